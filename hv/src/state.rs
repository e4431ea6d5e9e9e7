//! The per-core state table.
//!
//! One record per logical processor, allocated once at initialization and
//! freed after VMXOFF. The owning CPU reads and writes its record freely;
//! remote mutation happens only inside a broadcast DPC pinned to the
//! target CPU or while that CPU is quiesced in the NMI halt spin. The few
//! fields read across cores (the halt flags) are atomics.

use crate::hooks::HookId;
use crate::Platform;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_utils::CachePadded;
use vtx::{GuestRegisters, PhysAddr, VirtAddr};

/// Size of the per-core VMM stack the exit stub runs on.
pub const VMM_STACK_SIZE: usize = 0x8000;

/// Which component armed the pending monitor trap flag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MtfOwner {
    /// Nobody; an MTF exit now is unexpected and only logged.
    None,
    /// An immediate-vmexit request; the exit itself was the point.
    ImmediateExit,
    /// The EPT hook engine: re-apply the hook view for this record after
    /// the guest executed one instruction on the real page.
    HookRestore(HookId),
    /// The debugger armed it for instruction stepping.
    Stepping,
    /// A software breakpoint byte was lifted for one instruction and must
    /// be put back (carries the breakpoint id).
    BreakpointReApply(u64),
    /// Transparent mode is waiting to scrub a syscall return.
    Transparent,
}

/// Per-core event-control flags mutated on the exit path.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreFlags {
    /// Pause into the debugger when the armed MTF fires.
    pub register_break_on_mtf: bool,
    /// Transparent mode armed the guest trap flag for this core's
    /// current thread.
    pub transparent_trap_flag_armed: bool,
    /// Instrumentation step-in: keep re-arming TF until RIP leaves the
    /// stepping instruction, ignoring kernel-delivered #DBs.
    pub instrumentation_step_in: bool,
    /// Suppress the automatic RIP advance for this exit.
    pub suppress_rip_increment: bool,
    /// Skip re-applying a lifted breakpoint byte on the pending MTF.
    pub avoid_reapply_breakpoint: bool,
    /// The guest IF bit must be restored on the pending MTF.
    pub set_rflags_if_on_mtf: bool,
}

/// One record per logical CPU.
pub struct CoreState {
    /// Index of this core.
    pub core_id: usize,
    /// VMXON region.
    pub vmxon_region_phys: PhysAddr,
    pub vmxon_region_virt: VirtAddr,
    /// VMCS region.
    pub vmcs_region_phys: PhysAddr,
    pub vmcs_region_virt: VirtAddr,
    /// Base of the VMM stack; RSP starts at `base + VMM_STACK_SIZE`,
    /// 16-byte aligned.
    pub vmm_stack: VirtAddr,
    /// 4 KiB MSR bitmap.
    pub msr_bitmap_phys: PhysAddr,
    pub msr_bitmap_virt: VirtAddr,
    /// Two 4 KiB I/O bitmaps.
    pub io_bitmap_a_phys: PhysAddr,
    pub io_bitmap_a_virt: VirtAddr,
    pub io_bitmap_b_phys: PhysAddr,
    pub io_bitmap_b_virt: VirtAddr,
    /// The EPTP value this core runs on.
    pub eptp: u64,
    /// Set after the first successful VMLAUNCH.
    pub has_launched: bool,
    /// Set while the core executes in VMX root (the exit handler).
    pub is_on_vmx_root: bool,
    /// Guest RIP/RSP captured for the emergency VMXOFF path, so the core
    /// can continue un-virtualized exactly where the guest stopped.
    pub vmxoff_guest_rip: u64,
    pub vmxoff_guest_rsp: u64,
    /// XMM save area for the exit stub.
    pub xmm_save_area: [u128; 16],
    /// Who owns the pending monitor trap flag.
    pub mtf_owner: MtfOwner,
    /// Saved interruptibility/IF for MTF completion.
    pub flags: CoreFlags,
    /// RIP of the instruction an instrumentation step started on.
    pub instrumentation_step_rip: u64,
    /// The halt-protocol spin flag: while true, this core parks in its
    /// NMI handler inside VMX root. Written by the conductor core.
    pub halted: AtomicBool,
    /// Set by the conductor to tell the halt loop an NMI is expected.
    pub awaiting_nmi_halt: AtomicBool,
    /// Exit again right after the next VM entry. A core that was inside
    /// its own exit handler when the halt NMI went out cannot take the
    /// NMI until it re-enters the guest; this bounces it straight back
    /// so the pending NMI lands while the conductor is still waiting.
    pub wait_for_immediate_vmexit: AtomicBool,
    /// Scratch copy of the guest registers for the debugger while paused.
    pub paused_regs: GuestRegisters,
}

impl CoreState {
    fn new(core_id: usize) -> Self {
        Self {
            core_id,
            vmxon_region_phys: PhysAddr::from_pfn(0),
            vmxon_region_virt: VirtAddr::new(0).unwrap(),
            vmcs_region_phys: PhysAddr::from_pfn(0),
            vmcs_region_virt: VirtAddr::new(0).unwrap(),
            vmm_stack: VirtAddr::new(0).unwrap(),
            msr_bitmap_phys: PhysAddr::from_pfn(0),
            msr_bitmap_virt: VirtAddr::new(0).unwrap(),
            io_bitmap_a_phys: PhysAddr::from_pfn(0),
            io_bitmap_a_virt: VirtAddr::new(0).unwrap(),
            io_bitmap_b_phys: PhysAddr::from_pfn(0),
            io_bitmap_b_virt: VirtAddr::new(0).unwrap(),
            eptp: 0,
            has_launched: false,
            is_on_vmx_root: false,
            vmxoff_guest_rip: 0,
            vmxoff_guest_rsp: 0,
            xmm_save_area: [0; 16],
            mtf_owner: MtfOwner::None,
            flags: CoreFlags::default(),
            instrumentation_step_rip: 0,
            halted: AtomicBool::new(false),
            awaiting_nmi_halt: AtomicBool::new(false),
            wait_for_immediate_vmexit: AtomicBool::new(false),
            paused_regs: GuestRegisters::default(),
        }
    }

    /// Set or clear an MSR bitmap bit.
    ///
    /// The bitmap covers reads in its first 2 KiB (low MSRs, then high
    /// MSRs) and writes in its second 2 KiB (SDM Vol. 3C, 24.6.9).
    pub fn set_msr_bitmap(&mut self, msr: u32, write: bool, on: bool) -> bool {
        use vtx::msr::{MSR_BITMAP_HIGH_BASE, MSR_BITMAP_HIGH_LIMIT, MSR_BITMAP_LOW_LIMIT};
        let (half_offset, index) = if msr <= MSR_BITMAP_LOW_LIMIT {
            (0usize, msr)
        } else if (MSR_BITMAP_HIGH_BASE..=MSR_BITMAP_HIGH_LIMIT).contains(&msr) {
            (0x400, msr - MSR_BITMAP_HIGH_BASE)
        } else {
            return false;
        };
        let base = half_offset + if write { 0x800 } else { 0 };
        let byte = base + (index / 8) as usize;
        let bit = 1u8 << (index % 8);
        let bitmap = self.msr_bitmap_virt.as_ptr::<u8>();
        unsafe {
            let p = bitmap.add(byte);
            if on {
                *p |= bit;
            } else {
                *p &= !bit;
            }
        }
        true
    }

    /// Set or clear an I/O bitmap bit. Bitmap A covers ports
    /// 0x0000-0x7FFF, bitmap B the rest (SDM Vol. 3C, 24.6.4).
    pub fn set_io_bitmap(&mut self, port: u16, on: bool) {
        let (bitmap, index) = if port < 0x8000 {
            (self.io_bitmap_a_virt, port)
        } else {
            (self.io_bitmap_b_virt, port - 0x8000)
        };
        let byte = (index / 8) as usize;
        let bit = 1u8 << (index % 8);
        unsafe {
            let p = bitmap.as_ptr::<u8>().add(byte);
            if on {
                *p |= bit;
            } else {
                *p &= !bit;
            }
        }
    }
}

/// The process-wide table of per-core records.
pub struct CorePool {
    cores: Vec<CachePadded<UnsafeCell<CoreState>>>,
}

// Cross-core access is limited to the atomic fields and to broadcast
// callbacks pinned to the owning core; see the module docs.
unsafe impl Sync for CorePool {}
unsafe impl Send for CorePool {}

impl CorePool {
    /// Allocate one record per core.
    pub fn new(core_count: usize) -> Self {
        Self {
            cores: (0..core_count)
                .map(|id| CachePadded::new(UnsafeCell::new(CoreState::new(id))))
                .collect(),
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// Whether the table is empty (it never is after init).
    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// The calling core's record.
    ///
    /// # Safety
    /// The caller must actually be running on `core` (pinned thread, DPC
    /// or VMX-root context), which makes the access single-writer.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, core: usize) -> &mut CoreState {
        &mut *self.cores[core].get()
    }

    /// The record for the core `platform` says we are on.
    ///
    /// # Safety
    /// The calling thread must be pinned to its current core.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn current(&self, platform: &dyn Platform) -> &mut CoreState {
        self.get_mut(platform.current_core())
    }

    /// Read a core's halt flag from any core.
    pub fn is_halted(&self, core: usize) -> bool {
        unsafe { (*self.cores[core].get()).halted.load(Ordering::Acquire) }
    }

    /// Set a core's halt flag from the conductor.
    pub fn set_halted(&self, core: usize, value: bool) {
        unsafe { (*self.cores[core].get()).halted.store(value, Ordering::Release) }
    }

    /// Flag that a debugger-issued NMI is on its way to `core`.
    pub fn set_awaiting_nmi(&self, core: usize, value: bool) {
        unsafe {
            (*self.cores[core].get())
                .awaiting_nmi_halt
                .store(value, Ordering::Release)
        }
    }

    /// Whether `core` expects a halt NMI.
    pub fn is_awaiting_nmi(&self, core: usize) -> bool {
        unsafe {
            (*self.cores[core].get())
                .awaiting_nmi_halt
                .load(Ordering::Acquire)
        }
    }

    /// Ask `core` to exit again immediately after its next VM entry.
    pub fn request_immediate_vmexit(&self, core: usize) {
        unsafe {
            (*self.cores[core].get())
                .wait_for_immediate_vmexit
                .store(true, Ordering::Release)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msr_bitmap_bit_positions() {
        let mut bitmap = vec![0u8; 4096];
        let mut cs = CoreState::new(0);
        cs.msr_bitmap_virt = VirtAddr::new(bitmap.as_mut_ptr() as u64).unwrap();

        // Read bitmap, low half: IA32_LSTAR is a high MSR.
        assert!(cs.set_msr_bitmap(vtx::msr::IA32_LSTAR, false, true));
        let index = vtx::msr::IA32_LSTAR - 0xC000_0000;
        let byte = 0x400 + (index / 8) as usize;
        assert_eq!(bitmap[byte], 1 << (index % 8));

        // Write bitmap for a low MSR lands in the second 2 KiB.
        assert!(cs.set_msr_bitmap(0x1D9, true, true));
        assert_eq!(bitmap[0x800 + 0x1D9 / 8], 1 << (0x1D9 % 8));

        // Clearing restores zero.
        assert!(cs.set_msr_bitmap(0x1D9, true, false));
        assert_eq!(bitmap[0x800 + 0x1D9 / 8], 0);

        // Out-of-range MSRs are rejected.
        assert!(!cs.set_msr_bitmap(0x2000, false, true));
    }

    #[test]
    fn io_bitmap_splits_at_0x8000() {
        let mut a = vec![0u8; 4096];
        let mut b = vec![0u8; 4096];
        let mut cs = CoreState::new(0);
        cs.io_bitmap_a_virt = VirtAddr::new(a.as_mut_ptr() as u64).unwrap();
        cs.io_bitmap_b_virt = VirtAddr::new(b.as_mut_ptr() as u64).unwrap();

        cs.set_io_bitmap(0x3F8, true);
        assert_eq!(a[0x3F8 / 8], 1 << (0x3F8 % 8));
        cs.set_io_bitmap(0x8004, true);
        assert_eq!(b[0], 1 << 4);
    }

    #[test]
    fn halt_flags_are_visible_across_the_pool() {
        let pool = CorePool::new(4);
        assert!(!pool.is_halted(2));
        pool.set_halted(2, true);
        assert!(pool.is_halted(2));
        pool.set_awaiting_nmi(3, true);
        assert!(pool.is_awaiting_nmi(3));
        pool.set_halted(2, false);
        assert!(!pool.is_halted(2));
    }
}
