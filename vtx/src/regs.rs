//! Control registers, RFLAGS and the guest register frame.

use core::arch::asm;

bitflags::bitflags! {
    /// rflags.
    #[repr(transparent)]
    pub struct Rflags: u64 {
        /// Carry Flag.
        const CF = 1 << 0;
        /// Must be 1.
        const _1 = 1 << 1;
        /// Parity Flag.
        const PF = 1 << 2;
        /// Adjust Flag.
        const AF = 1 << 4;
        /// Zero Flag.
        const ZF = 1 << 6;
        /// Sign Flag.
        const SF = 1 << 7;
        /// Trap Flag. Set to cause a #DB after the next instruction.
        const TF = 1 << 8;
        /// Interrupt enable.
        ///
        /// Controls the response of the processor to maskable hardware
        /// interrupt requests. Does not affect exceptions or NMIs.
        const IF = 1 << 9;
        /// Direction Flag.
        const DF = 1 << 10;
        /// Overflow Flag.
        const OF = 1 << 11;
        /// I/O privilege level field - bit 0.
        const IOPL0 = 1 << 12;
        /// I/O privilege level field - bit 1.
        const IOPL1 = 1 << 13;
        /// Nested task.
        const NT = 1 << 14;
        /// Resume.
        ///
        /// When set, temporarily disables instruction-breakpoint #DBs so the
        /// faulting instruction can be restarted after a debug exception.
        const RF = 1 << 16;
        /// Virtual-8086 mode.
        const VM = 1 << 17;
        /// Alignment check or access control.
        const AC = 1 << 18;
        /// Virtual Interrupt.
        const VIF = 1 << 19;
        /// Virtual interrupt pending.
        const VIP = 1 << 20;
        /// Identification; writability indicates CPUID support.
        const ID = 1 << 21;
    }
}

impl Rflags {
    /// Read the current value.
    #[inline(always)]
    pub fn read() -> Self {
        let ret: u64;
        unsafe {
            asm!("pushfq", "pop {0}", lateout(reg) ret);
        }
        Self::from_bits_truncate(ret)
    }
}

bitflags::bitflags! {
    /// Cr0 Register.
    #[repr(transparent)]
    pub struct Cr0: u64 {
        /// Protected mode enable.
        const PE = 1 << 0;
        /// Monitor co-processor.
        const MP = 1 << 1;
        /// Emulation.
        const EM = 1 << 2;
        /// Task switched.
        const TS = 1 << 3;
        /// Extension type.
        const ET = 1 << 4;
        /// Numeric error.
        const NE = 1 << 5;
        /// Write protect.
        const WP = 1 << 16;
        /// Alignment mask.
        const AM = 1 << 18;
        /// Not-write through.
        const NW = 1 << 29;
        /// Cache disable.
        const CD = 1 << 30;
        /// Paging.
        const PG = 1 << 31;
    }
}

impl Cr0 {
    /// Read the current value.
    #[inline(always)]
    pub fn current() -> Self {
        let ret: u64;
        unsafe {
            asm!("mov {}, cr0", lateout(reg) ret, options(nomem, nostack));
            Self::from_bits_unchecked(ret)
        }
    }

    /// Load this value into CR0.
    ///
    /// # Safety
    /// Write to a system register is unsafe.
    #[inline(always)]
    pub unsafe fn apply(self) {
        asm!("mov cr0, {}", in(reg) self.bits(), options(nomem, nostack));
    }

    /// This value with the VMX fixed-0/fixed-1 bits enforced
    /// (SDM Vol. 3C, 23.8).
    pub fn vmx_adjusted(self) -> Self {
        use crate::msr::{Msr, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1};
        let fixed0 = Msr::<IA32_VMX_CR0_FIXED0>::read();
        let fixed1 = Msr::<IA32_VMX_CR0_FIXED1>::read();
        unsafe { Self::from_bits_unchecked((self.bits() | fixed0) & fixed1) }
    }
}

bitflags::bitflags! {
    /// Cr4 Register.
    #[repr(transparent)]
    pub struct Cr4: u64 {
        /// Virtual 8086 mode extensions.
        const VME = 1 << 0;
        /// Protected mode virtual interrupts.
        const PVI = 1 << 1;
        /// Time stamp disable.
        const TSD = 1 << 2;
        /// Debugging extensions.
        const DE = 1 << 3;
        /// Page size extension.
        const PSE = 1 << 4;
        /// Physical address extension.
        const PAE = 1 << 5;
        /// Machine check exception.
        const MCE = 1 << 6;
        /// Page global enable.
        const PGE = 1 << 7;
        /// Performance monitoring counter enable.
        const PCE = 1 << 8;
        /// Os support for fxsave and fxrstor instructions.
        const OSFXSR = 1 << 9;
        /// Os support for unmasked simd floating point exceptions.
        const OSXMMEXCPT = 1 << 10;
        /// User mode instruction prevention.
        const UMIP = 1 << 11;
        /// Virtual machine extensions enable.
        const VMXE = 1 << 13;
        /// Safer mode extensions enable.
        const SMXE = 1 << 14;
        /// Pcid enable.
        const PCIDE = 1 << 17;
        /// Xsave and processor extended states enable.
        const OSXSAVE = 1 << 18;
        /// Supervisor mode executions protection enable.
        const SMEP = 1 << 20;
        /// Supervisor mode access protection enable.
        const SMAP = 1 << 21;
        /// Protection keys for user-mode pages enable.
        const PKE = 1 << 22;
    }
}

impl Cr4 {
    /// Read the current value.
    #[inline(always)]
    pub fn current() -> Self {
        let ret: u64;
        unsafe {
            asm!("mov {}, cr4", lateout(reg) ret, options(nomem, nostack));
            Self::from_bits_unchecked(ret)
        }
    }

    /// Load this value into CR4.
    ///
    /// # Safety
    /// Write to a system register is unsafe.
    #[inline(always)]
    pub unsafe fn apply(self) {
        asm!("mov cr4, {}", in(reg) self.bits(), options(nomem, nostack));
    }

    /// This value with the VMX fixed-0/fixed-1 bits enforced
    /// (SDM Vol. 3C, 23.8).
    pub fn vmx_adjusted(self) -> Self {
        use crate::msr::{Msr, IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1};
        let fixed0 = Msr::<IA32_VMX_CR4_FIXED0>::read();
        let fixed1 = Msr::<IA32_VMX_CR4_FIXED1>::read();
        unsafe { Self::from_bits_unchecked((self.bits() | fixed0) & fixed1) }
    }
}

/// Read the current CR3.
#[inline(always)]
pub fn read_cr3() -> u64 {
    let r: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) r, options(nomem, nostack));
    }
    r
}

/// Load a new CR3.
///
/// # Safety
/// Switching address spaces invalidates every raw pointer derived from the
/// previous one.
#[inline(always)]
pub unsafe fn write_cr3(v: u64) {
    asm!("mov cr3, {}", in(reg) v, options(nostack));
}

/// Read CR2 (page-fault linear address).
#[inline(always)]
pub fn read_cr2() -> u64 {
    let r: u64;
    unsafe {
        asm!("mov {}, cr2", out(reg) r, options(nomem, nostack));
    }
    r
}

/// Read DR7.
#[inline(always)]
pub fn read_dr7() -> u64 {
    let r: u64;
    unsafe {
        asm!("mov {}, dr7", out(reg) r, options(nomem, nostack));
    }
    r
}

/// Invalidate the TLB entry for one linear address.
#[inline(always)]
pub fn invlpg(va: u64) {
    unsafe {
        asm!("invlpg [{}]", in(reg) va, options(nostack));
    }
}

/// The guest general-purpose register frame.
///
/// The VM-exit stub stores registers at these exact offsets; the layout is
/// pinned by the `offset_of!` assertions below and must not be reordered.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

const _: () = {
    use core::mem::offset_of;
    assert!(offset_of!(GuestRegisters, rax) == 0x00);
    assert!(offset_of!(GuestRegisters, rcx) == 0x08);
    assert!(offset_of!(GuestRegisters, rdx) == 0x10);
    assert!(offset_of!(GuestRegisters, rbx) == 0x18);
    assert!(offset_of!(GuestRegisters, rsp) == 0x20);
    assert!(offset_of!(GuestRegisters, rbp) == 0x28);
    assert!(offset_of!(GuestRegisters, rsi) == 0x30);
    assert!(offset_of!(GuestRegisters, rdi) == 0x38);
    assert!(offset_of!(GuestRegisters, r8) == 0x40);
    assert!(offset_of!(GuestRegisters, r15) == 0x78);
    assert!(core::mem::size_of::<GuestRegisters>() == 0x80);
};

impl GuestRegisters {
    /// Read a register by its wire id (the `r` command numbering).
    ///
    /// Ids 0..=15 follow the hardware encoding order rax..r15.
    pub fn read_by_id(&self, id: u32) -> Option<u64> {
        Some(match id {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => return None,
        })
    }

    /// Write a register by its wire id.
    pub fn write_by_id(&mut self, id: u32, value: u64) -> bool {
        let slot = match id {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            _ => return false,
        };
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_ids_follow_hardware_order() {
        let mut regs = GuestRegisters::default();
        assert!(regs.write_by_id(1, 0xdead));
        assert_eq!(regs.rcx, 0xdead);
        regs.r11 = 0x202;
        assert_eq!(regs.read_by_id(11), Some(0x202));
        assert_eq!(regs.read_by_id(16), None);
        assert!(!regs.write_by_id(99, 0));
    }
}
