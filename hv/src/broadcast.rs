//! Fan-out of configuration changes to every core.
//!
//! A feature toggle is described by a [`CoreOp`]. From passive level the
//! broadcaster runs a DPC on each target core; the DPC issues a VMCALL so
//! the change is applied in VMX root, where VMCS fields are writable.
//! From VMX root (all peers already halted by the NMI protocol) the same
//! op is applied directly with [`apply_in_root`].

use crate::state::CoreState;
use crate::Platform;
#[cfg(not(test))]
use vtx::vmcs::{vmread, vmwrite, VmcsField};
use vtx::vmx_controls::ProcBasedControls;

/// One per-core configuration change.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CoreOp {
    /// Intercept reads of one MSR (or all, with `msr == None`).
    MsrReadExit { msr: Option<u32>, enable: bool },
    /// Intercept writes of one MSR (or all).
    MsrWriteExit { msr: Option<u32>, enable: bool },
    /// Intercept one I/O port (or all ports).
    IoExit { port: Option<u16>, enable: bool },
    /// Set or clear one exception-bitmap bit.
    ExceptionBitmapBit { vector: u8, enable: bool },
    /// RDTSC/RDTSCP exiting.
    RdtscExiting(bool),
    /// RDPMC exiting.
    RdpmcExiting(bool),
    /// MOV-DR exiting.
    MovDrExiting(bool),
    /// External-interrupt exiting.
    ExternalInterruptExiting(bool),
    /// EFER SCE hook: make SYSCALL/SYSRET fault into #UD interception.
    SyscallHook(bool),
    /// Invalidate this core's EPT translations.
    InvalidateEpt,
    /// Arm the monitor trap flag on the current core.
    MonitorTrapFlag(bool),
}

impl CoreOp {
    /// Encode into two VMCALL argument registers.
    pub fn encode(self) -> (u64, u64) {
        match self {
            Self::MsrReadExit { msr, enable } => {
                (1, arg_with_flag(msr.map(u64::from), enable))
            }
            Self::MsrWriteExit { msr, enable } => {
                (2, arg_with_flag(msr.map(u64::from), enable))
            }
            Self::IoExit { port, enable } => (3, arg_with_flag(port.map(u64::from), enable)),
            Self::ExceptionBitmapBit { vector, enable } => {
                (4, (vector as u64) << 1 | enable as u64)
            }
            Self::RdtscExiting(on) => (5, on as u64),
            Self::RdpmcExiting(on) => (6, on as u64),
            Self::MovDrExiting(on) => (7, on as u64),
            Self::ExternalInterruptExiting(on) => (8, on as u64),
            Self::SyscallHook(on) => (9, on as u64),
            Self::InvalidateEpt => (10, 0),
            Self::MonitorTrapFlag(on) => (11, on as u64),
        }
    }

    /// Decode the VMCALL argument registers.
    pub fn decode(code: u64, arg: u64) -> Option<Self> {
        Some(match code {
            1 => {
                let (value, enable) = split_arg(arg);
                Self::MsrReadExit {
                    msr: value.map(|v| v as u32),
                    enable,
                }
            }
            2 => {
                let (value, enable) = split_arg(arg);
                Self::MsrWriteExit {
                    msr: value.map(|v| v as u32),
                    enable,
                }
            }
            3 => {
                let (value, enable) = split_arg(arg);
                Self::IoExit {
                    port: value.map(|v| v as u16),
                    enable,
                }
            }
            4 => Self::ExceptionBitmapBit {
                vector: (arg >> 1) as u8,
                enable: arg & 1 != 0,
            },
            5 => Self::RdtscExiting(arg != 0),
            6 => Self::RdpmcExiting(arg != 0),
            7 => Self::MovDrExiting(arg != 0),
            8 => Self::ExternalInterruptExiting(arg != 0),
            9 => Self::SyscallHook(arg != 0),
            10 => Self::InvalidateEpt,
            11 => Self::MonitorTrapFlag(arg != 0),
            _ => return None,
        })
    }
}

// Bit 0: enable. Bit 1: "all" marker. Value starts at bit 2.
fn arg_with_flag(value: Option<u64>, enable: bool) -> u64 {
    match value {
        Some(v) => (v << 2) | (enable as u64),
        None => 2 | (enable as u64),
    }
}

fn split_arg(arg: u64) -> (Option<u64>, bool) {
    let enable = arg & 1 != 0;
    if arg & 2 != 0 {
        (None, enable)
    } else {
        (Some(arg >> 2), enable)
    }
}

/// How a broadcast op reaches VMX root on the target core.
pub trait OpDelivery: Sync {
    /// Called on the target core (DPC context); must hand the op to VMX
    /// root, normally via VMCALL.
    fn deliver(&self, core: usize, op: CoreOp);
}

/// Broadcasts ops to cores.
pub struct Broadcaster<'a> {
    pub platform: &'a dyn Platform,
    pub delivery: &'a dyn OpDelivery,
}

impl<'a> Broadcaster<'a> {
    /// Apply `op` on every core, synchronously.
    pub fn on_all_cores(&self, op: CoreOp) {
        self.delivery_sweep(None, op)
    }

    /// Apply `op` on one core, synchronously.
    pub fn on_core(&self, core: usize, op: CoreOp) -> bool {
        if core >= self.platform.core_count() {
            return false;
        }
        self.delivery_sweep(Some(core), op);
        true
    }

    fn delivery_sweep(&self, only: Option<usize>, op: CoreOp) {
        match only {
            Some(core) => {
                let delivery = self.delivery;
                self.platform.run_on_core(core, &move || delivery.deliver(core, op));
            }
            None => {
                let delivery = self.delivery;
                self.platform
                    .run_on_each_core(&move |core| delivery.deliver(core, op));
            }
        }
    }
}

/// Apply an op on the calling core, in VMX root.
///
/// VMCS writes are real here; the bitmap halves live in plain memory and
/// are updated through the per-core record.
pub fn apply_in_root(core_state: &mut CoreState, eptp: u64, op: CoreOp) {
    match op {
        CoreOp::MsrReadExit { msr, enable } => match msr {
            Some(msr) => {
                core_state.set_msr_bitmap(msr, false, enable);
            }
            None => {
                fill_msr_bitmap_half(core_state, false, enable);
            }
        },
        CoreOp::MsrWriteExit { msr, enable } => match msr {
            Some(msr) => {
                core_state.set_msr_bitmap(msr, true, enable);
            }
            None => {
                fill_msr_bitmap_half(core_state, true, enable);
            }
        },
        CoreOp::IoExit { port, enable } => match port {
            Some(port) => core_state.set_io_bitmap(port, enable),
            None => fill_io_bitmaps(core_state, enable),
        },
        CoreOp::ExceptionBitmapBit { vector, enable } => {
            set_exception_bitmap_bit(vector, enable);
        }
        CoreOp::RdtscExiting(on) => set_proc_control(ProcBasedControls::RDTSC_EXITING, on),
        CoreOp::RdpmcExiting(on) => set_proc_control(ProcBasedControls::RDPMC_EXITING, on),
        CoreOp::MovDrExiting(on) => set_proc_control(ProcBasedControls::MOV_DR_EXITING, on),
        CoreOp::ExternalInterruptExiting(on) => set_external_interrupt_exiting(on),
        CoreOp::SyscallHook(on) => {
            // EFER reads are intercepted alongside so the cleared SCE bit
            // stays invisible to the guest.
            core_state.set_msr_bitmap(vtx::msr::IA32_EFER, false, on);
            crate::vmx::set_syscall_hook(on);
        }
        CoreOp::InvalidateEpt => {
            #[cfg(not(test))]
            vtx::ept::invept(vtx::ept::InveptKind::SingleContext, eptp);
            #[cfg(test)]
            let _ = eptp;
        }
        CoreOp::MonitorTrapFlag(on) => set_proc_control(ProcBasedControls::MONITOR_TRAP_FLAG, on),
    }
}

fn fill_msr_bitmap_half(core_state: &mut CoreState, write: bool, enable: bool) {
    let base = if write { 0x800usize } else { 0 };
    let bitmap = core_state.msr_bitmap_virt.as_ptr::<u8>();
    unsafe {
        core::ptr::write_bytes(bitmap.add(base), if enable { 0xFF } else { 0 }, 0x800);
    }
}

fn fill_io_bitmaps(core_state: &mut CoreState, enable: bool) {
    let fill = if enable { 0xFF } else { 0 };
    unsafe {
        core::ptr::write_bytes(core_state.io_bitmap_a_virt.as_ptr::<u8>(), fill, 4096);
        core::ptr::write_bytes(core_state.io_bitmap_b_virt.as_ptr::<u8>(), fill, 4096);
    }
}

/// Set or clear one bit of the exception bitmap of the current VMCS.
pub fn set_exception_bitmap_bit(vector: u8, enable: bool) {
    #[cfg(not(test))]
    {
        if let Ok(mut bitmap) = vmread(VmcsField::ExceptionBitmap) {
            if enable {
                bitmap |= 1 << vector;
            } else {
                bitmap &= !(1 << vector);
            }
            let _ = vmwrite(VmcsField::ExceptionBitmap, bitmap);
        }
    }
    #[cfg(test)]
    {
        let _ = (vector, enable);
    }
}

fn set_proc_control(control: ProcBasedControls, on: bool) {
    #[cfg(not(test))]
    {
        if let Ok(mut controls) = vmread(VmcsField::ProcBasedControls) {
            if on {
                controls |= control.bits() as u64;
            } else {
                controls &= !(control.bits() as u64);
            }
            let _ = vmwrite(VmcsField::ProcBasedControls, controls);
        }
    }
    #[cfg(test)]
    {
        let _ = (control, on);
    }
}

fn set_external_interrupt_exiting(on: bool) {
    #[cfg(not(test))]
    {
        use vtx::vmx_controls::{ExitControls, PinBasedControls};
        if let Ok(mut pin) = vmread(VmcsField::PinBasedControls) {
            if on {
                pin |= PinBasedControls::EXTERNAL_INTERRUPT_EXITING.bits() as u64;
            } else {
                pin &= !(PinBasedControls::EXTERNAL_INTERRUPT_EXITING.bits() as u64);
            }
            let _ = vmwrite(VmcsField::PinBasedControls, pin);
        }
        if let Ok(mut exit) = vmread(VmcsField::VmexitControls) {
            if on {
                exit |= ExitControls::ACK_INTERRUPT_ON_EXIT.bits() as u64;
            } else {
                exit &= !(ExitControls::ACK_INTERRUPT_ON_EXIT.bits() as u64);
            }
            let _ = vmwrite(VmcsField::VmexitControls, exit);
        }
    }
    #[cfg(test)]
    let _ = on;
}
