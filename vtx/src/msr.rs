//! Model-specific register (MSR) access.

use core::arch::asm;

/// Model specific register, addressed by a const parameter.
pub struct Msr<const ADDR: u32>;

impl<const ADDR: u32> Msr<ADDR> {
    /// Read the current value.
    #[inline(always)]
    pub fn read() -> u64 {
        read_msr(ADDR)
    }

    /// Write to the msr.
    ///
    /// # Safety
    /// Writing a model-specific register changes processor state.
    #[inline(always)]
    pub unsafe fn write(v: u64) {
        write_msr(ADDR, v)
    }
}

/// Read an MSR whose index is only known at runtime.
#[inline(always)]
pub fn read_msr(addr: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    unsafe {
        asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") addr, options(nomem, nostack));
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// Write an MSR whose index is only known at runtime.
///
/// # Safety
/// Writing a model-specific register changes processor state.
#[inline(always)]
pub unsafe fn write_msr(addr: u32, v: u64) {
    asm!(
        "wrmsr",
        in("edx") (v >> 32) as u32,
        in("eax") v as u32,
        in("ecx") addr,
        options(nomem, nostack)
    );
}

// VMX capability MSRs.
/// MSR - IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROC_BASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_MISC.
pub const IA32_VMX_MISC: u32 = 0x485;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_VMCS_ENUM.
pub const IA32_VMX_VMCS_ENUM: u32 = 0x48A;
/// MSR - IA32_VMX_PROC_BASED_CTLS2.
pub const IA32_VMX_PROC_BASED_CTLS2: u32 = 0x48B;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;
/// MSR - IA32_FEATURE_CONTROL.
pub const IA32_FEATURE_CONTROL: u32 = 0x03A;

// Architectural MSRs the debugger touches.
/// MSR - IA32_EFER.
pub const IA32_EFER: u32 = 0xC000_0080;
/// MSR - IA32_STAR.
pub const IA32_STAR: u32 = 0xC000_0081;
/// MSR - IA32_LSTAR, the 64-bit SYSCALL entry point.
pub const IA32_LSTAR: u32 = 0xC000_0082;
/// MSR - IA32_FMASK.
pub const IA32_FMASK: u32 = 0xC000_0084;
/// MSR - IA32_FS_BASE.
pub const IA32_FS_BASE: u32 = 0xC000_0100;
/// MSR - IA32_GS_BASE.
pub const IA32_GS_BASE: u32 = 0xC000_0101;
/// MSR - IA32_KERNEL_GS_BASE.
pub const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;
/// MSR - IA32_DEBUGCTL.
pub const IA32_DEBUGCTL: u32 = 0x1D9;
/// MSR - IA32_SYSENTER_CS.
pub const IA32_SYSENTER_CS: u32 = 0x174;
/// MSR - IA32_SYSENTER_ESP.
pub const IA32_SYSENTER_ESP: u32 = 0x175;
/// MSR - IA32_SYSENTER_EIP.
pub const IA32_SYSENTER_EIP: u32 = 0x176;
/// MSR - IA32_PAT.
pub const IA32_PAT: u32 = 0x277;
/// MSR - IA32_TSC.
pub const IA32_TSC: u32 = 0x10;

/// Highest MSR index covered by the low half of the MSR bitmap.
///
/// RDMSR/WRMSR bitmaps cover 0x0000_0000..=0x0000_1FFF in the low 1 KiB
/// and 0xC000_0000..=0xC000_1FFF in the high 1 KiB (SDM Vol. 3C, 24.6.9).
pub const MSR_BITMAP_LOW_LIMIT: u32 = 0x1FFF;
/// Base of the high-half MSR bitmap range.
pub const MSR_BITMAP_HIGH_BASE: u32 = 0xC000_0000;
/// Highest MSR index covered by the high half of the MSR bitmap.
pub const MSR_BITMAP_HIGH_LIMIT: u32 = 0xC000_1FFF;

bitflags::bitflags! {
    /// IA32_FEATURE_CONTROL bits relevant to VMXON.
    pub struct FeatureControl: u64 {
        /// Lock bit; once set, the MSR cannot be written until reset.
        const LOCK = 1 << 0;
        /// VMXON allowed inside SMX operation.
        const VMXON_IN_SMX = 1 << 1;
        /// VMXON allowed outside SMX operation.
        const VMXON_OUTSIDE_SMX = 1 << 2;
    }
}

/// Whether firmware left VMXON permitted outside SMX.
///
/// If the lock bit is clear the MSR is still writable and we could set the
/// bits ourselves, so that state also counts as permitted.
pub fn feature_control_allows_vmxon() -> bool {
    let fc = FeatureControl::from_bits_truncate(Msr::<IA32_FEATURE_CONTROL>::read());
    !fc.contains(FeatureControl::LOCK) || fc.contains(FeatureControl::VMXON_OUTSIDE_SMX)
}
