//! Intel VT-x and x86-64 architecture plumbing.
//!
//! This crate holds everything that is defined by the Intel SDM rather than
//! by us: model-specific registers, control registers, the VMCS field
//! encodings and access instructions, VM-execution control layouts,
//! VM-exit reason parsing, the EPT paging-structure formats, and the host
//! page-table entry format used by the safe memory mapper.
//!
//! Nothing in here owns policy. The hypervisor core (`hv`) decides what to
//! write into these structures; this crate only makes the bits type-safe.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod cpuid;
pub mod ept;
pub mod exit;
pub mod msr;
pub mod mtrr;
pub mod paging;
pub mod regs;
pub mod vmcs;
pub mod vmx_controls;

pub use addr::{PhysAddr, VirtAddr, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_2M};
pub use regs::GuestRegisters;

/// Returns whether the current processor supports VMX operation.
///
/// This only checks CPUID.1:ECX.VMX; whether the firmware left VMX enabled
/// is a separate question answered by [`msr::feature_control_allows_vmxon`].
pub fn has_vmx_support() -> bool {
    cpuid::cpuid(1, 0).ecx & (1 << 5) != 0
}
