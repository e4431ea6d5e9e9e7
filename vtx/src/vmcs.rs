//! Virtual-Machine Control Structure access.
//!
//! The VMCS is an opaque 4 KiB region manipulated only through
//! `vmread`/`vmwrite` on the *current* VMCS, plus the region-management
//! instructions `vmxon`, `vmclear` and `vmptrld`. All wrappers report
//! failure through [`VmxError`], reading the VM-instruction error field
//! when the processor provides one.

use crate::addr::PhysAddr;
use core::arch::asm;

/// Possible errors for VMX instructions.
///
/// See Intel SDM Vol. 3C, Table 30-1, VM-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation.
    VmcallInVmxRoot,
    /// VMCLEAR with invalid physical address.
    VmclearWithInvAddr,
    /// VMCLEAR with VMXON pointer.
    VmclearWithVmxon,
    /// VMLAUNCH with non-clear VMCS.
    VmlaunchWithNonclearVmcs,
    /// VMRESUME with non-launched VMCS.
    VmresumeWithNonlaunchedVmcs,
    /// VMRESUME after VMXOFF.
    VmresumeAfterVmxoff,
    /// VM entry with invalid control field(s).
    InvalidControlFields,
    /// VM entry with invalid host-state field(s).
    InvalidHostState,
    /// VMPTRLD with invalid physical address.
    VmptrldWithInvAddr,
    /// VMPTRLD with VMXON pointer.
    VmptrldWithVmxon,
    /// VMPTRLD with incorrect VMCS revision identifier.
    VmptrldWithIncorrectRevId,
    /// VMREAD/VMWRITE from/to unsupported VMCS component.
    UnsupportedVmcsField,
    /// VMWRITE to read-only VMCS component.
    WriteToRoField,
    /// VMXON executed in VMX root operation.
    VmxonInVmxRoot,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid,
    /// Unknown error.
    Unknown(u64),
}

impl InstructionError {
    fn from_raw(v: u64) -> Self {
        match v {
            1 => Self::VmcallInVmxRoot,
            2 => Self::VmclearWithInvAddr,
            3 => Self::VmclearWithVmxon,
            4 => Self::VmlaunchWithNonclearVmcs,
            5 => Self::VmresumeWithNonlaunchedVmcs,
            6 => Self::VmresumeAfterVmxoff,
            7 => Self::InvalidControlFields,
            8 => Self::InvalidHostState,
            9 => Self::VmptrldWithInvAddr,
            10 => Self::VmptrldWithVmxon,
            11 => Self::VmptrldWithIncorrectRevId,
            12 => Self::UnsupportedVmcsField,
            13 => Self::WriteToRoField,
            15 => Self::VmxonInVmxRoot,
            26 => Self::VmentryWithEventBlockedByMovss,
            28 => Self::InvalidOperandToInveptInvvpid,
            other => Self::Unknown(other),
        }
    }
}

/// Error type for all VMX operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VmxError {
    /// The instruction failed with a valid current VMCS; the detailed
    /// reason was read from the VM-instruction error field.
    Failed(InstructionError),
    /// The instruction failed without a current VMCS (CF set).
    FailedInvalid,
}

/// Vmcs field encodings (SDM Vol. 3D, Appendix B).
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsField {
    // 16-bit control fields.
    Vpid = 0x00000000,
    // 16-bit guest-state fields.
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    // 16-bit host-state fields.
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,
    // 64-bit control fields.
    IoBitmapA = 0x00002000,
    IoBitmapB = 0x00002002,
    MsrBitmap = 0x00002004,
    VmexitMsrStoreAddr = 0x00002006,
    VmexitMsrLoadAddr = 0x00002008,
    VmentryMsrLoadAddr = 0x0000200A,
    TscOffset = 0x00002010,
    VirtualApicPageAddr = 0x00002012,
    ApicAccessAddr = 0x00002014,
    Eptp = 0x0000201A,
    // 64-bit read-only data fields.
    GuestPhysicalAddr = 0x00002400,
    // 64-bit guest-state fields.
    VmcsLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,
    GuestPdpte0 = 0x0000280A,
    GuestPdpte1 = 0x0000280C,
    GuestPdpte2 = 0x0000280E,
    GuestPdpte3 = 0x00002810,
    // 64-bit host-state fields.
    HostIa32Pat = 0x00002C00,
    HostIa32Efer = 0x00002C02,
    // 32-bit control fields.
    PinBasedControls = 0x00004000,
    ProcBasedControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    PageFaultErrCodeMask = 0x00004006,
    PageFaultErrCodeMatch = 0x00004008,
    Cr3TargetCount = 0x0000400A,
    VmexitControls = 0x0000400C,
    VmexitMsrStoreCount = 0x0000400E,
    VmexitMsrLoadCount = 0x00004010,
    VmentryControls = 0x00004012,
    VmentryMsrLoadCount = 0x00004014,
    VmentryInterruptionInfo = 0x00004016,
    VmentryExceptionErrCode = 0x00004018,
    VmentryInstructionLength = 0x0000401A,
    TprThreshold = 0x0000401C,
    SecondaryProcBasedControls = 0x0000401E,
    // 32-bit read-only data fields.
    VmInstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInterruptionErrCode = 0x00004406,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrCode = 0x0000440A,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    // 32-bit guest-state fields.
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestIa32SysenterCs = 0x0000482A,
    // 32-bit host-state field.
    HostIa32SysenterCs = 0x00004C00,
    // Natural-width control fields.
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    // Natural-width read-only data fields.
    ExitQualification = 0x00006400,
    IoRcx = 0x00006402,
    IoRsi = 0x00006404,
    IoRdi = 0x00006406,
    IoRip = 0x00006408,
    GuestLinearAddr = 0x0000640A,
    // Natural-width guest-state fields.
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestPendingDbgExceptions = 0x00006822,
    GuestIa32SysenterEsp = 0x00006824,
    GuestIa32SysenterEip = 0x00006826,
    // Natural-width host-state fields.
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostIa32SysenterEsp = 0x00006C10,
    HostIa32SysenterEip = 0x00006C12,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// Read the VM-instruction error field of the current VMCS.
pub fn instruction_error() -> InstructionError {
    unsafe {
        let err: i8;
        let v: u64;
        asm!(
            "clc",
            "vmread {}, {}",
            "setna {}",
            out(reg) v,
            in(reg) VmcsField::VmInstructionError as u64,
            out(reg_byte) err
        );
        if err != 0 {
            InstructionError::Unknown(u64::MAX)
        } else {
            InstructionError::from_raw(v)
        }
    }
}

fn failure(valid_vmcs: bool) -> VmxError {
    if valid_vmcs {
        VmxError::Failed(instruction_error())
    } else {
        VmxError::FailedInvalid
    }
}

/// Enter VMX root operation using the given 4 KiB VMXON region.
///
/// # Safety
/// The region must be revision-id initialized, page aligned, and CR4.VMXE
/// must already be set with the fixed CR0/CR4 bits enforced.
pub unsafe fn vmxon(region: PhysAddr) -> Result<(), VmxError> {
    let err: i8;
    let pa = region.into_u64();
    asm!(
        "clc",
        "vmxon [{}]",
        "setna {}",
        in(reg) &pa,
        out(reg_byte) err
    );
    if err != 0 {
        Err(failure(false))
    } else {
        Ok(())
    }
}

/// Leave VMX operation.
///
/// # Safety
/// Must only run in VMX root operation.
pub unsafe fn vmxoff() {
    asm!("vmxoff");
}

/// Clear the launch state of a VMCS and flush it to memory.
pub fn vmclear(region: PhysAddr) -> Result<(), VmxError> {
    unsafe {
        let err: i8;
        let pa = region.into_u64();
        asm!(
            "clc",
            "vmclear [{}]",
            "setna {}",
            in(reg) &pa,
            out(reg_byte) err
        );
        if err != 0 {
            Err(failure(true))
        } else {
            Ok(())
        }
    }
}

/// Make the given VMCS current and active.
pub fn vmptrld(region: PhysAddr) -> Result<(), VmxError> {
    unsafe {
        let err: i8;
        let pa = region.into_u64();
        asm!(
            "clc",
            "vmptrld [{}]",
            "setna {}",
            in(reg) &pa,
            out(reg_byte) err
        );
        if err != 0 {
            Err(failure(true))
        } else {
            Ok(())
        }
    }
}

/// Read a field of the current VMCS.
pub fn vmread(field: VmcsField) -> Result<u64, VmxError> {
    unsafe {
        let err: i8;
        let v: u64;
        asm!(
            "clc",
            "vmread {}, {}",
            "setna {}",
            out(reg) v,
            in(reg) field as u64,
            out(reg_byte) err
        );
        if err != 0 {
            Err(failure(true))
        } else {
            Ok(v)
        }
    }
}

/// Write a field of the current VMCS.
pub fn vmwrite(field: VmcsField, v: u64) -> Result<(), VmxError> {
    unsafe {
        let err: i8;
        asm!(
            "clc",
            "vmwrite {}, {}",
            "setna {}",
            in(reg) field as u64,
            in(reg) v,
            out(reg_byte) err
        );
        if err != 0 {
            Err(failure(true))
        } else {
            Ok(())
        }
    }
}

/// The VMCS revision identifier reported by IA32_VMX_BASIC.
pub fn revision_id() -> u32 {
    crate::msr::Msr::<{ crate::msr::IA32_VMX_BASIC }>::read() as u32 & 0x7fff_ffff
}

/// Advance guest RIP past the instruction that caused the current exit.
pub fn forward_rip() -> Result<(), VmxError> {
    vmwrite(
        VmcsField::GuestRip,
        vmread(VmcsField::GuestRip)? + vmread(VmcsField::VmexitInstructionLength)?,
    )
}
