//! VM-exit reason and qualification parsing.

use crate::addr::PhysAddr;
use crate::vmcs::{vmread, VmcsField, VmxError};

/// Exception vectors the debugger cares about by name.
pub const DIVIDE_ERROR_VECTOR: u8 = 0;
/// #DB.
pub const DEBUG_VECTOR: u8 = 1;
/// NMI.
pub const NMI_VECTOR: u8 = 2;
/// #BP.
pub const BREAKPOINT_VECTOR: u8 = 3;
/// #UD.
pub const INVALID_OPCODE_VECTOR: u8 = 6;
/// #PF.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Basic VM-exit reasons (SDM Vol. 3D, Appendix C, Table C-1).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BasicExitReason {
    ExceptionOrNmi,
    ExternalInterrupt,
    TripleFault,
    InitSignal,
    StartupIpi,
    InterruptWindow,
    NmiWindow,
    TaskSwitch,
    Cpuid,
    Getsec,
    Hlt,
    Invd,
    Invlpg,
    Rdpmc,
    Rdtsc,
    Rsm,
    Vmcall,
    Vmclear,
    Vmlaunch,
    Vmptrld,
    Vmptrst,
    Vmread,
    Vmresume,
    Vmwrite,
    Vmxoff,
    Vmxon,
    CrAccess,
    DrAccess,
    IoInstruction,
    Rdmsr,
    Wrmsr,
    EntryFailGuestState,
    EntryFailMsrLoading,
    Mwait,
    MonitorTrapFlag,
    Monitor,
    Pause,
    EntryFailMachineCheck,
    TprBelowThreshold,
    ApicAccess,
    GdtrIdtrAccess,
    LdtrTrAccess,
    EptViolation,
    EptMisconfig,
    Invept,
    Rdtscp,
    PreemptionTimer,
    Invvpid,
    Wbinvd,
    Xsetbv,
    ApicWrite,
    Rdrand,
    Invpcid,
    Vmfunc,
    Rdseed,
    PmlFull,
    Xsaves,
    Xrstors,
    Unknown(u16),
}

impl BasicExitReason {
    fn from_raw(v: u16) -> Self {
        match v {
            0 => Self::ExceptionOrNmi,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            3 => Self::InitSignal,
            4 => Self::StartupIpi,
            7 => Self::InterruptWindow,
            8 => Self::NmiWindow,
            9 => Self::TaskSwitch,
            10 => Self::Cpuid,
            11 => Self::Getsec,
            12 => Self::Hlt,
            13 => Self::Invd,
            14 => Self::Invlpg,
            15 => Self::Rdpmc,
            16 => Self::Rdtsc,
            17 => Self::Rsm,
            18 => Self::Vmcall,
            19 => Self::Vmclear,
            20 => Self::Vmlaunch,
            21 => Self::Vmptrld,
            22 => Self::Vmptrst,
            23 => Self::Vmread,
            24 => Self::Vmresume,
            25 => Self::Vmwrite,
            26 => Self::Vmxoff,
            27 => Self::Vmxon,
            28 => Self::CrAccess,
            29 => Self::DrAccess,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            33 => Self::EntryFailGuestState,
            34 => Self::EntryFailMsrLoading,
            36 => Self::Mwait,
            37 => Self::MonitorTrapFlag,
            39 => Self::Monitor,
            40 => Self::Pause,
            41 => Self::EntryFailMachineCheck,
            43 => Self::TprBelowThreshold,
            44 => Self::ApicAccess,
            46 => Self::GdtrIdtrAccess,
            47 => Self::LdtrTrAccess,
            48 => Self::EptViolation,
            49 => Self::EptMisconfig,
            50 => Self::Invept,
            51 => Self::Rdtscp,
            52 => Self::PreemptionTimer,
            53 => Self::Invvpid,
            54 => Self::Wbinvd,
            55 => Self::Xsetbv,
            56 => Self::ApicWrite,
            57 => Self::Rdrand,
            58 => Self::Invpcid,
            59 => Self::Vmfunc,
            61 => Self::Rdseed,
            62 => Self::PmlFull,
            63 => Self::Xsaves,
            64 => Self::Xrstors,
            other => Self::Unknown(other),
        }
    }
}

/// A parsed VM-exit reason field.
#[derive(Debug, Clone, Copy)]
pub struct ExitReason {
    /// The basic reason (bits 15:0).
    pub basic: BasicExitReason,
    /// Bit 29: the exit happened from VMX root operation (SMM only).
    pub from_vmx_root: bool,
    /// Bit 31: VM-entry failure.
    pub entry_failure: bool,
}

impl ExitReason {
    /// Parse the exit-reason field of the current VMCS.
    pub fn read() -> Result<Self, VmxError> {
        let raw = vmread(VmcsField::VmexitReason)?;
        Ok(Self {
            basic: BasicExitReason::from_raw(raw as u16),
            from_vmx_root: raw & (1 << 29) != 0,
            entry_failure: raw & (1 << 31) != 0,
        })
    }
}

/// Interruption type of a vectored event
/// (SDM Vol. 3C, Tables 24-18 and 24-19).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InterruptionType {
    ExternalInterrupt,
    Nmi,
    HardwareException,
    SoftwareInterrupt,
    PrivilegedSoftwareException,
    SoftwareException,
    Other,
}

impl InterruptionType {
    fn from_raw(v: u32) -> Self {
        match v {
            0 => Self::ExternalInterrupt,
            2 => Self::Nmi,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => Self::Other,
        }
    }

    const fn into_raw(self) -> u32 {
        match self {
            Self::ExternalInterrupt => 0,
            Self::Nmi => 2,
            Self::HardwareException => 3,
            Self::SoftwareInterrupt => 4,
            Self::PrivilegedSoftwareException => 5,
            Self::SoftwareException => 6,
            Self::Other => 7,
        }
    }
}

/// VM-exit (or VM-entry) interruption information.
#[derive(Debug, Clone, Copy)]
pub struct InterruptionInfo {
    /// Vector of the interrupt or exception.
    pub vector: u8,
    /// Interruption type, bits 10:8.
    pub kind: InterruptionType,
    /// Whether an error code is delivered.
    pub error_code_valid: bool,
    /// NMI unblocking due to IRET.
    pub nmi_unblocked_by_iret: bool,
}

impl InterruptionInfo {
    /// Read the VM-exit interruption information of the current VMCS.
    ///
    /// Returns `None` when the valid bit (31) is clear.
    pub fn read() -> Result<Option<Self>, VmxError> {
        let raw = vmread(VmcsField::VmexitInterruptionInfo)? as u32;
        if raw & (1 << 31) == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            vector: raw as u8,
            kind: InterruptionType::from_raw((raw >> 8) & 7),
            error_code_valid: raw & (1 << 11) != 0,
            nmi_unblocked_by_iret: raw & (1 << 12) != 0,
        }))
    }

    /// Encode this event for the VM-entry interruption-information field.
    pub const fn encode_for_injection(vector: u8, kind: InterruptionType, deliver_error_code: bool) -> u32 {
        (vector as u32) | (kind.into_raw() << 8) | ((deliver_error_code as u32) << 11) | (1 << 31)
    }
}

bitflags::bitflags! {
    /// Exit qualification for EPT violations
    /// (SDM Vol. 3C, Table 28-7).
    pub struct EptViolationQualification: u64 {
        /// The access causing the violation was a data read.
        const READ_ACCESS = 1 << 0;
        /// The access causing the violation was a data write.
        const WRITE_ACCESS = 1 << 1;
        /// The access causing the violation was an instruction fetch.
        const EXECUTE_ACCESS = 1 << 2;
        /// The guest-physical address was readable.
        const READABLE = 1 << 3;
        /// The guest-physical address was writable.
        const WRITABLE = 1 << 4;
        /// The guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const LINEAR_ADDRESS_VALID = 1 << 7;
        /// The access was to the translation of a linear address, not to a
        /// paging-structure entry.
        const CAUSED_BY_TRANSLATION = 1 << 8;
        /// NMI unblocking due to IRET.
        const NMI_UNBLOCKED_BY_IRET = 1 << 12;
    }
}

/// The faulting guest-physical address of the current EPT violation.
pub fn ept_violation_address() -> Result<PhysAddr, VmxError> {
    let gpa = vmread(VmcsField::GuestPhysicalAddr)?;
    Ok(PhysAddr::new(gpa).unwrap_or(PhysAddr::from_pfn(0)))
}

/// Parsed exit qualification for I/O instructions
/// (SDM Vol. 3C, Table 27-5).
#[derive(Debug, Clone, Copy)]
pub struct IoExitQualification {
    /// Access width in bytes (1, 2 or 4).
    pub size: u8,
    /// Whether this is an IN (true) or OUT (false).
    pub is_in: bool,
    /// Whether this is a string instruction (INS/OUTS).
    pub is_string: bool,
    /// Whether the instruction carried a REP prefix.
    pub rep_prefixed: bool,
    /// Whether the operand was immediate.
    pub immediate_operand: bool,
    /// Port number.
    pub port: u16,
}

impl IoExitQualification {
    /// Decode a raw exit-qualification value.
    pub fn decode(qual: u64) -> Self {
        Self {
            size: (qual as u8 & 0x7) + 1,
            is_in: qual & (1 << 3) != 0,
            is_string: qual & (1 << 4) != 0,
            rep_prefixed: qual & (1 << 5) != 0,
            immediate_operand: qual & (1 << 6) != 0,
            port: (qual >> 16) as u16,
        }
    }
}

/// Kind of control-register access (SDM Vol. 3C, Table 27-3).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CrAccessKind {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// Parsed exit qualification for control-register accesses.
#[derive(Debug, Clone, Copy)]
pub struct CrAccessQualification {
    /// Which control register (0, 3, 4, 8).
    pub cr: u8,
    /// Direction or instruction form.
    pub kind: CrAccessKind,
    /// Index of the general-purpose register operand.
    pub gpr: u8,
    /// LMSW source data, when `kind` is `Lmsw`.
    pub lmsw_source: u16,
}

impl CrAccessQualification {
    /// Decode a raw exit-qualification value.
    pub fn decode(qual: u64) -> Self {
        Self {
            cr: qual as u8 & 0xf,
            kind: match (qual >> 4) & 3 {
                0 => CrAccessKind::MovToCr,
                1 => CrAccessKind::MovFromCr,
                2 => CrAccessKind::Clts,
                _ => CrAccessKind::Lmsw,
            },
            gpr: ((qual >> 8) & 0xf) as u8,
            lmsw_source: (qual >> 16) as u16,
        }
    }
}

/// Parsed exit qualification for debug-register accesses
/// (SDM Vol. 3C, Table 27-4).
#[derive(Debug, Clone, Copy)]
pub struct DrAccessQualification {
    /// Which debug register.
    pub dr: u8,
    /// Whether this is MOV from DR (true) or MOV to DR (false).
    pub is_read: bool,
    /// Index of the general-purpose register operand.
    pub gpr: u8,
}

impl DrAccessQualification {
    /// Decode a raw exit-qualification value.
    pub fn decode(qual: u64) -> Self {
        Self {
            dr: qual as u8 & 0x7,
            is_read: qual & (1 << 4) != 0,
            gpr: ((qual >> 8) & 0xf) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_qualification_decodes_port_and_direction() {
        // IN AL, 0x3F8: size 1, in, not string.
        let q = IoExitQualification::decode((0x3F8 << 16) | (1 << 3));
        assert_eq!(q.size, 1);
        assert!(q.is_in);
        assert!(!q.is_string);
        assert_eq!(q.port, 0x3F8);
    }

    #[test]
    fn cr_qualification_decodes_mov_to_cr3() {
        let q = CrAccessQualification::decode(3 | (0 << 4) | (2 << 8));
        assert_eq!(q.cr, 3);
        assert_eq!(q.kind, CrAccessKind::MovToCr);
        assert_eq!(q.gpr, 2);
    }

    #[test]
    fn injection_encoding_sets_valid_bit() {
        let raw = InterruptionInfo::encode_for_injection(3, InterruptionType::SoftwareException, false);
        assert_eq!(raw & 0xff, 3);
        assert_eq!((raw >> 8) & 7, 6);
        assert!(raw & (1 << 31) != 0);
    }

    #[test]
    fn unknown_exit_reasons_are_preserved() {
        assert_eq!(BasicExitReason::from_raw(48), BasicExitReason::EptViolation);
        assert_eq!(BasicExitReason::from_raw(37), BasicExitReason::MonitorTrapFlag);
        assert_eq!(BasicExitReason::from_raw(999), BasicExitReason::Unknown(999));
    }
}
