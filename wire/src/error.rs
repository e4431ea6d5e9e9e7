//! The flat error-code space shared by both ends of the link.
//!
//! Codes start at `0xC000_0000`; `0xFFFF_FFFF` is reserved for success.
//! Both binaries carry these values raw inside response payloads, so the
//! assignments are frozen the same way the enums in [`crate::types`] are.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Value meaning "the operation was successful".
pub const OPERATION_SUCCESSFUL: u32 = 0xFFFF_FFFF;

/// Kernel-side error codes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    TagNotExists = 0xC000_0000,
    InvalidActionType = 0xC000_0001,
    ActionBufferSizeIsZero = 0xC000_0002,
    EventTypeIsInvalid = 0xC000_0003,
    UnableToCreateEvent = 0xC000_0004,
    InvalidAddress = 0xC000_0005,
    InvalidCoreId = 0xC000_0006,
    ExceptionIndexExceedsFirst32Entries = 0xC000_0007,
    InterruptIndexIsNotValid = 0xC000_0008,
    UnableToHideOrUnhideDebugger = 0xC000_0009,
    DebuggerAlreadyUnhidden = 0xC000_000A,
    EditMemoryInvalidParameter = 0xC000_000B,
    EditMemoryInvalidAddressBasedOnCurrentProcess = 0xC000_000C,
    EditMemoryInvalidAddressBasedOnOtherProcess = 0xC000_000D,
    ModifyEventsInvalidTag = 0xC000_000E,
    ModifyEventsInvalidTypeOfAction = 0xC000_000F,
    SteppingInvalidParameter = 0xC000_0010,
    SteppingThreadNotFoundOrDisabled = 0xC000_0011,
    PreparingDebuggeeInvalidBaudRate = 0xC000_0012,
    PreparingDebuggeeInvalidSerialPort = 0xC000_0013,
    InvalidCoreInRemoteDebuggee = 0xC000_0014,
    UnableToSwitchToNewProcess = 0xC000_0015,
    UnableToRunScriptInRemoteDebuggee = 0xC000_0016,
    InvalidRegisterNumber = 0xC000_0017,
    MaximumBreakpointWithoutContinue = 0xC000_0018,
    BreakpointAlreadyExistsOnTheAddress = 0xC000_0019,
    BreakpointIdNotFound = 0xC000_001A,
    BreakpointAlreadyDisabled = 0xC000_001B,
    BreakpointAlreadyEnabled = 0xC000_001C,
    MemoryTypeInvalid = 0xC000_001D,
    InvalidProcessId = 0xC000_001E,
    InvalidThreadId = 0xC000_001F,
    MaximumBreakpointForSinglePageIsHit = 0xC000_0020,
    EptPageSplitFailed = 0xC000_0021,
    EptFetchPml1EntryFailed = 0xC000_0022,
    PreAllocatedPoolEmpty = 0xC000_0023,
    AddressAlreadyHooked = 0xC000_0024,
    VmxNotSupported = 0xC000_0025,
    VmxDisabledByFirmware = 0xC000_0026,
    EptNotSupported = 0xC000_0027,
    DetourTargetCrossesPage = 0xC000_0028,
    UnknownRequestedAction = 0xC000_0029,
    ScriptEngineFailed = 0xC000_002A,
    CorruptedPacketReceived = 0xC000_002B,
    DebuggeeNotPaused = 0xC000_002C,
}

/// Result carried in response payload status fields: either the success
/// sentinel or an [`ErrorCode`] raw value.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KernelStatus(pub u32);

impl KernelStatus {
    /// The success value.
    pub const SUCCESS: Self = Self(OPERATION_SUCCESSFUL);

    /// Whether this status reports success.
    pub fn is_success(self) -> bool {
        self.0 == OPERATION_SUCCESSFUL
    }

    /// The error code, if this status is an error.
    pub fn error(self) -> Option<ErrorCode> {
        if self.is_success() {
            None
        } else {
            ErrorCode::try_from(self.0).ok()
        }
    }
}

impl From<ErrorCode> for KernelStatus {
    fn from(e: ErrorCode) -> Self {
        Self(e.into())
    }
}

impl From<Result<(), ErrorCode>> for KernelStatus {
    fn from(r: Result<(), ErrorCode>) -> Self {
        match r {
            Ok(()) => Self::SUCCESS,
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_space_is_stable() {
        assert_eq!(u32::from(ErrorCode::TagNotExists), 0xC000_0000);
        assert_eq!(u32::from(ErrorCode::InvalidAddress), 0xC000_0005);
        assert_eq!(u32::from(ErrorCode::MemoryTypeInvalid), 0xC000_001D);
        assert_eq!(
            u32::from(ErrorCode::MaximumBreakpointForSinglePageIsHit),
            0xC000_0020
        );
    }

    #[test]
    fn status_round_trip() {
        assert!(KernelStatus::SUCCESS.is_success());
        assert_eq!(KernelStatus::SUCCESS.error(), None);
        let st = KernelStatus::from(ErrorCode::PreAllocatedPoolEmpty);
        assert!(!st.is_success());
        assert_eq!(st.error(), Some(ErrorCode::PreAllocatedPoolEmpty));
    }
}
