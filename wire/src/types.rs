//! Protocol enumerations.
//!
//! Integer assignments are frozen; reordering a variant here breaks every
//! deployed peer silently, so new values may only be appended.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Direction/privilege class of a packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    /// Debugger to debuggee, executed in VMX root.
    DebuggerToDebuggeeVmxRoot = 1,
    /// Debugger to debuggee, executed in user mode.
    DebuggerToDebuggeeUserMode = 2,
    /// Debuggee to debugger.
    DebuggeeToDebugger = 3,
}

impl PacketKind {
    /// Whether a packet of this kind may be accepted by the debuggee side.
    pub fn accepted_by_debuggee(self) -> bool {
        matches!(
            self,
            Self::DebuggerToDebuggeeVmxRoot | Self::DebuggerToDebuggeeUserMode
        )
    }

    /// Whether a packet of this kind may be accepted by the debugger side.
    pub fn accepted_by_debugger(self) -> bool {
        matches!(self, Self::DebuggeeToDebugger)
    }
}

/// Requested actions carried by debugger-to-debuggee packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DebuggerAction {
    // User-mode execution.
    UserModePause = 1,
    UserModeDoNotReadAnyPacket = 2,
    // VMX-root execution.
    Step = 3,
    Continue = 4,
    CloseAndUnloadDebuggee = 5,
    ChangeCore = 6,
    FlushBuffers = 7,
    ChangeProcess = 8,
    RunScript = 9,
    UserInputBuffer = 10,
    RegisterEvent = 11,
    AddActionToEvent = 12,
    QueryAndModifyEvent = 13,
    ReadRegisters = 14,
    ReadMemory = 15,
    EditMemory = 16,
    BreakpointCreate = 17,
    ListOrModifyBreakpoints = 18,
    ChangeThread = 19,
    Callstack = 20,
    TestQuery = 21,
    SymbolReload = 22,
    SearchMemory = 23,
    Va2PaAndPa2Va = 24,
    PteDetails = 25,
}

/// Requested actions carried by debuggee-to-debugger packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DebuggeeAction {
    NoAction = 0,
    Started = 1,
    LoggingMechanism = 2,
    PausedAndCurrentInstruction = 3,
    ResultOfChangingCore = 4,
    ResultOfChangingProcess = 5,
    ResultOfRunningScript = 6,
    ResultOfFormats = 7,
    ResultOfFlush = 8,
    ResultOfRegisteringEvent = 9,
    ResultOfAddingActionToEvent = 10,
    ResultOfQueryAndModifyEvent = 11,
    ResultOfReadingRegisters = 12,
    ResultOfReadingMemory = 13,
    ResultOfEditingMemory = 14,
    ResultOfBreakpoint = 15,
    ResultOfListOrModifyBreakpoints = 16,
    ResultOfChangingThread = 17,
    ResultOfCallstack = 18,
    ResultOfTestQuery = 19,
    ResultOfSymbolReload = 20,
    ResultOfSearchMemory = 21,
    ResultOfVa2PaAndPa2Va = 22,
    ResultOfPteDetails = 23,
}

/// Why the debuggee paused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum PausingReason {
    NotPaused = 0,
    PauseWithoutDisasm = 1,
    RequestFromDebugger = 2,
    Stepped = 3,
    SoftwareBreakpointHit = 4,
    HardwareDebugRegisterHit = 5,
    CoreSwitched = 6,
    ProcessSwitched = 7,
    CommandExecutionFinished = 8,
    EventTriggered = 9,
    ThreadSwitched = 10,
    EntryPointReached = 11,
}

/// Kinds of debugger events.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EventKind {
    HiddenHookReadAndWrite = 0,
    HiddenHookRead = 1,
    HiddenHookWrite = 2,
    HiddenHookReadAndWriteAndExecute = 3,
    HiddenHookReadAndExecute = 4,
    HiddenHookWriteAndExecute = 5,
    HiddenHookExecDetours = 6,
    HiddenHookExecCc = 7,
    SyscallHookEferSyscall = 8,
    SyscallHookEferSysret = 9,
    CpuidInstructionExecution = 10,
    RdmsrInstructionExecution = 11,
    WrmsrInstructionExecution = 12,
    InInstructionExecution = 13,
    OutInstructionExecution = 14,
    ExceptionOccurred = 15,
    ExternalInterruptOccurred = 16,
    DebugRegistersAccessed = 17,
    TscInstructionExecution = 18,
    PmcInstructionExecution = 19,
    VmcallInstructionExecution = 20,
}

impl EventKind {
    /// Total number of event kinds; sizes the per-kind registries.
    pub const COUNT: usize = 21;

    /// Whether this kind is implemented by an EPT hook on a guest page.
    pub fn is_ept_hook(self) -> bool {
        matches!(
            self,
            Self::HiddenHookReadAndWrite
                | Self::HiddenHookRead
                | Self::HiddenHookWrite
                | Self::HiddenHookReadAndWriteAndExecute
                | Self::HiddenHookReadAndExecute
                | Self::HiddenHookWriteAndExecute
                | Self::HiddenHookExecDetours
                | Self::HiddenHookExecCc
        )
    }

    /// Whether this kind watches read accesses.
    pub fn watches_read(self) -> bool {
        matches!(
            self,
            Self::HiddenHookRead
                | Self::HiddenHookReadAndWrite
                | Self::HiddenHookReadAndExecute
                | Self::HiddenHookReadAndWriteAndExecute
        )
    }

    /// Whether this kind watches write accesses.
    pub fn watches_write(self) -> bool {
        matches!(
            self,
            Self::HiddenHookWrite
                | Self::HiddenHookReadAndWrite
                | Self::HiddenHookWriteAndExecute
                | Self::HiddenHookReadAndWriteAndExecute
        )
    }

    /// Whether this kind watches execute accesses.
    pub fn watches_execute(self) -> bool {
        matches!(
            self,
            Self::HiddenHookExecDetours
                | Self::HiddenHookExecCc
                | Self::HiddenHookReadAndExecute
                | Self::HiddenHookWriteAndExecute
                | Self::HiddenHookReadAndWriteAndExecute
        )
    }
}

/// Kinds of event actions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ActionKind {
    BreakToDebugger = 0,
    RunScript = 1,
    RunCustomCode = 2,
}

/// Requests to modify a registered event.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ModifyEventKind {
    QueryState = 0,
    Enable = 1,
    Disable = 2,
    Clear = 3,
}

/// Requests to modify a breakpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum BreakpointModifyRequest {
    ListBreakpoints = 0,
    Enable = 1,
    Disable = 2,
    Clear = 3,
}

/// Stepping request types.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SteppingKind {
    StepOver = 0,
    StepIn = 1,
    InstrumentationStepIn = 2,
    /// Single-step to the next RET, then one more step (`gu`).
    GoUp = 3,
}

/// The tag value meaning "apply to every event".
pub const APPLY_TO_ALL_TAG: u64 = 0xffff_ffff_ffff_ffff;
/// The core id meaning "apply to every core".
pub const APPLY_TO_ALL_CORES: u32 = 0xffff_ffff;
/// The process id meaning "apply to every process".
pub const APPLY_TO_ALL_PROCESSES: u32 = 0xffff_ffff;
/// The thread id meaning "apply to every thread".
pub const APPLY_TO_ALL_THREADS: u32 = 0xffff_ffff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_kind_side_filters() {
        assert!(PacketKind::DebuggerToDebuggeeVmxRoot.accepted_by_debuggee());
        assert!(!PacketKind::DebuggerToDebuggeeVmxRoot.accepted_by_debugger());
        assert!(PacketKind::DebuggeeToDebugger.accepted_by_debugger());
        assert!(!PacketKind::DebuggeeToDebugger.accepted_by_debuggee());
    }

    #[test]
    fn enum_values_are_frozen() {
        assert_eq!(u32::from(DebuggerAction::Step), 3);
        assert_eq!(u32::from(DebuggerAction::BreakpointCreate), 17);
        assert_eq!(u32::from(DebuggeeAction::PausedAndCurrentInstruction), 3);
        assert_eq!(u32::from(PausingReason::SoftwareBreakpointHit), 4);
        assert_eq!(u32::from(EventKind::VmcallInstructionExecution), 20);
        assert_eq!(DebuggerAction::try_from(4).unwrap(), DebuggerAction::Continue);
        assert!(DebuggerAction::try_from(0xdead).is_err());
    }

    #[test]
    fn hook_kind_access_masks() {
        assert!(EventKind::HiddenHookReadAndWrite.watches_read());
        assert!(EventKind::HiddenHookReadAndWrite.watches_write());
        assert!(!EventKind::HiddenHookReadAndWrite.watches_execute());
        assert!(EventKind::HiddenHookExecCc.watches_execute());
        assert!(!EventKind::CpuidInstructionExecution.is_ept_hook());
    }
}
