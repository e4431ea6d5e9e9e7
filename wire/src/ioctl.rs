//! Device control codes of the local (same-machine) interface.
//!
//! The user-space controller reaches the kernel agent through one control
//! code per command family. The numbers are encoded the NT way
//! (`CTL_CODE(FILE_DEVICE_UNKNOWN, function, METHOD_BUFFERED,
//! FILE_ANY_ACCESS)`) and are as frozen as the serial enums: both sides
//! carry them raw.

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

/// The NT control-code encoding.
pub const fn ctl_code(function: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (FILE_ANY_ACCESS << 14) | (function << 2) | METHOD_BUFFERED
}

/// Register the user-mode notification channel.
pub const IOCTL_REGISTER_NOTIFICATION: u32 = ctl_code(0x800);
/// IRP-pending delivery of buffered trace messages.
pub const IOCTL_RETURN_IRP_PENDING_PACKETS: u32 = ctl_code(0x801);
/// Terminate VMX operation and unload.
pub const IOCTL_TERMINATE_VMX: u32 = ctl_code(0x802);
/// Read guest memory.
pub const IOCTL_DEBUGGER_READ_MEMORY: u32 = ctl_code(0x803);
/// Read or write an MSR.
pub const IOCTL_DEBUGGER_READ_OR_WRITE_MSR: u32 = ctl_code(0x804);
/// Dump the paging-structure entries of an address.
pub const IOCTL_DEBUGGER_READ_PAGE_TABLE_ENTRIES: u32 = ctl_code(0x805);
/// Register a debugger event.
pub const IOCTL_DEBUGGER_REGISTER_EVENT: u32 = ctl_code(0x806);
/// Add an action to a registered event.
pub const IOCTL_DEBUGGER_ADD_ACTION_TO_EVENT: u32 = ctl_code(0x807);
/// Enter or leave transparent mode.
pub const IOCTL_DEBUGGER_HIDE_AND_UNHIDE: u32 = ctl_code(0x808);
/// Translate VA to PA or PA to VA.
pub const IOCTL_DEBUGGER_VA2PA_AND_PA2VA: u32 = ctl_code(0x809);
/// Edit guest memory.
pub const IOCTL_DEBUGGER_EDIT_MEMORY: u32 = ctl_code(0x80A);
/// Search guest memory.
pub const IOCTL_DEBUGGER_SEARCH_MEMORY: u32 = ctl_code(0x80B);
/// Enable, disable, clear or query events.
pub const IOCTL_DEBUGGER_MODIFY_EVENTS: u32 = ctl_code(0x80C);
/// Flush the kernel message buffers.
pub const IOCTL_DEBUGGER_FLUSH_LOGGING_BUFFERS: u32 = ctl_code(0x80D);
/// Attach to or detach from a user-mode process.
pub const IOCTL_DEBUGGER_ATTACH_DETACH_PROCESS: u32 = ctl_code(0x80E);
/// Stepping requests.
pub const IOCTL_DEBUGGER_STEPPINGS: u32 = ctl_code(0x80F);
/// Prepare this machine to serve as a serial debuggee.
pub const IOCTL_PREPARE_DEBUGGEE: u32 = ctl_code(0x811);
/// Pause the debuggee (halt all cores).
pub const IOCTL_PAUSE_PACKET_RECEIVED: u32 = ctl_code(0x812);
/// Signal that a command finished executing in the debuggee.
pub const IOCTL_SEND_SIGNAL_EXECUTION_FINISHED: u32 = ctl_code(0x813);
/// Relay user-mode messages to the debugger.
pub const IOCTL_SEND_USERMODE_MESSAGES: u32 = ctl_code(0x814);
/// Relay a general buffer from debuggee to debugger.
pub const IOCTL_SEND_GENERAL_BUFFER: u32 = ctl_code(0x815);
/// Fill a typed pre-allocated pool.
pub const IOCTL_RESERVE_PRE_ALLOCATED_POOLS: u32 = ctl_code(0x816);
/// Pre-activate a functionality so its pools are sized before use.
pub const IOCTL_PREACTIVATE_FUNCTIONALITY: u32 = ctl_code(0x817);
