//! Invocation contract of the external script interpreter.
//!
//! The interpreter itself lives outside this workspace; the engine only
//! needs to hand it bytecode plus the execution environment and observe
//! whether the script asked to short-circuit emulation or to see a
//! post-event pass.

use vtx::GuestRegisters;

/// Number of temporary value slots a script invocation receives.
pub const MAX_TEMP_COUNT: usize = 32;

/// Number of shared global variable slots.
pub const MAX_GLOBAL_COUNT: usize = 256;

/// Where a script's output goes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OutputDisposition {
    /// Stream results to the debugger immediately.
    Immediate,
    /// Buffer results into the action's pre-allocated buffer.
    Buffered,
}

/// The per-invocation output channel.
pub struct ActionBuffer<'a> {
    /// Where results go.
    pub disposition: OutputDisposition,
    /// The pre-allocated result buffer, when buffered.
    pub buffer: Option<&'a mut [u8]>,
    /// Set by the script to request skipping the exiting instruction's
    /// emulation.
    pub short_circuit_requested: bool,
    /// Set by the script to request a post-emulation pass.
    pub post_event_requested: bool,
}

/// What the engine passes about the triggering exit.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext {
    /// The event's tag.
    pub tag: u64,
    /// Exit-specific context value (faulting address, MSR index, ...).
    pub context: u64,
    /// Index of the triggering core.
    pub core: usize,
}

/// Errors surfaced by the interpreter.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScriptError {
    /// Opaque error-symbol descriptor from the interpreter.
    pub error_symbol: u64,
}

/// The interpreter boundary.
pub trait ScriptEngine: Sync {
    /// Run a condition buffer; non-zero means the event fires.
    fn evaluate_condition(
        &self,
        bytecode: &[u8],
        regs: &GuestRegisters,
        context: &TriggerContext,
    ) -> u64;

    /// Run an action script to completion or first fault.
    ///
    /// `temps` is a fresh per-invocation slot pool; `globals` is the
    /// array shared by every script in the system.
    fn execute(
        &self,
        bytecode: &[u8],
        regs: &mut GuestRegisters,
        context: &TriggerContext,
        temps: &mut [u64; MAX_TEMP_COUNT],
        globals: &mut [u64; MAX_GLOBAL_COUNT],
        output: &mut ActionBuffer<'_>,
    ) -> Result<(), ScriptError>;
}

/// An engine that treats every condition as true and every script as a
/// successful no-op; used until a real interpreter is registered and by
/// tests that only care about engine mechanics.
pub struct NullScriptEngine;

impl ScriptEngine for NullScriptEngine {
    fn evaluate_condition(
        &self,
        _bytecode: &[u8],
        _regs: &GuestRegisters,
        _context: &TriggerContext,
    ) -> u64 {
        1
    }

    fn execute(
        &self,
        _bytecode: &[u8],
        _regs: &mut GuestRegisters,
        _context: &TriggerContext,
        _temps: &mut [u64; MAX_TEMP_COUNT],
        _globals: &mut [u64; MAX_GLOBAL_COUNT],
        _output: &mut ActionBuffer<'_>,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}
