//! Instruction stepping.
//!
//! *Step-in* (`t`) sets the guest trap flag and pauses on the resulting
//! #DB. *Instrumentation step-in* (`i`) keeps re-arming the flag until
//! RIP leaves the stepping instruction, so #DBs delivered into kernel
//! handlers in between are ignored. *Step-over* (`p`) is step-in unless
//! the instruction is a CALL, in which case a one-shot breakpoint at the
//! return site replaces the trap flag. *Go-up* (`gu`) single-steps to
//! the next RET, takes one more step, then pauses.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};
use wire::types::SteppingKind;

/// Decoded class of the instruction at RIP.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InstructionClass {
    /// A near or far call, carrying its encoded length.
    Call { len: usize },
    /// A return.
    Ret { len: usize },
    /// Anything else.
    Other { len: usize },
}

impl InstructionClass {
    /// Length of the instruction.
    pub fn len(self) -> usize {
        match self {
            Self::Call { len } | Self::Ret { len } | Self::Other { len } => len,
        }
    }
}

/// Classify the instruction at the start of `code`.
pub fn classify(code: &[u8], is_64bit: bool) -> InstructionClass {
    let bitness = if is_64bit { 64 } else { 32 };
    let mut decoder = Decoder::with_ip(bitness, code, 0, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    if !decoder.can_decode() {
        return InstructionClass::Other { len: 1 };
    }
    decoder.decode_out(&mut instruction);
    let len = instruction.len();
    match instruction.flow_control() {
        FlowControl::Call | FlowControl::IndirectCall => InstructionClass::Call { len },
        FlowControl::Return => InstructionClass::Ret { len },
        _ => InstructionClass::Other { len },
    }
}

/// What the debuggee must arm to perform one step request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepAction {
    /// Set RFLAGS.TF and resume the core.
    ArmTrapFlag,
    /// Like [`StepAction::ArmTrapFlag`], but keep re-arming across
    /// foreign #DBs until RIP moves off `start_rip`.
    ArmInstrumentationTrapFlag { start_rip: u64 },
    /// Plant a one-shot breakpoint at the return site of a CALL.
    OneShotBreakpoint { at: u64 },
}

/// Per-core stepping state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum SteppingMode {
    /// Not stepping.
    #[default]
    Idle,
    /// One #DB away from pausing.
    StepIn,
    /// Ignore #DBs until RIP leaves the recorded instruction.
    InstrumentationStepIn { start_rip: u64 },
    /// Waiting for the one-shot breakpoint of a step-over.
    StepOver { breakpoint_id: u64 },
    /// Scanning for the next RET.
    GoUp { stepped_past_ret: bool },
}

/// Decide what to arm for a stepping request, given the instruction
/// under RIP. Go-up also arms the trap flag; its state machine keeps
/// re-arming until one step past the next RET.
pub fn plan_step(kind: SteppingKind, rip: u64, class: InstructionClass) -> StepAction {
    match kind {
        SteppingKind::StepIn | SteppingKind::GoUp => StepAction::ArmTrapFlag,
        SteppingKind::InstrumentationStepIn => {
            StepAction::ArmInstrumentationTrapFlag { start_rip: rip }
        }
        SteppingKind::StepOver => match class {
            InstructionClass::Call { len } => StepAction::OneShotBreakpoint {
                at: rip + len as u64,
            },
            _ => StepAction::ArmTrapFlag,
        },
    }
}

/// Advance the stepping state machine on a #DB. Returns whether the core
/// should pause into the debugger now (false: silently re-arm and keep
/// running).
pub fn on_debug_trap(mode: &mut SteppingMode, rip: u64, class: InstructionClass) -> bool {
    match *mode {
        SteppingMode::Idle | SteppingMode::StepOver { .. } => false,
        SteppingMode::StepIn => {
            *mode = SteppingMode::Idle;
            true
        }
        SteppingMode::InstrumentationStepIn { start_rip } => {
            if rip == start_rip {
                // Still on the original instruction (a #DB was delivered
                // into the kernel and came back): re-arm, keep going.
                false
            } else {
                *mode = SteppingMode::Idle;
                true
            }
        }
        SteppingMode::GoUp { stepped_past_ret } => {
            if stepped_past_ret {
                *mode = SteppingMode::Idle;
                true
            } else {
                if matches!(class, InstructionClass::Ret { .. }) {
                    *mode = SteppingMode::GoUp {
                        stepped_past_ret: true,
                    };
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_calls_and_rets() {
        // call rel32
        assert_eq!(
            classify(&[0xE8, 0x00, 0x10, 0x00, 0x00], true),
            InstructionClass::Call { len: 5 }
        );
        // call rax
        assert_eq!(classify(&[0xFF, 0xD0], true), InstructionClass::Call { len: 2 });
        // ret
        assert_eq!(classify(&[0xC3], true), InstructionClass::Ret { len: 1 });
        // mov eax, imm32
        assert_eq!(
            classify(&[0xB8, 1, 0, 0, 0], true),
            InstructionClass::Other { len: 5 }
        );
    }

    #[test]
    fn step_over_a_call_uses_a_one_shot_breakpoint() {
        let class = classify(&[0xE8, 0x00, 0x10, 0x00, 0x00], true);
        assert_eq!(
            plan_step(SteppingKind::StepOver, 0x1000, class),
            StepAction::OneShotBreakpoint { at: 0x1005 }
        );
        // A non-call steps normally.
        let other = classify(&[0x90], true);
        assert_eq!(
            plan_step(SteppingKind::StepOver, 0x1000, other),
            StepAction::ArmTrapFlag
        );
    }

    #[test]
    fn instrumentation_step_ignores_reentrant_traps() {
        let mut mode = SteppingMode::InstrumentationStepIn { start_rip: 0x1000 };
        // Same RIP: a #DB delivered into the kernel bounced back.
        assert!(!on_debug_trap(
            &mut mode,
            0x1000,
            InstructionClass::Other { len: 1 }
        ));
        assert!(matches!(mode, SteppingMode::InstrumentationStepIn { .. }));
        // New RIP: the step completed.
        assert!(on_debug_trap(
            &mut mode,
            0x1001,
            InstructionClass::Other { len: 1 }
        ));
        assert_eq!(mode, SteppingMode::Idle);
    }

    #[test]
    fn go_up_pauses_one_step_after_the_ret() {
        let mut mode = SteppingMode::GoUp {
            stepped_past_ret: false,
        };
        // Ordinary instructions keep scanning.
        assert!(!on_debug_trap(&mut mode, 0x10, InstructionClass::Other { len: 3 }));
        // The RET itself: remember, but do not pause yet.
        assert!(!on_debug_trap(&mut mode, 0x13, InstructionClass::Ret { len: 1 }));
        // One more step: now pause.
        assert!(on_debug_trap(&mut mode, 0x9000, InstructionClass::Other { len: 2 }));
        assert_eq!(mode, SteppingMode::Idle);
    }

    #[test]
    fn plain_step_in_pauses_immediately() {
        let mut mode = SteppingMode::StepIn;
        assert!(on_debug_trap(&mut mode, 0x1, InstructionClass::Other { len: 1 }));
        assert_eq!(mode, SteppingMode::Idle);
    }
}
