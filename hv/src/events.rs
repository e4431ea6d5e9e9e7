//! The event/action engine.
//!
//! Users declare *events* (conditions under which a VM exit is
//! interesting) and attach ordered *actions* to them. Registration
//! turns each event into per-core activations of the hardware mechanism
//! it needs (an MSR-bitmap bit, an exception-bitmap bit, RDTSC exiting,
//! an EPT hook, ...); triggering walks the registrations for one kind,
//! applies core/process filters and the optional condition bytecode, and
//! runs the actions.
//!
//! Lists of one kind fire in registration order. Removing an event
//! re-applies its surviving siblings before the shared hardware feature
//! may be disabled, and record frees are deferred to passive level.

use crate::broadcast::{Broadcaster, CoreOp};
use crate::hooks::HookId;
use crate::script::{
    ActionBuffer, OutputDisposition, ScriptEngine, TriggerContext, MAX_GLOBAL_COUNT,
    MAX_TEMP_COUNT,
};
use crate::{CallingStage, TriggerResponse};
use alloc::vec::Vec;
use vtx::exit::{BREAKPOINT_VECTOR, DEBUG_VECTOR, INVALID_OPCODE_VECTOR};
use vtx::GuestRegisters;
use wire::types::{ActionKind, EventKind, APPLY_TO_ALL_CORES, APPLY_TO_ALL_PROCESSES, APPLY_TO_ALL_TAG};
use wire::ErrorCode;

/// Handle to a registered event.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EventId(pub u32);

/// Outcome a custom-code action reports back.
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomCodeOutcome {
    /// Skip emulating the exiting instruction.
    pub short_circuit: bool,
    /// Run the post-emulation pass for this kind.
    pub request_post: bool,
}

/// A validated-at-registration custom code hook.
pub type CustomCodeHandler =
    fn(regs: &mut GuestRegisters, context: u64, buffer: Option<&mut [u8]>) -> CustomCodeOutcome;

/// One action of an event.
pub struct Action {
    /// Position within the event; actions run in ascending order.
    pub ordinal: u32,
    pub kind: ActionKind,
    /// Script bytecode for [`ActionKind::RunScript`].
    pub script: Vec<u8>,
    /// Handler for [`ActionKind::RunCustomCode`].
    pub custom_code: Option<CustomCodeHandler>,
    /// Pre-allocated result buffer, sized by the registration request.
    pub result_buffer: Vec<u8>,
    /// Stream results immediately instead of buffering.
    pub immediate_message_passing: bool,
}

/// One registered event.
pub struct Event {
    pub tag: u64,
    pub kind: EventKind,
    /// Core filter, or [`APPLY_TO_ALL_CORES`].
    pub core_id: u32,
    /// Process filter, or [`APPLY_TO_ALL_PROCESSES`].
    pub process_id: u32,
    pub enabled: bool,
    /// Per-kind parameters (MSR index, exception vector, range ends, ...).
    pub optional_params: [u64; 4],
    /// Condition bytecode; empty means unconditional.
    pub condition: Vec<u8>,
    pub actions: Vec<Action>,
    /// The EPT hook implementing this event, for the hook kinds.
    pub hook: Option<HookId>,
    /// Output-source tags script results may be routed to; empty means
    /// the default channel.
    pub output_source_tags: Vec<u64>,
}

impl Event {
    fn matches(&self, core: usize, process_id: u32) -> bool {
        (self.core_id == APPLY_TO_ALL_CORES || self.core_id == core as u32)
            && (self.process_id == APPLY_TO_ALL_PROCESSES || self.process_id == process_id)
    }
}

/// Debugger features that pin hardware interceptions independently of
/// user events; consulted by the protected-resources predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebuggerNeeds {
    /// Software breakpoints need #BP interception.
    pub breakpoint_exception: bool,
    /// Stepping and transparent mode need #DB interception.
    pub debug_exception: bool,
    /// The EFER syscall hook needs #UD interception.
    pub undefined_opcode: bool,
}

/// A hardware resource the dispatcher wants to release.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtectedResource {
    ExceptionBit(u8),
    ExternalInterruptExiting,
    MovDrExiting,
    RdtscExiting,
    RdpmcExiting,
}

/// The engine.
pub struct EventEngine {
    slots: Vec<Option<Event>>,
    /// Registration order per kind.
    by_kind: [Vec<EventId>; EventKind::COUNT],
    /// Per-core, per-kind count of enabled events.
    active: Vec<[u32; EventKind::COUNT]>,
    /// Records waiting for a passive-level drop.
    graveyard: Vec<Event>,
    /// Debugger-pinned resources.
    pub debugger_needs: DebuggerNeeds,
    /// The global variable array shared by every script invocation.
    script_globals: [u64; MAX_GLOBAL_COUNT],
    initialized: bool,
}

const BY_KIND_EMPTY: Vec<EventId> = Vec::new();

impl EventEngine {
    pub fn new(core_count: usize) -> Self {
        Self {
            slots: Vec::with_capacity(128),
            by_kind: [BY_KIND_EMPTY; EventKind::COUNT],
            active: alloc::vec![[0; EventKind::COUNT]; core_count],
            graveyard: Vec::new(),
            debugger_needs: DebuggerNeeds::default(),
            script_globals: [0; MAX_GLOBAL_COUNT],
            initialized: true,
        }
    }

    /// The shared script-variable array.
    pub fn script_globals(&mut self) -> &mut [u64; MAX_GLOBAL_COUNT] {
        &mut self.script_globals
    }

    fn kind_index(kind: EventKind) -> usize {
        u32::from(kind) as usize
    }

    /// Whether any enabled event of `kind` targets `core`.
    pub fn is_active_on(&self, kind: EventKind, core: usize) -> bool {
        self.active
            .get(core)
            .map(|counts| counts[Self::kind_index(kind)] > 0)
            .unwrap_or(false)
    }

    fn adjust_active(&mut self, event: &Event, delta: i32) {
        let index = Self::kind_index(event.kind);
        for (core, counts) in self.active.iter_mut().enumerate() {
            if event.core_id == APPLY_TO_ALL_CORES || event.core_id == core as u32 {
                let c = &mut counts[index];
                *c = c.wrapping_add_signed(delta);
            }
        }
    }

    /// Validate and insert an event, then enable the hardware feature it
    /// needs through the broadcaster. EPT-hook kinds carry their hook id
    /// from the hook engine; their hardware side is already in place.
    pub fn register(
        &mut self,
        event: Event,
        broadcaster: &Broadcaster<'_>,
    ) -> Result<EventId, ErrorCode> {
        if event.core_id != APPLY_TO_ALL_CORES
            && event.core_id as usize >= self.active.len()
        {
            return Err(ErrorCode::InvalidCoreId);
        }
        if event.kind.is_ept_hook() && event.hook.is_none() {
            return Err(ErrorCode::UnableToCreateEvent);
        }
        for action in &event.actions {
            if action.kind == ActionKind::RunScript && action.script.is_empty() {
                return Err(ErrorCode::ActionBufferSizeIsZero);
            }
            if action.kind == ActionKind::RunCustomCode && action.custom_code.is_none() {
                return Err(ErrorCode::InvalidActionType);
            }
        }

        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(event);
                EventId(free as u32)
            }
            None => {
                self.slots.push(Some(event));
                EventId((self.slots.len() - 1) as u32)
            }
        };
        let kind = self.slots[id.0 as usize].as_ref().unwrap().kind;
        self.by_kind[Self::kind_index(kind)].push(id);
        self.apply_event(id, broadcaster);
        let event = self.slots[id.0 as usize].take().unwrap();
        if event.enabled {
            self.adjust_active(&event, 1);
        }
        self.slots[id.0 as usize] = Some(event);
        Ok(id)
    }

    /// Enable the hardware mechanism one event needs.
    pub fn apply_event(&self, id: EventId, broadcaster: &Broadcaster<'_>) {
        let Some(event) = self.slots.get(id.0 as usize).and_then(Option::as_ref) else {
            return;
        };
        let op = match event.kind {
            EventKind::RdmsrInstructionExecution => Some(CoreOp::MsrReadExit {
                msr: param_as_msr(event.optional_params[0]),
                enable: true,
            }),
            EventKind::WrmsrInstructionExecution => Some(CoreOp::MsrWriteExit {
                msr: param_as_msr(event.optional_params[0]),
                enable: true,
            }),
            EventKind::InInstructionExecution | EventKind::OutInstructionExecution => {
                Some(CoreOp::IoExit {
                    port: param_as_port(event.optional_params[0]),
                    enable: true,
                })
            }
            EventKind::ExceptionOccurred => Some(CoreOp::ExceptionBitmapBit {
                vector: event.optional_params[0] as u8,
                enable: true,
            }),
            EventKind::ExternalInterruptOccurred => Some(CoreOp::ExternalInterruptExiting(true)),
            EventKind::DebugRegistersAccessed => Some(CoreOp::MovDrExiting(true)),
            EventKind::TscInstructionExecution => Some(CoreOp::RdtscExiting(true)),
            EventKind::PmcInstructionExecution => Some(CoreOp::RdpmcExiting(true)),
            EventKind::SyscallHookEferSyscall | EventKind::SyscallHookEferSysret => {
                Some(CoreOp::SyscallHook(true))
            }
            // CPUID and VMCALL exit unconditionally; EPT hooks were armed
            // by the hook engine before registration.
            EventKind::CpuidInstructionExecution | EventKind::VmcallInstructionExecution => None,
            _ => None,
        };
        if let Some(op) = op {
            if event.core_id == APPLY_TO_ALL_CORES {
                broadcaster.on_all_cores(op);
            } else {
                broadcaster.on_core(event.core_id as usize, op);
            }
        }
    }

    /// The disable op for an event's kind, used by the terminators.
    fn disable_op(event: &Event) -> Option<CoreOp> {
        Some(match event.kind {
            EventKind::RdmsrInstructionExecution => CoreOp::MsrReadExit {
                msr: param_as_msr(event.optional_params[0]),
                enable: false,
            },
            EventKind::WrmsrInstructionExecution => CoreOp::MsrWriteExit {
                msr: param_as_msr(event.optional_params[0]),
                enable: false,
            },
            EventKind::InInstructionExecution | EventKind::OutInstructionExecution => {
                CoreOp::IoExit {
                    port: param_as_port(event.optional_params[0]),
                    enable: false,
                }
            }
            EventKind::ExceptionOccurred => CoreOp::ExceptionBitmapBit {
                vector: event.optional_params[0] as u8,
                enable: false,
            },
            EventKind::ExternalInterruptOccurred => CoreOp::ExternalInterruptExiting(false),
            EventKind::DebugRegistersAccessed => CoreOp::MovDrExiting(false),
            EventKind::TscInstructionExecution => CoreOp::RdtscExiting(false),
            EventKind::PmcInstructionExecution => CoreOp::RdpmcExiting(false),
            EventKind::SyscallHookEferSyscall | EventKind::SyscallHookEferSysret => {
                CoreOp::SyscallHook(false)
            }
            _ => return None,
        })
    }

    /// Append an action to a registered event. Actions execute in the
    /// order they were added.
    pub fn add_action(
        &mut self,
        id: EventId,
        kind: ActionKind,
        payload: Vec<u8>,
        preallocated_buffer_size: u32,
        immediate_message_passing: bool,
    ) -> Result<(), ErrorCode> {
        let event = self
            .slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(ErrorCode::TagNotExists)?;
        match kind {
            ActionKind::RunScript if payload.is_empty() => {
                return Err(ErrorCode::ActionBufferSizeIsZero)
            }
            // Custom code carries a function pointer and cannot arrive
            // over the wire; kernel-side callers attach it directly.
            ActionKind::RunCustomCode => return Err(ErrorCode::InvalidActionType),
            _ => {}
        }
        let ordinal = event.actions.len() as u32;
        event.actions.push(Action {
            ordinal,
            kind,
            script: payload,
            custom_code: None,
            result_buffer: alloc::vec![0u8; preallocated_buffer_size as usize],
            immediate_message_passing,
        });
        Ok(())
    }

    /// Look up an event id by tag.
    pub fn find_by_tag(&self, tag: u64) -> Option<EventId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|e| e.tag == tag).unwrap_or(false))
            .map(|i| EventId(i as u32))
    }

    pub fn get(&self, id: EventId) -> Option<&Event> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    /// Enable or disable an event by tag.
    pub fn set_enabled(&mut self, tag: u64, enabled: bool) -> Result<(), ErrorCode> {
        if tag == APPLY_TO_ALL_TAG {
            let ids: Vec<usize> = (0..self.slots.len()).collect();
            for i in ids {
                if self.slots[i].is_some() {
                    self.set_enabled_at(EventId(i as u32), enabled);
                }
            }
            return Ok(());
        }
        let id = self
            .find_by_tag(tag)
            .ok_or(ErrorCode::ModifyEventsInvalidTag)?;
        self.set_enabled_at(id, enabled);
        Ok(())
    }

    fn set_enabled_at(&mut self, id: EventId, enabled: bool) {
        let Some(event) = self.slots[id.0 as usize].take() else {
            return;
        };
        if event.enabled != enabled {
            self.adjust_active(&event, if enabled { 1 } else { -1 });
        }
        let mut event = event;
        event.enabled = enabled;
        self.slots[id.0 as usize] = Some(event);
    }

    /// Query whether the event with `tag` is enabled.
    pub fn query_state(&self, tag: u64) -> Result<bool, ErrorCode> {
        let id = self
            .find_by_tag(tag)
            .ok_or(ErrorCode::ModifyEventsInvalidTag)?;
        Ok(self.get(id).map(|e| e.enabled).unwrap_or(false))
    }

    /// Remove one event without disturbing its siblings.
    ///
    /// When siblings of the kind survive, the shared hardware feature is
    /// disabled once and every *other* event re-applied; when the removed
    /// event was the last of its kind, the feature is simply disabled.
    /// The record is parked in the graveyard for a passive-level drop;
    /// the caller tears down any EPT hook the event owned.
    pub fn clear(
        &mut self,
        tag: u64,
        broadcaster: &Broadcaster<'_>,
    ) -> Result<Option<HookId>, ErrorCode> {
        let id = self
            .find_by_tag(tag)
            .ok_or(ErrorCode::ModifyEventsInvalidTag)?;
        let event = self.slots[id.0 as usize]
            .take()
            .ok_or(ErrorCode::ModifyEventsInvalidTag)?;
        let kind_index = Self::kind_index(event.kind);
        self.by_kind[kind_index].retain(|e| *e != id);
        if event.enabled {
            self.adjust_active(&event, -1);
        }

        if let Some(op) = Self::disable_op(&event) {
            broadcaster.on_all_cores(op);
            // Re-apply the survivors of the same kind so their
            // interceptions come back.
            let survivors: Vec<EventId> = self.by_kind[kind_index].clone();
            for sibling in survivors {
                self.apply_event(sibling, broadcaster);
            }
        }

        let hook = event.hook;
        self.graveyard.push(event);
        Ok(hook)
    }

    /// Remove every event; returns the hooks the caller must tear down.
    pub fn clear_all(&mut self, broadcaster: &Broadcaster<'_>) -> Vec<HookId> {
        let tags: Vec<u64> = self
            .slots
            .iter()
            .filter_map(|s| s.as_ref().map(|e| e.tag))
            .collect();
        let mut hooks = Vec::new();
        for tag in tags {
            if let Ok(Some(hook)) = self.clear(tag, broadcaster) {
                hooks.push(hook);
            }
        }
        hooks
    }

    /// Drop records parked by the terminators. Passive level only.
    pub fn drain_graveyard(&mut self) -> usize {
        let n = self.graveyard.len();
        self.graveyard.clear();
        n
    }

    /// Whether a hardware resource is still needed by any live event or
    /// pinned debugger feature. The dispatcher asks before disabling a
    /// VMCS control globally; a `true` answer overrides the request.
    pub fn is_protected(&self, resource: ProtectedResource) -> bool {
        let event_needs = |kind: EventKind, vector: Option<u8>| {
            self.by_kind[Self::kind_index(kind)].iter().any(|id| {
                self.get(*id)
                    .map(|e| {
                        e.enabled
                            && vector
                                .map(|v| e.optional_params[0] as u8 == v)
                                .unwrap_or(true)
                    })
                    .unwrap_or(false)
            })
        };
        match resource {
            ProtectedResource::ExceptionBit(vector) => {
                if vector == BREAKPOINT_VECTOR && self.debugger_needs.breakpoint_exception {
                    return true;
                }
                if vector == DEBUG_VECTOR && self.debugger_needs.debug_exception {
                    return true;
                }
                if vector == INVALID_OPCODE_VECTOR
                    && (self.debugger_needs.undefined_opcode
                        || event_needs(EventKind::SyscallHookEferSyscall, None)
                        || event_needs(EventKind::SyscallHookEferSysret, None))
                {
                    return true;
                }
                event_needs(EventKind::ExceptionOccurred, Some(vector))
            }
            ProtectedResource::ExternalInterruptExiting => {
                event_needs(EventKind::ExternalInterruptOccurred, None)
            }
            ProtectedResource::MovDrExiting => event_needs(EventKind::DebugRegistersAccessed, None),
            ProtectedResource::RdtscExiting => event_needs(EventKind::TscInstructionExecution, None),
            ProtectedResource::RdpmcExiting => event_needs(EventKind::PmcInstructionExecution, None),
        }
    }

    /// Walk the list for `kind` and run every matching event's actions.
    ///
    /// Returns the aggregate response and whether any event requested a
    /// post-emulation pass.
    #[allow(clippy::too_many_arguments)]
    pub fn trigger(
        &mut self,
        hv: &crate::Hypervisor<'_>,
        kind: EventKind,
        stage: CallingStage,
        context: u64,
        regs: &mut GuestRegisters,
        core: usize,
    ) -> (TriggerResponse, bool) {
        if !self.initialized {
            return (TriggerResponse::NotInitialized, false);
        }
        let process_id = hv.platform.current_process_id();
        let mut short_circuit = false;
        let mut post_requested = false;

        // Events fire in registration order; the list is only mutated
        // with the guest quiesced, so the iteration cannot race an
        // insertion.
        let count = self.by_kind[Self::kind_index(kind)].len();
        for index in 0..count {
            let id = self.by_kind[Self::kind_index(kind)][index];
            let Some(event) = self.slots[id.0 as usize].as_mut() else {
                continue;
            };
            if !event.enabled || !event.matches(core, process_id) {
                continue;
            }
            let trigger_context = TriggerContext {
                tag: event.tag,
                context,
                core,
            };
            if !event.condition.is_empty()
                && hv
                    .script
                    .evaluate_condition(&event.condition, regs, &trigger_context)
                    == 0
            {
                continue;
            }
            if stage == CallingStage::PreEvent {
                post_requested |= post_wanted(event);
            }

            for action in event.actions.iter_mut() {
                match action.kind {
                    ActionKind::BreakToDebugger => {
                        hv.debugger.break_to_debugger(
                            core,
                            regs,
                            wire::types::PausingReason::EventTriggered,
                            trigger_context.tag,
                        );
                    }
                    ActionKind::RunScript => {
                        let mut temps = [0u64; MAX_TEMP_COUNT];
                        let mut output = ActionBuffer {
                            disposition: if action.immediate_message_passing {
                                OutputDisposition::Immediate
                            } else {
                                OutputDisposition::Buffered
                            },
                            buffer: if action.result_buffer.is_empty() {
                                None
                            } else {
                                Some(action.result_buffer.as_mut_slice())
                            },
                            short_circuit_requested: false,
                            post_event_requested: false,
                        };
                        if hv
                            .script
                            .execute(
                                &action.script,
                                regs,
                                &trigger_context,
                                &mut temps,
                                &mut self.script_globals,
                                &mut output,
                            )
                            .is_err()
                        {
                            warn!("script action of event {:#x} failed", trigger_context.tag);
                        }
                        short_circuit |= output.short_circuit_requested;
                        post_requested |= output.post_event_requested;
                    }
                    ActionKind::RunCustomCode => {
                        if let Some(handler) = action.custom_code {
                            let buffer = if action.result_buffer.is_empty() {
                                None
                            } else {
                                Some(action.result_buffer.as_mut_slice())
                            };
                            let outcome = handler(regs, context, buffer);
                            short_circuit |= outcome.short_circuit;
                            post_requested |= outcome.request_post;
                        }
                    }
                }
            }
        }

        let response = if short_circuit {
            TriggerResponse::SuccessfulIgnoreEvent
        } else {
            TriggerResponse::Successful
        };
        (response, post_requested && stage == CallingStage::PreEvent)
    }
}

/// Post events only make sense for kinds with an emulation step to
/// observe; hook reads/writes and breakpoints get theirs from the MTF
/// restore path instead.
fn post_wanted(event: &Event) -> bool {
    !event.kind.is_ept_hook()
}

fn param_as_msr(param: u64) -> Option<u32> {
    if param == u64::MAX {
        None
    } else {
        Some(param as u32)
    }
}

fn param_as_port(param: u64) -> Option<u16> {
    if param == u64::MAX {
        None
    } else {
        Some(param as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::OpDelivery;
    use crate::testing::MockPlatform;
    use std::sync::Mutex;

    struct RecordingDelivery {
        log: Mutex<Vec<(usize, CoreOp)>>,
    }

    impl RecordingDelivery {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
            }
        }

        fn ops(&self) -> Vec<CoreOp> {
            self.log.lock().unwrap().iter().map(|(_, op)| *op).collect()
        }
    }

    impl OpDelivery for RecordingDelivery {
        fn deliver(&self, core: usize, op: CoreOp) {
            self.log.lock().unwrap().push((core, op));
        }
    }

    fn msr_event(tag: u64, msr: u64) -> Event {
        Event {
            tag,
            kind: EventKind::RdmsrInstructionExecution,
            core_id: APPLY_TO_ALL_CORES,
            process_id: APPLY_TO_ALL_PROCESSES,
            enabled: true,
            optional_params: [msr, 0, 0, 0],
            condition: Vec::new(),
            actions: Vec::new(),
            hook: None,
            output_source_tags: Vec::new(),
        }
    }

    #[test]
    fn registration_broadcasts_the_msr_bitmap_bit() {
        let platform = MockPlatform::new(2, 64);
        let delivery = RecordingDelivery::new();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &delivery,
        };
        let mut engine = EventEngine::new(2);
        engine
            .register(msr_event(0x100, 0xC000_0080), &broadcaster)
            .unwrap();
        let expected = CoreOp::MsrReadExit {
            msr: Some(0xC000_0080),
            enable: true,
        };
        // One delivery per core.
        assert_eq!(delivery.ops(), vec![expected, expected]);
        assert!(engine.is_active_on(EventKind::RdmsrInstructionExecution, 0));
        assert!(engine.is_active_on(EventKind::RdmsrInstructionExecution, 1));
    }

    #[test]
    fn core_filter_limits_activation_and_broadcast() {
        let platform = MockPlatform::new(4, 64);
        let delivery = RecordingDelivery::new();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &delivery,
        };
        let mut engine = EventEngine::new(4);
        let mut event = msr_event(0x200, 0x10);
        event.core_id = 2;
        engine.register(event, &broadcaster).unwrap();
        let log = delivery.log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 2);
        drop(log);
        assert!(!engine.is_active_on(EventKind::RdmsrInstructionExecution, 0));
        assert!(engine.is_active_on(EventKind::RdmsrInstructionExecution, 2));

        let mut bad = msr_event(0x201, 0x10);
        bad.core_id = 9;
        assert_eq!(
            engine.register(bad, &broadcaster),
            Err(ErrorCode::InvalidCoreId)
        );
    }

    #[test]
    fn clearing_one_of_two_siblings_reapplies_the_other() {
        let platform = MockPlatform::new(1, 64);
        let delivery = RecordingDelivery::new();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &delivery,
        };
        let mut engine = EventEngine::new(1);
        engine
            .register(msr_event(0x300, 0xC000_0080), &broadcaster)
            .unwrap();
        engine
            .register(msr_event(0x301, 0xC000_0080), &broadcaster)
            .unwrap();
        delivery.log.lock().unwrap().clear();

        engine.clear(0x300, &broadcaster).unwrap();
        // Disable once, then re-apply the survivor.
        assert_eq!(
            delivery.ops(),
            vec![
                CoreOp::MsrReadExit {
                    msr: Some(0xC000_0080),
                    enable: false,
                },
                CoreOp::MsrReadExit {
                    msr: Some(0xC000_0080),
                    enable: true,
                },
            ]
        );
        // The sibling still counts as active; the record is parked, not
        // freed, until passive level.
        assert!(engine.is_active_on(EventKind::RdmsrInstructionExecution, 0));
        assert_eq!(engine.drain_graveyard(), 1);
    }

    #[test]
    fn clearing_the_last_sibling_just_disables() {
        let platform = MockPlatform::new(1, 64);
        let delivery = RecordingDelivery::new();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &delivery,
        };
        let mut engine = EventEngine::new(1);
        engine.register(msr_event(0x400, 0x1D9), &broadcaster).unwrap();
        delivery.log.lock().unwrap().clear();
        engine.clear(0x400, &broadcaster).unwrap();
        assert_eq!(
            delivery.ops(),
            vec![CoreOp::MsrReadExit {
                msr: Some(0x1D9),
                enable: false,
            }]
        );
        assert!(!engine.is_active_on(EventKind::RdmsrInstructionExecution, 0));
        assert_eq!(
            engine.clear(0x400, &broadcaster),
            Err(ErrorCode::ModifyEventsInvalidTag)
        );
    }

    #[test]
    fn enable_disable_and_query_by_tag() {
        let platform = MockPlatform::new(1, 64);
        let delivery = RecordingDelivery::new();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &delivery,
        };
        let mut engine = EventEngine::new(1);
        engine.register(msr_event(0x500, 0x10), &broadcaster).unwrap();
        assert_eq!(engine.query_state(0x500), Ok(true));

        engine.set_enabled(0x500, false).unwrap();
        assert_eq!(engine.query_state(0x500), Ok(false));
        assert!(!engine.is_active_on(EventKind::RdmsrInstructionExecution, 0));

        engine.set_enabled(0x500, true).unwrap();
        assert!(engine.is_active_on(EventKind::RdmsrInstructionExecution, 0));

        assert_eq!(
            engine.set_enabled(0x999, true),
            Err(ErrorCode::ModifyEventsInvalidTag)
        );
        assert_eq!(
            engine.query_state(0x999),
            Err(ErrorCode::ModifyEventsInvalidTag)
        );
    }

    #[test]
    fn protected_resources_track_events_and_debugger_needs() {
        let platform = MockPlatform::new(1, 64);
        let delivery = RecordingDelivery::new();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &delivery,
        };
        let mut engine = EventEngine::new(1);
        assert!(!engine.is_protected(ProtectedResource::ExceptionBit(3)));

        engine.debugger_needs.breakpoint_exception = true;
        assert!(engine.is_protected(ProtectedResource::ExceptionBit(3)));
        assert!(!engine.is_protected(ProtectedResource::ExceptionBit(14)));

        let mut exception_event = msr_event(0x600, 0);
        exception_event.kind = EventKind::ExceptionOccurred;
        exception_event.optional_params[0] = 14;
        engine.register(exception_event, &broadcaster).unwrap();
        assert!(engine.is_protected(ProtectedResource::ExceptionBit(14)));

        engine.set_enabled(0x600, false).unwrap();
        assert!(!engine.is_protected(ProtectedResource::ExceptionBit(14)));
    }

    #[test]
    fn syscall_events_protect_ud_interception() {
        let platform = MockPlatform::new(1, 64);
        let delivery = RecordingDelivery::new();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &delivery,
        };
        let mut engine = EventEngine::new(1);
        let mut event = msr_event(0x700, 0);
        event.kind = EventKind::SyscallHookEferSyscall;
        engine.register(event, &broadcaster).unwrap();
        assert!(engine.is_protected(ProtectedResource::ExceptionBit(INVALID_OPCODE_VECTOR)));
    }
}
