//! The debuggee side: halt protocol and the VMX-root command loop.
//!
//! One core, the *conductor*, initiates a pause, NMIs every peer, and
//! services packets from the debugger while everybody spins in VMX root.
//! The `change-core` command moves the conductor role; `continue`
//! releases all cores at once. Commands run directly against the
//! hypervisor: the memory mapper for memory access, the hook/event
//! engines for registrations, the breakpoint table for `bp`.

use crate::breakpoints::BreakpointManager;
use crate::commands;
use crate::serial::{receive_packet, send_packet, SerialError, SerialIo};
use crate::stepping::{self, StepAction, SteppingMode};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use hv::broadcast::{Broadcaster, CoreOp, OpDelivery};
use hv::hooks;
use hv::mapper::GuestMemory;
use hv::script::{ActionBuffer, OutputDisposition, ScriptEngine, TriggerContext, MAX_TEMP_COUNT};
use hv::state::MtfOwner;
use hv::sync::SpinLock;
use hv::{DebuggerHooks, Hypervisor};
use vtx::exit::{BREAKPOINT_VECTOR, DEBUG_VECTOR};
use vtx::regs::Rflags;
use vtx::{GuestRegisters, VirtAddr};
use wire::error::KernelStatus;
use wire::payloads::{
    AddActionPacket, AddressTranslationPacket, BpListOrModifyPacket, BpPacket, ChangeCorePacket,
    ChangeProcessPacket, ChangeThreadPacket, EditMemoryPacket, EventRegistrationPacket,
    ModifyEventPacket, PausedPacket, ReadMemoryPacket, RegisterReadDescription, ScriptPacket,
    SearchMemoryPacket, StepPacket, UserInputPacket, MAXIMUM_INSTR_SIZE,
};
use wire::types::{
    ActionKind, BreakpointModifyRequest, DebuggeeAction, DebuggerAction, EventKind,
    ModifyEventKind, PacketKind, PausingReason, SteppingKind,
};
use wire::{ErrorCode, FrameAssembler};

/// Per-core debugger-side state.
#[derive(Default)]
struct CoreDebugState {
    stepping: SteppingMode,
    /// Breakpoint byte to put back on the pending MTF.
    pending_reapply: Option<u64>,
    /// One-shot breakpoint planted by a step-over.
    one_shot_breakpoint: Option<u64>,
    /// Announce a core-switch pause when this core becomes conductor.
    announce_switch: bool,
}

/// The debuggee.
pub struct Debuggee<T: SerialIo + Send> {
    hv: AtomicPtr<Hypervisor<'static>>,
    transport: SpinLock<T>,
    assembler: SpinLock<FrameAssembler>,
    pub breakpoints: SpinLock<BreakpointManager>,
    cores: SpinLock<Vec<CoreDebugState>>,
    operating_core: AtomicUsize,
    unload_pending: AtomicBool,
    attached: AtomicBool,
}

/// Broadcast delivery used once the VM is up: hand the op to VMX root
/// with a VMCALL on the target core.
struct VmcallDelivery;

impl OpDelivery for VmcallDelivery {
    fn deliver(&self, _core: usize, op: CoreOp) {
        let (code, arg) = op.encode();
        #[cfg(not(test))]
        unsafe {
            core::arch::asm!(
                "vmcall",
                in("rcx") code,
                in("rdx") arg,
                lateout("rax") _,
            );
        }
        #[cfg(test)]
        let _ = (code, arg);
    }
}

impl<T: SerialIo + Send> Debuggee<T> {
    pub fn new(transport: T) -> Self {
        Self {
            hv: AtomicPtr::new(core::ptr::null_mut()),
            transport: SpinLock::new(transport),
            assembler: SpinLock::new(FrameAssembler::new()),
            breakpoints: SpinLock::new(BreakpointManager::new()),
            cores: SpinLock::new(Vec::new()),
            operating_core: AtomicUsize::new(0),
            unload_pending: AtomicBool::new(false),
            attached: AtomicBool::new(false),
        }
    }

    /// Bind to the hypervisor, pin the debugger's exception intercepts
    /// and tell the remote end we are alive.
    pub fn attach(&self, hv: &'static Hypervisor<'static>) {
        self.hv.store(hv as *const _ as *mut _, Ordering::Release);
        {
            let mut cores = self.cores.lock();
            cores.clear();
            cores.resize_with(hv.platform.core_count(), CoreDebugState::default);
        }
        {
            let mut events = hv.events.lock();
            events.debugger_needs.breakpoint_exception = true;
            events.debugger_needs.debug_exception = true;
        }
        let broadcaster = Broadcaster {
            platform: hv.platform,
            delivery: &VmcallDelivery,
        };
        broadcaster.on_all_cores(CoreOp::ExceptionBitmapBit {
            vector: BREAKPOINT_VECTOR,
            enable: true,
        });
        broadcaster.on_all_cores(CoreOp::ExceptionBitmapBit {
            vector: DEBUG_VECTOR,
            enable: true,
        });
        self.attached.store(true, Ordering::Release);
        self.send(DebuggeeAction::Started, &[]);
    }

    fn hv(&self) -> &'static Hypervisor<'static> {
        let p = self.hv.load(Ordering::Acquire);
        debug_assert!(!p.is_null());
        unsafe { &*p }
    }

    fn send(&self, action: DebuggeeAction, payload: &[u8]) {
        let mut transport = self.transport.lock();
        if let Err(e) = send_packet(
            &mut *transport,
            PacketKind::DebuggeeToDebugger,
            action.into(),
            payload,
        ) {
            warn!("failed to send {:?}: {:?}", action, e);
        }
    }

    fn broadcaster(&self) -> Broadcaster<'static> {
        Broadcaster {
            platform: self.hv().platform,
            delivery: &VmcallDelivery,
        }
    }

    /// The guest CR3 used for memory commands.
    fn command_cr3(&self) -> u64 {
        #[cfg(not(test))]
        {
            vtx::vmcs::vmread(vtx::vmcs::VmcsField::GuestCr3)
                .unwrap_or_else(|_| self.hv().mapper.kernel_cr3())
        }
        #[cfg(test)]
        {
            0
        }
    }

    fn guest_rip() -> u64 {
        #[cfg(not(test))]
        {
            vtx::vmcs::vmread(vtx::vmcs::VmcsField::GuestRip).unwrap_or(0)
        }
        #[cfg(test)]
        {
            0
        }
    }

    fn guest_rflags() -> u64 {
        #[cfg(not(test))]
        {
            vtx::vmcs::vmread(vtx::vmcs::VmcsField::GuestRflags).unwrap_or(0)
        }
        #[cfg(test)]
        {
            0
        }
    }

    fn set_guest_rflags(value: u64) {
        #[cfg(not(test))]
        {
            let _ = vtx::vmcs::vmwrite(vtx::vmcs::VmcsField::GuestRflags, value);
        }
        #[cfg(test)]
        let _ = value;
    }

    fn guest_rsp() -> u64 {
        #[cfg(not(test))]
        {
            vtx::vmcs::vmread(vtx::vmcs::VmcsField::GuestRsp).unwrap_or(0)
        }
        #[cfg(test)]
        {
            0
        }
    }

    fn arm_trap_flag() {
        Self::set_guest_rflags(Self::guest_rflags() | Rflags::TF.bits());
    }

    fn clear_trap_flag() {
        Self::set_guest_rflags(Self::guest_rflags() & !Rflags::TF.bits());
    }

    /// Assemble and emit one paused packet for the calling core.
    fn send_paused(&self, core: usize, reason: PausingReason, tag: u64) {
        let hv = self.hv();
        let rip = Self::guest_rip();
        let mut window = [0u8; MAXIMUM_INSTR_SIZE];
        if let Some(va) = VirtAddr::new(rip) {
            let _ = hv.mapper.read_virt(va, self.command_cr3(), &mut window);
        }
        let packet = PausedPacket {
            rip,
            is_32bit_address: false,
            reason,
            current_core: core as u32,
            event_tag: tag,
            rflags: Self::guest_rflags(),
            instruction_bytes: window,
        };
        self.send(DebuggeeAction::PausedAndCurrentInstruction, &packet.encode());
    }

    /// Halt every core and run the command loop on this one.
    ///
    /// Must be called from VMX root on the conductor core.
    pub fn pause_all(&self, core: usize, regs: &mut GuestRegisters, reason: PausingReason, tag: u64) {
        let hv = self.hv();
        for i in 0..hv.cores.len() {
            hv.cores.set_halted(i, true);
            if i != core {
                hv.cores.set_awaiting_nmi(i, true);
                // Peers currently inside their own exit handlers cannot
                // take the NMI until they re-enter the guest.
                hv.cores.request_immediate_vmexit(i);
            }
        }
        hv.platform.send_nmi_to_peers();
        self.operating_core.store(core, Ordering::Release);
        self.send_paused(core, reason, tag);
        self.root_loop(core, regs);
    }

    /// The halted spin. The operating core services packets; everyone
    /// else waits for its flag to clear.
    fn root_loop(&self, core: usize, regs: &mut GuestRegisters) {
        let hv = self.hv();
        unsafe {
            hv.cores.get_mut(core).paused_regs = *regs;
        }
        loop {
            if !hv.cores.is_halted(core) {
                break;
            }
            if self.operating_core.load(Ordering::Acquire) == core {
                {
                    let announce = {
                        let mut cores = self.cores.lock();
                        core::mem::take(&mut cores[core].announce_switch)
                    };
                    if announce {
                        self.send_paused(core, PausingReason::CoreSwitched, 0);
                    }
                }
                match self.service_one_packet(core, regs) {
                    Ok(()) => {}
                    Err(SerialError::Disconnected) => {
                        warn!("debugger disconnected; releasing all cores");
                        self.reset_connection_state();
                        break;
                    }
                    Err(e) => {
                        warn!("transport error: {:?}", e);
                    }
                }
            } else {
                core::hint::spin_loop();
            }
        }
        if self.unload_pending.load(Ordering::Acquire) {
            unsafe {
                let core_state = hv.cores.get_mut(core);
                hv::vmx::vmxoff_on_exit(hv, core_state);
            }
        }
    }

    /// On a disconnection: clear debugger state so a fresh session can
    /// attach, then release the guest.
    fn reset_connection_state(&self) {
        let hv = self.hv();
        self.assembler.lock().reset();
        {
            let mut bps = self.breakpoints.lock();
            bps.clear_all(&hv.mapper);
        }
        for i in 0..hv.cores.len() {
            hv.cores.set_halted(i, false);
        }
    }

    fn release_all(&self) {
        let hv = self.hv();
        for i in 0..hv.cores.len() {
            hv.cores.set_halted(i, false);
        }
    }

    fn service_one_packet(&self, core: usize, regs: &mut GuestRegisters) -> Result<(), SerialError> {
        let (header, payload) = {
            let mut transport = self.transport.lock();
            let mut assembler = self.assembler.lock();
            receive_packet(&mut *transport, &mut assembler, PacketKind::accepted_by_debuggee)?
        };
        let Ok(action) = DebuggerAction::try_from(header.action) else {
            warn!("unknown requested action {:#x}", header.action);
            return Ok(());
        };
        self.dispatch_command(core, regs, action, &payload);
        Ok(())
    }

    fn dispatch_command(
        &self,
        core: usize,
        regs: &mut GuestRegisters,
        action: DebuggerAction,
        payload: &[u8],
    ) {
        let hv = self.hv();
        match action {
            DebuggerAction::Continue => {
                self.release_all();
            }
            DebuggerAction::Step => self.handle_step(core, payload),
            DebuggerAction::CloseAndUnloadDebuggee => self.handle_unload(),
            DebuggerAction::ChangeCore => self.handle_change_core(core, payload),
            DebuggerAction::FlushBuffers => {
                self.send(DebuggeeAction::ResultOfFlush, &KernelStatus::SUCCESS.0.to_le_bytes());
            }
            DebuggerAction::ChangeProcess => self.handle_change_process(payload),
            DebuggerAction::ChangeThread => self.handle_change_thread(payload),
            DebuggerAction::RunScript => self.handle_run_script(core, regs, payload),
            DebuggerAction::UserInputBuffer => {
                // The input is executed by the user-mode shell once the
                // debuggee resumes; acknowledge receipt here.
                let response = UserInputPacket {
                    result: KernelStatus::SUCCESS,
                    command: Vec::new(),
                };
                self.send(DebuggeeAction::ResultOfRunningScript, &response.encode());
            }
            DebuggerAction::RegisterEvent => self.handle_register_event(payload),
            DebuggerAction::AddActionToEvent => self.handle_add_action(payload),
            DebuggerAction::QueryAndModifyEvent => self.handle_modify_event(payload),
            DebuggerAction::ReadRegisters => self.handle_read_registers(regs, payload),
            DebuggerAction::ReadMemory => {
                let response = match ReadMemoryPacket::decode(payload) {
                    Some(req) => commands::read_memory(&hv.mapper, self.command_cr3(), req),
                    None => return self.send_status(DebuggeeAction::ResultOfReadingMemory, ErrorCode::CorruptedPacketReceived),
                };
                self.send(DebuggeeAction::ResultOfReadingMemory, &response.encode());
            }
            DebuggerAction::EditMemory => {
                let response = match EditMemoryPacket::decode(payload) {
                    Some(req) => commands::edit_memory(&hv.mapper, self.command_cr3(), req),
                    None => return self.send_status(DebuggeeAction::ResultOfEditingMemory, ErrorCode::CorruptedPacketReceived),
                };
                self.send(DebuggeeAction::ResultOfEditingMemory, &response.encode());
            }
            DebuggerAction::SearchMemory => self.handle_search(payload),
            DebuggerAction::BreakpointCreate => self.handle_bp_create(payload),
            DebuggerAction::ListOrModifyBreakpoints => self.handle_bp_modify(payload),
            DebuggerAction::Callstack => self.handle_callstack(),
            DebuggerAction::TestQuery => {
                self.send(DebuggeeAction::ResultOfTestQuery, &KernelStatus::SUCCESS.0.to_le_bytes());
            }
            DebuggerAction::SymbolReload => {
                // Symbols live in the user-mode front-end; the kernel
                // only confirms the request reached a paused debuggee.
                self.send(DebuggeeAction::ResultOfSymbolReload, &KernelStatus::SUCCESS.0.to_le_bytes());
            }
            DebuggerAction::Va2PaAndPa2Va => self.handle_translate(payload),
            DebuggerAction::PteDetails => self.handle_pte(payload),
            DebuggerAction::UserModePause | DebuggerAction::UserModeDoNotReadAnyPacket => {
                // User-mode directives are not serviced from VMX root.
            }
        }
    }

    fn send_status(&self, action: DebuggeeAction, error: ErrorCode) {
        let status: KernelStatus = error.into();
        self.send(action, &status.0.to_le_bytes());
    }

    fn handle_step(&self, core: usize, payload: &[u8]) {
        let Some(request) = StepPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let rip = Self::guest_rip();
        let mut window = [0u8; MAXIMUM_INSTR_SIZE];
        if let Some(va) = VirtAddr::new(rip) {
            let _ = hv.mapper.read_virt(va, self.command_cr3(), &mut window);
        }
        let class = stepping::classify(&window, true);

        let mut cores = self.cores.lock();
        match stepping::plan_step(request.kind, rip, class) {
            StepAction::ArmTrapFlag => {
                cores[core].stepping = match request.kind {
                    SteppingKind::StepIn | SteppingKind::StepOver => SteppingMode::StepIn,
                    SteppingKind::GoUp => SteppingMode::GoUp {
                        stepped_past_ret: false,
                    },
                    SteppingKind::InstrumentationStepIn => unreachable!(),
                };
                Self::arm_trap_flag();
            }
            StepAction::ArmInstrumentationTrapFlag { start_rip } => {
                cores[core].stepping = SteppingMode::InstrumentationStepIn { start_rip };
                unsafe {
                    let cs = hv.cores.get_mut(core);
                    cs.flags.instrumentation_step_in = true;
                    cs.instrumentation_step_rip = start_rip;
                }
                Self::arm_trap_flag();
            }
            StepAction::OneShotBreakpoint { at } => {
                let mut bps = self.breakpoints.lock();
                match VirtAddr::new(at).ok_or(ErrorCode::InvalidAddress).and_then(|va| {
                    bps.add(
                        &hv.mapper,
                        self.command_cr3(),
                        va,
                        wire::types::APPLY_TO_ALL_PROCESSES,
                        wire::types::APPLY_TO_ALL_THREADS,
                        core as u32,
                        class.len() as u16,
                    )
                }) {
                    Ok(id) => {
                        cores[core].stepping = SteppingMode::StepOver { breakpoint_id: id };
                        cores[core].one_shot_breakpoint = Some(id);
                    }
                    Err(_) => {
                        // Fall back to a plain single step.
                        cores[core].stepping = SteppingMode::StepIn;
                        Self::arm_trap_flag();
                    }
                }
            }
        }
        drop(cores);
        // Only the stepping core resumes; peers stay halted.
        self.hv().cores.set_halted(core, false);
    }

    fn handle_unload(&self) {
        let hv = self.hv();
        {
            let mut bps = self.breakpoints.lock();
            bps.clear_all(&hv.mapper);
        }
        {
            let broadcaster = self.broadcaster();
            let mut events = hv.events.lock();
            let hooks_to_remove = events.clear_all(&broadcaster);
            drop(events);
            let mut ept = hv.ept.lock();
            for hook in hooks_to_remove {
                hooks::remove_record(&mut ept, hv.platform, &hv.pools, hook);
            }
            hooks::unhook_all(&mut ept, hv.platform, &hv.pools);
        }
        self.unload_pending.store(true, Ordering::Release);
        self.send(
            DebuggeeAction::ResultOfFlush,
            &KernelStatus::SUCCESS.0.to_le_bytes(),
        );
        self.release_all();
    }

    fn handle_change_core(&self, core: usize, payload: &[u8]) {
        let Some(mut request) = ChangeCorePacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        if (request.new_core as usize) < hv.cores.len() {
            let target = request.new_core as usize;
            request.result = KernelStatus::SUCCESS;
            self.send(DebuggeeAction::ResultOfChangingCore, &request.encode());
            if target != core {
                self.cores.lock()[target].announce_switch = true;
                self.operating_core.store(target, Ordering::Release);
            }
        } else {
            request.result = ErrorCode::InvalidCoreInRemoteDebuggee.into();
            self.send(DebuggeeAction::ResultOfChangingCore, &request.encode());
        }
    }

    fn handle_change_process(&self, payload: &[u8]) {
        let Some(mut request) = ChangeProcessPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        if request.get_remote_pid {
            request.process_id = hv.platform.current_process_id();
            request.result = KernelStatus::SUCCESS;
        } else if hv.platform.kernel_cr3_of(request.process_id).is_some() {
            request.result = KernelStatus::SUCCESS;
        } else {
            request.result = ErrorCode::UnableToSwitchToNewProcess.into();
        }
        self.send(DebuggeeAction::ResultOfChangingProcess, &request.encode());
    }

    fn handle_change_thread(&self, payload: &[u8]) {
        let Some(mut request) = ChangeThreadPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        if request.get_remote_tid {
            request.thread_id = hv.platform.current_thread_id();
            request.result = KernelStatus::SUCCESS;
        } else {
            request.result = ErrorCode::InvalidThreadId.into();
        }
        self.send(DebuggeeAction::ResultOfChangingThread, &request.encode());
    }

    fn handle_run_script(&self, core: usize, regs: &mut GuestRegisters, payload: &[u8]) {
        let Some(mut request) = ScriptPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let context = TriggerContext {
            tag: 0,
            context: 0,
            core,
        };
        let mut temps = [0u64; MAX_TEMP_COUNT];
        let mut output = ActionBuffer {
            disposition: OutputDisposition::Immediate,
            buffer: None,
            short_circuit_requested: false,
            post_event_requested: false,
        };
        let mut events = hv.events.lock();
        request.result = match hv.script.execute(
            &request.bytecode,
            regs,
            &context,
            &mut temps,
            events.script_globals(),
            &mut output,
        ) {
            Ok(()) => KernelStatus::SUCCESS,
            Err(_) => ErrorCode::ScriptEngineFailed.into(),
        };
        drop(events);
        request.bytecode.clear();
        self.send(DebuggeeAction::ResultOfRunningScript, &request.encode());
    }

    fn handle_register_event(&self, payload: &[u8]) {
        let Some(request) = EventRegistrationPacket::decode(payload) else {
            return self.send_status(
                DebuggeeAction::ResultOfRegisteringEvent,
                ErrorCode::CorruptedPacketReceived,
            );
        };
        let hv = self.hv();
        let Ok(kind) = EventKind::try_from(request.kind) else {
            return self.send_status(
                DebuggeeAction::ResultOfRegisteringEvent,
                ErrorCode::EventTypeIsInvalid,
            );
        };

        // EPT-backed kinds install their hook before the registration.
        let hook = if kind.is_ept_hook() {
            let target = match VirtAddr::new(request.optional_params[0]) {
                Some(va) => va,
                None => {
                    return self.send_status(
                        DebuggeeAction::ResultOfRegisteringEvent,
                        ErrorCode::InvalidAddress,
                    )
                }
            };
            let cr3 = self.command_cr3();
            let mut ept = hv.ept.lock();
            let installed = match kind {
                EventKind::HiddenHookExecCc => hooks::install_hidden_breakpoint(
                    &mut ept, hv.platform, &hv.pools, &hv.mapper, target, cr3,
                ),
                EventKind::HiddenHookExecDetours => hooks::install_detour(
                    &mut ept,
                    hv.platform,
                    &hv.pools,
                    &hv.mapper,
                    target,
                    request.optional_params[1],
                    cr3,
                )
                .map(|(id, _trampoline)| id),
                _ => {
                    let mut watch = hooks::HookAccess::empty();
                    if kind.watches_read() {
                        watch |= hooks::HookAccess::READ;
                    }
                    if kind.watches_write() {
                        watch |= hooks::HookAccess::WRITE;
                    }
                    hooks::install_monitor(&mut ept, hv.platform, &hv.pools, &hv.mapper, target, cr3, watch)
                }
            };
            match installed {
                Ok(id) => Some(id),
                Err(e) => {
                    return self.send_status(DebuggeeAction::ResultOfRegisteringEvent, e)
                }
            }
        } else {
            None
        };

        let event = hv::events::Event {
            tag: request.tag,
            kind,
            core_id: request.core_id,
            process_id: request.process_id,
            enabled: true,
            optional_params: request.optional_params,
            condition: request.condition_bytecode,
            actions: Vec::new(),
            hook,
            output_source_tags: Vec::new(),
        };
        let broadcaster = self.broadcaster();
        let result = hv.events.lock().register(event, &broadcaster);
        match result {
            Ok(_) => self.send(
                DebuggeeAction::ResultOfRegisteringEvent,
                &KernelStatus::SUCCESS.0.to_le_bytes(),
            ),
            Err(e) => self.send_status(DebuggeeAction::ResultOfRegisteringEvent, e),
        }
    }

    fn handle_add_action(&self, payload: &[u8]) {
        let Some(request) = AddActionPacket::decode(payload) else {
            return self.send_status(
                DebuggeeAction::ResultOfAddingActionToEvent,
                ErrorCode::CorruptedPacketReceived,
            );
        };
        let Ok(kind) = ActionKind::try_from(request.action_kind) else {
            return self.send_status(
                DebuggeeAction::ResultOfAddingActionToEvent,
                ErrorCode::InvalidActionType,
            );
        };
        let hv = self.hv();
        let mut events = hv.events.lock();
        let Some(id) = events.find_by_tag(request.event_tag) else {
            return self.send_status(
                DebuggeeAction::ResultOfAddingActionToEvent,
                ErrorCode::TagNotExists,
            );
        };
        // Registration order defines the action ordinals.
        let status = events.add_action(
            id,
            kind,
            request.payload,
            request.preallocated_buffer_size,
            request.immediate_message_passing,
        );
        drop(events);
        match status {
            Ok(()) => self.send(
                DebuggeeAction::ResultOfAddingActionToEvent,
                &KernelStatus::SUCCESS.0.to_le_bytes(),
            ),
            Err(e) => self.send_status(DebuggeeAction::ResultOfAddingActionToEvent, e),
        }
    }

    fn handle_modify_event(&self, payload: &[u8]) {
        let Some(mut request) = ModifyEventPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let broadcaster = self.broadcaster();
        let mut events = hv.events.lock();
        let outcome: Result<(), ErrorCode> = match request.kind {
            ModifyEventKind::QueryState => events.query_state(request.tag).map(|enabled| {
                request.is_enabled = enabled;
            }),
            ModifyEventKind::Enable => events.set_enabled(request.tag, true),
            ModifyEventKind::Disable => events.set_enabled(request.tag, false),
            ModifyEventKind::Clear => match events.clear(request.tag, &broadcaster) {
                Ok(hook) => {
                    drop(events);
                    if let Some(hook) = hook {
                        let mut ept = hv.ept.lock();
                        hooks::remove_record(&mut ept, hv.platform, &hv.pools, hook);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        request.result = outcome.into();
        self.send(DebuggeeAction::ResultOfQueryAndModifyEvent, &request.encode());
    }

    fn handle_read_registers(&self, regs: &GuestRegisters, payload: &[u8]) {
        let Some(request) = RegisterReadDescription::decode(payload) else {
            return;
        };
        let descriptions = commands::read_registers(
            regs,
            Self::guest_rip(),
            Self::guest_rflags(),
            request.register_id,
        );
        let mut out = Vec::with_capacity(4 + descriptions.len() * 16);
        out.extend_from_slice(&(descriptions.len() as u32).to_le_bytes());
        for d in &descriptions {
            out.extend_from_slice(&d.encode());
        }
        self.send(DebuggeeAction::ResultOfReadingRegisters, &out);
    }

    fn handle_search(&self, payload: &[u8]) {
        let Some(mut request) = SearchMemoryPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let (status, hits) = commands::search_memory(&hv.mapper, self.command_cr3(), &request);
        request.result = status;
        let mut out = request.encode();
        out.extend_from_slice(&(hits.len() as u32).to_le_bytes());
        for hit in hits {
            out.extend_from_slice(&hit.to_le_bytes());
        }
        self.send(DebuggeeAction::ResultOfSearchMemory, &out);
    }

    fn handle_bp_create(&self, payload: &[u8]) {
        let Some(mut request) = BpPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let cr3 = self.command_cr3();
        let outcome = VirtAddr::new(request.address)
            .ok_or(ErrorCode::InvalidAddress)
            .and_then(|va| {
                let mut window = [0u8; MAXIMUM_INSTR_SIZE];
                let _ = hv.mapper.read_virt(va, cr3, &mut window);
                let len = stepping::classify(&window, true).len() as u16;
                self.breakpoints.lock().add(
                    &hv.mapper,
                    cr3,
                    va,
                    request.pid,
                    request.tid,
                    request.core,
                    len,
                )
            });
        match outcome {
            Ok(_id) => {
                // The intercept rides on the exception bitmap; one enable
                // covers every breakpoint.
                self.broadcaster().on_all_cores(CoreOp::ExceptionBitmapBit {
                    vector: BREAKPOINT_VECTOR,
                    enable: true,
                });
                request.result = KernelStatus::SUCCESS;
            }
            Err(e) => request.result = e.into(),
        }
        self.send(DebuggeeAction::ResultOfBreakpoint, &request.encode());
    }

    fn handle_bp_modify(&self, payload: &[u8]) {
        let Some(mut request) = BpListOrModifyPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let mut bps = self.breakpoints.lock();
        let outcome: Result<(), ErrorCode> = match request.request {
            BreakpointModifyRequest::ListBreakpoints => {
                let mut out = request.encode();
                let list: Vec<_> = bps.list().collect();
                out.extend_from_slice(&(list.len() as u32).to_le_bytes());
                for bp in list {
                    out.extend_from_slice(&bp.id.to_le_bytes());
                    out.extend_from_slice(&bp.address.into_u64().to_le_bytes());
                    out.push(bp.enabled as u8);
                }
                drop(bps);
                self.send(DebuggeeAction::ResultOfListOrModifyBreakpoints, &out);
                return;
            }
            BreakpointModifyRequest::Enable => bps.enable(&hv.mapper, request.breakpoint_id),
            BreakpointModifyRequest::Disable => bps.disable(&hv.mapper, request.breakpoint_id),
            BreakpointModifyRequest::Clear => bps.clear(&hv.mapper, request.breakpoint_id),
        };
        let none_left = !bps.any_enabled();
        drop(bps);
        if none_left
            && !hv
                .events
                .lock()
                .is_protected(hv::events::ProtectedResource::ExceptionBit(BREAKPOINT_VECTOR))
        {
            self.broadcaster().on_all_cores(CoreOp::ExceptionBitmapBit {
                vector: BREAKPOINT_VECTOR,
                enable: false,
            });
        }
        request.result = outcome.into();
        self.send(DebuggeeAction::ResultOfListOrModifyBreakpoints, &request.encode());
    }

    fn handle_callstack(&self) {
        let hv = self.hv();
        let frames = commands::callstack(&hv.mapper, self.command_cr3(), Self::guest_rsp(), 32);
        let mut out = Vec::with_capacity(4 + frames.len() * 8);
        out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        for frame in frames {
            out.extend_from_slice(&frame.to_le_bytes());
        }
        self.send(DebuggeeAction::ResultOfCallstack, &out);
    }

    fn handle_translate(&self, payload: &[u8]) {
        let Some(request) = AddressTranslationPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let response = commands::translate_address(
            &hv.mapper,
            self.command_cr3(),
            &|pa| Some(hv.platform.phys_to_virt(pa)),
            request,
        );
        self.send(DebuggeeAction::ResultOfVa2PaAndPa2Va, &response.encode());
    }

    fn handle_pte(&self, payload: &[u8]) {
        let Some(request) = wire::payloads::PteDetailsPacket::decode(payload) else {
            return;
        };
        let hv = self.hv();
        let response = commands::pte_details(&hv.mapper, self.command_cr3(), request.address);
        self.send(DebuggeeAction::ResultOfPteDetails, &response.encode());
    }
}

impl<T: SerialIo + Send> DebuggerHooks for Debuggee<T> {
    fn nmi_arrived(&self, core: usize, regs: &mut GuestRegisters) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }
        let hv = self.hv();
        if !hv.cores.is_awaiting_nmi(core) {
            return false;
        }
        hv.cores.set_awaiting_nmi(core, false);
        self.root_loop(core, regs);
        true
    }

    fn breakpoint_hit(&self, core: usize, regs: &mut GuestRegisters) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }
        let hv = self.hv();
        let rip = Self::guest_rip();
        let cr3 = self.command_cr3();
        let Some(phys) = VirtAddr::new(rip).and_then(|va| hv.mapper.virt_to_phys_in(va, cr3)) else {
            return false;
        };
        let (id, matches, one_shot, set_if_on_mtf) = {
            let bps = self.breakpoints.lock();
            let Some(bp) = bps.find_by_phys(phys) else {
                return false;
            };
            let matches = bp.matches(
                core as u32,
                hv.platform.current_process_id(),
                hv.platform.current_thread_id(),
            );
            let one_shot = self.cores.lock()[core].one_shot_breakpoint == Some(bp.id);
            (bp.id, matches, one_shot, bp.set_rflags_if_on_mtf)
        };
        if one_shot {
            // A step-over landed: the helper breakpoint disappears for
            // good, no re-apply dance needed.
            let mut cores = self.cores.lock();
            cores[core].one_shot_breakpoint = None;
            cores[core].stepping = SteppingMode::Idle;
            drop(cores);
            let _ = self.breakpoints.lock().clear(&hv.mapper, id);
            self.pause_all(core, regs, PausingReason::Stepped, 0);
            return true;
        }

        // Put the original byte back so the instruction window and the
        // eventual resume see real code; a one-shot MTF re-applies it
        // after the instruction completes. We are already in VMX root,
        // so the feature toggle is applied directly.
        self.breakpoints.lock().lift(&hv.mapper, id);
        self.cores.lock()[core].pending_reapply = Some(id);
        unsafe {
            let core_state = hv.cores.get_mut(core);
            core_state.mtf_owner = MtfOwner::BreakpointReApply(id);
            core_state.flags.set_rflags_if_on_mtf = set_if_on_mtf;
            let eptp = core_state.eptp;
            hv::broadcast::apply_in_root(core_state, eptp, CoreOp::MonitorTrapFlag(true));
        }

        if matches {
            self.pause_all(core, regs, PausingReason::SoftwareBreakpointHit, id);
        }
        // A filtered-out hit still swallows the #BP: the 0xCC is ours.
        true
    }

    fn debug_trap(&self, core: usize, regs: &mut GuestRegisters) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }
        let hv = self.hv();
        let rip = Self::guest_rip();
        let mut window = [0u8; MAXIMUM_INSTR_SIZE];
        if let Some(va) = VirtAddr::new(rip) {
            let _ = hv.mapper.read_virt(va, self.command_cr3(), &mut window);
        }
        let class = stepping::classify(&window, true);

        let mut cores = self.cores.lock();
        let mode = &mut cores[core].stepping;
        if *mode == SteppingMode::Idle {
            return false;
        }
        let pause = stepping::on_debug_trap(mode, rip, class);
        drop(cores);
        if pause {
            Self::clear_trap_flag();
            unsafe {
                let cs = hv.cores.get_mut(core);
                cs.flags.instrumentation_step_in = false;
            }
            self.pause_all(core, regs, PausingReason::Stepped, 0);
        } else {
            Self::arm_trap_flag();
        }
        true
    }

    fn mtf_arrived(&self, core: usize, _regs: &mut GuestRegisters) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }
        let hv = self.hv();
        let pending = {
            let mut cores = self.cores.lock();
            cores[core].pending_reapply.take()
        };
        let Some(id) = pending else {
            return false;
        };
        let avoid = {
            let bps = self.breakpoints.lock();
            bps.get(id).map(|b| b.avoid_reapply).unwrap_or(true)
        };
        if !avoid {
            self.breakpoints.lock().reapply(&hv.mapper, id);
        }
        true
    }

    fn break_to_debugger(
        &self,
        core: usize,
        regs: &mut GuestRegisters,
        reason: PausingReason,
        tag: u64,
    ) {
        if !self.attached.load(Ordering::Acquire) {
            return;
        }
        self.pause_all(core, regs, reason, tag);
    }
}
