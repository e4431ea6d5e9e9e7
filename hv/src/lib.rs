//! The hypervisor core.
//!
//! This crate virtualizes the *running* operating system: every logical
//! processor is put into VMX non-root operation over an identity-mapped
//! EPT, and the machinery here observes and intrudes on the guest through
//! VM-exit interception, EPT hooks and the event/action engine.
//!
//! OS services are consumed through the [`Platform`] trait so that the
//! same core runs under any kernel glue, and so the paging- and
//! bookkeeping-heavy subsystems can be exercised by hosted tests against
//! a mock platform.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod broadcast;
pub mod dispatch;
pub mod ept;
pub mod events;
pub mod hooks;
pub mod mapper;
pub mod pools;
pub mod script;
pub mod state;
pub mod sync;
pub mod transparent;
pub mod vmx;

#[cfg(test)]
pub(crate) mod testing;

use vtx::{GuestRegisters, PhysAddr, VirtAddr};
use wire::types::{EventKind, PausingReason};

/// A reserved kernel virtual page with no physical backing, together with
/// the virtual address of the PTE that controls it. The memory mapper
/// retargets the PTE to reach arbitrary frames.
#[derive(Debug, Clone, Copy)]
pub struct MappingWindow {
    /// The reserved virtual address.
    pub va: VirtAddr,
    /// Virtual address of the PTE mapping `va`.
    pub pte_va: VirtAddr,
}

/// Services the hosting kernel provides to the hypervisor.
///
/// All methods must be callable at elevated IRQL unless noted; none of
/// them may be called from VMX root (VMX-root code only touches
/// pre-allocated state).
pub trait Platform: Sync {
    /// Number of logical processors.
    fn core_count(&self) -> usize;

    /// Index of the calling logical processor.
    fn current_core(&self) -> usize;

    /// Allocate `count` contiguous, zeroed, page-aligned physical pages.
    /// Passive level only.
    fn alloc_pages(&self, count: usize) -> Option<PhysAddr>;

    /// Free pages obtained from [`Platform::alloc_pages`]. Passive level only.
    fn free_pages(&self, pa: PhysAddr, count: usize);

    /// Translate a physical address into an always-mapped virtual address.
    fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr;

    /// Translate a virtual address through the current CR3.
    fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// Reserve `pages` consecutive unbacked kernel virtual pages and
    /// return one window per page. Passive level only.
    fn reserve_windows(&self, pages: usize) -> Option<alloc::vec::Vec<MappingWindow>>;

    /// Run `f` on every core, synchronously, at DPC level.
    fn run_on_each_core(&self, f: &(dyn Fn(usize) + Sync));

    /// Run `f` on one core, synchronously, at DPC level. Returns false
    /// for an out-of-range core index.
    fn run_on_core(&self, core: usize, f: &(dyn Fn() + Sync)) -> bool;

    /// Send an NMI to every core except the caller.
    fn send_nmi_to_peers(&self);

    /// The kernel-mode CR3 of a process, never a KPTI user CR3.
    /// Returns `None` for an unknown process id.
    fn kernel_cr3_of(&self, process_id: u32) -> Option<u64>;

    /// Process id of the current thread's owner.
    fn current_process_id(&self) -> u32;

    /// Thread id of the current thread.
    fn current_thread_id(&self) -> u32;

    /// One past the highest physical page frame installed.
    fn highest_pfn(&self) -> u64;
}

/// Stage at which an event fires relative to emulation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CallingStage {
    /// Before the exiting instruction is emulated.
    PreEvent,
    /// After the exiting instruction was emulated.
    PostEvent,
}

/// Outcome of triggering the events of one kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TriggerResponse {
    /// Events ran (or none matched); emulate normally.
    Successful,
    /// At least one action requested short-circuiting: skip emulation.
    SuccessfulIgnoreEvent,
    /// The debugger machinery is not initialized on this core yet.
    NotInitialized,
}

/// Callbacks the kernel-debugger layer registers with the VMM.
///
/// The VMM never links against the debugger; everything debugger-shaped
/// that must happen inside an exit handler goes through this table.
pub trait DebuggerHooks: Sync {
    /// An NMI arrived. Returns true when the halt protocol consumed it
    /// (the core then spins in VMX root until released).
    fn nmi_arrived(&self, core: usize, regs: &mut GuestRegisters) -> bool;

    /// A #BP hit in the guest. Returns true when a debugger breakpoint
    /// descriptor claimed it; false re-injects the exception.
    fn breakpoint_hit(&self, core: usize, regs: &mut GuestRegisters) -> bool;

    /// A #DB hit in the guest. Returns true when stepping logic claimed it.
    fn debug_trap(&self, core: usize, regs: &mut GuestRegisters) -> bool;

    /// An MTF exit arrived and no hook restoration owned it.
    fn mtf_arrived(&self, core: usize, regs: &mut GuestRegisters) -> bool;

    /// Break the current core into the debugger loop.
    fn break_to_debugger(
        &self,
        core: usize,
        regs: &mut GuestRegisters,
        reason: PausingReason,
        tag: u64,
    );
}

/// A no-op hook table, installed until the debugger attaches.
pub struct NoDebugger;

impl DebuggerHooks for NoDebugger {
    fn nmi_arrived(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
        false
    }
    fn breakpoint_hit(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
        false
    }
    fn debug_trap(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
        false
    }
    fn mtf_arrived(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
        false
    }
    fn break_to_debugger(
        &self,
        _core: usize,
        _regs: &mut GuestRegisters,
        _reason: PausingReason,
        _tag: u64,
    ) {
    }
}

/// Everything the exit path needs, grouped behind one pointer.
///
/// A single `Hypervisor` is allocated at initialization; the assembly
/// stub finds it again through the per-core state saved in the host-state
/// area, so no other module-level mutable state exists.
pub struct Hypervisor<'a> {
    /// OS services.
    pub platform: &'a dyn Platform,
    /// The script-engine the actions invoke.
    pub script: &'a dyn script::ScriptEngine,
    /// The debugger's callback table.
    pub debugger: &'a dyn DebuggerHooks,
    /// Per-core state table.
    pub cores: state::CorePool,
    /// EPT tables and hook records.
    pub ept: sync::SpinLock<ept::EptState>,
    /// The event/action engine.
    pub events: sync::SpinLock<events::EventEngine>,
    /// Transparent-mode filter.
    pub transparent: transparent::Transparent,
    /// Pre-allocated pools.
    pub pools: pools::PoolManager,
    /// The safe memory mapper.
    pub mapper: mapper::MemoryMapper<'a>,
}

impl<'a> Hypervisor<'a> {
    /// Build the hypervisor state without touching VMX yet: the EPT
    /// identity map, the memory-mapper windows, the per-core table and
    /// the empty engines. Passive level only.
    pub fn create(
        platform: &'a dyn Platform,
        script: &'a dyn script::ScriptEngine,
        debugger: &'a dyn DebuggerHooks,
        memory_map: &vtx::mtrr::MemoryTypeMap,
    ) -> Result<Self, wire::ErrorCode> {
        let mapper =
            mapper::MemoryMapper::init(platform).ok_or(wire::ErrorCode::PreAllocatedPoolEmpty)?;
        let ept = ept::EptState::build(platform, memory_map).map_err(wire::ErrorCode::from)?;
        let core_count = platform.core_count();
        Ok(Self {
            platform,
            script,
            debugger,
            cores: state::CorePool::new(core_count),
            ept: sync::SpinLock::new(ept),
            events: sync::SpinLock::new(events::EventEngine::new(core_count)),
            transparent: transparent::Transparent::new(),
            pools: pools::PoolManager::new(),
            mapper,
        })
    }
}

impl Hypervisor<'static> {
    /// Virtualize every logical processor.
    ///
    /// The context must already be leaked to `'static`; the exit stub
    /// finds it again through [`vmx::install_context`]. Returns the
    /// number of cores that failed to launch (0 on full success).
    pub fn virtualize_all_cores(&'static self) -> Result<(), wire::ErrorCode> {
        vmx::check_vmx_support()?;
        unsafe {
            vmx::install_context(self);
        }
        let eptp = self.ept.lock().eptp().raw();
        let failures = core::sync::atomic::AtomicUsize::new(0);
        self.platform.run_on_each_core(&|core| {
            // SAFETY: the broadcast pins us to `core`.
            let core_state = unsafe { self.cores.get_mut(core) };
            let up = vmx::init_core(self.platform, core_state, eptp)
                .and_then(|()| vmx::launch_core(core_state));
            if let Err(e) = up {
                error!("core {} failed to virtualize: {:?}", core, e);
                failures.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
        });
        if failures.load(core::sync::atomic::Ordering::Relaxed) == 0 {
            Ok(())
        } else {
            Err(wire::ErrorCode::VmxNotSupported)
        }
    }

    /// Devirtualize every core: each one VMCALLs into its own exit
    /// handler, which restores the hook views, executes VMXOFF and lands
    /// the core where its guest stopped. Passive level only.
    pub fn devirtualize_all_cores(&'static self) {
        self.platform.run_on_each_core(&|_core| {
            #[cfg(not(test))]
            unsafe {
                core::arch::asm!(
                    "vmcall",
                    in("rcx") vmx::VMCALL_UNLOAD,
                    in("rdx") 0u64,
                    lateout("rax") _,
                );
            }
        });
        // Everything below runs with no core in VMX operation any more.
        let pools = &self.pools;
        let ept = core::mem::replace(
            unsafe { self.ept.force_get_mut() },
            ept::EptState::empty(),
        );
        ept.teardown(self.platform, pools);
        pools.release_all(self.platform);
        self.events.lock().drain_graveyard();
    }
}

impl<'a> Hypervisor<'a> {
    /// Trigger all events of `kind` at `stage`; thin forwarding wrapper so
    /// exit handlers do not each re-open the engine lock logic.
    pub fn trigger(
        &self,
        kind: EventKind,
        stage: CallingStage,
        context: u64,
        regs: &mut GuestRegisters,
    ) -> (TriggerResponse, bool) {
        let core = self.platform.current_core();
        // SAFETY: event lists are only mutated from non-root code or with
        // every peer halted, so the exit path may traverse without taking
        // the lock. This also keeps a break-to-debugger action free to
        // register events from the command loop.
        let engine = unsafe { self.events.force_get_mut() };
        engine.trigger(self, kind, stage, context, regs, core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Broadcaster, CoreOp, OpDelivery};
    use crate::events::Event;
    use crate::script::{
        ActionBuffer, NullScriptEngine, ScriptEngine, ScriptError, TriggerContext, MAX_TEMP_COUNT,
    };
    use crate::testing::MockPlatform;
    use std::sync::Mutex;
    use vtx::ept::EptMemoryType;
    use vtx::mtrr::MemoryTypeMap;
    use wire::types::{ActionKind, APPLY_TO_ALL_CORES, APPLY_TO_ALL_PROCESSES};

    struct NullDelivery;
    impl OpDelivery for NullDelivery {
        fn deliver(&self, _core: usize, _op: CoreOp) {}
    }

    #[derive(Default)]
    struct RecordingDebugger {
        breaks: Mutex<Vec<(usize, PausingReason, u64)>>,
    }

    impl DebuggerHooks for RecordingDebugger {
        fn nmi_arrived(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
            false
        }
        fn breakpoint_hit(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
            false
        }
        fn debug_trap(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
            false
        }
        fn mtf_arrived(&self, _core: usize, _regs: &mut GuestRegisters) -> bool {
            false
        }
        fn break_to_debugger(
            &self,
            core: usize,
            _regs: &mut GuestRegisters,
            reason: PausingReason,
            tag: u64,
        ) {
            self.breaks.lock().unwrap().push((core, reason, tag));
        }
    }

    /// Fires conditions by the low bit of the context and requests a
    /// short circuit from every executed script.
    struct PickyScriptEngine;

    impl ScriptEngine for PickyScriptEngine {
        fn evaluate_condition(
            &self,
            _bytecode: &[u8],
            _regs: &GuestRegisters,
            context: &TriggerContext,
        ) -> u64 {
            context.context & 1
        }

        fn execute(
            &self,
            _bytecode: &[u8],
            _regs: &mut GuestRegisters,
            _context: &TriggerContext,
            _temps: &mut [u64; MAX_TEMP_COUNT],
            _globals: &mut [u64; crate::script::MAX_GLOBAL_COUNT],
            output: &mut ActionBuffer<'_>,
        ) -> Result<(), ScriptError> {
            output.short_circuit_requested = true;
            Ok(())
        }
    }

    fn msr_event(tag: u64, condition: bool) -> Event {
        Event {
            tag,
            kind: EventKind::RdmsrInstructionExecution,
            core_id: APPLY_TO_ALL_CORES,
            process_id: APPLY_TO_ALL_PROCESSES,
            enabled: true,
            optional_params: [0xC000_0080, 0, 0, 0],
            condition: if condition {
                alloc::vec![1]
            } else {
                Vec::new()
            },
            actions: alloc::vec![events::Action {
                ordinal: 0,
                kind: ActionKind::BreakToDebugger,
                script: Vec::new(),
                custom_code: None,
                result_buffer: Vec::new(),
                immediate_message_passing: false,
            }],
            hook: None,
            output_source_tags: Vec::new(),
        }
    }

    #[test]
    fn triggering_respects_enable_state_of_siblings() {
        let platform = MockPlatform::new(1, 4096);
        let debugger = RecordingDebugger::default();
        let hv = Hypervisor::create(
            &platform,
            &NullScriptEngine,
            &debugger,
            &MemoryTypeMap::from_ranges(Vec::new(), EptMemoryType::WriteBack),
        )
        .unwrap();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &NullDelivery,
        };
        hv.events.lock().register(msr_event(0x10, false), &broadcaster).unwrap();
        hv.events.lock().register(msr_event(0x20, false), &broadcaster).unwrap();
        hv.events.lock().set_enabled(0x10, false).unwrap();

        let mut regs = GuestRegisters::default();
        let (response, _) = hv.trigger(
            EventKind::RdmsrInstructionExecution,
            CallingStage::PreEvent,
            0xC000_0080,
            &mut regs,
        );
        assert_eq!(response, TriggerResponse::Successful);

        // Only the still-enabled sibling fired its break action.
        let breaks = debugger.breaks.lock().unwrap();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].1, PausingReason::EventTriggered);
        assert_eq!(breaks[0].2, 0x20);
    }

    #[test]
    fn script_short_circuit_propagates_to_the_dispatcher() {
        let platform = MockPlatform::new(1, 4096);
        let debugger = RecordingDebugger::default();
        let script = PickyScriptEngine;
        let hv = Hypervisor::create(
            &platform,
            &script,
            &debugger,
            &MemoryTypeMap::from_ranges(Vec::new(), EptMemoryType::WriteBack),
        )
        .unwrap();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &NullDelivery,
        };
        let mut event = msr_event(0x30, true);
        event.actions = alloc::vec![events::Action {
            ordinal: 0,
            kind: ActionKind::RunScript,
            script: alloc::vec![0xAA],
            custom_code: None,
            result_buffer: Vec::new(),
            immediate_message_passing: true,
        }];
        hv.events.lock().register(event, &broadcaster).unwrap();

        let mut regs = GuestRegisters::default();
        // Condition false (even context): nothing runs, no short circuit.
        let (response, _) = hv.trigger(
            EventKind::RdmsrInstructionExecution,
            CallingStage::PreEvent,
            0x10,
            &mut regs,
        );
        assert_eq!(response, TriggerResponse::Successful);

        // Condition true (odd context): the script demands the skip.
        let (response, _) = hv.trigger(
            EventKind::RdmsrInstructionExecution,
            CallingStage::PreEvent,
            0x11,
            &mut regs,
        );
        assert_eq!(response, TriggerResponse::SuccessfulIgnoreEvent);
    }

    #[test]
    fn custom_code_actions_observe_registers_and_request_post() {
        static SEEN: Mutex<Vec<u64>> = Mutex::new(Vec::new());

        fn custom(regs: &mut GuestRegisters, context: u64, _buf: Option<&mut [u8]>) -> events::CustomCodeOutcome {
            SEEN.lock().unwrap().push(regs.rax + context);
            events::CustomCodeOutcome {
                short_circuit: false,
                request_post: true,
            }
        }

        let platform = MockPlatform::new(1, 4096);
        let debugger = RecordingDebugger::default();
        let hv = Hypervisor::create(
            &platform,
            &NullScriptEngine,
            &debugger,
            &MemoryTypeMap::from_ranges(Vec::new(), EptMemoryType::WriteBack),
        )
        .unwrap();
        let broadcaster = Broadcaster {
            platform: &platform,
            delivery: &NullDelivery,
        };
        let mut event = msr_event(0x40, false);
        event.actions = alloc::vec![events::Action {
            ordinal: 0,
            kind: ActionKind::RunCustomCode,
            script: Vec::new(),
            custom_code: Some(custom),
            result_buffer: Vec::new(),
            immediate_message_passing: false,
        }];
        hv.events.lock().register(event, &broadcaster).unwrap();

        let mut regs = GuestRegisters {
            rax: 40,
            ..Default::default()
        };
        let (_, want_post) = hv.trigger(
            EventKind::RdmsrInstructionExecution,
            CallingStage::PreEvent,
            2,
            &mut regs,
        );
        assert!(want_post);
        assert_eq!(SEEN.lock().unwrap().as_slice(), &[42]);
    }
}
