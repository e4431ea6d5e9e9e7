//! The VM-exit dispatcher.
//!
//! Single entry from the assembly save/restore stub. Every reason is a
//! variant of [`BasicExitReason`]; each handler runs inside the same
//! envelope:
//!
//! ```text
//! (response, want_post) = trigger_pre(kind, context);
//! if response != SuccessfulIgnoreEvent { emulate(); }
//! if want_post { trigger_post(kind, context); }
//! ```
//!
//! where `SuccessfulIgnoreEvent` is the short-circuit signal actions use
//! when they already produced the architectural effect themselves.

use crate::broadcast::{apply_in_root, CoreOp};
use crate::hooks::{self, HookAccess};
use crate::mapper::GuestMemory;
use crate::state::{CoreState, MtfOwner};
use crate::transparent::TrapContext;
use crate::{CallingStage, Hypervisor, TriggerResponse};
use vtx::cpuid::{cpuid, CpuidResult};
use vtx::exit::{
    BasicExitReason, CrAccessKind, CrAccessQualification, DrAccessQualification,
    EptViolationQualification, ExitReason, InterruptionInfo, InterruptionType,
    IoExitQualification, BREAKPOINT_VECTOR, DEBUG_VECTOR, INVALID_OPCODE_VECTOR, NMI_VECTOR,
};
use vtx::msr::{read_msr, write_msr};
use vtx::regs::Rflags;
use vtx::vmcs::{forward_rip, vmread, vmwrite, VmcsField};
use vtx::{GuestRegisters, VirtAddr};
use wire::types::{EventKind, PausingReason};

/// Reasons whose handlers emulate an instruction and therefore advance
/// RIP afterwards, unless a handler suppressed it.
fn advances_rip(reason: BasicExitReason) -> bool {
    matches!(
        reason,
        BasicExitReason::Cpuid
            | BasicExitReason::Rdmsr
            | BasicExitReason::Wrmsr
            | BasicExitReason::CrAccess
            | BasicExitReason::DrAccess
            | BasicExitReason::IoInstruction
            | BasicExitReason::Rdtsc
            | BasicExitReason::Rdtscp
            | BasicExitReason::Rdpmc
            | BasicExitReason::Vmcall
            | BasicExitReason::Xsetbv
            | BasicExitReason::Invd
            | BasicExitReason::Wbinvd
            | BasicExitReason::Invlpg
    )
}

/// Entry from the exit stub.
///
/// # Safety
/// Must run in VMX root on the core whose VMCS is current, with `regs`
/// pointing at the frame the stub saved.
pub unsafe fn handle_vmexit(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let core_id = hv.platform.current_core();
    let core = hv.cores.get_mut(core_id);
    core.is_on_vmx_root = true;
    core.flags.suppress_rip_increment = false;

    let reason = match ExitReason::read() {
        Ok(reason) => reason,
        Err(e) => {
            error!("unreadable exit reason: {:?}", e);
            core.is_on_vmx_root = false;
            return;
        }
    };

    match reason.basic {
        BasicExitReason::Cpuid => handle_cpuid(hv, regs),
        BasicExitReason::Rdmsr => handle_rdmsr(hv, regs),
        BasicExitReason::Wrmsr => handle_wrmsr(hv, regs),
        BasicExitReason::CrAccess => handle_cr_access(core, regs),
        BasicExitReason::DrAccess => handle_dr_access(hv, regs),
        BasicExitReason::IoInstruction => handle_io(hv, regs),
        BasicExitReason::Rdtsc => handle_rdtsc(hv, regs, false),
        BasicExitReason::Rdtscp => handle_rdtsc(hv, regs, true),
        BasicExitReason::Rdpmc => handle_rdpmc(hv, regs),
        BasicExitReason::Vmcall => handle_vmcall(hv, core, regs),
        BasicExitReason::ExceptionOrNmi => handle_exception(hv, core, regs),
        BasicExitReason::ExternalInterrupt => handle_external_interrupt(hv, regs),
        BasicExitReason::MonitorTrapFlag => handle_mtf(hv, core, regs),
        BasicExitReason::EptViolation => handle_ept_violation(hv, core, regs),
        BasicExitReason::EptMisconfig => {
            let gpa = vmread(VmcsField::GuestPhysicalAddr).unwrap_or(0);
            error!("EPT misconfiguration at {:#x}; check split integrity", gpa);
        }
        BasicExitReason::Xsetbv => emulate_xsetbv(regs),
        BasicExitReason::Invd | BasicExitReason::Wbinvd => {
            core::arch::asm!("wbinvd", options(nostack));
        }
        BasicExitReason::Invlpg => {
            if let Ok(linear) = vmread(VmcsField::ExitQualification) {
                vtx::regs::invlpg(linear);
            }
        }
        other => {
            warn!("unhandled exit reason {:?} at rip {:#x}", other, vmread(VmcsField::GuestRip).unwrap_or(0));
        }
    }

    if advances_rip(reason.basic) && !core.flags.suppress_rip_increment {
        let _ = forward_rip();
    }
    core.flags.suppress_rip_increment = false;

    // A halt request arrived while we were in here: the NMI cannot be
    // taken until VM entry, so bounce straight back out after one
    // instruction and let it land.
    if core
        .wait_for_immediate_vmexit
        .swap(false, core::sync::atomic::Ordering::AcqRel)
    {
        let eptp = core.eptp;
        core.mtf_owner = MtfOwner::ImmediateExit;
        apply_in_root(core, eptp, CoreOp::MonitorTrapFlag(true));
    }
    core.is_on_vmx_root = false;
}

fn handle_cpuid(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let leaf = regs.rax as u32;
    let (response, want_post) = hv.trigger(
        EventKind::CpuidInstructionExecution,
        CallingStage::PreEvent,
        leaf as u64,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        let mut result = cpuid(leaf, regs.rcx as u32);
        if hv.transparent.is_enabled() {
            result = hv.transparent.filter_cpuid(leaf, result);
        }
        write_cpuid_result(regs, result);
    }
    if want_post {
        hv.trigger(
            EventKind::CpuidInstructionExecution,
            CallingStage::PostEvent,
            leaf as u64,
            regs,
        );
    }
}

fn write_cpuid_result(regs: &mut GuestRegisters, result: CpuidResult) {
    regs.rax = result.eax as u64;
    regs.rbx = result.ebx as u64;
    regs.rcx = result.ecx as u64;
    regs.rdx = result.edx as u64;
}

fn handle_rdmsr(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let msr = regs.rcx as u32;
    let (response, want_post) = hv.trigger(
        EventKind::RdmsrInstructionExecution,
        CallingStage::PreEvent,
        msr as u64,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        let value = read_msr(msr);
        regs.rax = value & 0xffff_ffff;
        regs.rdx = value >> 32;
    }
    if want_post {
        hv.trigger(
            EventKind::RdmsrInstructionExecution,
            CallingStage::PostEvent,
            msr as u64,
            regs,
        );
    }
}

fn handle_wrmsr(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let msr = regs.rcx as u32;
    let (response, want_post) = hv.trigger(
        EventKind::WrmsrInstructionExecution,
        CallingStage::PreEvent,
        msr as u64,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        let value = (regs.rdx << 32) | (regs.rax & 0xffff_ffff);
        unsafe { write_msr(msr, value) };
    }
    if want_post {
        hv.trigger(
            EventKind::WrmsrInstructionExecution,
            CallingStage::PostEvent,
            msr as u64,
            regs,
        );
    }
}

fn gpr_slot(regs: &mut GuestRegisters, index: u8) -> &mut u64 {
    match index {
        0 => &mut regs.rax,
        1 => &mut regs.rcx,
        2 => &mut regs.rdx,
        3 => &mut regs.rbx,
        4 => &mut regs.rsp,
        5 => &mut regs.rbp,
        6 => &mut regs.rsi,
        7 => &mut regs.rdi,
        8 => &mut regs.r8,
        9 => &mut regs.r9,
        10 => &mut regs.r10,
        11 => &mut regs.r11,
        12 => &mut regs.r12,
        13 => &mut regs.r13,
        14 => &mut regs.r14,
        _ => &mut regs.r15,
    }
}

fn handle_cr_access(core: &mut CoreState, regs: &mut GuestRegisters) {
    let Ok(qualification) = vmread(VmcsField::ExitQualification) else {
        return;
    };
    let access = CrAccessQualification::decode(qualification);
    match (access.kind, access.cr) {
        (CrAccessKind::MovToCr, 0) => {
            let value = *gpr_slot(regs, access.gpr);
            let _ = vmwrite(VmcsField::GuestCr0, value);
            let _ = vmwrite(VmcsField::Cr0ReadShadow, value);
        }
        (CrAccessKind::MovToCr, 3) => {
            // Bit 63 of a MOV-to-CR3 value asks to keep cached PCID
            // translations; it is never stored.
            let value = *gpr_slot(regs, access.gpr) & !(1u64 << 63);
            let _ = vmwrite(VmcsField::GuestCr3, value);
            #[cfg(not(test))]
            vtx::ept::invvpid(vtx::ept::InvvpidKind::SingleContextRetainingGlobals, 1, 0);
        }
        (CrAccessKind::MovToCr, 4) => {
            let value = *gpr_slot(regs, access.gpr);
            let _ = vmwrite(VmcsField::GuestCr4, value);
            let _ = vmwrite(VmcsField::Cr4ReadShadow, value);
        }
        (CrAccessKind::MovFromCr, 0) => {
            if let Ok(v) = vmread(VmcsField::GuestCr0) {
                *gpr_slot(regs, access.gpr) = v;
            }
        }
        (CrAccessKind::MovFromCr, 3) => {
            if let Ok(v) = vmread(VmcsField::GuestCr3) {
                *gpr_slot(regs, access.gpr) = v;
            }
        }
        (CrAccessKind::MovFromCr, 4) => {
            if let Ok(v) = vmread(VmcsField::GuestCr4) {
                *gpr_slot(regs, access.gpr) = v;
            }
        }
        _ => {
            warn!(
                "unhandled CR access: cr{} {:?} on core {}",
                access.cr, access.kind, core.core_id
            );
        }
    }
}

fn handle_dr_access(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let Ok(qualification) = vmread(VmcsField::ExitQualification) else {
        return;
    };
    let access = DrAccessQualification::decode(qualification);
    let (response, want_post) = hv.trigger(
        EventKind::DebugRegistersAccessed,
        CallingStage::PreEvent,
        access.dr as u64,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        emulate_dr_access(regs, access);
    }
    if want_post {
        hv.trigger(
            EventKind::DebugRegistersAccessed,
            CallingStage::PostEvent,
            access.dr as u64,
            regs,
        );
    }
}

fn emulate_dr_access(regs: &mut GuestRegisters, access: DrAccessQualification) {
    unsafe {
        if access.is_read {
            let value: u64;
            match access.dr {
                0 => core::arch::asm!("mov {}, dr0", out(reg) value),
                1 => core::arch::asm!("mov {}, dr1", out(reg) value),
                2 => core::arch::asm!("mov {}, dr2", out(reg) value),
                3 => core::arch::asm!("mov {}, dr3", out(reg) value),
                6 => core::arch::asm!("mov {}, dr6", out(reg) value),
                _ => {
                    *gpr_slot(regs, access.gpr) = vmread(VmcsField::GuestDr7).unwrap_or(0);
                    return;
                }
            }
            *gpr_slot(regs, access.gpr) = value;
        } else {
            let value = *gpr_slot(regs, access.gpr);
            match access.dr {
                0 => core::arch::asm!("mov dr0, {}", in(reg) value),
                1 => core::arch::asm!("mov dr1, {}", in(reg) value),
                2 => core::arch::asm!("mov dr2, {}", in(reg) value),
                3 => core::arch::asm!("mov dr3, {}", in(reg) value),
                6 => core::arch::asm!("mov dr6, {}", in(reg) value),
                _ => {
                    let _ = vmwrite(VmcsField::GuestDr7, value);
                }
            }
        }
    }
}

fn handle_io(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let Ok(qualification) = vmread(VmcsField::ExitQualification) else {
        return;
    };
    let io = IoExitQualification::decode(qualification);
    let kind = if io.is_in {
        EventKind::InInstructionExecution
    } else {
        EventKind::OutInstructionExecution
    };
    let (response, want_post) = hv.trigger(kind, CallingStage::PreEvent, io.port as u64, regs);
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        emulate_io(regs, io);
    }
    if want_post {
        hv.trigger(kind, CallingStage::PostEvent, io.port as u64, regs);
    }
}

fn emulate_io(regs: &mut GuestRegisters, io: IoExitQualification) {
    if io.is_string {
        // INS/OUTS move through guest linear memory; with I/O events
        // armed the exit fires before any transfer, so re-executing the
        // instruction unmodified under the bitmap is not possible. The
        // string forms are rare in kernels; log and skip.
        warn!("string I/O on port {:#x} skipped", io.port);
        return;
    }
    unsafe {
        let port = io.port;
        if io.is_in {
            let value: u32 = match io.size {
                1 => {
                    let v: u8;
                    core::arch::asm!("in al, dx", out("al") v, in("dx") port);
                    v as u32
                }
                2 => {
                    let v: u16;
                    core::arch::asm!("in ax, dx", out("ax") v, in("dx") port);
                    v as u32
                }
                _ => {
                    let v: u32;
                    core::arch::asm!("in eax, dx", out("eax") v, in("dx") port);
                    v
                }
            };
            let keep = match io.size {
                1 => regs.rax & !0xff,
                2 => regs.rax & !0xffff,
                _ => 0,
            };
            regs.rax = keep | value as u64;
        } else {
            match io.size {
                1 => core::arch::asm!("out dx, al", in("dx") port, in("al") regs.rax as u8),
                2 => core::arch::asm!("out dx, ax", in("dx") port, in("ax") regs.rax as u16),
                _ => core::arch::asm!("out dx, eax", in("dx") port, in("eax") regs.rax as u32),
            }
        }
    }
}

fn handle_rdtsc(hv: &Hypervisor<'_>, regs: &mut GuestRegisters, with_aux: bool) {
    let (response, want_post) = hv.trigger(
        EventKind::TscInstructionExecution,
        CallingStage::PreEvent,
        with_aux as u64,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        let mut tsc = unsafe { core::arch::x86_64::_rdtsc() };
        if hv.transparent.is_enabled() {
            tsc = hv.transparent.jittered_tsc(tsc);
        }
        regs.rax = tsc & 0xffff_ffff;
        regs.rdx = tsc >> 32;
        if with_aux {
            regs.rcx = read_msr(0xC000_0103) & 0xffff_ffff; // IA32_TSC_AUX
        }
    }
    if want_post {
        hv.trigger(
            EventKind::TscInstructionExecution,
            CallingStage::PostEvent,
            with_aux as u64,
            regs,
        );
    }
}

fn handle_rdpmc(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let counter = regs.rcx as u32;
    let (response, want_post) = hv.trigger(
        EventKind::PmcInstructionExecution,
        CallingStage::PreEvent,
        counter as u64,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        let value: u64;
        let (hi, lo): (u32, u32);
        unsafe {
            core::arch::asm!("rdpmc", in("ecx") counter, out("eax") lo, out("edx") hi);
        }
        value = ((hi as u64) << 32) | lo as u64;
        regs.rax = value & 0xffff_ffff;
        regs.rdx = value >> 32;
    }
    if want_post {
        hv.trigger(
            EventKind::PmcInstructionExecution,
            CallingStage::PostEvent,
            counter as u64,
            regs,
        );
    }
}

fn handle_vmcall(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) {
    if regs.rcx == crate::vmx::VMCALL_UNLOAD {
        // SAFETY: VMX root, own core, about to return from the handler.
        unsafe {
            crate::vmx::vmxoff_on_exit(hv, core);
        }
        regs.rax = 0;
        return;
    }
    // Broadcast DPCs deliver feature toggles with a VMCALL; anything
    // else is a guest-visible hypercall and goes through the event path.
    if let Some(op) = CoreOp::decode(regs.rcx, regs.rdx) {
        let eptp = core.eptp;
        apply_in_root(core, eptp, op);
        regs.rax = 0;
        return;
    }
    let (response, want_post) = hv.trigger(
        EventKind::VmcallInstructionExecution,
        CallingStage::PreEvent,
        regs.rcx,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        // No hypercall interface of our own: report "unknown".
        regs.rax = u64::MAX;
    }
    if want_post {
        hv.trigger(
            EventKind::VmcallInstructionExecution,
            CallingStage::PostEvent,
            regs.rcx,
            regs,
        );
    }
}

fn handle_exception(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) {
    let info = match InterruptionInfo::read() {
        Ok(Some(info)) => info,
        _ => return,
    };

    match (info.kind, info.vector) {
        (InterruptionType::Nmi, _) | (_, NMI_VECTOR) => {
            // A debugger-issued halt broadcast swallows its own NMI.
            if hv.debugger.nmi_arrived(core.core_id, regs) {
                return;
            }
            let (response, _) = hv.trigger(
                EventKind::ExceptionOccurred,
                CallingStage::PreEvent,
                NMI_VECTOR as u64,
                regs,
            );
            if response != TriggerResponse::SuccessfulIgnoreEvent {
                inject_event(NMI_VECTOR, InterruptionType::Nmi, None);
            }
        }
        (_, BREAKPOINT_VECTOR) => {
            if hv.debugger.breakpoint_hit(core.core_id, regs) {
                return;
            }
            if hidden_breakpoint_claim(hv, core, regs) {
                return;
            }
            let (response, _) = hv.trigger(
                EventKind::ExceptionOccurred,
                CallingStage::PreEvent,
                BREAKPOINT_VECTOR as u64,
                regs,
            );
            if response != TriggerResponse::SuccessfulIgnoreEvent {
                inject_event(BREAKPOINT_VECTOR, InterruptionType::SoftwareException, None);
            }
        }
        (_, DEBUG_VECTOR) => {
            if handle_transparent_trap(hv, core, regs) {
                return;
            }
            if hv.debugger.debug_trap(core.core_id, regs) {
                return;
            }
            let (response, _) = hv.trigger(
                EventKind::ExceptionOccurred,
                CallingStage::PreEvent,
                DEBUG_VECTOR as u64,
                regs,
            );
            if response != TriggerResponse::SuccessfulIgnoreEvent {
                inject_event(DEBUG_VECTOR, InterruptionType::HardwareException, None);
            }
        }
        (_, INVALID_OPCODE_VECTOR) => {
            if handle_efer_syscall_trap(hv, core, regs) {
                return;
            }
            let (response, _) = hv.trigger(
                EventKind::ExceptionOccurred,
                CallingStage::PreEvent,
                INVALID_OPCODE_VECTOR as u64,
                regs,
            );
            if response != TriggerResponse::SuccessfulIgnoreEvent {
                inject_event(INVALID_OPCODE_VECTOR, InterruptionType::HardwareException, None);
            }
        }
        (_, vector) => {
            let (response, _) = hv.trigger(
                EventKind::ExceptionOccurred,
                CallingStage::PreEvent,
                vector as u64,
                regs,
            );
            if response != TriggerResponse::SuccessfulIgnoreEvent {
                let error_code = if info.error_code_valid {
                    vmread(VmcsField::VmexitInterruptionErrCode).ok()
                } else {
                    None
                };
                inject_event(vector, info.kind, error_code);
            }
        }
    }
}

/// A #BP that none of the debugger's own breakpoints claimed may be a
/// hidden EPT breakpoint: the guest fetched `0xCC` from a shadow page.
/// Fire the pre-events, then either skip the replaced instruction (short
/// circuit) or single-step the original code under MTF.
fn hidden_breakpoint_claim(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) -> bool {
    let rip = vmread(VmcsField::GuestRip).unwrap_or(0);
    let cr3 = vmread(VmcsField::GuestCr3).unwrap_or(0);
    let Some(rip_va) = VirtAddr::new(rip) else {
        return false;
    };
    let Some(phys) = hv.mapper.virt_to_phys_in(rip_va, cr3) else {
        return false;
    };
    // SAFETY: hook records only mutate with peers halted.
    let ept = unsafe { hv.ept.force_get_mut() };
    let Some(hook_id) = ept.find_hook_by_pfn(phys.pfn()) else {
        return false;
    };
    let Some(record) = ept.hooks.get(hook_id) else {
        return false;
    };
    if !record.is_hidden_breakpoint || !record.breakpoints.iter().any(|b| b.va == rip_va) {
        return false;
    }

    // The syscall-entry probe of transparent mode rides on this
    // mechanism; capture before the events fire.
    if hv.transparent.is_syscall_probe(rip) {
        transparent_syscall_capture(hv, core, regs);
    }

    let (response, _) = hv.trigger(EventKind::HiddenHookExecCc, CallingStage::PreEvent, rip, regs);
    if response == TriggerResponse::SuccessfulIgnoreEvent {
        // Skip the replaced instruction entirely: its length comes from
        // the real frame, which still holds the original bytes.
        let mut window = [0u8; 16];
        if hv.mapper.read_virt(rip_va, cr3, &mut window) {
            let len = hooks::ldisasm(&window, true) as u64;
            let _ = vmwrite(VmcsField::GuestRip, rip + len);
        }
        return true;
    }

    // Let the guest run the original instruction from the real page and
    // swap the shadow view back in on the MTF.
    hooks::expose_original_view(ept, hv.platform, hook_id);
    core.mtf_owner = MtfOwner::HookRestore(hook_id);
    let eptp = core.eptp;
    apply_in_root(core, eptp, CoreOp::MonitorTrapFlag(true));
    true
}

/// Watched-syscall capture for transparent mode: record the caller and
/// arm the trap flag in the syscall-preserved R11 image so the #DB fires
/// when SYSRET restores it in user mode.
fn transparent_syscall_capture(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) {
    if !hv.transparent.is_enabled() {
        return;
    }
    let number = regs.rax as u32;
    let watched = number == hv.transparent.syscalls.nt_query_system_information
        || number == hv.transparent.syscalls.nt_query_system_information_ex;
    if !watched {
        return;
    }
    let context = TrapContext {
        syscall_number: number,
        info_class: regs.r10 as u32,
        buffer: regs.rdx,
        buffer_len: regs.r8 as u32,
    };
    let pid = hv.platform.current_process_id();
    let tid = hv.platform.current_thread_id();
    if hv.transparent.on_watched_syscall(pid, tid, context) {
        regs.r11 |= Rflags::TF.bits();
        core.flags.transparent_trap_flag_armed = true;
    }
}

/// Transparent-mode #DB follow-up: scrub the completed watched syscall
/// and clear the trap flag we armed.
fn handle_transparent_trap(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) -> bool {
    if !core.flags.transparent_trap_flag_armed || !hv.transparent.is_enabled() {
        return false;
    }
    let pid = hv.platform.current_process_id();
    let tid = hv.platform.current_thread_id();
    let Some(context) = hv.transparent.take_trap(pid, tid) else {
        return false;
    };
    let cr3 = vmread(VmcsField::GuestCr3).unwrap_or(0);
    if !hv.transparent.scrub_completed_syscall(&hv.mapper, cr3, &context) {
        debug!("transparent scrub failed for pid {} tid {}", pid, tid);
    }
    if let Ok(rflags) = vmread(VmcsField::GuestRflags) {
        let _ = vmwrite(VmcsField::GuestRflags, rflags & !Rflags::TF.bits());
    }
    core.flags.transparent_trap_flag_armed = false;
    let _ = regs;
    true
}

/// With the EFER syscall hook active, SYSCALL/SYSRET raise #UD and are
/// dispatched as events, then emulated here.
fn handle_efer_syscall_trap(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) -> bool {
    let rip = vmread(VmcsField::GuestRip).unwrap_or(0);
    let cr3 = vmread(VmcsField::GuestCr3).unwrap_or(0);
    let mut opcode = [0u8; 2];
    let Some(va) = VirtAddr::new(rip) else {
        return false;
    };
    if !hv.mapper.read_virt(va, cr3, &mut opcode) {
        return false;
    }

    match opcode {
        [0x0F, 0x05] => {
            // SYSCALL: the number rides in RAX.
            let (response, want_post) = hv.trigger(
                EventKind::SyscallHookEferSyscall,
                CallingStage::PreEvent,
                regs.rax,
                regs,
            );
            if response != TriggerResponse::SuccessfulIgnoreEvent {
                emulate_syscall(hv, core, regs, rip);
            }
            core.flags.suppress_rip_increment = true;
            if want_post {
                hv.trigger(
                    EventKind::SyscallHookEferSyscall,
                    CallingStage::PostEvent,
                    regs.rax,
                    regs,
                );
            }
            true
        }
        [0x0F, 0x07] => {
            let (response, want_post) = hv.trigger(
                EventKind::SyscallHookEferSysret,
                CallingStage::PreEvent,
                regs.rcx,
                regs,
            );
            if response != TriggerResponse::SuccessfulIgnoreEvent {
                emulate_sysret(regs);
            }
            core.flags.suppress_rip_increment = true;
            if want_post {
                hv.trigger(
                    EventKind::SyscallHookEferSysret,
                    CallingStage::PostEvent,
                    regs.rcx,
                    regs,
                );
            }
            true
        }
        _ => false,
    }
}

/// Emulate SYSCALL (SDM Vol. 2B): save return state, load the LSTAR
/// target and the masked RFLAGS, and switch the selectors.
fn emulate_syscall(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters, rip: u64) {
    use vtx::msr::{IA32_FMASK, IA32_LSTAR, IA32_STAR};

    let rflags = vmread(VmcsField::GuestRflags).unwrap_or(0);
    regs.rcx = rip + 2;
    regs.r11 = rflags;

    // Transparent mode watches specific syscall numbers and arms the
    // trap flag through the saved R11 image; the flag materializes when
    // SYSRET restores RFLAGS on the way back to user mode.
    transparent_syscall_capture(hv, core, regs);

    let lstar = read_msr(IA32_LSTAR);
    let fmask = read_msr(IA32_FMASK);
    let star = read_msr(IA32_STAR);
    let _ = vmwrite(VmcsField::GuestRip, lstar);
    let _ = vmwrite(VmcsField::GuestRflags, rflags & !(fmask | Rflags::RF.bits()));

    let kernel_cs = ((star >> 32) & 0xFFFC) as u64;
    let _ = vmwrite(VmcsField::GuestCsSelector, kernel_cs);
    let _ = vmwrite(VmcsField::GuestSsSelector, kernel_cs + 8);
}

/// Emulate SYSRET to 64-bit user mode.
fn emulate_sysret(regs: &mut GuestRegisters) {
    use vtx::msr::IA32_STAR;

    let _ = vmwrite(VmcsField::GuestRip, regs.rcx);
    let _ = vmwrite(
        VmcsField::GuestRflags,
        (regs.r11 & !(Rflags::RF.bits() | Rflags::VM.bits())) | Rflags::_1.bits(),
    );
    let star = read_msr(IA32_STAR);
    let user_cs = (((star >> 48) + 16) | 3) & 0xFFFF;
    let user_ss = (((star >> 48) + 8) | 3) & 0xFFFF;
    let _ = vmwrite(VmcsField::GuestCsSelector, user_cs);
    let _ = vmwrite(VmcsField::GuestSsSelector, user_ss);
}

fn handle_external_interrupt(hv: &Hypervisor<'_>, regs: &mut GuestRegisters) {
    let info = match InterruptionInfo::read() {
        Ok(Some(info)) => info,
        _ => return,
    };
    let (response, want_post) = hv.trigger(
        EventKind::ExternalInterruptOccurred,
        CallingStage::PreEvent,
        info.vector as u64,
        regs,
    );
    if response != TriggerResponse::SuccessfulIgnoreEvent {
        // Re-inject so the guest's IDT still sees the interrupt.
        inject_event(info.vector, InterruptionType::ExternalInterrupt, None);
    }
    if want_post {
        hv.trigger(
            EventKind::ExternalInterruptOccurred,
            CallingStage::PostEvent,
            info.vector as u64,
            regs,
        );
    }
}

fn handle_mtf(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) {
    let owner = core.mtf_owner;
    let eptp = core.eptp;
    core.mtf_owner = MtfOwner::None;
    apply_in_root(core, eptp, CoreOp::MonitorTrapFlag(false));

    match owner {
        MtfOwner::HookRestore(hook_id) => {
            let ept = unsafe { hv.ept.force_get_mut() };
            hooks::reapply_hook(ept, hv.platform, hook_id);
            if core.flags.register_break_on_mtf {
                core.flags.register_break_on_mtf = false;
                hv.debugger
                    .break_to_debugger(core.core_id, regs, PausingReason::EventTriggered, 0);
            }
        }
        MtfOwner::BreakpointReApply(_) | MtfOwner::Stepping | MtfOwner::Transparent => {
            if core.flags.set_rflags_if_on_mtf {
                core.flags.set_rflags_if_on_mtf = false;
                if let Ok(rflags) = vmread(VmcsField::GuestRflags) {
                    let _ = vmwrite(VmcsField::GuestRflags, rflags | Rflags::IF.bits());
                }
            }
            if !hv.debugger.mtf_arrived(core.core_id, regs) {
                debug!("unowned MTF consumed on core {}", core.core_id);
            }
        }
        MtfOwner::ImmediateExit => {
            // Nothing to do: exiting was the point, and any pending halt
            // NMI has been delivered by now.
        }
        MtfOwner::None => {
            warn!("spurious MTF exit on core {}", core.core_id);
        }
    }
}

fn handle_ept_violation(hv: &Hypervisor<'_>, core: &mut CoreState, regs: &mut GuestRegisters) {
    let qualification = EptViolationQualification::from_bits_truncate(
        vmread(VmcsField::ExitQualification).unwrap_or(0),
    );
    let gpa = vmread(VmcsField::GuestPhysicalAddr).unwrap_or(0);
    let pfn = gpa >> 12;

    // SAFETY: hook records are only mutated with peers halted; the exit
    // path reads them without the lock.
    let ept = unsafe { hv.ept.force_get_mut() };
    let Some(hook_id) = ept.find_hook_by_pfn(pfn) else {
        error!(
            "EPT violation without a hook record: gpa {:#x} {:?}",
            gpa, qualification
        );
        return;
    };

    let access = if qualification.contains(EptViolationQualification::EXECUTE_ACCESS) {
        HookAccess::EXECUTE
    } else if qualification.contains(EptViolationQualification::WRITE_ACCESS) {
        HookAccess::WRITE
    } else {
        HookAccess::READ
    };
    let is_detour = ept
        .hooks
        .get(hook_id)
        .map(|r| r.trampoline.is_some())
        .unwrap_or(false);

    // Pre-events fire in enumerated order; any one of them may demand
    // the short circuit.
    let mut short_circuit = false;
    let mut wants_post = false;
    for kind in hooks::violation_kinds(access, is_detour) {
        let (response, post) = hv.trigger(*kind, CallingStage::PreEvent, gpa, regs);
        short_circuit |= response == TriggerResponse::SuccessfulIgnoreEvent;
        wants_post |= post;
    }

    if short_circuit {
        // The action already did the architectural work: skip the
        // faulting instruction entirely.
        let _ = forward_rip();
        return;
    }

    // Let the guest run the one offending instruction against the real
    // page, then flip the hook view back on the MTF exit.
    hooks::expose_original_view(ept, hv.platform, hook_id);
    core.mtf_owner = MtfOwner::HookRestore(hook_id);
    core.flags.register_break_on_mtf = wants_post;
    let eptp = core.eptp;
    apply_in_root(core, eptp, CoreOp::MonitorTrapFlag(true));
}

/// Write the VM-entry interruption-information field so the event is
/// delivered on the next entry.
pub fn inject_event(vector: u8, kind: InterruptionType, error_code: Option<u64>) {
    let raw = InterruptionInfo::encode_for_injection(vector, kind, error_code.is_some());
    let _ = vmwrite(VmcsField::VmentryInterruptionInfo, raw as u64);
    if let Some(code) = error_code {
        let _ = vmwrite(VmcsField::VmentryExceptionErrCode, code);
    }
    if matches!(
        kind,
        InterruptionType::SoftwareException | InterruptionType::SoftwareInterrupt
    ) {
        if let Ok(len) = vmread(VmcsField::VmexitInstructionLength) {
            let _ = vmwrite(VmcsField::VmentryInstructionLength, len);
        }
    }
}

fn emulate_xsetbv(regs: &mut GuestRegisters) {
    let value = (regs.rdx << 32) | (regs.rax & 0xffff_ffff);
    let xcr = regs.rcx as u32;
    unsafe {
        core::arch::asm!(
            "xsetbv",
            in("ecx") xcr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
        );
    }
}
