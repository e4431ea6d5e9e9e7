//! Per-core VMX lifecycle.
//!
//! Each logical processor is virtualized in place: the running OS
//! becomes the guest, with guest state captured from the live processor
//! at launch time. Host state aliases the OS's own descriptor tables, so
//! no separate IDT/GDT/TSS is constructed. A failed VMLAUNCH logs the
//! VM-instruction error, executes VMXOFF and leaves the core
//! un-virtualized; a deliberate unload does the same through a VMCALL so
//! the exit stub can land the core exactly where the guest stopped.

use crate::state::{CoreState, VMM_STACK_SIZE};
use crate::{Hypervisor, Platform};
use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, Ordering};
use vtx::msr::{self, Msr};
use vtx::regs::{Cr0, Cr4};
use vtx::vmcs::{
    self, vmclear, vmptrld, vmread, vmwrite, vmxon, VmcsField, VmxError,
};
use vtx::vmx_controls::{
    adjust_controls, EntryControls, ExitControls, PinBasedControls, ProcBasedControls,
    SecondaryControls,
};
use vtx::{PhysAddr, VirtAddr, PAGE_SIZE};
use wire::ErrorCode;

/// VMCALL code asking the current core to devirtualize itself.
pub const VMCALL_UNLOAD: u64 = 0x1000_0001;

/// The context root the assembly stubs re-enter through.
static HYPERVISOR: AtomicPtr<Hypervisor<'static>> = AtomicPtr::new(core::ptr::null_mut());

/// Publish the hypervisor context for the exit path.
///
/// # Safety
/// `hv` must outlive every virtualized core (in practice: leaked once at
/// initialization and reclaimed only after the termination broadcast).
pub unsafe fn install_context(hv: &'static Hypervisor<'static>) {
    HYPERVISOR.store(hv as *const _ as *mut _, Ordering::Release);
}

fn context() -> &'static Hypervisor<'static> {
    let p = HYPERVISOR.load(Ordering::Acquire);
    debug_assert!(!p.is_null());
    unsafe { &*p }
}

/// Environmental checks: VT-x present, usable, and able to do what the
/// hook engine needs. Fatal when any of them fails; the driver unloads
/// cleanly without touching a core.
pub fn check_vmx_support() -> Result<(), ErrorCode> {
    if !vtx::has_vmx_support() {
        return Err(ErrorCode::VmxNotSupported);
    }
    if !msr::feature_control_allows_vmxon() {
        return Err(ErrorCode::VmxDisabledByFirmware);
    }
    let ept_cap = Msr::<{ msr::IA32_VMX_EPT_VPID_CAP }>::read();
    // Page-walk length 4 (bit 6), WB EPT memory type (bit 14),
    // 2 MiB pages (bit 16), single-context INVEPT (bit 25).
    let needed = (1 << 6) | (1 << 14) | (1 << 16) | (1 << 25);
    if ept_cap & needed != needed {
        return Err(ErrorCode::EptNotSupported);
    }
    Ok(())
}

/// Allocate the per-core regions and enter VMX operation on the calling
/// core. Runs inside the init broadcast DPC.
pub fn init_core(platform: &dyn Platform, core: &mut CoreState, eptp: u64) -> Result<(), ErrorCode> {
    let alloc = |pages: usize| -> Result<(PhysAddr, VirtAddr), ErrorCode> {
        let pa = platform
            .alloc_pages(pages)
            .ok_or(ErrorCode::PreAllocatedPoolEmpty)?;
        Ok((pa, platform.phys_to_virt(pa)))
    };

    let (vmxon_phys, vmxon_virt) = alloc(1)?;
    let (vmcs_phys, vmcs_virt) = alloc(1)?;
    let (msr_bitmap_phys, msr_bitmap_virt) = alloc(1)?;
    let (io_a_phys, io_a_virt) = alloc(1)?;
    let (io_b_phys, io_b_virt) = alloc(1)?;
    let (_stack_phys, stack_virt) = alloc(VMM_STACK_SIZE / PAGE_SIZE)?;

    core.vmxon_region_phys = vmxon_phys;
    core.vmxon_region_virt = vmxon_virt;
    core.vmcs_region_phys = vmcs_phys;
    core.vmcs_region_virt = vmcs_virt;
    core.msr_bitmap_phys = msr_bitmap_phys;
    core.msr_bitmap_virt = msr_bitmap_virt;
    core.io_bitmap_a_phys = io_a_phys;
    core.io_bitmap_a_virt = io_a_virt;
    core.io_bitmap_b_phys = io_b_phys;
    core.io_bitmap_b_virt = io_b_virt;
    core.vmm_stack = stack_virt;
    core.eptp = eptp;

    // Both regions start with the VMCS revision identifier.
    let revision = vmcs::revision_id();
    unsafe {
        *vmxon_virt.as_ptr::<u32>() = revision;
        *vmcs_virt.as_ptr::<u32>() = revision;
    }

    unsafe {
        (Cr4::current() | Cr4::VMXE).vmx_adjusted().apply();
        Cr0::current().vmx_adjusted().apply();
        vmxon(vmxon_phys).map_err(|e| fatal_vmx("vmxon", e))?;
    }
    vmclear(vmcs_phys).map_err(|e| fatal_vmx("vmclear", e))?;
    vmptrld(vmcs_phys).map_err(|e| fatal_vmx("vmptrld", e))?;
    Ok(())
}

fn fatal_vmx(what: &str, e: VmxError) -> ErrorCode {
    error!("{} failed: {:?}", what, e);
    ErrorCode::VmxNotSupported
}

global_asm!(
    // The VM-exit entry. The processor arrives here with the host RSP
    // from the VMCS; registers still hold guest values and are pushed in
    // the exact GuestRegisters layout (rax at the lowest address).
    ".global vmx_exit_stub",
    "vmx_exit_stub:",
    "push r15",
    "push r14",
    "push r13",
    "push r12",
    "push r11",
    "push r10",
    "push r9",
    "push r8",
    "push rdi",
    "push rsi",
    "push rbp",
    "push rbp", // placeholder slot for guest RSP (lives in the VMCS)
    "push rbx",
    "push rdx",
    "push rcx",
    "push rax",
    "mov rdi, rsp",
    "sub rsp, 0x20",
    "call vmx_exit_entry",
    "add rsp, 0x20",
    "cmp al, 0",
    "jnz 2f",
    "pop rax",
    "pop rcx",
    "pop rdx",
    "pop rbx",
    "add rsp, 8", // skip the RSP placeholder
    "pop rbp",
    "pop rsi",
    "pop rdi",
    "pop r8",
    "pop r9",
    "pop r10",
    "pop r11",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    "vmresume",
    "call vmx_resume_failed",
    // VMXOFF path: land on the guest RIP with the guest RSP, registers
    // restored from the frame.
    "2:",
    "pop rax",
    "pop rcx",
    "pop rdx",
    "pop rbx",
    "add rsp, 8",
    "pop rbp",
    "pop rsi",
    "pop rdi",
    "pop r8",
    "pop r9",
    "pop r10",
    "pop r11",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    "sub rsp, 0x100", // scratch away from the guest frame
    "push rax",
    "push rcx",
    "call vmxoff_restore_rsp",
    "mov rcx, rax",
    "call vmxoff_restore_rip",
    "mov rdx, rax",
    "pop rcx",
    "pop rax",
    "mov rsp, rcx",
    "jmp rdx",
);

global_asm!(
    // Capture the live processor state and launch the guest so that a
    // successful VMLAUNCH "returns" to the caller's return address in
    // VMX non-root operation. rdi = per-core launch context pointer.
    ".global vmx_launch_in_place",
    "vmx_launch_in_place:",
    "pushfq",
    "push r15",
    "push r14",
    "push r13",
    "push r12",
    "push rbp",
    "push rbx",
    "mov rsi, rsp",          // guest RSP to capture
    "lea rdx, [rip + 3f]",   // guest RIP to capture
    "sub rsp, 0x20",
    "call vmx_prepare_and_launch",
    "add rsp, 0x20",
    // Only reached when VMLAUNCH failed; the error path already ran.
    "pop rbx",
    "pop rbp",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    "popfq",
    "mov rax, 1",
    "ret",
    // The guest resumes here after a successful launch.
    "3:",
    "pop rbx",
    "pop rbp",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    "popfq",
    "xor rax, rax",
    "ret",
);

extern "C" {
    /// The VM-exit entry point written into HostRip.
    pub fn vmx_exit_stub();
    /// Captures state and launches; returns non-zero only on failure.
    pub fn vmx_launch_in_place(core: *mut CoreState) -> u64;
}

/// Rust side of the exit stub. Returns non-zero when VMXOFF ran and the
/// stub must jump back into the (now un-virtualized) guest.
#[no_mangle]
unsafe extern "C" fn vmx_exit_entry(regs: *mut vtx::GuestRegisters) -> u8 {
    let hv = context();
    let regs = &mut *regs;
    crate::dispatch::handle_vmexit(hv, regs);

    let core = hv.cores.get_mut(hv.platform.current_core());
    if core.vmxoff_guest_rip != 0 {
        1
    } else {
        0
    }
}

/// VMRESUME fell through: read the VM-instruction error, log it, and
/// give the core back to the OS un-virtualized. The guest continues.
#[no_mangle]
unsafe extern "C" fn vmx_resume_failed() -> ! {
    let e = vmcs::instruction_error();
    error!("vmresume failed: {:?}", e);
    let rip = vmread(VmcsField::GuestRip).unwrap_or(0);
    let rsp = vmread(VmcsField::GuestRsp).unwrap_or(0);
    vmcs::vmxoff();
    core::arch::asm!(
        "mov rsp, {rsp}",
        "jmp {rip}",
        rsp = in(reg) rsp,
        rip = in(reg) rip,
        options(noreturn)
    );
}

#[no_mangle]
unsafe extern "C" fn vmxoff_restore_rsp() -> u64 {
    let hv = context();
    hv.cores.get_mut(hv.platform.current_core()).vmxoff_guest_rsp
}

#[no_mangle]
unsafe extern "C" fn vmxoff_restore_rip() -> u64 {
    let hv = context();
    hv.cores.get_mut(hv.platform.current_core()).vmxoff_guest_rip
}

/// Rust side of the launch stub: build the VMCS around the captured
/// state and VMLAUNCH. Returns only on failure.
#[no_mangle]
unsafe extern "C" fn vmx_prepare_and_launch(
    core: *mut CoreState,
    guest_rsp: u64,
    guest_rip: u64,
) {
    let core = &mut *core;
    if let Err(e) = setup_vmcs(core, guest_rsp, guest_rip) {
        error!("vmcs setup failed on core {}: {:?}", core.core_id, e);
        vmcs::vmxoff();
        return;
    }
    core.has_launched = true;
    let err: i8;
    core::arch::asm!(
        "clc",
        "vmlaunch",
        "setna {}",
        out(reg_byte) err,
    );
    // VMLAUNCH only falls through on failure.
    let _ = err;
    core.has_launched = false;
    let e = vmcs::instruction_error();
    error!("vmlaunch failed on core {}: {:?}", core.core_id, e);
    vmcs::vmxoff();
}

#[inline(always)]
unsafe fn read_cs() -> u16 {
    let v: u16;
    core::arch::asm!("mov {0:x}, cs", out(reg) v, options(nomem, nostack));
    v
}

#[inline(always)]
unsafe fn read_ss() -> u16 {
    let v: u16;
    core::arch::asm!("mov {0:x}, ss", out(reg) v, options(nomem, nostack));
    v
}

#[inline(always)]
unsafe fn read_ds() -> u16 {
    let v: u16;
    core::arch::asm!("mov {0:x}, ds", out(reg) v, options(nomem, nostack));
    v
}

#[inline(always)]
unsafe fn read_es() -> u16 {
    let v: u16;
    core::arch::asm!("mov {0:x}, es", out(reg) v, options(nomem, nostack));
    v
}

#[inline(always)]
unsafe fn read_fs() -> u16 {
    let v: u16;
    core::arch::asm!("mov {0:x}, fs", out(reg) v, options(nomem, nostack));
    v
}

#[inline(always)]
unsafe fn read_gs() -> u16 {
    let v: u16;
    core::arch::asm!("mov {0:x}, gs", out(reg) v, options(nomem, nostack));
    v
}

#[inline(always)]
unsafe fn read_tr() -> u16 {
    let v: u16;
    core::arch::asm!("str {0:x}", out(reg) v, options(nomem, nostack));
    v
}

#[inline(always)]
unsafe fn read_ldtr() -> u16 {
    let v: u16;
    core::arch::asm!("sldt {0:x}", out(reg) v, options(nomem, nostack));
    v
}

#[repr(C, packed)]
struct TableRegister {
    limit: u16,
    base: u64,
}

#[inline(always)]
unsafe fn read_gdtr() -> TableRegister {
    let mut reg = TableRegister { limit: 0, base: 0 };
    core::arch::asm!("sgdt [{}]", in(reg) &mut reg, options(nostack));
    reg
}

#[inline(always)]
unsafe fn read_idtr() -> TableRegister {
    let mut reg = TableRegister { limit: 0, base: 0 };
    core::arch::asm!("sidt [{}]", in(reg) &mut reg, options(nostack));
    reg
}

/// Access-rights byte of a selector via LAR, in the VMCS encoding.
/// An unusable (null) selector reports the unusable bit.
unsafe fn access_rights(selector: u16) -> u64 {
    if selector == 0 {
        return 1 << 16; // unusable
    }
    let ar: u64;
    let ok: u8;
    core::arch::asm!(
        "lar {ar}, {sel:r}",
        "setz {ok}",
        ar = out(reg) ar,
        sel = in(reg) selector as u64,
        ok = out(reg_byte) ok,
    );
    if ok == 0 {
        1 << 16
    } else {
        (ar >> 8) & 0xF0FF
    }
}

/// Base address of a system segment (TR) from the GDT.
unsafe fn segment_base(gdt_base: u64, selector: u16) -> u64 {
    if selector == 0 {
        return 0;
    }
    let descriptor = (gdt_base + (selector & !7) as u64) as *const u64;
    let low = *descriptor;
    let mut base =
        ((low >> 16) & 0xFF_FFFF) | (((low >> 56) & 0xFF) << 24);
    // 16-byte system descriptors carry base bits 63:32 in the next slot.
    if (low >> 44) & 0x1 == 0 {
        let high = *descriptor.add(1);
        base |= (high & 0xFFFF_FFFF) << 32;
    }
    base
}

fn setup_vmcs(core: &mut CoreState, guest_rsp: u64, guest_rip: u64) -> Result<(), VmxError> {
    unsafe {
        // Execution controls, masked against the capability MSRs.
        vmwrite(
            VmcsField::PinBasedControls,
            adjust_controls(msr::IA32_VMX_PINBASED_CTLS, PinBasedControls::NMI_EXITING.bits())
                as u64,
        )?;
        vmwrite(
            VmcsField::ProcBasedControls,
            adjust_controls(
                msr::IA32_VMX_PROC_BASED_CTLS,
                (ProcBasedControls::USE_MSR_BITMAPS
                    | ProcBasedControls::USE_IO_BITMAPS
                    | ProcBasedControls::ACTIVATE_SECONDARY_CONTROLS)
                    .bits(),
            ) as u64,
        )?;
        vmwrite(
            VmcsField::SecondaryProcBasedControls,
            adjust_controls(
                msr::IA32_VMX_PROC_BASED_CTLS2,
                (SecondaryControls::ENABLE_EPT
                    | SecondaryControls::ENABLE_VPID
                    | SecondaryControls::ENABLE_RDTSCP
                    | SecondaryControls::ENABLE_INVPCID
                    | SecondaryControls::ENABLE_XSAVES_XRSTORS)
                    .bits(),
            ) as u64,
        )?;
        vmwrite(
            VmcsField::VmexitControls,
            adjust_controls(
                msr::IA32_VMX_EXIT_CTLS,
                (ExitControls::HOST_ADDRESS_SPACE_SIZE
                    | ExitControls::SAVE_IA32_EFER
                    | ExitControls::LOAD_IA32_EFER
                    | ExitControls::SAVE_DEBUG_CONTROLS)
                    .bits(),
            ) as u64,
        )?;
        vmwrite(
            VmcsField::VmentryControls,
            adjust_controls(
                msr::IA32_VMX_ENTRY_CTLS,
                (EntryControls::IA32E_MODE_GUEST
                    | EntryControls::LOAD_IA32_EFER
                    | EntryControls::LOAD_DEBUG_CONTROLS)
                    .bits(),
            ) as u64,
        )?;

        vmwrite(VmcsField::MsrBitmap, core.msr_bitmap_phys.into_u64())?;
        vmwrite(VmcsField::IoBitmapA, core.io_bitmap_a_phys.into_u64())?;
        vmwrite(VmcsField::IoBitmapB, core.io_bitmap_b_phys.into_u64())?;
        vmwrite(VmcsField::Eptp, core.eptp)?;
        vmwrite(VmcsField::Vpid, 1)?;
        vmwrite(VmcsField::VmcsLinkPointer, u64::MAX)?;
        vmwrite(VmcsField::ExceptionBitmap, 0)?;
        vmwrite(VmcsField::PageFaultErrCodeMask, 0)?;
        vmwrite(VmcsField::PageFaultErrCodeMatch, 0)?;
        vmwrite(VmcsField::Cr3TargetCount, 0)?;
        vmwrite(VmcsField::Cr0GuestHostMask, 0)?;
        vmwrite(VmcsField::Cr4GuestHostMask, Cr4::VMXE.bits())?;
        vmwrite(VmcsField::Cr0ReadShadow, Cr0::current().bits())?;
        vmwrite(VmcsField::Cr4ReadShadow, (Cr4::current() - Cr4::VMXE).bits())?;

        // Guest state: the processor exactly as it runs now.
        let gdtr = read_gdtr();
        let idtr = read_idtr();
        let (cs, ss, ds, es, fs, gs, tr, ldtr) = (
            read_cs(),
            read_ss(),
            read_ds(),
            read_es(),
            read_fs(),
            read_gs(),
            read_tr(),
            read_ldtr(),
        );

        vmwrite(VmcsField::GuestCr0, Cr0::current().bits())?;
        vmwrite(VmcsField::GuestCr3, vtx::regs::read_cr3())?;
        vmwrite(VmcsField::GuestCr4, Cr4::current().bits())?;
        vmwrite(VmcsField::GuestDr7, vtx::regs::read_dr7())?;
        vmwrite(VmcsField::GuestRsp, guest_rsp)?;
        vmwrite(VmcsField::GuestRip, guest_rip)?;
        vmwrite(VmcsField::GuestRflags, vtx::regs::Rflags::read().bits())?;

        vmwrite(VmcsField::GuestCsSelector, cs as u64)?;
        vmwrite(VmcsField::GuestSsSelector, ss as u64)?;
        vmwrite(VmcsField::GuestDsSelector, ds as u64)?;
        vmwrite(VmcsField::GuestEsSelector, es as u64)?;
        vmwrite(VmcsField::GuestFsSelector, fs as u64)?;
        vmwrite(VmcsField::GuestGsSelector, gs as u64)?;
        vmwrite(VmcsField::GuestTrSelector, tr as u64)?;
        vmwrite(VmcsField::GuestLdtrSelector, ldtr as u64)?;

        vmwrite(VmcsField::GuestCsAccessRights, access_rights(cs))?;
        vmwrite(VmcsField::GuestSsAccessRights, access_rights(ss))?;
        vmwrite(VmcsField::GuestDsAccessRights, access_rights(ds))?;
        vmwrite(VmcsField::GuestEsAccessRights, access_rights(es))?;
        vmwrite(VmcsField::GuestFsAccessRights, access_rights(fs))?;
        vmwrite(VmcsField::GuestGsAccessRights, access_rights(gs))?;
        vmwrite(VmcsField::GuestTrAccessRights, access_rights(tr))?;
        vmwrite(VmcsField::GuestLdtrAccessRights, access_rights(ldtr))?;

        vmwrite(VmcsField::GuestCsLimit, segment_limit(cs))?;
        vmwrite(VmcsField::GuestSsLimit, segment_limit(ss))?;
        vmwrite(VmcsField::GuestDsLimit, segment_limit(ds))?;
        vmwrite(VmcsField::GuestEsLimit, segment_limit(es))?;
        vmwrite(VmcsField::GuestFsLimit, segment_limit(fs))?;
        vmwrite(VmcsField::GuestGsLimit, segment_limit(gs))?;
        vmwrite(VmcsField::GuestTrLimit, segment_limit(tr))?;
        vmwrite(VmcsField::GuestLdtrLimit, segment_limit(ldtr))?;

        vmwrite(VmcsField::GuestCsBase, 0)?;
        vmwrite(VmcsField::GuestSsBase, 0)?;
        vmwrite(VmcsField::GuestDsBase, 0)?;
        vmwrite(VmcsField::GuestEsBase, 0)?;
        vmwrite(VmcsField::GuestFsBase, Msr::<{ msr::IA32_FS_BASE }>::read())?;
        vmwrite(VmcsField::GuestGsBase, Msr::<{ msr::IA32_GS_BASE }>::read())?;
        vmwrite(VmcsField::GuestTrBase, segment_base(gdtr.base, tr))?;
        vmwrite(VmcsField::GuestLdtrBase, segment_base(gdtr.base, ldtr))?;
        vmwrite(VmcsField::GuestGdtrBase, gdtr.base)?;
        vmwrite(VmcsField::GuestGdtrLimit, gdtr.limit as u64)?;
        vmwrite(VmcsField::GuestIdtrBase, idtr.base)?;
        vmwrite(VmcsField::GuestIdtrLimit, idtr.limit as u64)?;

        vmwrite(VmcsField::GuestIa32Debugctl, Msr::<{ msr::IA32_DEBUGCTL }>::read())?;
        vmwrite(VmcsField::GuestIa32Efer, Msr::<{ msr::IA32_EFER }>::read())?;
        vmwrite(VmcsField::GuestIa32Pat, Msr::<{ msr::IA32_PAT }>::read())?;
        vmwrite(VmcsField::GuestInterruptibilityState, 0)?;
        vmwrite(VmcsField::GuestActivityState, 0)?;
        vmwrite(VmcsField::GuestPendingDbgExceptions, 0)?;
        vmwrite(
            VmcsField::GuestIa32SysenterCs,
            Msr::<{ msr::IA32_SYSENTER_CS }>::read(),
        )?;
        vmwrite(
            VmcsField::GuestIa32SysenterEsp,
            Msr::<{ msr::IA32_SYSENTER_ESP }>::read(),
        )?;
        vmwrite(
            VmcsField::GuestIa32SysenterEip,
            Msr::<{ msr::IA32_SYSENTER_EIP }>::read(),
        )?;

        // Host state: the OS's own tables, our stack and entry stub.
        vmwrite(VmcsField::HostCr0, Cr0::current().bits())?;
        vmwrite(VmcsField::HostCr3, vtx::regs::read_cr3())?;
        vmwrite(VmcsField::HostCr4, Cr4::current().bits())?;
        vmwrite(VmcsField::HostCsSelector, (cs & !7) as u64)?;
        vmwrite(VmcsField::HostSsSelector, (ss & !7) as u64)?;
        vmwrite(VmcsField::HostDsSelector, (ds & !7) as u64)?;
        vmwrite(VmcsField::HostEsSelector, (es & !7) as u64)?;
        vmwrite(VmcsField::HostFsSelector, (fs & !7) as u64)?;
        vmwrite(VmcsField::HostGsSelector, (gs & !7) as u64)?;
        vmwrite(VmcsField::HostTrSelector, (tr & !7) as u64)?;
        vmwrite(VmcsField::HostFsBase, Msr::<{ msr::IA32_FS_BASE }>::read())?;
        vmwrite(VmcsField::HostGsBase, Msr::<{ msr::IA32_GS_BASE }>::read())?;
        vmwrite(VmcsField::HostTrBase, segment_base(gdtr.base, tr))?;
        vmwrite(VmcsField::HostGdtrBase, gdtr.base)?;
        vmwrite(VmcsField::HostIdtrBase, idtr.base)?;
        vmwrite(VmcsField::HostIa32Efer, Msr::<{ msr::IA32_EFER }>::read())?;
        vmwrite(VmcsField::HostIa32Pat, Msr::<{ msr::IA32_PAT }>::read())?;
        vmwrite(
            VmcsField::HostIa32SysenterCs,
            Msr::<{ msr::IA32_SYSENTER_CS }>::read(),
        )?;
        vmwrite(
            VmcsField::HostIa32SysenterEsp,
            Msr::<{ msr::IA32_SYSENTER_ESP }>::read(),
        )?;
        vmwrite(
            VmcsField::HostIa32SysenterEip,
            Msr::<{ msr::IA32_SYSENTER_EIP }>::read(),
        )?;

        // 16-byte aligned top of the VMM stack.
        let host_rsp = (core.vmm_stack.into_u64() + VMM_STACK_SIZE as u64) & !0xF;
        vmwrite(VmcsField::HostRsp, host_rsp)?;
        vmwrite(VmcsField::HostRip, vmx_exit_stub as usize as u64)?;
    }
    Ok(())
}

#[inline(always)]
unsafe fn segment_limit(selector: u16) -> u64 {
    if selector == 0 {
        return 0;
    }
    let limit: u64;
    let ok: u8;
    core::arch::asm!(
        "lsl {limit}, {sel:r}",
        "setz {ok}",
        limit = out(reg) limit,
        sel = in(reg) selector as u64,
        ok = out(reg_byte) ok,
    );
    if ok == 0 {
        0
    } else {
        limit
    }
}

/// Flip the EFER syscall-enable hook on the current VMCS: with SCE
/// cleared, every SYSCALL/SYSRET raises #UD, which the exception handler
/// turns into events and emulation. Guest reads of IA32_EFER are
/// intercepted alongside so the cleared bit stays invisible.
pub fn set_syscall_hook(on: bool) {
    #[cfg(not(test))]
    {
        if let Ok(efer) = vmread(VmcsField::GuestIa32Efer) {
            const SCE: u64 = 1;
            let new = if on { efer & !SCE } else { efer | SCE };
            let _ = vmwrite(VmcsField::GuestIa32Efer, new);
        }
        crate::broadcast::set_exception_bitmap_bit(vtx::exit::INVALID_OPCODE_VECTOR, on);
    }
    #[cfg(test)]
    let _ = on;
}

/// Request a clean VMXOFF of the calling core: capture where the guest
/// must continue, drop every hook view, and let the exit stub land on
/// the captured state after the handler returns.
///
/// # Safety
/// VMX root only; the core must be about to return from its exit
/// handler.
pub unsafe fn vmxoff_on_exit(hv: &Hypervisor<'_>, core: &mut CoreState) {
    let rip = vmread(VmcsField::GuestRip).unwrap_or(0);
    let len = vmread(VmcsField::VmexitInstructionLength).unwrap_or(0);
    let rsp = vmread(VmcsField::GuestRsp).unwrap_or(0);
    core.vmxoff_guest_rip = rip + len;
    core.vmxoff_guest_rsp = rsp;

    // The EPT views must be gone before this core stops translating
    // through them.
    let ept = hv.ept.force_get_mut();
    ept.restore_all_hooks(hv.platform);

    vmcs::vmxoff();
    core.has_launched = false;
    core.is_on_vmx_root = false;
}

/// Launch the current core. Returns an error when VMLAUNCH failed (the
/// core is then already back out of VMX operation).
pub fn launch_core(core: &mut CoreState) -> Result<(), ErrorCode> {
    let failed = unsafe { vmx_launch_in_place(core as *mut CoreState) };
    if failed != 0 {
        return Err(ErrorCode::VmxNotSupported);
    }
    Ok(())
}
