//! VM-execution, VM-exit and VM-entry control fields.

use crate::msr::read_msr;

bitflags::bitflags! {
    /// Pin-based VM-execution controls (SDM Vol. 3C, Table 24-5).
    pub struct PinBasedControls: u32 {
        /// External interrupts cause VM exits; RFLAGS.IF does not block them.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMIs cause VM exits instead of using IDT descriptor 2.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked; interruptibility tracks virtual-NMI blocking.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in non-root operation.
        const PREEMPTION_TIMER = 1 << 6;
        /// Posted-interrupt processing.
        const POSTED_INTERRUPTS = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls (SDM Vol. 3C, Table 24-6).
    pub struct ProcBasedControls: u32 {
        /// VM exit at the start of any instruction while RFLAGS.IF = 1 and
        /// interrupts are not otherwise blocked.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// RDTSC/RDTSCP/IA32_TIME_STAMP_COUNTER reads see the TSC offset.
        const USE_TSC_OFFSETTING = 1 << 3;
        /// HLT causes VM exits.
        const HLT_EXITING = 1 << 7;
        /// INVLPG causes VM exits.
        const INVLPG_EXITING = 1 << 9;
        /// MWAIT causes VM exits.
        const MWAIT_EXITING = 1 << 10;
        /// RDPMC causes VM exits.
        const RDPMC_EXITING = 1 << 11;
        /// RDTSC and RDTSCP cause VM exits.
        const RDTSC_EXITING = 1 << 12;
        /// MOV to CR3 causes VM exits (with the CR3-target controls).
        const CR3_LOAD_EXITING = 1 << 15;
        /// MOV from CR3 causes VM exits.
        const CR3_STORE_EXITING = 1 << 16;
        /// MOV to CR8 causes VM exits.
        const CR8_LOAD_EXITING = 1 << 19;
        /// MOV from CR8 causes VM exits.
        const CR8_STORE_EXITING = 1 << 20;
        /// TPR virtualization and other APIC-virtualization features.
        const USE_TPR_SHADOW = 1 << 21;
        /// VM exit at the start of any instruction with no virtual-NMI blocking.
        const NMI_WINDOW_EXITING = 1 << 22;
        /// MOV DR causes VM exits.
        const MOV_DR_EXITING = 1 << 23;
        /// IN/INS/OUT/OUTS cause VM exits unconditionally.
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        /// I/O bitmaps restrict I/O instruction exiting.
        const USE_IO_BITMAPS = 1 << 25;
        /// The monitor trap flag debugging feature (SDM Vol. 3C, 25.5.2).
        const MONITOR_TRAP_FLAG = 1 << 27;
        /// MSR bitmaps restrict RDMSR/WRMSR exiting.
        const USE_MSR_BITMAPS = 1 << 28;
        /// MONITOR causes VM exits.
        const MONITOR_EXITING = 1 << 29;
        /// PAUSE causes VM exits.
        const PAUSE_EXITING = 1 << 30;
        /// The secondary processor-based controls are used.
        const ACTIVATE_SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls (SDM Vol. 3C, Table 24-7).
    pub struct SecondaryControls: u32 {
        /// Accesses to the APIC-access page are treated specially.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables are enabled.
        const ENABLE_EPT = 1 << 1;
        /// LGDT/LIDT/LLDT/LTR/SGDT/SIDT/SLDT/STR cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// RDTSCP does not #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// Cached linear translations carry a virtual-processor identifier.
        const ENABLE_VPID = 1 << 5;
        /// WBINVD causes VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// The guest may run in unpaged protected mode or real mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// INVPCID does not #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// VMFUNC is usable in non-root operation.
        const ENABLE_VM_FUNCTIONS = 1 << 13;
        /// Intel PT hides that the processor was in non-root operation.
        const CONCEAL_VMX_FROM_PT = 1 << 19;
        /// XSAVES/XRSTORS do not #UD.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
        /// EPT execute permissions distinguish user/supervisor linear addresses.
        const MODE_BASED_EXECUTE_CONTROL = 1 << 22;
        /// RDTSC/RDTSCP/RDMSR of the TSC see the TSC multiplier.
        const USE_TSC_SCALING = 1 << 25;
    }
}

bitflags::bitflags! {
    /// Primary VM-exit controls (SDM Vol. 3C, Table 24-13).
    pub struct ExitControls: u32 {
        /// DR7 and IA32_DEBUGCTL are saved on VM exit.
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        /// The processor is in 64-bit mode after VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// Acknowledge the interrupt controller on external-interrupt exits,
        /// storing the vector in the interruption-information field.
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        /// IA32_PAT is saved on VM exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// IA32_PAT is loaded on VM exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// IA32_EFER is saved on VM exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// IA32_EFER is loaded on VM exit.
        const LOAD_IA32_EFER = 1 << 21;
    }
}

bitflags::bitflags! {
    /// VM-entry controls (SDM Vol. 3C, Table 24-15).
    pub struct EntryControls: u32 {
        /// DR7 and IA32_DEBUGCTL are loaded on VM entry.
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        /// The logical processor is in IA-32e mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// IA32_PAT is loaded on VM entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// IA32_EFER is loaded on VM entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

/// Adjust a desired control value against its VMX capability MSR.
///
/// The capability MSR reports allowed-0 settings in its low half and
/// allowed-1 settings in its high half (SDM Vol. 3D, A.3): mandatory bits
/// are OR-ed in, unsupported bits are masked off.
pub fn adjust_controls(capability_msr: u32, desired: u32) -> u32 {
    let cap = read_msr(capability_msr);
    let allowed0 = cap as u32;
    let allowed1 = (cap >> 32) as u32;
    (desired | allowed0) & allowed1
}
