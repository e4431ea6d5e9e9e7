//! The EPT hook engine.
//!
//! Three hook flavors share one record per hooked physical page, so
//! adding a second flavor or a second breakpoint to the same page never
//! allocates another record:
//!
//! * **Hidden breakpoints** patch `0xCC` into a shadow copy of the page
//!   and point the execute view at the shadow frame. The guest reads its
//!   own original bytes (reads hit the real frame) while executing ours.
//! * **Inline detours** patch a 19-byte absolute jump into the shadow
//!   page and build a trampoline holding the displaced instructions.
//! * **R/W monitors** keep the original frame but strip the watched
//!   access bits from the PML1 entry.
//!
//! All state changes go through the EPT manager's PML1-swap primitive;
//! the EPT-violation path in the dispatcher consults [`violation_kinds`]
//! for the exact event fan-out order.

use crate::ept::{EptError, EptState};
use crate::mapper::GuestMemory;
use crate::pools::{PoolBuffer, PoolKind, PoolManager};
use crate::Platform;
use alloc::vec::Vec;
use vtx::ept::{EptEntry, EptFlags};
use vtx::{PhysAddr, VirtAddr, PAGE_SIZE};
use wire::types::EventKind;
use wire::ErrorCode;

/// How many hidden breakpoints one page can carry.
pub const MAX_HIDDEN_BREAKPOINTS_ON_PAGE: usize = 16;

/// Size of the long absolute-jump template.
pub const ABSOLUTE_JUMP_SIZE: usize = 19;

/// Size of the short absolute-jump template (no leading call).
pub const ABSOLUTE_JUMP_RETURN_SIZE: usize = 14;

/// Upper bound of a trampoline: the displaced prologue can end at most
/// one instruction (15 bytes) past the 19-byte window, plus the tail.
pub const MAX_TRAMPOLINE_SIZE: usize = ABSOLUTE_JUMP_SIZE + 15 + ABSOLUTE_JUMP_RETURN_SIZE;

bitflags::bitflags! {
    /// Which access kinds a record watches.
    pub struct HookAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Handle to a hook record.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct HookId(pub u32);

/// One hidden breakpoint within a page.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointSlot {
    /// Guest virtual address of the breakpoint.
    pub va: VirtAddr,
    /// The byte that was at the address when the hook was installed.
    pub original_byte: u8,
}

/// Per-page hook record.
pub struct HookedPage {
    /// Aligned physical frame of the hooked page.
    pub pfn: u64,
    /// One representative guest virtual address within the frame.
    pub representative_va: VirtAddr,
    /// The PML1 entry before the hook.
    pub original_entry: EptEntry,
    /// The hook view swapped in while the hook is active.
    pub changed_entry: EptEntry,
    /// Physical slot of the PML1 entry controlling the page.
    pub pml1_slot: PhysAddr,
    /// Shadow page, present for execution hooks.
    pub shadow: Option<PoolBuffer>,
    /// True for the hidden-`0xCC` flavor.
    pub is_hidden_breakpoint: bool,
    /// True for `0xCC` and detour flavors.
    pub is_execution_hook: bool,
    /// Watched access kinds (monitor hooks).
    pub access: HookAccess,
    /// Hidden breakpoints sharing this page.
    pub breakpoints: Vec<BreakpointSlot>,
    /// Trampoline buffer of the detour flavor.
    pub trampoline: Option<PoolBuffer>,
    /// Valid bytes in the trampoline.
    pub trampoline_len: usize,
    /// Guest address of the detoured function.
    pub detoured_function: u64,
    /// Address of the user's hook function the shadow page jumps to.
    pub hook_function: u64,
}

impl HookedPage {
    /// The virtual address of the shadow page contents.
    fn shadow_bytes(&self, len: usize) -> Option<&mut [u8]> {
        let shadow = self.shadow.as_ref()?;
        Some(unsafe { core::slice::from_raw_parts_mut(shadow.virt.as_ptr::<u8>(), len) })
    }
}

/// Registry of hook records: a typed arena with id handles, iterated in
/// installation order.
pub struct HookRegistry {
    slots: Vec<Option<HookedPage>>,
    order: Vec<HookId>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            // Reserved up front: inserts on the VMCALL path must not grow.
            slots: Vec::with_capacity(256),
            order: Vec::with_capacity(256),
        }
    }

    fn insert(&mut self, record: HookedPage) -> HookId {
        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(record);
                HookId(free as u32)
            }
            None => {
                self.slots.push(Some(record));
                HookId((self.slots.len() - 1) as u32)
            }
        };
        self.order.push(id);
        id
    }

    fn remove(&mut self, id: HookId) -> Option<HookedPage> {
        let record = self.slots.get_mut(id.0 as usize)?.take()?;
        self.order.retain(|o| *o != id);
        Some(record)
    }

    pub fn get(&self, id: HookId) -> Option<&HookedPage> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: HookId) -> Option<&mut HookedPage> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    /// Records in installation order.
    pub fn iter(&self) -> impl Iterator<Item = (HookId, &HookedPage)> {
        self.order
            .iter()
            .filter_map(move |id| self.get(*id).map(|r| (*id, r)))
    }

    /// The record owning a physical frame. At most one exists per frame.
    pub fn find_by_pfn(&self, pfn: u64) -> Option<HookId> {
        self.iter().find(|(_, r)| r.pfn == pfn).map(|(id, _)| id)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the 19-byte absolute jump:
///
/// ```text
/// E8 00 00 00 00            call $+5
/// 68 <lo32>                 push low 32 bits
/// C7 44 24 04 <hi32>        mov dword [rsp+4], high 32 bits
/// C3                        ret
/// ```
pub fn write_absolute_jump(buffer: &mut [u8], target: u64) {
    buffer[0] = 0xE8;
    buffer[1..5].fill(0x00);
    buffer[5] = 0x68;
    buffer[6..10].copy_from_slice(&(target as u32).to_le_bytes());
    buffer[10] = 0xC7;
    buffer[11] = 0x44;
    buffer[12] = 0x24;
    buffer[13] = 0x04;
    buffer[14..18].copy_from_slice(&((target >> 32) as u32).to_le_bytes());
    buffer[18] = 0xC3;
}

/// Write the 14-byte variant used at a trampoline tail (no leading call).
pub fn write_absolute_jump_return(buffer: &mut [u8], target: u64) {
    buffer[0] = 0x68;
    buffer[1..5].copy_from_slice(&(target as u32).to_le_bytes());
    buffer[5] = 0xC7;
    buffer[6] = 0x44;
    buffer[7] = 0x24;
    buffer[8] = 0x04;
    buffer[9..13].copy_from_slice(&((target >> 32) as u32).to_le_bytes());
    buffer[13] = 0xC3;
}

/// Length of the instruction at the start of `code`.
///
/// `code` should hold at least one full instruction; the decoder never
/// reads past the slice.
pub fn ldisasm(code: &[u8], is_64bit: bool) -> usize {
    use iced_x86::{Decoder, DecoderOptions, Instruction};
    let bitness = if is_64bit { 64 } else { 32 };
    let mut decoder = Decoder::with_ip(bitness, code, 0, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    if decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        instruction.len()
    } else {
        1
    }
}

/// The pre-event fan-out for an EPT violation, in enumerated order.
///
/// The dispatcher triggers each kind; the final short-circuit decision is
/// "short-circuit if any pre-event so requested".
pub fn violation_kinds(access: HookAccess, record_is_detour: bool) -> &'static [EventKind] {
    if access.contains(HookAccess::EXECUTE) {
        if record_is_detour {
            &[EventKind::HiddenHookExecDetours]
        } else {
            &[EventKind::HiddenHookExecCc]
        }
    } else if access.contains(HookAccess::WRITE) {
        &[
            EventKind::HiddenHookWrite,
            EventKind::HiddenHookReadAndWrite,
            EventKind::HiddenHookWriteAndExecute,
            EventKind::HiddenHookReadAndWriteAndExecute,
        ]
    } else {
        &[
            EventKind::HiddenHookRead,
            EventKind::HiddenHookReadAndWrite,
            EventKind::HiddenHookReadAndExecute,
            EventKind::HiddenHookReadAndWriteAndExecute,
        ]
    }
}

fn split_and_slot(
    state: &mut EptState,
    platform: &dyn Platform,
    pools: &PoolManager,
    page_phys: PhysAddr,
) -> Result<PhysAddr, ErrorCode> {
    state
        .split_large_page(platform, pools, page_phys)
        .map_err(ErrorCode::from)?;
    state
        .pml1_slot(platform, page_phys)
        .map_err(ErrorCode::from)
}

fn build_shadow(
    pools: &PoolManager,
    mem: &dyn GuestMemory,
    page_va: VirtAddr,
    cr3: u64,
) -> Result<PoolBuffer, ErrorCode> {
    let shadow = pools
        .request(PoolKind::ShadowPage)
        .ok_or(ErrorCode::PreAllocatedPoolEmpty)?;
    let contents = unsafe { core::slice::from_raw_parts_mut(shadow.virt.as_ptr::<u8>(), PAGE_SIZE) };
    if !mem.read_virt(page_va, cr3, contents) {
        pools.recycle(shadow);
        return Err(ErrorCode::InvalidAddress);
    }
    Ok(shadow)
}

/// Install (or extend) a hidden breakpoint at `va`.
///
/// A second install on a page that already carries an execution hook
/// appends to the record instead of creating a new one; installing at a
/// virtual address that is already a breakpoint is an error.
pub fn install_hidden_breakpoint(
    state: &mut EptState,
    platform: &dyn Platform,
    pools: &PoolManager,
    mem: &dyn GuestMemory,
    va: VirtAddr,
    cr3: u64,
) -> Result<HookId, ErrorCode> {
    let phys = mem
        .virt_to_phys_in(va, cr3)
        .ok_or(ErrorCode::InvalidAddress)?;
    let offset = va.page_offset();

    if let Some(id) = state.hooks.find_by_pfn(phys.pfn()) {
        let record = state.hooks.get_mut(id).ok_or(ErrorCode::TagNotExists)?;
        if !record.is_execution_hook {
            // A monitor record has no shadow page to patch.
            return Err(ErrorCode::AddressAlreadyHooked);
        }
        if record.breakpoints.iter().any(|b| b.va == va) {
            return Err(ErrorCode::AddressAlreadyHooked);
        }
        if record.breakpoints.len() >= MAX_HIDDEN_BREAKPOINTS_ON_PAGE {
            return Err(ErrorCode::MaximumBreakpointForSinglePageIsHit);
        }
        let shadow = record
            .shadow_bytes(PAGE_SIZE)
            .ok_or(ErrorCode::EptFetchPml1EntryFailed)?;
        let original_byte = shadow[offset];
        shadow[offset] = 0xCC;
        record.is_hidden_breakpoint = true;
        record.breakpoints.push(BreakpointSlot { va, original_byte });
        return Ok(id);
    }

    let page_phys = phys.page_base();
    let slot = split_and_slot(state, platform, pools, page_phys)?;
    let shadow = build_shadow(pools, mem, va.page_base(), cr3)?;

    let contents = unsafe { core::slice::from_raw_parts_mut(shadow.virt.as_ptr::<u8>(), PAGE_SIZE) };
    let original_byte = contents[offset];
    contents[offset] = 0xCC;

    let original_entry = state.read_pml1(platform, slot);
    let changed_entry = original_entry
        .with_permissions(EptFlags::EXECUTE_ONLY)
        .with_pfn(shadow.phys.pfn());

    let id = state.hooks.insert(HookedPage {
        pfn: phys.pfn(),
        representative_va: va,
        original_entry,
        changed_entry,
        pml1_slot: slot,
        shadow: Some(shadow),
        is_hidden_breakpoint: true,
        is_execution_hook: true,
        access: HookAccess::EXECUTE,
        breakpoints: alloc::vec![BreakpointSlot { va, original_byte }],
        trampoline: None,
        trampoline_len: 0,
        detoured_function: 0,
        hook_function: 0,
    });
    state.set_pml1_and_invalidate(platform, slot, changed_entry);
    Ok(id)
}

/// Install an inline detour at `target`, routing execution to
/// `hook_function`. Returns the record id and the trampoline address the
/// hook function uses to reach the displaced prologue.
pub fn install_detour(
    state: &mut EptState,
    platform: &dyn Platform,
    pools: &PoolManager,
    mem: &dyn GuestMemory,
    target: VirtAddr,
    hook_function: u64,
    cr3: u64,
) -> Result<(HookId, VirtAddr), ErrorCode> {
    let offset = target.page_offset();
    if offset + ABSOLUTE_JUMP_SIZE > PAGE_SIZE - 1 {
        return Err(ErrorCode::DetourTargetCrossesPage);
    }
    let phys = mem
        .virt_to_phys_in(target, cr3)
        .ok_or(ErrorCode::InvalidAddress)?;
    if state.hooks.find_by_pfn(phys.pfn()).is_some() {
        return Err(ErrorCode::AddressAlreadyHooked);
    }

    let page_phys = phys.page_base();
    let slot = split_and_slot(state, platform, pools, page_phys)?;
    let shadow = build_shadow(pools, mem, target.page_base(), cr3)?;
    let contents = unsafe { core::slice::from_raw_parts_mut(shadow.virt.as_ptr::<u8>(), PAGE_SIZE) };

    // Size the displaced prologue with the length disassembler, reading
    // from the shadow copy so user-mode targets need no address-space
    // switch here.
    let mut displaced = 0usize;
    while displaced < ABSOLUTE_JUMP_SIZE {
        displaced += ldisasm(&contents[offset + displaced..], true);
    }

    let trampoline = pools
        .request(PoolKind::ExecTrampoline)
        .ok_or(ErrorCode::PreAllocatedPoolEmpty)?;
    let trampoline_len = displaced + ABSOLUTE_JUMP_RETURN_SIZE;
    let tramp_bytes =
        unsafe { core::slice::from_raw_parts_mut(trampoline.virt.as_ptr::<u8>(), trampoline_len) };
    tramp_bytes[..displaced].copy_from_slice(&contents[offset..offset + displaced]);
    write_absolute_jump_return(
        &mut tramp_bytes[displaced..],
        target.into_u64() + displaced as u64,
    );

    // Route executions of the shadow page into the hook function.
    write_absolute_jump(&mut contents[offset..], hook_function);

    let original_entry = state.read_pml1(platform, slot);
    let changed_entry = original_entry
        .with_permissions(EptFlags::EXECUTE_ONLY)
        .with_pfn(shadow.phys.pfn());

    let trampoline_va = trampoline.virt;
    let id = state.hooks.insert(HookedPage {
        pfn: phys.pfn(),
        representative_va: target,
        original_entry,
        changed_entry,
        pml1_slot: slot,
        shadow: Some(shadow),
        is_hidden_breakpoint: false,
        is_execution_hook: true,
        access: HookAccess::EXECUTE,
        breakpoints: Vec::new(),
        trampoline: Some(trampoline),
        trampoline_len,
        detoured_function: target.into_u64(),
        hook_function,
    });
    state.set_pml1_and_invalidate(platform, slot, changed_entry);
    Ok((id, trampoline_va))
}

/// Install an R/W monitor over the page containing `va`.
///
/// The hook view keeps the original frame but clears the watched access
/// bits. Because an EPT entry with write permission but no read
/// permission is a misconfiguration, watching reads also strips writes.
pub fn install_monitor(
    state: &mut EptState,
    platform: &dyn Platform,
    pools: &PoolManager,
    mem: &dyn GuestMemory,
    va: VirtAddr,
    cr3: u64,
    watch: HookAccess,
) -> Result<HookId, ErrorCode> {
    if !watch.intersects(HookAccess::READ | HookAccess::WRITE) {
        return Err(ErrorCode::InvalidActionType);
    }
    let phys = mem
        .virt_to_phys_in(va, cr3)
        .ok_or(ErrorCode::InvalidAddress)?;
    if state.hooks.find_by_pfn(phys.pfn()).is_some() {
        return Err(ErrorCode::AddressAlreadyHooked);
    }

    let page_phys = phys.page_base();
    let slot = split_and_slot(state, platform, pools, page_phys)?;
    let original_entry = state.read_pml1(platform, slot);

    let mut perm = original_entry.flags() & EptFlags::FULL;
    if watch.contains(HookAccess::WRITE) {
        perm.remove(EptFlags::WRITE);
    }
    if watch.contains(HookAccess::READ) {
        perm.remove(EptFlags::READ);
        perm.remove(EptFlags::WRITE);
    }
    let changed_entry = original_entry.with_permissions(perm);

    let id = state.hooks.insert(HookedPage {
        pfn: phys.pfn(),
        representative_va: va,
        original_entry,
        changed_entry,
        pml1_slot: slot,
        shadow: None,
        is_hidden_breakpoint: false,
        is_execution_hook: false,
        access: watch,
        breakpoints: Vec::new(),
        trampoline: None,
        trampoline_len: 0,
        detoured_function: 0,
        hook_function: 0,
    });
    state.set_pml1_and_invalidate(platform, slot, changed_entry);
    Ok(id)
}

/// Remove one hidden breakpoint by virtual address.
///
/// The byte in the shadow page is restored; the record itself is removed
/// only when its last breakpoint goes away. Unhook-all of an empty
/// registry is a no-op.
pub fn remove_hidden_breakpoint(
    state: &mut EptState,
    platform: &dyn Platform,
    pools: &PoolManager,
    mem: &dyn GuestMemory,
    va: VirtAddr,
    cr3: u64,
) -> Result<(), ErrorCode> {
    let phys = mem
        .virt_to_phys_in(va, cr3)
        .ok_or(ErrorCode::InvalidAddress)?;
    let id = state
        .hooks
        .find_by_pfn(phys.pfn())
        .ok_or(ErrorCode::TagNotExists)?;
    let record = state.hooks.get_mut(id).ok_or(ErrorCode::TagNotExists)?;
    let index = record
        .breakpoints
        .iter()
        .position(|b| b.va == va)
        .ok_or(ErrorCode::TagNotExists)?;

    let slotinfo = record.breakpoints.remove(index);
    if let Some(shadow) = record.shadow_bytes(PAGE_SIZE) {
        shadow[va.page_offset()] = slotinfo.original_byte;
    }

    if record.breakpoints.is_empty() && record.trampoline.is_none() {
        remove_record(state, platform, pools, id);
    }
    Ok(())
}

/// Remove a whole record: restore the PML1 view and queue the shadow and
/// trampoline for deferred freeing.
pub fn remove_record(
    state: &mut EptState,
    platform: &dyn Platform,
    pools: &PoolManager,
    id: HookId,
) -> bool {
    let Some(record) = state.hooks.remove(id) else {
        return false;
    };
    state.set_pml1_and_invalidate(platform, record.pml1_slot, record.original_entry);
    if let Some(shadow) = record.shadow {
        if !pools.defer_free(shadow) {
            pools.recycle(shadow);
        }
    }
    if let Some(trampoline) = record.trampoline {
        if !pools.defer_free(trampoline) {
            pools.recycle(trampoline);
        }
    }
    true
}

/// Remove every hook.
pub fn unhook_all(state: &mut EptState, platform: &dyn Platform, pools: &PoolManager) -> usize {
    let ids: Vec<HookId> = state.hooks.iter().map(|(id, _)| id).collect();
    let mut removed = 0;
    for id in ids {
        if remove_record(state, platform, pools, id) {
            removed += 1;
        }
    }
    removed
}

/// Swap a hooked page to its normal view so the guest can execute one
/// real instruction; the caller arms MTF and restores via
/// [`reapply_hook`].
pub fn expose_original_view(state: &EptState, platform: &dyn Platform, id: HookId) -> bool {
    let Some(record) = state.hooks.get(id) else {
        return false;
    };
    state.set_pml1_and_invalidate(platform, record.pml1_slot, record.original_entry);
    true
}

/// Swap a hooked page back to its hook view after the MTF fired.
pub fn reapply_hook(state: &EptState, platform: &dyn Platform, id: HookId) -> bool {
    let Some(record) = state.hooks.get(id) else {
        return false;
    };
    state.set_pml1_and_invalidate(platform, record.pml1_slot, record.changed_entry);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::EptState;
    use crate::testing::{IdentityGuestMemory, MockPlatform};
    use vtx::ept::EptMemoryType;
    use vtx::mtrr::MemoryTypeMap;

    struct Fixture {
        platform: MockPlatform,
        pools: PoolManager,
        state: EptState,
    }

    fn fixture() -> Fixture {
        let platform = MockPlatform::new(1, 4096);
        let pools = PoolManager::new();
        pools.prealloc(&platform, PoolKind::EptPageTable, 8);
        pools.prealloc(&platform, PoolKind::ShadowPage, 8);
        pools.prealloc(&platform, PoolKind::ExecTrampoline, 8);
        let state = EptState::build(
            &platform,
            &MemoryTypeMap::from_ranges(Vec::new(), EptMemoryType::WriteBack),
        )
        .unwrap();
        Fixture {
            platform,
            pools,
            state,
        }
    }

    #[test]
    fn absolute_jump_templates_are_byte_exact() {
        let target = 0xFFFF_F801_2345_6789u64;
        let mut long = [0u8; ABSOLUTE_JUMP_SIZE];
        write_absolute_jump(&mut long, target);
        assert_eq!(&long[..5], &[0xE8, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(long[5], 0x68);
        assert_eq!(&long[6..10], &0x2345_6789u32.to_le_bytes());
        assert_eq!(&long[10..14], &[0xC7, 0x44, 0x24, 0x04]);
        assert_eq!(&long[14..18], &0xFFFF_F801u32.to_le_bytes());
        assert_eq!(long[18], 0xC3);

        let mut short = [0u8; ABSOLUTE_JUMP_RETURN_SIZE];
        write_absolute_jump_return(&mut short, target);
        assert_eq!(short[0], 0x68);
        assert_eq!(&short[1..5], &0x2345_6789u32.to_le_bytes());
        assert_eq!(&short[5..9], &[0xC7, 0x44, 0x24, 0x04]);
        assert_eq!(&short[9..13], &0xFFFF_F801u32.to_le_bytes());
        assert_eq!(short[13], 0xC3);
        // The long template is the short one behind a 5-byte call.
        assert_eq!(&long[5..], &short[..]);
    }

    #[test]
    fn ldisasm_reports_real_lengths() {
        // mov eax, imm32 (5), push rbp (1), nop dword (4), ret (1)
        assert_eq!(ldisasm(&[0xB8, 1, 0, 0, 0, 0x90], true), 5);
        assert_eq!(ldisasm(&[0x55, 0x90], true), 1);
        assert_eq!(ldisasm(&[0x0F, 0x1F, 0x40, 0x00, 0x90], true), 4);
        assert_eq!(ldisasm(&[0xC3], true), 1);
    }

    #[test]
    fn hidden_breakpoint_patches_shadow_only() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };

        // Guest page at 0x100000 with a known byte at +0x50.
        let page = PhysAddr::new(0x10_0000).unwrap();
        platform.phys_slice_mut(page, PAGE_SIZE)[0x50] = 0x48;
        let va = VirtAddr::new(0x10_0050).unwrap();

        let id = install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va, 0).unwrap();
        let record = state.hooks.get(id).unwrap();

        // Shadow carries 0xCC, the real frame still carries 0x48.
        let shadow = record.shadow.as_ref().unwrap();
        assert_eq!(platform.phys_slice(shadow.phys, PAGE_SIZE)[0x50], 0xCC);
        assert_eq!(platform.phys_slice(page, PAGE_SIZE)[0x50], 0x48);
        assert_eq!(record.breakpoints.len(), 1);
        assert_eq!(record.breakpoints[0].original_byte, 0x48);

        // The PML1 entry shows the hook view: execute-only, shadow frame.
        let live = state.read_pml1(&platform, record.pml1_slot);
        assert_eq!(live, record.changed_entry);
        assert_eq!(live.flags() & EptFlags::FULL, EptFlags::EXECUTE);
        assert_eq!(live.addr().unwrap(), shadow.phys);
    }

    #[test]
    fn second_breakpoint_same_page_shares_the_record() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let va1 = VirtAddr::new(0x10_0050).unwrap();
        let va2 = VirtAddr::new(0x10_0060).unwrap();

        let id1 = install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va1, 0).unwrap();
        let id2 = install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va2, 0).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(state.hooks.len(), 1);
        assert_eq!(state.hooks.get(id1).unwrap().breakpoints.len(), 2);

        // Same virtual address again is an error.
        assert_eq!(
            install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va1, 0),
            Err(ErrorCode::AddressAlreadyHooked)
        );
    }

    #[test]
    fn breakpoint_cap_is_enforced() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        for i in 0..MAX_HIDDEN_BREAKPOINTS_ON_PAGE {
            let va = VirtAddr::new(0x10_0000 + i as u64).unwrap();
            install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va, 0).unwrap();
        }
        let overflow = VirtAddr::new(0x10_0F00).unwrap();
        assert_eq!(
            install_hidden_breakpoint(&mut state, &platform, &pools, &mem, overflow, 0),
            Err(ErrorCode::MaximumBreakpointForSinglePageIsHit)
        );
    }

    #[test]
    fn breakpoint_remove_restores_everything() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let page = PhysAddr::new(0x10_0000).unwrap();
        platform.phys_slice_mut(page, PAGE_SIZE)[0x50] = 0x48;
        let va = VirtAddr::new(0x10_0050).unwrap();

        let id = install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va, 0).unwrap();
        let slot = state.hooks.get(id).unwrap().pml1_slot;
        let original = state.hooks.get(id).unwrap().original_entry;

        remove_hidden_breakpoint(&mut state, &platform, &pools, &mem, va, 0).unwrap();
        // Record gone, PML1 restored to the pre-install entry.
        assert!(state.hooks.is_empty());
        assert_eq!(state.read_pml1(&platform, slot), original);
        // The guest byte still reads back unchanged.
        assert_eq!(platform.phys_slice(page, PAGE_SIZE)[0x50], 0x48);
    }

    #[test]
    fn remove_one_of_two_keeps_the_record() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let page = PhysAddr::new(0x10_0000).unwrap();
        platform.phys_slice_mut(page, PAGE_SIZE)[0x50] = 0x11;
        platform.phys_slice_mut(page, PAGE_SIZE)[0x60] = 0x22;
        let va1 = VirtAddr::new(0x10_0050).unwrap();
        let va2 = VirtAddr::new(0x10_0060).unwrap();
        let id = install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va1, 0).unwrap();
        install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va2, 0).unwrap();

        remove_hidden_breakpoint(&mut state, &platform, &pools, &mem, va1, 0).unwrap();
        let record = state.hooks.get(id).unwrap();
        assert_eq!(record.breakpoints.len(), 1);
        let shadow = record.shadow.as_ref().unwrap();
        // va1's byte restored in the shadow, va2 still patched.
        assert_eq!(platform.phys_slice(shadow.phys, PAGE_SIZE)[0x50], 0x11);
        assert_eq!(platform.phys_slice(shadow.phys, PAGE_SIZE)[0x60], 0xCC);
    }

    #[test]
    fn detour_builds_trampoline_from_original_bytes() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        // Four 5-byte `mov eax, imm32` instructions: the displaced
        // prologue ends at 20 bytes, the first length >= 19.
        let page = PhysAddr::new(0x10_0000).unwrap();
        let body = platform.phys_slice_mut(page, PAGE_SIZE);
        for i in 0..4 {
            body[0x100 + i * 5] = 0xB8;
            body[0x100 + i * 5 + 1..0x100 + i * 5 + 5].copy_from_slice(&(i as u32).to_le_bytes());
        }
        let target = VirtAddr::new(0x10_0100).unwrap();
        let hook_fn = 0xFFFF_8000_DEAD_0000u64;

        let (id, trampoline_va) =
            install_detour(&mut state, &platform, &pools, &mem, target, hook_fn, 0).unwrap();
        let record = state.hooks.get(id).unwrap();
        assert_eq!(record.trampoline_len, 20 + ABSOLUTE_JUMP_RETURN_SIZE);

        let tramp = unsafe {
            core::slice::from_raw_parts(trampoline_va.as_ptr::<u8>(), record.trampoline_len)
        };
        // Displaced prologue is byte-identical to the original.
        assert_eq!(&tramp[..20], &platform.phys_slice(page, PAGE_SIZE)[0x100..0x114]);
        // Tail is the 14-byte return jump to target + 20.
        let mut expected_tail = [0u8; ABSOLUTE_JUMP_RETURN_SIZE];
        write_absolute_jump_return(&mut expected_tail, target.into_u64() + 20);
        assert_eq!(&tramp[20..], &expected_tail);

        // The shadow page carries the 19-byte jump to the hook function.
        let shadow = record.shadow.as_ref().unwrap();
        let mut expected_jump = [0u8; ABSOLUTE_JUMP_SIZE];
        write_absolute_jump(&mut expected_jump, hook_fn);
        assert_eq!(
            &platform.phys_slice(shadow.phys, PAGE_SIZE)[0x100..0x100 + ABSOLUTE_JUMP_SIZE],
            &expected_jump
        );

        // The original frame is untouched.
        assert_eq!(platform.phys_slice(page, PAGE_SIZE)[0x100], 0xB8);
    }

    #[test]
    fn detour_near_page_end_is_rejected() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let target = VirtAddr::new(0x10_0FF0).unwrap();
        assert_eq!(
            install_detour(&mut state, &platform, &pools, &mem, target, 0x1000, 0),
            Err(ErrorCode::DetourTargetCrossesPage)
        );
    }

    #[test]
    fn monitor_hook_strips_watched_bits_and_keeps_frame() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let va = VirtAddr::new(0x20_0800).unwrap();

        let id = install_monitor(
            &mut state,
            &platform,
            &pools,
            &mem,
            va,
            0,
            HookAccess::WRITE,
        )
        .unwrap();
        let record = state.hooks.get(id).unwrap();
        let live = state.read_pml1(&platform, record.pml1_slot);
        assert_eq!(
            live.flags() & EptFlags::FULL,
            EptFlags::READ | EptFlags::EXECUTE
        );
        // The frame is the original one; no shadow exists.
        assert_eq!(live.addr().unwrap().into_u64(), 0x20_0000);
        assert!(record.shadow.is_none());
    }

    #[test]
    fn read_monitor_also_strips_write() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let va = VirtAddr::new(0x20_0000).unwrap();
        let id = install_monitor(&mut state, &platform, &pools, &mem, va, 0, HookAccess::READ)
            .unwrap();
        let record = state.hooks.get(id).unwrap();
        assert_eq!(
            record.changed_entry.flags() & EptFlags::FULL,
            EptFlags::EXECUTE
        );
    }

    #[test]
    fn expose_and_reapply_swap_the_views() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let va = VirtAddr::new(0x10_0050).unwrap();
        let id = install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va, 0).unwrap();
        let record_slot = state.hooks.get(id).unwrap().pml1_slot;
        let original = state.hooks.get(id).unwrap().original_entry;
        let changed = state.hooks.get(id).unwrap().changed_entry;

        assert!(expose_original_view(&state, &platform, id));
        assert_eq!(state.read_pml1(&platform, record_slot), original);
        assert!(reapply_hook(&state, &platform, id));
        assert_eq!(state.read_pml1(&platform, record_slot), changed);
    }

    #[test]
    fn exactly_one_leaf_references_the_shadow_frame() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        let mem = IdentityGuestMemory {
            platform: &platform,
        };
        let va = VirtAddr::new(0x10_0800).unwrap();
        let id = install_hidden_breakpoint(&mut state, &platform, &pools, &mem, va, 0).unwrap();
        let shadow_pfn = state.hooks.get(id).unwrap().shadow.as_ref().unwrap().phys.pfn();

        // Scan every 4 KiB leaf of the split 2 MiB region. The shadow
        // frame's own identity slot still maps itself (all of physical
        // memory stays mapped); beyond that, only the hook view may
        // reference the shadow frame, and only execute-only.
        let mut hook_views = 0;
        for page in 0..512u64 {
            let pa = PhysAddr::new(page * PAGE_SIZE as u64).unwrap();
            let slot = state.pml1_slot(&platform, pa).unwrap();
            let entry = state.read_pml1(&platform, slot);
            if entry.addr().unwrap().pfn() != shadow_pfn {
                continue;
            }
            if page == shadow_pfn {
                assert_eq!(entry.flags() & EptFlags::FULL, EptFlags::FULL);
            } else {
                hook_views += 1;
                assert_eq!(entry.flags() & EptFlags::FULL, EptFlags::EXECUTE);
                assert_eq!(pa.pfn(), 0x100);
            }
        }
        assert_eq!(hook_views, 1);
    }

    #[test]
    fn unhook_all_from_empty_is_a_noop() {
        let f = fixture();
        let Fixture {
            platform,
            pools,
            mut state,
        } = f;
        assert_eq!(unhook_all(&mut state, &platform, &pools), 0);
    }

    #[test]
    fn violation_fanout_orders_match_the_contract() {
        assert_eq!(
            violation_kinds(HookAccess::WRITE, false),
            &[
                EventKind::HiddenHookWrite,
                EventKind::HiddenHookReadAndWrite,
                EventKind::HiddenHookWriteAndExecute,
                EventKind::HiddenHookReadAndWriteAndExecute,
            ]
        );
        assert_eq!(
            violation_kinds(HookAccess::READ, false),
            &[
                EventKind::HiddenHookRead,
                EventKind::HiddenHookReadAndWrite,
                EventKind::HiddenHookReadAndExecute,
                EventKind::HiddenHookReadAndWriteAndExecute,
            ]
        );
        assert_eq!(
            violation_kinds(HookAccess::EXECUTE, true),
            &[EventKind::HiddenHookExecDetours]
        );
        assert_eq!(
            violation_kinds(HookAccess::EXECUTE, false),
            &[EventKind::HiddenHookExecCc]
        );
    }
}
