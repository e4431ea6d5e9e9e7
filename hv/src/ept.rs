//! EPT construction and maintenance.
//!
//! The guest runs on an identity map of physical memory built once at
//! initialization from 2 MiB pages whose memory types follow the MTRRs.
//! Afterwards the manager mutates the hierarchy on demand: splitting a
//! 2 MiB leaf into 512 PML1 entries when a hook needs 4 KiB granularity,
//! and swapping individual PML1 entries between their normal and hook
//! views. Every mutation is followed by a single-context INVEPT.

use crate::hooks::{HookId, HookRegistry};
use crate::pools::{PoolKind, PoolManager};
use crate::Platform;
use alloc::vec::Vec;
use vtx::ept::{self, EptEntry, EptFlags, EptMemoryType, Eptp, InveptKind};
use vtx::mtrr::MemoryTypeMap;
use vtx::{PhysAddr, PAGE_SIZE, PAGE_SIZE_2M};
use wire::ErrorCode;

/// Errors of EPT maintenance operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EptError {
    /// The address is beyond the built identity map.
    OutOfRange,
    /// A 2 MiB leaf had to be split but the split pool is empty.
    SplitPoolEmpty,
    /// The PML1 entry for the address could not be fetched.
    NoPml1Entry,
    /// The platform could not provide pages for the initial tables.
    OutOfMemory,
}

impl From<EptError> for ErrorCode {
    fn from(e: EptError) -> Self {
        match e {
            EptError::OutOfRange => ErrorCode::InvalidAddress,
            EptError::SplitPoolEmpty => ErrorCode::EptPageSplitFailed,
            EptError::NoPml1Entry => ErrorCode::EptFetchPml1EntryFailed,
            EptError::OutOfMemory => ErrorCode::PreAllocatedPoolEmpty,
        }
    }
}

/// The EPT hierarchy plus the registry of hooked pages.
pub struct EptState {
    pml4: PhysAddr,
    eptp: Eptp,
    /// Pages backing the static hierarchy, freed at teardown.
    table_pages: Vec<PhysAddr>,
    /// Pages drawn from the split pool, recycled at teardown.
    split_tables: Vec<PhysAddr>,
    /// Hooked-page records, reachable by id.
    pub hooks: HookRegistry,
}

impl EptState {
    /// A placeholder with no tables, used to swap the real state out at
    /// teardown.
    pub fn empty() -> Self {
        Self {
            pml4: PhysAddr::from_pfn(0),
            eptp: vtx::ept::Eptp::new(PhysAddr::from_pfn(0)),
            table_pages: Vec::new(),
            split_tables: Vec::new(),
            hooks: HookRegistry::new(),
        }
    }

    /// Build the identity map. Passive level only.
    pub fn build(platform: &dyn Platform, memory_map: &MemoryTypeMap) -> Result<Self, EptError> {
        let highest = platform.highest_pfn() * PAGE_SIZE as u64;
        let gib = 1u64 << 30;
        let gib_count = highest.div_ceil(gib).max(1);

        let mut table_pages = Vec::new();
        let mut alloc_table = |p: &dyn Platform| -> Result<PhysAddr, EptError> {
            let pa = p.alloc_pages(1).ok_or(EptError::OutOfMemory)?;
            table_pages.push(pa);
            Ok(pa)
        };

        let pml4 = alloc_table(platform)?;
        let pdpt = alloc_table(platform)?;
        unsafe {
            *Self::entry_ptr(platform, pml4, 0) = EptEntry::table(pdpt);
        }

        for g in 0..gib_count {
            let pd = alloc_table(platform)?;
            unsafe {
                *Self::entry_ptr(platform, pdpt, g as usize) = EptEntry::table(pd);
            }
            for i in 0..512usize {
                let base = PhysAddr::new(g * gib + (i * PAGE_SIZE_2M) as u64)
                    .ok_or(EptError::OutOfRange)?;
                let memory_type = memory_map.type_of_large_page(base);
                unsafe {
                    *Self::entry_ptr(platform, pd, i) =
                        EptEntry::leaf(base, EptFlags::FULL, memory_type, true);
                }
            }
        }

        Ok(Self {
            pml4,
            eptp: Eptp::new(pml4),
            table_pages,
            split_tables: Vec::new(),
            hooks: HookRegistry::new(),
        })
    }

    /// The EPTP value for the VMCS.
    pub fn eptp(&self) -> Eptp {
        self.eptp
    }

    unsafe fn entry_ptr(platform: &dyn Platform, table: PhysAddr, index: usize) -> *mut EptEntry {
        platform.phys_to_virt(table).as_ptr::<EptEntry>().add(index)
    }

    fn read_entry(&self, platform: &dyn Platform, table: PhysAddr, index: usize) -> EptEntry {
        unsafe { core::ptr::read_volatile(Self::entry_ptr(platform, table, index)) }
    }

    /// Invalidate guest-physical mappings derived from this EPTP.
    fn flush(&self) {
        #[cfg(not(test))]
        ept::invept(InveptKind::SingleContext, self.eptp.raw());
        #[cfg(test)]
        let _ = InveptKind::SingleContext;
    }

    /// Invalidate across all contexts (used by the unload path).
    pub fn flush_global(&self) {
        #[cfg(not(test))]
        ept::invept(InveptKind::Global, 0);
    }

    /// The PDE covering `pa`, with the physical slot it lives in.
    fn pde_slot(&self, platform: &dyn Platform, pa: PhysAddr) -> Result<(PhysAddr, EptEntry), EptError> {
        let gpa = pa.into_u64();
        let pml4e = self.read_entry(platform, self.pml4, ept::pml4_index(gpa));
        let pdpt = pml4e.addr().ok_or(EptError::OutOfRange)?;
        let pdpte = self.read_entry(platform, pdpt, ept::pdpt_index(gpa));
        let pd = pdpte.addr().ok_or(EptError::OutOfRange)?;
        let slot = pd + (ept::pd_index(gpa) * 8) as u64;
        let pde = self.read_entry(platform, pd, ept::pd_index(gpa));
        Ok((slot, pde))
    }

    /// Whether the 2 MiB region containing `pa` is still a single leaf.
    pub fn is_large_page(&self, platform: &dyn Platform, pa: PhysAddr) -> Result<bool, EptError> {
        Ok(self.pde_slot(platform, pa)?.1.is_large())
    }

    /// Split the 2 MiB leaf covering `pa` into 512 PML1 entries drawn
    /// from the pre-allocated split pool. No-op when already split.
    pub fn split_large_page(
        &mut self,
        platform: &dyn Platform,
        pools: &PoolManager,
        pa: PhysAddr,
    ) -> Result<(), EptError> {
        let (slot, pde) = self.pde_slot(platform, pa)?;
        if !pde.is_large() {
            return Ok(());
        }
        let buffer = pools
            .request(PoolKind::EptPageTable)
            .ok_or(EptError::SplitPoolEmpty)?;

        let base = pde.addr().ok_or(EptError::NoPml1Entry)?;
        let flags = pde.flags() & EptFlags::FULL;
        let memory_type = pde.memory_type();
        for i in 0..512usize {
            unsafe {
                *Self::entry_ptr(platform, buffer.phys, i) = EptEntry::leaf(
                    base + (i * PAGE_SIZE) as u64,
                    flags,
                    memory_type,
                    false,
                );
            }
        }

        // Publish the table with one aligned store, then invalidate.
        unsafe {
            core::ptr::write_volatile(
                platform.phys_to_virt(slot).as_ptr::<EptEntry>(),
                EptEntry::table(buffer.phys),
            );
        }
        self.split_tables.push(buffer.phys);
        self.flush();
        Ok(())
    }

    /// The physical slot of the PML1 entry mapping `pa`.
    ///
    /// Fails with [`EptError::NoPml1Entry`] while the region is still a
    /// 2 MiB leaf; callers split first.
    pub fn pml1_slot(&self, platform: &dyn Platform, pa: PhysAddr) -> Result<PhysAddr, EptError> {
        let (_, pde) = self.pde_slot(platform, pa)?;
        if pde.is_large() {
            return Err(EptError::NoPml1Entry);
        }
        let pt = pde.addr().ok_or(EptError::NoPml1Entry)?;
        Ok(pt + (ept::pt_index(pa.into_u64()) * 8) as u64)
    }

    /// Read the PML1 entry at `slot`.
    pub fn read_pml1(&self, platform: &dyn Platform, slot: PhysAddr) -> EptEntry {
        unsafe { core::ptr::read_volatile(platform.phys_to_virt(slot).as_ptr::<EptEntry>()) }
    }

    /// The canonical state-change primitive: write a PML1 entry, then
    /// invalidate this EPTP's translations.
    pub fn set_pml1_and_invalidate(&self, platform: &dyn Platform, slot: PhysAddr, entry: EptEntry) {
        unsafe {
            core::ptr::write_volatile(platform.phys_to_virt(slot).as_ptr::<EptEntry>(), entry);
        }
        self.flush();
    }

    /// Restore every hooked page to its original entry (the emergency
    /// path run before VMXOFF; records stay in place for the orderly
    /// unhook that follows at passive level).
    pub fn restore_all_hooks(&self, platform: &dyn Platform) {
        for (_, record) in self.hooks.iter() {
            self.set_pml1_and_invalidate(platform, record.pml1_slot, record.original_entry);
        }
    }

    /// Find the hook record owning a physical frame.
    pub fn find_hook_by_pfn(&self, pfn: u64) -> Option<HookId> {
        self.hooks.find_by_pfn(pfn)
    }

    /// Return the split-pool pages and the static tables. Passive level
    /// only; the hierarchy must no longer be active on any core.
    pub fn teardown(mut self, platform: &dyn Platform, pools: &PoolManager) {
        for pa in self.split_tables.drain(..) {
            pools.recycle(crate::pools::PoolBuffer {
                kind: PoolKind::EptPageTable,
                phys: pa,
                virt: platform.phys_to_virt(pa),
            });
        }
        for pa in self.table_pages.drain(..) {
            platform.free_pages(pa, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;
    use vtx::mtrr::MtrrRange;

    fn small_map() -> MemoryTypeMap {
        MemoryTypeMap::from_ranges(Vec::new(), EptMemoryType::WriteBack)
    }

    #[test]
    fn identity_map_covers_memory_with_2m_leaves() {
        let platform = MockPlatform::new(1, 2048);
        let state = EptState::build(&platform, &small_map()).unwrap();

        let pa = PhysAddr::new(0x10_0000).unwrap();
        assert!(state.is_large_page(&platform, pa).unwrap());
        let (_, pde) = state.pde_slot(&platform, pa).unwrap();
        assert_eq!(pde.addr().unwrap().into_u64(), 0);
        assert_eq!(pde.flags() & EptFlags::FULL, EptFlags::FULL);
        assert_eq!(pde.memory_type(), EptMemoryType::WriteBack);
    }

    #[test]
    fn mtrr_uncacheable_region_is_reflected() {
        let platform = MockPlatform::new(1, 2048);
        let map = MemoryTypeMap::from_ranges(
            vec![MtrrRange {
                base: PhysAddr::new(0x0000_0000).unwrap(),
                end: PhysAddr::new(0x0020_0000).unwrap(),
                memory_type: EptMemoryType::Uncacheable,
            }],
            EptMemoryType::WriteBack,
        );
        let state = EptState::build(&platform, &map).unwrap();
        let (_, pde) = state.pde_slot(&platform, PhysAddr::new(0).unwrap()).unwrap();
        assert_eq!(pde.memory_type(), EptMemoryType::Uncacheable);
        let (_, far) = state
            .pde_slot(&platform, PhysAddr::new(0x40_0000).unwrap())
            .unwrap();
        assert_eq!(far.memory_type(), EptMemoryType::WriteBack);
    }

    #[test]
    fn split_produces_512_inheriting_leaves() {
        let platform = MockPlatform::new(1, 4096);
        let pools = PoolManager::new();
        pools.prealloc(&platform, PoolKind::EptPageTable, 4);
        let mut state = EptState::build(&platform, &small_map()).unwrap();

        let target = PhysAddr::new(0x0030_0800).unwrap();
        assert_eq!(state.pml1_slot(&platform, target), Err(EptError::NoPml1Entry));

        state.split_large_page(&platform, &pools, target).unwrap();
        assert!(!state.is_large_page(&platform, target).unwrap());

        // All 512 leaves exist and inherit full permissions; the leaf for
        // the target maps its own frame.
        let slot = state.pml1_slot(&platform, target).unwrap();
        let leaf = state.read_pml1(&platform, slot);
        assert_eq!(leaf.addr().unwrap(), target.page_base());
        assert!(!leaf.is_large());
        assert_eq!(leaf.flags() & EptFlags::FULL, EptFlags::FULL);

        let (_, pde) = state.pde_slot(&platform, target).unwrap();
        let pt = pde.addr().unwrap();
        for i in 0..512usize {
            let e = state.read_entry(&platform, pt, i);
            assert_eq!(
                e.addr().unwrap().into_u64(),
                0x0020_0000 + (i * PAGE_SIZE) as u64
            );
            assert_eq!(e.flags() & EptFlags::FULL, EptFlags::FULL);
        }
    }

    #[test]
    fn split_is_idempotent_and_fails_without_pool() {
        let platform = MockPlatform::new(1, 4096);
        let pools = PoolManager::new();
        let mut state = EptState::build(&platform, &small_map()).unwrap();
        let target = PhysAddr::new(0x0050_0000).unwrap();

        // Empty pool: the split reports the specific error.
        assert_eq!(
            state.split_large_page(&platform, &pools, target),
            Err(EptError::SplitPoolEmpty)
        );

        pools.prealloc(&platform, PoolKind::EptPageTable, 1);
        state.split_large_page(&platform, &pools, target).unwrap();
        // Second call is a no-op and consumes nothing.
        state.split_large_page(&platform, &pools, target).unwrap();
        assert_eq!(pools.available(PoolKind::EptPageTable), 0);
    }

    #[test]
    fn pml1_swap_round_trips() {
        let platform = MockPlatform::new(1, 4096);
        let pools = PoolManager::new();
        pools.prealloc(&platform, PoolKind::EptPageTable, 1);
        let mut state = EptState::build(&platform, &small_map()).unwrap();
        let target = PhysAddr::new(0x0060_0000).unwrap();
        state.split_large_page(&platform, &pools, target).unwrap();

        let slot = state.pml1_slot(&platform, target).unwrap();
        let original = state.read_pml1(&platform, slot);
        let hook_view = original
            .with_permissions(EptFlags::EXECUTE_ONLY)
            .with_pfn(0x1234);
        state.set_pml1_and_invalidate(&platform, slot, hook_view);
        assert_eq!(state.read_pml1(&platform, slot), hook_view);
        state.set_pml1_and_invalidate(&platform, slot, original);
        assert_eq!(state.read_pml1(&platform, slot), original);
    }
}
