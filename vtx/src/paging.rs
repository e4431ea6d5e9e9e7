//! Host (IA-32e) page-table entry format.
//!
//! The safe memory mapper works by stamping the page-frame number of a
//! reserved PTE and issuing `invlpg`; this module provides the entry type
//! it stamps.

use crate::addr::{PhysAddr, VirtAddr};

bitflags::bitflags! {
    /// IA-32e paging-structure entry bits (SDM Vol. 3A, Table 4-19).
    #[repr(transparent)]
    pub struct PteFlags: u64 {
        /// Present.
        const PRESENT = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// User-accessible.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Accessed.
        const ACCESSED = 1 << 5;
        /// Dirty.
        const DIRTY = 1 << 6;
        /// For PDEs/PDPTEs: maps a large page. For PTEs: PAT bit.
        const LARGE_PAGE = 1 << 7;
        /// Global; survives CR3 reloads while CR4.PGE is set.
        const GLOBAL = 1 << 8;
        /// Execute-disable (requires IA32_EFER.NXE).
        const NO_EXECUTE = 1 << 63;
    }
}

const PFN_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One host page-table entry at any level.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// The zero entry.
    pub const ZERO: Self = Self(0);

    /// Rebuild from a raw value.
    #[inline]
    pub const fn from_raw(v: u64) -> Self {
        Self(v)
    }

    /// The raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The flag bits.
    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry is present.
    #[inline]
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Whether the entry maps a large page.
    #[inline]
    pub fn is_large(self) -> bool {
        self.flags().contains(PteFlags::LARGE_PAGE)
    }

    /// The physical address this entry references.
    #[inline]
    pub fn addr(self) -> Option<PhysAddr> {
        if self.is_present() {
            PhysAddr::new(self.0 & PFN_MASK)
        } else {
            None
        }
    }

    /// This entry retargeted at `pfn` and made present, writable and
    /// global: the mapper's stamp for a transient window mapping.
    #[inline]
    pub fn stamped_for_window(self, pfn: u64) -> Self {
        let flags = self.flags() | PteFlags::PRESENT | PteFlags::WRITE | PteFlags::GLOBAL;
        Self((flags.bits() & !PFN_MASK) | ((pfn << 12) & PFN_MASK))
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageEntry(0x{:x}, {:?})", self.0, self.flags())
    }
}

/// Index of the PML4 entry translating `va`.
#[inline]
pub const fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}

/// Index of the PDPT entry translating `va`.
#[inline]
pub const fn pdpt_index(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}

/// Index of the PD entry translating `va`.
#[inline]
pub const fn pd_index(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}

/// Index of the PT entry translating `va`.
#[inline]
pub const fn pt_index(va: u64) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

/// Walk result of a software page-table walk.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    /// The physical address `va` translates to.
    pub phys: PhysAddr,
    /// Level of the mapping leaf (1 = 4 KiB PTE, 2 = 2 MiB PDE, 3 = 1 GiB PDPTE).
    pub level: u8,
    /// The leaf entry itself.
    pub entry: PageEntry,
}

/// Walk the paging hierarchy rooted at `cr3` in software.
///
/// `read_entry` resolves one physical table slot to its entry value; the
/// caller provides it because reading arbitrary physical memory is the
/// memory mapper's job, and during tests it is a plain array lookup.
pub fn walk(
    cr3: u64,
    va: VirtAddr,
    read_entry: &mut dyn FnMut(PhysAddr) -> Option<PageEntry>,
) -> Option<Translation> {
    let v = va.into_u64();
    let pml4_base = PhysAddr::new(cr3 & PFN_MASK)?;
    let pml4e = read_entry(pml4_base + (pml4_index(v) * 8) as u64)?;
    let pdpt_base = pml4e.addr()?;

    let pdpte = read_entry(pdpt_base + (pdpt_index(v) * 8) as u64)?;
    let pd_base = pdpte.addr()?;
    if pdpte.is_large() {
        return Some(Translation {
            phys: PhysAddr::new((pd_base.into_u64() & !0x3fff_ffff) | (v & 0x3fff_ffff))?,
            level: 3,
            entry: pdpte,
        });
    }

    let pde = read_entry(pd_base + (pd_index(v) * 8) as u64)?;
    let pt_base = pde.addr()?;
    if pde.is_large() {
        return Some(Translation {
            phys: PhysAddr::new((pt_base.into_u64() & !0x1f_ffff) | (v & 0x1f_ffff))?,
            level: 2,
            entry: pde,
        });
    }

    let pte = read_entry(pt_base + (pt_index(v) * 8) as u64)?;
    let page = pte.addr()?;
    Some(Translation {
        phys: page + va.page_offset() as u64,
        level: 1,
        entry: pte,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry_reader(map: BTreeMap<u64, u64>) -> impl FnMut(PhysAddr) -> Option<PageEntry> {
        move |pa| map.get(&pa.into_u64()).map(|v| PageEntry::from_raw(*v))
    }

    #[test]
    fn stamp_preserves_attributes_and_sets_pfn() {
        let base = PageEntry::from_raw(PteFlags::NO_EXECUTE.bits());
        let stamped = base.stamped_for_window(0x1234);
        assert!(stamped.is_present());
        assert!(stamped.flags().contains(PteFlags::WRITE | PteFlags::GLOBAL));
        assert!(stamped.flags().contains(PteFlags::NO_EXECUTE));
        assert_eq!(stamped.addr().unwrap().pfn(), 0x1234);
    }

    #[test]
    fn walk_resolves_a_4k_mapping() {
        let cr3 = 0x1000u64;
        let va = VirtAddr::new(0x40201234).unwrap();
        let mut tables = BTreeMap::new();
        let present = PteFlags::PRESENT.bits();
        tables.insert(0x1000 + pml4_index(0x40201234) as u64 * 8, 0x2000 | present);
        tables.insert(0x2000 + pdpt_index(0x40201234) as u64 * 8, 0x3000 | present);
        tables.insert(0x3000 + pd_index(0x40201234) as u64 * 8, 0x4000 | present);
        tables.insert(0x4000 + pt_index(0x40201234) as u64 * 8, 0x7000 | present);

        let t = walk(cr3, va, &mut entry_reader(tables)).unwrap();
        assert_eq!(t.level, 1);
        assert_eq!(t.phys.into_u64(), 0x7234);
    }

    #[test]
    fn walk_resolves_a_2m_mapping() {
        let va = VirtAddr::new(0x40255678).unwrap();
        let v = va.into_u64();
        let mut tables = BTreeMap::new();
        let present = PteFlags::PRESENT.bits();
        let large = (PteFlags::PRESENT | PteFlags::LARGE_PAGE).bits();
        tables.insert(0x1000 + pml4_index(v) as u64 * 8, 0x2000 | present);
        tables.insert(0x2000 + pdpt_index(v) as u64 * 8, 0x3000 | present);
        tables.insert(0x3000 + pd_index(v) as u64 * 8, 0x60_0000 | large);

        let t = walk(0x1000, va, &mut entry_reader(tables)).unwrap();
        assert_eq!(t.level, 2);
        assert_eq!(t.phys.into_u64(), 0x60_0000 | (v & 0x1f_ffff));
    }

    #[test]
    fn walk_fails_on_non_present() {
        let va = VirtAddr::new(0x1000).unwrap();
        let t = walk(0x1000, va, &mut entry_reader(BTreeMap::new()));
        assert!(t.is_none());
    }
}
