//! Extended page-table structures.
//!
//! All four levels share the same bit layout for the permission bits, so
//! one transparent entry type per level keeps the table-walk code honest
//! about which level it is touching while the flag types stay small.

use crate::addr::PhysAddr;
use core::arch::asm;

bitflags::bitflags! {
    /// Permission and attribute bits common to EPT entries
    /// (SDM Vol. 3C, Tables 28-1 through 28-6).
    #[repr(transparent)]
    pub struct EptFlags: u64 {
        /// Reads are allowed from the region controlled by this entry.
        const READ = 1 << 0;
        /// Writes are allowed to the region controlled by this entry.
        const WRITE = 1 << 1;
        /// Instruction fetches are allowed from the region.
        const EXECUTE = 1 << 2;
        /// For PDEs/PDPTEs: this entry maps a large page rather than
        /// referencing a lower-level table.
        const LARGE_PAGE = 1 << 7;
        /// Accessed flag, when EPTP bit 6 is set.
        const ACCESSED = 1 << 8;
        /// Dirty flag (leaf entries only), when EPTP bit 6 is set.
        const DIRTY = 1 << 9;
        /// User-mode execute access, when mode-based execute control is on.
        const USER_EXECUTE = 1 << 10;

        /// All three access permissions.
        const FULL = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
        /// The monitor view of an execution hook: execute-only.
        const EXECUTE_ONLY = Self::EXECUTE.bits;
    }
}

/// EPT memory types (leaf entry bits 5:3; SDM Vol. 3C, 28.3.7).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u64)]
pub enum EptMemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl EptMemoryType {
    /// Decode bits 5:3 of a leaf entry, defaulting unknown encodings to UC.
    pub fn from_raw(v: u64) -> Self {
        match v {
            0 => Self::Uncacheable,
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            _ => Self::Uncacheable,
        }
    }
}

const MEMORY_TYPE_SHIFT: u64 = 3;
const MEMORY_TYPE_MASK: u64 = 0b111 << MEMORY_TYPE_SHIFT;
const PFN_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One EPT entry at any level.
///
/// The wrapper stays `repr(transparent)` so tables are plain `[EptEntry; 512]`
/// pages and an entry can be published with a single aligned store.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    /// The all-zero (not-present) entry.
    pub const ZERO: Self = Self(0);

    /// Rebuild an entry from its raw value.
    #[inline]
    pub const fn from_raw(v: u64) -> Self {
        Self(v)
    }

    /// The raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Build a non-leaf entry referencing a lower-level table.
    pub fn table(pa: PhysAddr) -> Self {
        Self((pa.into_u64() & PFN_MASK) | EptFlags::FULL.bits())
    }

    /// Build a leaf entry mapping a page at `pa`.
    pub fn leaf(pa: PhysAddr, flags: EptFlags, mem_type: EptMemoryType, large: bool) -> Self {
        let mut v = (pa.into_u64() & PFN_MASK) | flags.bits() | ((mem_type as u64) << MEMORY_TYPE_SHIFT);
        if large {
            v |= EptFlags::LARGE_PAGE.bits();
        }
        Self(v)
    }

    /// The physical address this entry references, `None` when no
    /// permission bit is set (EPT has no separate present bit; an entry
    /// with all access bits clear is not-present).
    #[inline]
    pub fn addr(self) -> Option<PhysAddr> {
        if self.flags().intersects(EptFlags::FULL) {
            PhysAddr::new(self.0 & PFN_MASK)
        } else {
            None
        }
    }

    /// The permission/attribute flags of this entry.
    #[inline]
    pub fn flags(self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }

    /// The memory type encoded in a leaf entry.
    #[inline]
    pub fn memory_type(self) -> EptMemoryType {
        EptMemoryType::from_raw((self.0 & MEMORY_TYPE_MASK) >> MEMORY_TYPE_SHIFT)
    }

    /// Whether this entry maps a large page.
    #[inline]
    pub fn is_large(self) -> bool {
        self.flags().contains(EptFlags::LARGE_PAGE)
    }

    /// This entry with its permission bits replaced.
    #[inline]
    pub fn with_permissions(self, perm: EptFlags) -> Self {
        Self((self.0 & !EptFlags::FULL.bits()) | (perm & EptFlags::FULL).bits())
    }

    /// This entry with its page-frame number replaced.
    #[inline]
    pub fn with_pfn(self, pfn: u64) -> Self {
        Self((self.0 & !PFN_MASK) | ((pfn << 12) & PFN_MASK))
    }
}

impl core::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EptEntry(0x{:x}, {:?})", self.0, self.flags())
    }
}

/// The extended-page-table pointer (VMCS `EPTP` field layout;
/// SDM Vol. 3C, Table 24-8).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Eptp(u64);

impl Eptp {
    /// Build an EPTP for the given PML4 table: write-back, 4-level walk,
    /// accessed/dirty flags enabled.
    pub fn new(pml4: PhysAddr) -> Self {
        const WALK_LENGTH_4: u64 = 3 << 3;
        const ENABLE_ACCESS_DIRTY: u64 = 1 << 6;
        Self((pml4.into_u64() & PFN_MASK) | EptMemoryType::WriteBack as u64 | WALK_LENGTH_4 | ENABLE_ACCESS_DIRTY)
    }

    /// The raw VMCS field value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The PML4 base this EPTP points at.
    #[inline]
    pub fn pml4(self) -> PhysAddr {
        PhysAddr::new(self.0 & PFN_MASK).unwrap()
    }
}

/// Index of the PML4 entry translating `gpa`.
#[inline]
pub const fn pml4_index(gpa: u64) -> usize {
    ((gpa >> 39) & 0x1ff) as usize
}

/// Index of the PDPT entry translating `gpa`.
#[inline]
pub const fn pdpt_index(gpa: u64) -> usize {
    ((gpa >> 30) & 0x1ff) as usize
}

/// Index of the PD entry translating `gpa`.
#[inline]
pub const fn pd_index(gpa: u64) -> usize {
    ((gpa >> 21) & 0x1ff) as usize
}

/// Index of the PT entry translating `gpa`.
#[inline]
pub const fn pt_index(gpa: u64) -> usize {
    ((gpa >> 12) & 0x1ff) as usize
}

/// Descriptor operand of INVEPT (SDM Vol. 3C, 30.3).
#[repr(C, align(16))]
struct InveptDescriptor {
    eptp: u64,
    _reserved: u64,
}

/// INVEPT type selector.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u64)]
pub enum InveptKind {
    /// Invalidate mappings associated with a single EPTP.
    SingleContext = 1,
    /// Invalidate mappings associated with all EPTPs.
    Global = 2,
}

/// Invalidate EPT-derived translations.
///
/// `eptp` is ignored for [`InveptKind::Global`].
#[inline]
pub fn invept(kind: InveptKind, eptp: u64) {
    let descriptor = InveptDescriptor { eptp, _reserved: 0 };
    unsafe {
        asm!(
            "invept {}, [{}]",
            in(reg) kind as u64,
            in(reg) &descriptor,
            options(nostack)
        );
    }
}

/// Descriptor operand of INVVPID (SDM Vol. 3C, 30.3).
#[repr(C, align(16))]
struct InvvpidDescriptor {
    vpid: u16,
    _reserved: [u16; 3],
    linear_address: u64,
}

/// INVVPID type selector.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u64)]
pub enum InvvpidKind {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainingGlobals = 3,
}

/// Invalidate VPID-tagged linear translations.
#[inline]
pub fn invvpid(kind: InvvpidKind, vpid: u16, linear_address: u64) {
    let descriptor = InvvpidDescriptor {
        vpid,
        _reserved: [0; 3],
        linear_address,
    };
    unsafe {
        asm!(
            "invvpid {}, [{}]",
            in(reg) kind as u64,
            in(reg) &descriptor,
            options(nostack)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_entry_round_trips_address_and_permissions() {
        let pa = PhysAddr::new(0x20_0000).unwrap();
        let e = EptEntry::leaf(pa, EptFlags::FULL, EptMemoryType::WriteBack, true);
        assert_eq!(e.addr(), Some(pa));
        assert!(e.is_large());
        assert_eq!(e.memory_type(), EptMemoryType::WriteBack);

        let hooked = e.with_permissions(EptFlags::EXECUTE_ONLY).with_pfn(0x999);
        assert_eq!(hooked.flags() & EptFlags::FULL, EptFlags::EXECUTE);
        assert_eq!(hooked.addr().unwrap().pfn(), 0x999);
        // Restoring the saved original puts the bits back exactly.
        assert_eq!(EptEntry::from_raw(e.raw()), e);
    }

    #[test]
    fn entry_without_permissions_is_not_present() {
        let e = EptEntry::ZERO;
        assert!(e.addr().is_none());
        let leaf = EptEntry::leaf(
            PhysAddr::new(0x1000).unwrap(),
            EptFlags::empty(),
            EptMemoryType::Uncacheable,
            false,
        );
        assert!(leaf.addr().is_none());
    }

    #[test]
    fn gpa_indices_split_the_address() {
        let gpa = 0x0000_7fed_cba9_8765u64;
        assert_eq!(pml4_index(gpa), ((gpa >> 39) & 0x1ff) as usize);
        let reassembled = ((pml4_index(gpa) as u64) << 39)
            | ((pdpt_index(gpa) as u64) << 30)
            | ((pd_index(gpa) as u64) << 21)
            | ((pt_index(gpa) as u64) << 12)
            | (gpa & 0xfff);
        assert_eq!(reassembled, gpa);
    }

    #[test]
    fn eptp_encodes_walk_and_memory_type() {
        let eptp = Eptp::new(PhysAddr::new(0xabc000).unwrap());
        assert_eq!(eptp.raw() & 0x7, EptMemoryType::WriteBack as u64);
        assert_eq!((eptp.raw() >> 3) & 0x7, 3);
        assert_eq!(eptp.pml4().into_u64(), 0xabc000);
    }
}
