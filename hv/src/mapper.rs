//! Safe physical/virtual memory access from any execution context.
//!
//! Each core owns a few reserved kernel virtual pages with no physical
//! backing. To touch an arbitrary frame the mapper copies that page's PTE,
//! points it at the target frame, `invlpg`s, performs the copy through the
//! reserved address, and zeroes the PTE again so no mapping lingers. The
//! sequence takes no page faults, allocates nothing and never sleeps, so
//! it is usable from VMX root at any IRQL.

use crate::{MappingWindow, Platform};
use alloc::vec::Vec;
use crossbeam_utils::CachePadded;
use vtx::paging::{self, PageEntry};
use vtx::regs::invlpg;
use vtx::{PhysAddr, VirtAddr, PAGE_SIZE};

/// Uniform guest-memory access used by the hook engine, the transparency
/// filter and the debugger. The production implementation is
/// [`MemoryMapper`]; tests substitute an arena-backed mock.
pub trait GuestMemory: Sync {
    /// Read physical memory. Returns false and reads nothing on failure.
    fn read_phys(&self, pa: PhysAddr, out: &mut [u8]) -> bool;

    /// Write physical memory. Returns false and writes nothing on failure.
    fn write_phys(&self, pa: PhysAddr, data: &[u8]) -> bool;

    /// Read virtual memory of the address space rooted at `cr3`.
    fn read_virt(&self, va: VirtAddr, cr3: u64, out: &mut [u8]) -> bool;

    /// Write virtual memory of the address space rooted at `cr3`.
    fn write_virt(&self, va: VirtAddr, cr3: u64, data: &[u8]) -> bool;

    /// Translate a virtual address through `cr3` without faulting.
    fn virt_to_phys_in(&self, va: VirtAddr, cr3: u64) -> Option<PhysAddr>;

    /// Best-effort reverse translation for display purposes.
    fn phys_to_virt_guess(&self, pa: PhysAddr) -> Option<VirtAddr>;
}

/// Per-core reserved windows.
struct CoreWindows {
    read: MappingWindow,
    write: MappingWindow,
    /// Two consecutive pages for accesses that straddle a boundary
    /// (MMIO-style accesses must be a single copy).
    mmio: [MappingWindow; 2],
}

/// The memory mapper.
pub struct MemoryMapper<'a> {
    platform: &'a dyn Platform,
    per_core: Vec<CachePadded<CoreWindows>>,
    kernel_cr3: u64,
}

#[inline]
fn current_cr3() -> u64 {
    #[cfg(not(test))]
    {
        vtx::regs::read_cr3()
    }
    #[cfg(test)]
    {
        0
    }
}

/// Split `(addr, len)` into spans that do not cross 4 KiB boundaries.
///
/// Sizes always sum exactly to `len`.
pub fn page_spans(addr: u64, len: usize) -> impl Iterator<Item = (u64, usize)> {
    let mut at = addr;
    let mut remaining = len;
    core::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let in_page = PAGE_SIZE - (at as usize & (PAGE_SIZE - 1));
        let take = in_page.min(remaining);
        let span = (at, take);
        at += take as u64;
        remaining -= take;
        Some(span)
    })
}

impl<'a> MemoryMapper<'a> {
    /// Reserve windows for every core. Passive level only.
    pub fn init(platform: &'a dyn Platform) -> Option<Self> {
        let mut per_core = Vec::with_capacity(platform.core_count());
        for _ in 0..platform.core_count() {
            let mut windows = platform.reserve_windows(4)?;
            let mmio1 = windows.pop()?;
            let mmio0 = windows.pop()?;
            let write = windows.pop()?;
            let read = windows.pop()?;
            per_core.push(CachePadded::new(CoreWindows {
                read,
                write,
                mmio: [mmio0, mmio1],
            }));
        }
        Some(Self {
            platform,
            per_core,
            kernel_cr3: current_cr3(),
        })
    }

    /// The CR3 captured at initialization (the system address space).
    pub fn kernel_cr3(&self) -> u64 {
        self.kernel_cr3
    }

    /// Copy one span through a window. The span must not cross a page
    /// boundary.
    ///
    /// # Safety
    /// `buf` must be valid for `len` bytes in the current address space,
    /// and the window must belong to the calling core.
    unsafe fn copy_span(window: &MappingWindow, pa: PhysAddr, buf: *mut u8, len: usize, is_write: bool) {
        debug_assert!(pa.page_offset() + len <= PAGE_SIZE);
        let pte = window.pte_va.as_ptr::<PageEntry>();
        let original = core::ptr::read_volatile(pte);
        let stamped = original.stamped_for_window(pa.pfn());
        core::ptr::write_volatile(pte, stamped);
        invlpg(window.va.into_u64());

        let mapped = window.va.as_ptr::<u8>().add(pa.page_offset());
        if is_write {
            core::ptr::copy_nonoverlapping(buf as *const u8, mapped, len);
        } else {
            core::ptr::copy_nonoverlapping(mapped as *const u8, buf, len);
        }

        // Leave no lingering mapping behind.
        core::ptr::write_volatile(pte, PageEntry::ZERO);
        invlpg(window.va.into_u64());
    }

    fn windows(&self) -> &CoreWindows {
        &self.per_core[self.platform.current_core()]
    }

    fn access_phys(&self, pa: PhysAddr, buf: *mut u8, len: usize, is_write: bool) -> bool {
        if pa.into_u64() == 0 {
            return false;
        }
        let windows = self.windows();
        let window = if is_write { &windows.write } else { &windows.read };
        let mut offset = 0usize;
        for (span_pa, span_len) in page_spans(pa.into_u64(), len) {
            let span_pa = match PhysAddr::new(span_pa) {
                Some(p) => p,
                None => return false,
            };
            unsafe {
                Self::copy_span(window, span_pa, buf.add(offset), span_len, is_write);
            }
            offset += span_len;
        }
        true
    }

    /// Read an 8-byte page-table entry by physical address.
    fn read_table_entry(&self, pa: PhysAddr) -> Option<PageEntry> {
        let mut raw = [0u8; 8];
        if self.read_phys(pa, &mut raw) {
            Some(PageEntry::from_raw(u64::from_le_bytes(raw)))
        } else {
            None
        }
    }

    /// Perform a single access through the two consecutive MMIO windows,
    /// which tolerates a physically contiguous access crossing one page
    /// boundary without splitting it into two copies.
    ///
    /// # Safety
    /// Same contract as [`GuestMemory::read_phys`], plus the access must
    /// fit in two pages.
    pub unsafe fn mmio_access(&self, pa: PhysAddr, buf: *mut u8, len: usize, is_write: bool) -> bool {
        if len > PAGE_SIZE * 2 - pa.page_offset() {
            return false;
        }
        let windows = self.windows();
        let first = pa.page_base();
        for (i, window) in windows.mmio.iter().enumerate() {
            let pte = window.pte_va.as_ptr::<PageEntry>();
            let original = core::ptr::read_volatile(pte);
            let stamped = original.stamped_for_window((first + (i * PAGE_SIZE) as u64).pfn());
            core::ptr::write_volatile(pte, stamped);
            invlpg(window.va.into_u64());
        }
        let mapped = windows.mmio[0].va.as_ptr::<u8>().add(pa.page_offset());
        if is_write {
            core::ptr::copy_nonoverlapping(buf as *const u8, mapped, len);
        } else {
            core::ptr::copy_nonoverlapping(mapped as *const u8, buf, len);
        }
        for window in windows.mmio.iter() {
            core::ptr::write_volatile(window.pte_va.as_ptr::<PageEntry>(), PageEntry::ZERO);
            invlpg(window.va.into_u64());
        }
        true
    }
}

impl GuestMemory for MemoryMapper<'_> {
    fn read_phys(&self, pa: PhysAddr, out: &mut [u8]) -> bool {
        self.access_phys(pa, out.as_mut_ptr(), out.len(), false)
    }

    fn write_phys(&self, pa: PhysAddr, data: &[u8]) -> bool {
        self.access_phys(pa, data.as_ptr() as *mut u8, data.len(), true)
    }

    fn read_virt(&self, va: VirtAddr, cr3: u64, out: &mut [u8]) -> bool {
        let mut offset = 0usize;
        for (span_va, span_len) in page_spans(va.into_u64(), out.len()) {
            let Some(span_va) = VirtAddr::new(span_va) else {
                return false;
            };
            let Some(pa) = self.virt_to_phys_in(span_va, cr3) else {
                return false;
            };
            if !self.access_phys(pa, unsafe { out.as_mut_ptr().add(offset) }, span_len, false) {
                return false;
            }
            offset += span_len;
        }
        true
    }

    fn write_virt(&self, va: VirtAddr, cr3: u64, data: &[u8]) -> bool {
        // Translate every span before touching anything so a failed
        // translation performs no partial write.
        let mut spans = Vec::new();
        for (span_va, span_len) in page_spans(va.into_u64(), data.len()) {
            let Some(span_va) = VirtAddr::new(span_va) else {
                return false;
            };
            let Some(pa) = self.virt_to_phys_in(span_va, cr3) else {
                return false;
            };
            spans.push((pa, span_len));
        }
        let mut offset = 0usize;
        for (pa, span_len) in spans {
            if !self.access_phys(pa, unsafe { data.as_ptr().add(offset) as *mut u8 }, span_len, true) {
                return false;
            }
            offset += span_len;
        }
        true
    }

    fn virt_to_phys_in(&self, va: VirtAddr, cr3: u64) -> Option<PhysAddr> {
        paging::walk(cr3, va, &mut |pa| self.read_table_entry(pa)).map(|t| t.phys)
    }

    fn phys_to_virt_guess(&self, _pa: PhysAddr) -> Option<VirtAddr> {
        None
    }
}
