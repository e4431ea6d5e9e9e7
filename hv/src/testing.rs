//! Mock platform for hosted tests.
//!
//! Simulates physical memory as one contiguous arena so the EPT builder,
//! hook engine and pool manager run unmodified: `phys_to_virt` is a base
//! offset into the arena and `alloc_pages` is a bump allocator over it.

use crate::mapper::GuestMemory;
use crate::{MappingWindow, Platform};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use vtx::{PhysAddr, VirtAddr, PAGE_SIZE};

pub struct MockPlatform {
    arena: Box<UnsafeCell<[u8]>>,
    next_pfn: AtomicU64,
    freed_pages: AtomicUsize,
    allocated_pages: AtomicUsize,
    core_count: usize,
    current_core: AtomicUsize,
    pub nmis_sent: AtomicUsize,
}

unsafe impl Sync for MockPlatform {}
unsafe impl Send for MockPlatform {}

impl MockPlatform {
    /// A platform with `core_count` cores and `pages` pages of fake
    /// physical memory. Page frame 0 is kept unusable so a zero address
    /// keeps meaning "nothing".
    pub fn new(core_count: usize, pages: usize) -> Self {
        let arena: Box<[u8]> = alloc::vec![0u8; pages * PAGE_SIZE].into_boxed_slice();
        Self {
            // SAFETY: transmuting Box<[u8]> into Box<UnsafeCell<[u8]>> is
            // sound; UnsafeCell<T> has the same layout as T.
            arena: unsafe { core::mem::transmute(arena) },
            next_pfn: AtomicU64::new(1),
            freed_pages: AtomicUsize::new(0),
            allocated_pages: AtomicUsize::new(0),
            core_count,
            current_core: AtomicUsize::new(0),
            nmis_sent: AtomicUsize::new(0),
        }
    }

    fn arena_base(&self) -> *mut u8 {
        self.arena.get() as *mut u8
    }

    fn arena_len(&self) -> usize {
        unsafe { (&*self.arena.get()).len() }
    }

    /// Pages currently allocated and not freed.
    pub fn pages_in_use(&self) -> usize {
        self.allocated_pages.load(Ordering::Relaxed) - self.freed_pages.load(Ordering::Relaxed)
    }

    /// Pretend to be running on `core`.
    pub fn pin_to_core(&self, core: usize) {
        self.current_core.store(core, Ordering::Relaxed);
    }

    /// Raw view of a physical range, for assertions.
    pub fn phys_slice(&self, pa: PhysAddr, len: usize) -> &[u8] {
        let off = pa.into_u64() as usize;
        assert!(off + len <= self.arena_len());
        unsafe { core::slice::from_raw_parts(self.arena_base().add(off), len) }
    }

    /// Raw mutable view of a physical range, for test setup.
    #[allow(clippy::mut_from_ref)]
    pub fn phys_slice_mut(&self, pa: PhysAddr, len: usize) -> &mut [u8] {
        let off = pa.into_u64() as usize;
        assert!(off + len <= self.arena_len());
        unsafe { core::slice::from_raw_parts_mut(self.arena_base().add(off), len) }
    }
}

impl Platform for MockPlatform {
    fn core_count(&self) -> usize {
        self.core_count
    }

    fn current_core(&self) -> usize {
        self.current_core.load(Ordering::Relaxed)
    }

    fn alloc_pages(&self, count: usize) -> Option<PhysAddr> {
        let pfn = self.next_pfn.fetch_add(count as u64, Ordering::Relaxed);
        let end = (pfn + count as u64) as usize * PAGE_SIZE;
        if end > self.arena_len() {
            return None;
        }
        self.allocated_pages.fetch_add(count, Ordering::Relaxed);
        let pa = PhysAddr::from_pfn(pfn);
        self.phys_slice_mut(pa, count * PAGE_SIZE).fill(0);
        Some(pa)
    }

    fn free_pages(&self, _pa: PhysAddr, count: usize) {
        self.freed_pages.fetch_add(count, Ordering::Relaxed);
    }

    fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.arena_base() as u64 + pa.into_u64()).unwrap()
    }

    fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        let base = self.arena_base() as u64;
        let v = va.into_u64();
        if v >= base && v < base + self.arena_len() as u64 {
            PhysAddr::new(v - base)
        } else {
            None
        }
    }

    fn reserve_windows(&self, pages: usize) -> Option<Vec<MappingWindow>> {
        // Hosted tests exercise the mapper through `GuestMemory` mocks;
        // hand out arena pages so addresses stay valid.
        let pa = self.alloc_pages(pages + 1)?;
        (0..pages)
            .map(|i| {
                Some(MappingWindow {
                    va: self.phys_to_virt(pa + (i * PAGE_SIZE) as u64),
                    pte_va: self.phys_to_virt(pa + (pages * PAGE_SIZE) as u64) + (i * 8) as u64,
                })
            })
            .collect()
    }

    fn run_on_each_core(&self, f: &(dyn Fn(usize) + Sync)) {
        let saved = self.current_core();
        for core in 0..self.core_count {
            self.pin_to_core(core);
            f(core);
        }
        self.pin_to_core(saved);
    }

    fn run_on_core(&self, core: usize, f: &(dyn Fn() + Sync)) -> bool {
        if core >= self.core_count {
            return false;
        }
        let saved = self.current_core();
        self.pin_to_core(core);
        f();
        self.pin_to_core(saved);
        true
    }

    fn send_nmi_to_peers(&self) {
        self.nmis_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn kernel_cr3_of(&self, process_id: u32) -> Option<u64> {
        if process_id == 0 {
            None
        } else {
            Some(0x1000)
        }
    }

    fn current_process_id(&self) -> u32 {
        4
    }

    fn current_thread_id(&self) -> u32 {
        8
    }

    fn highest_pfn(&self) -> u64 {
        (self.arena_len() / PAGE_SIZE) as u64
    }
}

/// Guest-memory access that reads the mock arena directly, with identity
/// virtual-to-physical translation.
pub struct IdentityGuestMemory<'a> {
    pub platform: &'a MockPlatform,
}

impl GuestMemory for IdentityGuestMemory<'_> {
    fn read_phys(&self, pa: PhysAddr, out: &mut [u8]) -> bool {
        let off = pa.into_u64() as usize;
        if off + out.len() > self.platform.arena_len() {
            return false;
        }
        out.copy_from_slice(self.platform.phys_slice(pa, out.len()));
        true
    }

    fn write_phys(&self, pa: PhysAddr, data: &[u8]) -> bool {
        let off = pa.into_u64() as usize;
        if off + data.len() > self.platform.arena_len() {
            return false;
        }
        self.platform.phys_slice_mut(pa, data.len()).copy_from_slice(data);
        true
    }

    fn read_virt(&self, va: VirtAddr, _cr3: u64, out: &mut [u8]) -> bool {
        self.read_phys(PhysAddr::new(va.into_u64()).unwrap(), out)
    }

    fn write_virt(&self, va: VirtAddr, _cr3: u64, data: &[u8]) -> bool {
        self.write_phys(PhysAddr::new(va.into_u64()).unwrap(), data)
    }

    fn virt_to_phys_in(&self, va: VirtAddr, _cr3: u64) -> Option<PhysAddr> {
        PhysAddr::new(va.into_u64())
    }

    fn phys_to_virt_guess(&self, pa: PhysAddr) -> Option<VirtAddr> {
        VirtAddr::new(pa.into_u64())
    }
}
