//! Pre-allocated, typed page pools.
//!
//! VMX-root code must not allocate, so every page it might need on the
//! hot path is requested up front by the user-mode `prealloc` command and
//! parked in a fixed-capacity lock-free queue. Frees initiated from VMX
//! root are deferred onto another queue and performed at passive level.

use crate::Platform;
use crossbeam_queue::ArrayQueue;
use vtx::{PhysAddr, VirtAddr};

/// What a pooled buffer will be used for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PoolKind {
    /// A 512-entry PML1 table for splitting a 2 MiB EPT page.
    EptPageTable,
    /// The shadow copy of a hooked guest page.
    ShadowPage,
    /// An executable trampoline for an inline detour.
    ExecTrampoline,
    /// A result buffer for script/custom-code actions.
    ActionResultBuffer,
}

impl PoolKind {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            Self::EptPageTable => 0,
            Self::ShadowPage => 1,
            Self::ExecTrampoline => 2,
            Self::ActionResultBuffer => 3,
        }
    }

    /// Pages per buffer of this kind.
    pub fn pages(self) -> usize {
        1
    }
}

/// One pre-allocated buffer.
#[derive(Debug, Clone, Copy)]
pub struct PoolBuffer {
    pub kind: PoolKind,
    pub phys: PhysAddr,
    pub virt: VirtAddr,
}

/// Hard cap on parked buffers per kind; `prealloc` beyond this fails.
pub const POOL_CAPACITY: usize = 1024;

/// The pool manager.
pub struct PoolManager {
    pools: [ArrayQueue<PoolBuffer>; PoolKind::COUNT],
    deferred_free: ArrayQueue<PoolBuffer>,
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager {
    /// An empty manager; nothing is usable before `prealloc`.
    pub fn new() -> Self {
        Self {
            pools: [
                ArrayQueue::new(POOL_CAPACITY),
                ArrayQueue::new(POOL_CAPACITY),
                ArrayQueue::new(POOL_CAPACITY),
                ArrayQueue::new(POOL_CAPACITY),
            ],
            deferred_free: ArrayQueue::new(POOL_CAPACITY),
        }
    }

    /// Fill `kind` with `count` fresh buffers. Passive level only.
    ///
    /// Returns the number actually added, which is smaller than `count`
    /// when the platform runs out of pages or the pool hits capacity.
    pub fn prealloc(&self, platform: &dyn Platform, kind: PoolKind, count: usize) -> usize {
        let mut added = 0;
        for _ in 0..count {
            let Some(phys) = platform.alloc_pages(kind.pages()) else {
                break;
            };
            let buffer = PoolBuffer {
                kind,
                phys,
                virt: platform.phys_to_virt(phys),
            };
            if self.pools[kind.index()].push(buffer).is_err() {
                platform.free_pages(phys, kind.pages());
                break;
            }
            added += 1;
        }
        added
    }

    /// Take a buffer. Callable from any context including VMX root.
    pub fn request(&self, kind: PoolKind) -> Option<PoolBuffer> {
        self.pools[kind.index()].pop()
    }

    /// Return a buffer to its pool without freeing it.
    pub fn recycle(&self, buffer: PoolBuffer) {
        // On overflow fall through to a deferred free.
        if self.pools[buffer.kind.index()].push(buffer).is_err() {
            let _ = self.deferred_free.push(buffer);
        }
    }

    /// Queue a buffer for freeing at passive level. Callable from VMX root.
    ///
    /// Returns false when the deferred queue is full; the caller should
    /// recycle instead of leaking.
    pub fn defer_free(&self, buffer: PoolBuffer) -> bool {
        self.deferred_free.push(buffer).is_ok()
    }

    /// Release everything queued for freeing. Passive level only.
    pub fn drain_deferred(&self, platform: &dyn Platform) -> usize {
        let mut drained = 0;
        while let Some(buffer) = self.deferred_free.pop() {
            platform.free_pages(buffer.phys, buffer.kind.pages());
            drained += 1;
        }
        drained
    }

    /// How many buffers of `kind` are parked.
    pub fn available(&self, kind: PoolKind) -> usize {
        self.pools[kind.index()].len()
    }

    /// Free every parked buffer. Passive level only; used at unload.
    pub fn release_all(&self, platform: &dyn Platform) {
        self.drain_deferred(platform);
        for pool in &self.pools {
            while let Some(buffer) = pool.pop() {
                platform.free_pages(buffer.phys, buffer.kind.pages());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;

    #[test]
    fn prealloc_then_request_then_exhaust() {
        let platform = MockPlatform::new(1, 256);
        let pools = PoolManager::new();
        assert_eq!(pools.prealloc(&platform, PoolKind::EptPageTable, 3), 3);
        assert_eq!(pools.available(PoolKind::EptPageTable), 3);

        assert!(pools.request(PoolKind::EptPageTable).is_some());
        assert!(pools.request(PoolKind::EptPageTable).is_some());
        assert!(pools.request(PoolKind::EptPageTable).is_some());
        // Empty pool: the VMX-root caller sees None, never a fresh allocation.
        assert!(pools.request(PoolKind::EptPageTable).is_none());
        // Kinds are separate.
        assert!(pools.request(PoolKind::ShadowPage).is_none());
    }

    #[test]
    fn deferred_frees_return_pages_to_the_platform() {
        let platform = MockPlatform::new(1, 256);
        let pools = PoolManager::new();
        pools.prealloc(&platform, PoolKind::ExecTrampoline, 2);
        let a = pools.request(PoolKind::ExecTrampoline).unwrap();
        let before = platform.pages_in_use();
        assert!(pools.defer_free(a));
        // Nothing freed until the passive-level drain runs.
        assert_eq!(platform.pages_in_use(), before);
        assert_eq!(pools.drain_deferred(&platform), 1);
        assert_eq!(platform.pages_in_use(), before - 1);
    }

    #[test]
    fn recycle_keeps_the_buffer_usable() {
        let platform = MockPlatform::new(1, 16);
        let pools = PoolManager::new();
        pools.prealloc(&platform, PoolKind::ShadowPage, 1);
        let buffer = pools.request(PoolKind::ShadowPage).unwrap();
        pools.recycle(buffer);
        assert_eq!(pools.available(PoolKind::ShadowPage), 1);
        assert!(pools.request(PoolKind::ShadowPage).is_some());
    }
}
