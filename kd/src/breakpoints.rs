//! Software breakpoints (`bp`) of the kernel debugger.
//!
//! Unlike the EPT hidden breakpoints, these write the `0xCC` straight
//! into the guest page through the memory mapper (physical-addressed, so
//! the write lands regardless of page protections) and rely on the #BP
//! exception-bitmap intercept. On a hit the original byte goes back, the
//! conductor pauses everyone, and a one-shot MTF re-applies the byte
//! after the real instruction executes.

use alloc::vec::Vec;
use hv::mapper::GuestMemory;
use vtx::{PhysAddr, VirtAddr};
use wire::types::{APPLY_TO_ALL_CORES, APPLY_TO_ALL_PROCESSES, APPLY_TO_ALL_THREADS};
use wire::ErrorCode;

/// One `bp` descriptor.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: u64,
    pub address: VirtAddr,
    pub phys_address: PhysAddr,
    pub pid: u32,
    pub tid: u32,
    pub core: u32,
    /// The byte that was at the address before `0xCC`.
    pub previous_byte: u8,
    pub enabled: bool,
    /// Restore IF together with the MTF completion.
    pub set_rflags_if_on_mtf: bool,
    /// Skip the re-apply on the pending MTF (set while single-stepping
    /// over the breakpoint's own instruction).
    pub avoid_reapply: bool,
    /// Length of the replaced instruction, for step-over bookkeeping.
    pub instruction_length: u16,
}

impl Breakpoint {
    /// Whether this breakpoint applies to the given core/process/thread.
    pub fn matches(&self, core: u32, pid: u32, tid: u32) -> bool {
        (self.core == APPLY_TO_ALL_CORES || self.core == core)
            && (self.pid == APPLY_TO_ALL_PROCESSES || self.pid == pid)
            && (self.tid == APPLY_TO_ALL_THREADS || self.tid == tid)
    }
}

/// The breakpoint table.
pub struct BreakpointManager {
    breakpoints: Vec<Breakpoint>,
    next_id: u64,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            breakpoints: Vec::new(),
            next_id: 1,
        }
    }

    /// Install a breakpoint: capture the previous byte, write `0xCC`.
    ///
    /// The caller enables the #BP exception-bitmap bit on all cores
    /// afterwards (once, not per breakpoint).
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        mem: &dyn GuestMemory,
        cr3: u64,
        address: VirtAddr,
        pid: u32,
        tid: u32,
        core: u32,
        instruction_length: u16,
    ) -> Result<u64, ErrorCode> {
        if self.find_by_address(address).is_some() {
            return Err(ErrorCode::BreakpointAlreadyExistsOnTheAddress);
        }
        let phys_address = mem
            .virt_to_phys_in(address, cr3)
            .ok_or(ErrorCode::InvalidAddress)?;

        let mut previous_byte = [0u8];
        if !mem.read_phys(phys_address, &mut previous_byte) {
            return Err(ErrorCode::InvalidAddress);
        }
        if !mem.write_phys(phys_address, &[0xCC]) {
            return Err(ErrorCode::InvalidAddress);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.push(Breakpoint {
            id,
            address,
            phys_address,
            pid,
            tid,
            core,
            previous_byte: previous_byte[0],
            enabled: true,
            set_rflags_if_on_mtf: false,
            avoid_reapply: false,
            instruction_length,
        });
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Breakpoint> {
        self.breakpoints.iter_mut().find(|b| b.id == id)
    }

    /// The enabled breakpoint covering a physical address, if any.
    pub fn find_by_phys(&self, phys: PhysAddr) -> Option<&Breakpoint> {
        self.breakpoints
            .iter()
            .find(|b| b.enabled && b.phys_address == phys)
    }

    /// Any breakpoint at a guest virtual address.
    pub fn find_by_address(&self, address: VirtAddr) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|b| b.address == address)
    }

    /// Temporarily restore the original byte (hit handling).
    pub fn lift(&mut self, mem: &dyn GuestMemory, id: u64) -> bool {
        let Some(bp) = self.get(id) else {
            return false;
        };
        mem.write_phys(bp.phys_address, &[bp.previous_byte])
    }

    /// Put the `0xCC` back (MTF completion).
    pub fn reapply(&mut self, mem: &dyn GuestMemory, id: u64) -> bool {
        let Some(bp) = self.breakpoints.iter().find(|b| b.id == id && b.enabled) else {
            return false;
        };
        mem.write_phys(bp.phys_address, &[0xCC])
    }

    /// Disable: restore the byte but keep the descriptor.
    pub fn disable(&mut self, mem: &dyn GuestMemory, id: u64) -> Result<(), ErrorCode> {
        let bp = self.get_mut(id).ok_or(ErrorCode::BreakpointIdNotFound)?;
        if !bp.enabled {
            return Err(ErrorCode::BreakpointAlreadyDisabled);
        }
        bp.enabled = false;
        let (phys, byte) = (bp.phys_address, bp.previous_byte);
        if !mem.write_phys(phys, &[byte]) {
            return Err(ErrorCode::InvalidAddress);
        }
        Ok(())
    }

    /// Re-enable a disabled breakpoint.
    pub fn enable(&mut self, mem: &dyn GuestMemory, id: u64) -> Result<(), ErrorCode> {
        let bp = self.get_mut(id).ok_or(ErrorCode::BreakpointIdNotFound)?;
        if bp.enabled {
            return Err(ErrorCode::BreakpointAlreadyEnabled);
        }
        bp.enabled = true;
        let phys = bp.phys_address;
        if !mem.write_phys(phys, &[0xCC]) {
            return Err(ErrorCode::InvalidAddress);
        }
        Ok(())
    }

    /// Remove: restore the byte and drop the descriptor.
    pub fn clear(&mut self, mem: &dyn GuestMemory, id: u64) -> Result<(), ErrorCode> {
        let position = self
            .breakpoints
            .iter()
            .position(|b| b.id == id)
            .ok_or(ErrorCode::BreakpointIdNotFound)?;
        let bp = &self.breakpoints[position];
        if bp.enabled && !mem.write_phys(bp.phys_address, &[bp.previous_byte]) {
            return Err(ErrorCode::InvalidAddress);
        }
        self.breakpoints.remove(position);
        Ok(())
    }

    /// Remove everything (unload path).
    pub fn clear_all(&mut self, mem: &dyn GuestMemory) {
        let ids: Vec<u64> = self.breakpoints.iter().map(|b| b.id).collect();
        for id in ids {
            let _ = self.clear(mem, id);
        }
    }

    /// Descriptors for the `bl` listing.
    pub fn list(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Whether any breakpoint still needs the #BP intercept.
    pub fn any_enabled(&self) -> bool {
        self.breakpoints.iter().any(|b| b.enabled)
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::ArenaMemory;

    #[test]
    fn add_hit_and_clear_restores_the_byte() {
        let mem = ArenaMemory::new(0x4000);
        mem.write(0x1050, &[0x48]);
        let mut bps = BreakpointManager::new();

        let id = bps
            .add(
                &mem,
                0,
                VirtAddr::new(0x1050).unwrap(),
                APPLY_TO_ALL_PROCESSES,
                APPLY_TO_ALL_THREADS,
                APPLY_TO_ALL_CORES,
                1,
            )
            .unwrap();
        assert_eq!(mem.read_byte(0x1050), 0xCC);
        assert_eq!(bps.get(id).unwrap().previous_byte, 0x48);

        // Hit: lift, then the MTF puts it back.
        assert!(bps.lift(&mem, id));
        assert_eq!(mem.read_byte(0x1050), 0x48);
        assert!(bps.reapply(&mem, id));
        assert_eq!(mem.read_byte(0x1050), 0xCC);

        // Clear restores the original byte for good.
        bps.clear(&mem, id).unwrap();
        assert_eq!(mem.read_byte(0x1050), 0x48);
        assert!(bps.get(id).is_none());
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let mem = ArenaMemory::new(0x4000);
        let mut bps = BreakpointManager::new();
        let va = VirtAddr::new(0x2000).unwrap();
        bps.add(&mem, 0, va, 0xffff_ffff, 0xffff_ffff, 0xffff_ffff, 1)
            .unwrap();
        assert_eq!(
            bps.add(&mem, 0, va, 0xffff_ffff, 0xffff_ffff, 0xffff_ffff, 1),
            Err(ErrorCode::BreakpointAlreadyExistsOnTheAddress)
        );
    }

    #[test]
    fn enable_disable_toggles_the_byte_and_errors_on_repeats() {
        let mem = ArenaMemory::new(0x4000);
        mem.write(0x3000, &[0x90]);
        let mut bps = BreakpointManager::new();
        let id = bps
            .add(
                &mem,
                0,
                VirtAddr::new(0x3000).unwrap(),
                0xffff_ffff,
                0xffff_ffff,
                0xffff_ffff,
                1,
            )
            .unwrap();

        bps.disable(&mem, id).unwrap();
        assert_eq!(mem.read_byte(0x3000), 0x90);
        assert_eq!(bps.disable(&mem, id), Err(ErrorCode::BreakpointAlreadyDisabled));
        // A disabled breakpoint no longer claims hits.
        assert!(bps.find_by_phys(PhysAddr::new(0x3000).unwrap()).is_none());

        bps.enable(&mem, id).unwrap();
        assert_eq!(mem.read_byte(0x3000), 0xCC);
        assert_eq!(bps.enable(&mem, id), Err(ErrorCode::BreakpointAlreadyEnabled));
        assert!(bps.find_by_phys(PhysAddr::new(0x3000).unwrap()).is_some());

        assert_eq!(bps.clear(&mem, 999), Err(ErrorCode::BreakpointIdNotFound));
    }

    #[test]
    fn filters_match_wildcards_and_exact_values() {
        let bp = Breakpoint {
            id: 1,
            address: VirtAddr::new(0x1000).unwrap(),
            phys_address: PhysAddr::new(0x1000).unwrap(),
            pid: 4,
            tid: APPLY_TO_ALL_THREADS,
            core: 2,
            previous_byte: 0,
            enabled: true,
            set_rflags_if_on_mtf: false,
            avoid_reapply: false,
            instruction_length: 1,
        };
        assert!(bp.matches(2, 4, 1234));
        assert!(!bp.matches(1, 4, 1234));
        assert!(!bp.matches(2, 5, 1234));
    }
}
