//! Command handlers that do not touch the VMCS.
//!
//! Everything here operates on guest memory through [`GuestMemory`] and
//! on the paused register snapshot, so the debuggee loop stays a thin
//! packet-to-call translation layer.

use alloc::vec::Vec;
use hv::mapper::GuestMemory;
use vtx::paging::{pd_index, pdpt_index, pml4_index, pt_index, PageEntry};
use vtx::{GuestRegisters, PhysAddr, VirtAddr};
use wire::error::KernelStatus;
use wire::payloads::{
    AddressTranslationPacket, EditMemoryPacket, MemoryAddressKind, PteDetailsPacket,
    ReadMemoryPacket, RegisterReadDescription, SearchMemoryPacket, TranslationDirection,
    SHOW_ALL_REGISTERS,
};
use wire::ErrorCode;

/// Upper bound on one read/edit/search request.
pub const MAX_MEMORY_REQUEST: usize = 0x10000;

/// Most hits one search reports.
pub const MAX_SEARCH_HITS: usize = 32;

/// `read-memory`: fill the response data from guest memory.
pub fn read_memory(mem: &dyn GuestMemory, cr3: u64, mut req: ReadMemoryPacket) -> ReadMemoryPacket {
    let size = req.size as usize;
    if size == 0 || size > MAX_MEMORY_REQUEST {
        req.result = ErrorCode::InvalidAddress.into();
        return req;
    }
    let mut data = alloc::vec![0u8; size];
    let ok = match req.kind {
        MemoryAddressKind::Physical => match PhysAddr::new(req.address) {
            Some(pa) => mem.read_phys(pa, &mut data),
            None => false,
        },
        MemoryAddressKind::Virtual => match VirtAddr::new(req.address) {
            Some(va) => mem.read_virt(va, cr3, &mut data),
            None => false,
        },
    };
    if ok {
        req.data = data;
        req.result = KernelStatus::SUCCESS;
    } else {
        req.result = ErrorCode::InvalidAddress.into();
    }
    req
}

/// `edit-memory`: write the caller's bytes into guest memory.
pub fn edit_memory(mem: &dyn GuestMemory, cr3: u64, mut req: EditMemoryPacket) -> EditMemoryPacket {
    if req.data.is_empty()
        || req.data.len() > MAX_MEMORY_REQUEST
        || !matches!(req.byte_size, 1 | 2 | 4 | 8)
        || req.data.len() % req.byte_size as usize != 0
    {
        req.result = ErrorCode::EditMemoryInvalidParameter.into();
        return req;
    }
    let ok = match req.kind {
        MemoryAddressKind::Physical => match PhysAddr::new(req.address) {
            Some(pa) => mem.write_phys(pa, &req.data),
            None => false,
        },
        MemoryAddressKind::Virtual => match VirtAddr::new(req.address) {
            Some(va) => mem.write_virt(va, cr3, &req.data),
            None => false,
        },
    };
    req.result = if ok {
        KernelStatus::SUCCESS
    } else {
        ErrorCode::EditMemoryInvalidAddressBasedOnCurrentProcess.into()
    };
    req
}

/// `search-memory`: scan `[start, end)` for the needle.
pub fn search_memory(
    mem: &dyn GuestMemory,
    cr3: u64,
    req: &SearchMemoryPacket,
) -> (KernelStatus, Vec<u64>) {
    if req.needle.is_empty() || req.end <= req.start {
        return (ErrorCode::InvalidAddress.into(), Vec::new());
    }
    let span = (req.end - req.start) as usize;
    if span > MAX_MEMORY_REQUEST {
        return (ErrorCode::InvalidAddress.into(), Vec::new());
    }
    let mut hay = alloc::vec![0u8; span];
    let ok = match req.kind {
        MemoryAddressKind::Physical => match PhysAddr::new(req.start) {
            Some(pa) => mem.read_phys(pa, &mut hay),
            None => false,
        },
        MemoryAddressKind::Virtual => match VirtAddr::new(req.start) {
            Some(va) => mem.read_virt(va, cr3, &mut hay),
            None => false,
        },
    };
    if !ok {
        return (ErrorCode::InvalidAddress.into(), Vec::new());
    }
    let mut hits = Vec::new();
    for (offset, window) in hay.windows(req.needle.len()).enumerate() {
        if window == req.needle.as_slice() {
            hits.push(req.start + offset as u64);
            if hits.len() == MAX_SEARCH_HITS {
                break;
            }
        }
    }
    (KernelStatus::SUCCESS, hits)
}

/// `!va2pa` / `!pa2va`.
pub fn translate_address(
    mem: &dyn GuestMemory,
    cr3: u64,
    pa2va: &dyn Fn(PhysAddr) -> Option<VirtAddr>,
    mut req: AddressTranslationPacket,
) -> AddressTranslationPacket {
    match req.direction {
        TranslationDirection::VirtualToPhysical => {
            match VirtAddr::new(req.address).and_then(|va| mem.virt_to_phys_in(va, cr3)) {
                Some(pa) => {
                    req.translated = pa.into_u64();
                    req.result = KernelStatus::SUCCESS;
                }
                None => req.result = ErrorCode::InvalidAddress.into(),
            }
        }
        TranslationDirection::PhysicalToVirtual => {
            match PhysAddr::new(req.address).and_then(pa2va) {
                Some(va) => {
                    req.translated = va.into_u64();
                    req.result = KernelStatus::SUCCESS;
                }
                None => req.result = ErrorCode::InvalidAddress.into(),
            }
        }
    }
    req
}

fn read_table_entry(mem: &dyn GuestMemory, pa: PhysAddr) -> Option<PageEntry> {
    let mut raw = [0u8; 8];
    if mem.read_phys(pa, &mut raw) {
        Some(PageEntry::from_raw(u64::from_le_bytes(raw)))
    } else {
        None
    }
}

/// `!pte`: dump every paging level translating an address.
pub fn pte_details(mem: &dyn GuestMemory, cr3: u64, address: u64) -> PteDetailsPacket {
    let mut packet = PteDetailsPacket {
        address,
        pml4e: 0,
        pdpte: 0,
        pde: 0,
        pte: 0,
        leaf_level: 0,
        result: ErrorCode::InvalidAddress.into(),
    };
    let Some(pml4_base) = PhysAddr::new(cr3 & 0x000f_ffff_ffff_f000) else {
        return packet;
    };

    let Some(pml4e) = read_table_entry(mem, pml4_base + (pml4_index(address) * 8) as u64) else {
        return packet;
    };
    packet.pml4e = pml4e.raw();
    let Some(pdpt) = pml4e.addr() else {
        return packet;
    };

    let Some(pdpte) = read_table_entry(mem, pdpt + (pdpt_index(address) * 8) as u64) else {
        return packet;
    };
    packet.pdpte = pdpte.raw();
    let Some(pd) = pdpte.addr() else {
        return packet;
    };
    if pdpte.is_large() {
        packet.leaf_level = 3;
        packet.result = KernelStatus::SUCCESS;
        return packet;
    }

    let Some(pde) = read_table_entry(mem, pd + (pd_index(address) * 8) as u64) else {
        return packet;
    };
    packet.pde = pde.raw();
    let Some(pt) = pde.addr() else {
        return packet;
    };
    if pde.is_large() {
        packet.leaf_level = 2;
        packet.result = KernelStatus::SUCCESS;
        return packet;
    }

    let Some(pte) = read_table_entry(mem, pt + (pt_index(address) * 8) as u64) else {
        return packet;
    };
    packet.pte = pte.raw();
    if pte.is_present() {
        packet.leaf_level = 1;
        packet.result = KernelStatus::SUCCESS;
    }
    packet
}

/// `r`: read one register or the whole set from the paused snapshot.
pub fn read_registers(
    regs: &GuestRegisters,
    rip: u64,
    rflags: u64,
    register_id: u32,
) -> Vec<RegisterReadDescription> {
    // Ids 0..=15 are the GPRs; 16 = rip, 17 = rflags.
    const RIP_ID: u32 = 16;
    const RFLAGS_ID: u32 = 17;

    let one = |id: u32| -> RegisterReadDescription {
        let value = match id {
            RIP_ID => Some(rip),
            RFLAGS_ID => Some(rflags),
            other => regs.read_by_id(other),
        };
        match value {
            Some(value) => RegisterReadDescription {
                register_id: id,
                value,
                result: KernelStatus::SUCCESS,
            },
            None => RegisterReadDescription {
                register_id: id,
                value: 0,
                result: ErrorCode::InvalidRegisterNumber.into(),
            },
        }
    };

    if register_id == SHOW_ALL_REGISTERS {
        (0..=RFLAGS_ID).map(one).collect()
    } else {
        alloc::vec![one(register_id)]
    }
}

/// `k`: the raw return-address window at RSP.
pub fn callstack(mem: &dyn GuestMemory, cr3: u64, rsp: u64, frames: usize) -> Vec<u64> {
    let frames = frames.min(64);
    let mut out = Vec::with_capacity(frames);
    let Some(base) = VirtAddr::new(rsp) else {
        return out;
    };
    let mut raw = alloc::vec![0u8; frames * 8];
    if !mem.read_virt(base, cr3, &mut raw) {
        return out;
    }
    for chunk in raw.chunks_exact(8) {
        out.push(u64::from_le_bytes(chunk.try_into().unwrap()));
    }
    out
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use core::cell::UnsafeCell;

    /// Flat guest memory with identity virtual translation.
    pub struct ArenaMemory {
        bytes: UnsafeCell<Vec<u8>>,
    }

    unsafe impl Sync for ArenaMemory {}

    impl ArenaMemory {
        pub fn new(size: usize) -> Self {
            Self {
                bytes: UnsafeCell::new(alloc::vec![0u8; size]),
            }
        }

        pub fn write(&self, at: usize, data: &[u8]) {
            unsafe {
                (&mut *self.bytes.get())[at..at + data.len()].copy_from_slice(data);
            }
        }

        pub fn read_byte(&self, at: usize) -> u8 {
            unsafe { (&*self.bytes.get())[at] }
        }

        fn len(&self) -> usize {
            unsafe { (*self.bytes.get()).len() }
        }
    }

    impl GuestMemory for ArenaMemory {
        fn read_phys(&self, pa: PhysAddr, out: &mut [u8]) -> bool {
            let at = pa.into_u64() as usize;
            if at + out.len() > self.len() {
                return false;
            }
            unsafe {
                out.copy_from_slice(&(&*self.bytes.get())[at..at + out.len()]);
            }
            true
        }

        fn write_phys(&self, pa: PhysAddr, data: &[u8]) -> bool {
            let at = pa.into_u64() as usize;
            if at + data.len() > self.len() {
                return false;
            }
            self.write(at, data);
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

    #[test]
    fn read_memory_returns_data_or_error() {
        let mem = ArenaMemory::new(0x2000);
        mem.write(0x100, b"\xde\xad\xbe\xef");
        let response = read_memory(
            &mem,
            0,
            ReadMemoryPacket {
                address: 0x100,
                kind: MemoryAddressKind::Physical,
                size: 4,
                pid: 0,
                result: KernelStatus(0),
                data: Vec::new(),
            },
        );
        assert!(response.result.is_success());
        assert_eq!(response.data, b"\xde\xad\xbe\xef");

        let bad = read_memory(
            &mem,
            0,
            ReadMemoryPacket {
                address: 0x10_0000,
                kind: MemoryAddressKind::Physical,
                size: 4,
                pid: 0,
                result: KernelStatus(0),
                data: Vec::new(),
            },
        );
        assert_eq!(bad.result.error(), Some(ErrorCode::InvalidAddress));
    }

    #[test]
    fn edit_memory_validates_the_element_size() {
        let mem = ArenaMemory::new(0x1000);
        let ok = edit_memory(
            &mem,
            0,
            EditMemoryPacket {
                address: 0x10,
                kind: MemoryAddressKind::Virtual,
                byte_size: 4,
                pid: 0,
                result: KernelStatus(0),
                data: alloc::vec![1, 2, 3, 4],
            },
        );
        assert!(ok.result.is_success());
        assert_eq!(mem.read_byte(0x10), 1);
        assert_eq!(mem.read_byte(0x13), 4);

        let bad = edit_memory(
            &mem,
            0,
            EditMemoryPacket {
                address: 0x10,
                kind: MemoryAddressKind::Virtual,
                byte_size: 3,
                pid: 0,
                result: KernelStatus(0),
                data: alloc::vec![1, 2, 3],
            },
        );
        assert_eq!(
            bad.result.error(),
            Some(ErrorCode::EditMemoryInvalidParameter)
        );
    }

    #[test]
    fn search_finds_every_occurrence_in_range() {
        let mem = ArenaMemory::new(0x1000);
        mem.write(0x100, b"needle");
        mem.write(0x200, b"needle");
        mem.write(0x2f0, b"needle");
        let (status, hits) = search_memory(
            &mem,
            0,
            &SearchMemoryPacket {
                start: 0x0,
                end: 0x280,
                kind: MemoryAddressKind::Physical,
                result: KernelStatus(0),
                needle: b"needle".to_vec(),
            },
        );
        assert!(status.is_success());
        assert_eq!(hits, alloc::vec![0x100, 0x200]);
    }

    #[test]
    fn translation_both_directions() {
        let mem = ArenaMemory::new(0x1000);
        let pa2va = |pa: PhysAddr| VirtAddr::new(pa.into_u64());
        let v2p = translate_address(
            &mem,
            0,
            &pa2va,
            AddressTranslationPacket {
                address: 0x123,
                translated: 0,
                pid: 0,
                direction: TranslationDirection::VirtualToPhysical,
                result: KernelStatus(0),
            },
        );
        assert!(v2p.result.is_success());
        assert_eq!(v2p.translated, 0x123);

        let p2v = translate_address(
            &mem,
            0,
            &pa2va,
            AddressTranslationPacket {
                address: 0x456,
                translated: 0,
                pid: 0,
                direction: TranslationDirection::PhysicalToVirtual,
                result: KernelStatus(0),
            },
        );
        assert!(p2v.result.is_success());
        assert_eq!(p2v.translated, 0x456);
    }

    #[test]
    fn pte_details_walks_all_levels() {
        let mem = ArenaMemory::new(0x10000);
        let va = 0x40201234u64;
        let present = 1u64;
        let entry = |table: u64, index: usize, value: u64| {
            mem.write(table as usize + index * 8, &value.to_le_bytes());
        };
        entry(0x1000, pml4_index(va), 0x2000 | present);
        entry(0x2000, pdpt_index(va), 0x3000 | present);
        entry(0x3000, pd_index(va), 0x4000 | present);
        entry(0x4000, pt_index(va), 0x7000 | present);

        let packet = pte_details(&mem, 0x1000, va);
        assert!(packet.result.is_success());
        assert_eq!(packet.leaf_level, 1);
        assert_eq!(packet.pml4e, 0x2000 | present);
        assert_eq!(packet.pte, 0x7000 | present);

        let missing = pte_details(&mem, 0x1000, 0x5000_0000_0000);
        assert!(!missing.result.is_success());
        assert_eq!(missing.leaf_level, 0);
    }

    #[test]
    fn register_reads_cover_rip_and_rflags() {
        let mut regs = GuestRegisters::default();
        regs.rax = 0x11;
        regs.r15 = 0x22;
        let all = read_registers(&regs, 0x1000, 0x202, SHOW_ALL_REGISTERS);
        assert_eq!(all.len(), 18);
        assert_eq!(all[0].value, 0x11);
        assert_eq!(all[15].value, 0x22);
        assert_eq!(all[16].value, 0x1000);
        assert_eq!(all[17].value, 0x202);
        assert!(all.iter().all(|r| r.result.is_success()));

        let bad = read_registers(&regs, 0, 0, 99);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].result.error(), Some(ErrorCode::InvalidRegisterNumber));
    }

    #[test]
    fn callstack_reads_return_addresses() {
        let mem = ArenaMemory::new(0x1000);
        mem.write(0x800, &0xAAAAu64.to_le_bytes());
        mem.write(0x808, &0xBBBBu64.to_le_bytes());
        let frames = callstack(&mem, 0, 0x800, 2);
        assert_eq!(frames, alloc::vec![0xAAAA, 0xBBBB]);
    }
}
