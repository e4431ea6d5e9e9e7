//! Typed packet payloads.
//!
//! Each payload has an explicit little-endian wire layout written and
//! parsed field by field. The encoded size of every struct is stable;
//! a payload is rejected, never partially read, when it is too short.

use crate::error::KernelStatus;
use crate::types::{
    BreakpointModifyRequest, ModifyEventKind, PausingReason, SteppingKind,
};
use alloc::vec::Vec;

/// Size of the instruction window carried by a paused packet.
pub const MAXIMUM_INSTR_SIZE: usize = 16;

/// Cursor over a payload being decoded.
struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.bytes.get(self.at)?;
        self.at += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let v = u16::from_le_bytes(self.bytes.get(self.at..self.at + 2)?.try_into().ok()?);
        self.at += 2;
        Some(v)
    }

    fn u32(&mut self) -> Option<u32> {
        let v = u32::from_le_bytes(self.bytes.get(self.at..self.at + 4)?.try_into().ok()?);
        self.at += 4;
        Some(v)
    }

    fn u64(&mut self) -> Option<u64> {
        let v = u64::from_le_bytes(self.bytes.get(self.at..self.at + 8)?.try_into().ok()?);
        self.at += 8;
        Some(v)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let v: [u8; N] = self.bytes.get(self.at..self.at + N)?.try_into().ok()?;
        self.at += N;
        Some(v)
    }

    fn rest(self) -> &'a [u8] {
        &self.bytes[self.at..]
    }
}

/// The debuggee-to-debugger pause notification.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PausedPacket {
    /// Guest RIP of the paused core.
    pub rip: u64,
    /// Whether addresses should be interpreted in 32-bit mode.
    pub is_32bit_address: bool,
    /// Why the debuggee paused.
    pub reason: PausingReason,
    /// Index of the paused core.
    pub current_core: u32,
    /// The matching event tag (or breakpoint id), zero when none.
    pub event_tag: u64,
    /// Guest RFLAGS.
    pub rflags: u64,
    /// The raw bytes at RIP, for the front-end disassembler.
    pub instruction_bytes: [u8; MAXIMUM_INSTR_SIZE],
}

impl PausedPacket {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 8 + 1 + 4 + 4 + 8 + 8 + MAXIMUM_INSTR_SIZE;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.extend_from_slice(&self.rip.to_le_bytes());
        out.push(self.is_32bit_address as u8);
        out.extend_from_slice(&u32::from(self.reason).to_le_bytes());
        out.extend_from_slice(&self.current_core.to_le_bytes());
        out.extend_from_slice(&self.event_tag.to_le_bytes());
        out.extend_from_slice(&self.rflags.to_le_bytes());
        out.extend_from_slice(&self.instruction_bytes);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            rip: r.u64()?,
            is_32bit_address: r.u8()? != 0,
            reason: PausingReason::try_from(r.u32()?).ok()?,
            current_core: r.u32()?,
            event_tag: r.u64()?,
            rflags: r.u64()?,
            instruction_bytes: r.array()?,
        })
    }
}

/// Core-switch request/response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChangeCorePacket {
    pub new_core: u32,
    pub result: KernelStatus,
}

impl ChangeCorePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.new_core.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            new_core: r.u32()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Process-switch request/response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChangeProcessPacket {
    /// Only query the current process id, do not switch.
    pub get_remote_pid: bool,
    pub process_id: u32,
    pub result: KernelStatus,
}

impl ChangeProcessPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(self.get_remote_pid as u8);
        out.extend_from_slice(&self.process_id.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            get_remote_pid: r.u8()? != 0,
            process_id: r.u32()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Thread-switch request/response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChangeThreadPacket {
    pub get_remote_tid: bool,
    pub thread_id: u32,
    pub result: KernelStatus,
}

impl ChangeThreadPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(self.get_remote_tid as u8);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            get_remote_tid: r.u8()? != 0,
            thread_id: r.u32()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Stepping request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StepPacket {
    pub kind: SteppingKind,
    /// Whether the instruction at RIP is a CALL (the `p` command).
    pub is_current_instruction_a_call: bool,
    /// Length of that CALL instruction.
    pub call_length: u32,
}

impl StepPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.extend_from_slice(&u32::from(self.kind).to_le_bytes());
        out.push(self.is_current_instruction_a_call as u8);
        out.extend_from_slice(&self.call_length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            kind: SteppingKind::try_from(r.u32()?).ok()?,
            is_current_instruction_a_call: r.u8()? != 0,
            call_length: r.u32()?,
        })
    }
}

/// `.formats` evaluation result.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FormatsPacket {
    pub value: u64,
    pub result: KernelStatus,
}

impl FormatsPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            value: r.u64()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Breakpoint creation request/response (`bp`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BpPacket {
    pub address: u64,
    pub pid: u32,
    pub tid: u32,
    pub core: u32,
    pub result: KernelStatus,
}

impl BpPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&self.core.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            address: r.u64()?,
            pid: r.u32()?,
            tid: r.u32()?,
            core: r.u32()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Breakpoint list/enable/disable/clear request/response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BpListOrModifyPacket {
    pub breakpoint_id: u64,
    pub request: BreakpointModifyRequest,
    pub result: KernelStatus,
}

impl BpListOrModifyPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.breakpoint_id.to_le_bytes());
        out.extend_from_slice(&u32::from(self.request).to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            breakpoint_id: r.u64()?,
            request: BreakpointModifyRequest::try_from(r.u32()?).ok()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Event enable/disable/clear/query request/response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ModifyEventPacket {
    pub tag: u64,
    pub kind: ModifyEventKind,
    /// For query responses: whether the event is enabled.
    pub is_enabled: bool,
    pub result: KernelStatus,
}

impl ModifyEventPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(17);
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&u32::from(self.kind).to_le_bytes());
        out.push(self.is_enabled as u8);
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            tag: r.u64()?,
            kind: ModifyEventKind::try_from(r.u32()?).ok()?,
            is_enabled: r.u8()? != 0,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Script execution request; the bytecode rides behind the fixed part.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScriptPacket {
    /// Offset of the code within the buffer (the engine's entry symbol).
    pub script_buffer_pointer: u32,
    /// Whether the result should be formatted for `.formats`.
    pub is_format: bool,
    pub result: KernelStatus,
    /// The bytecode itself.
    pub bytecode: Vec<u8>,
}

impl ScriptPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13 + self.bytecode.len());
        out.extend_from_slice(&(self.bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.script_buffer_pointer.to_le_bytes());
        out.push(self.is_format as u8);
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out.extend_from_slice(&self.bytecode);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        let len = r.u32()? as usize;
        let script_buffer_pointer = r.u32()?;
        let is_format = r.u8()? != 0;
        let result = KernelStatus(r.u32()?);
        let rest = r.rest();
        if rest.len() < len {
            return None;
        }
        Some(Self {
            script_buffer_pointer,
            is_format,
            result,
            bytecode: rest[..len].to_vec(),
        })
    }
}

/// A line of user input forwarded to the debuggee shell.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserInputPacket {
    pub result: KernelStatus,
    pub command: Vec<u8>,
}

impl UserInputPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.command.len());
        out.extend_from_slice(&(self.command.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out.extend_from_slice(&self.command);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        let len = r.u32()? as usize;
        let result = KernelStatus(r.u32()?);
        let rest = r.rest();
        if rest.len() < len {
            return None;
        }
        Some(Self {
            result,
            command: rest[..len].to_vec(),
        })
    }
}

/// One register read result (the `r` command).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RegisterReadDescription {
    /// Register id, or [`SHOW_ALL_REGISTERS`](crate::payloads::SHOW_ALL_REGISTERS).
    pub register_id: u32,
    pub value: u64,
    pub result: KernelStatus,
}

/// Register id requesting the whole register set.
pub const SHOW_ALL_REGISTERS: u32 = 0xffff_ffff;

impl RegisterReadDescription {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.register_id.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            register_id: r.u32()?,
            value: r.u64()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Address class of a memory request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum MemoryAddressKind {
    Virtual = 0,
    Physical = 1,
}

/// Memory read request/response; data rides behind the fixed part in the
/// response direction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadMemoryPacket {
    pub address: u64,
    pub kind: MemoryAddressKind,
    pub size: u32,
    pub pid: u32,
    pub result: KernelStatus,
    pub data: Vec<u8>,
}

impl ReadMemoryPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.data.len());
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            address: r.u64()?,
            kind: match r.u32()? {
                0 => MemoryAddressKind::Virtual,
                1 => MemoryAddressKind::Physical,
                _ => return None,
            },
            size: r.u32()?,
            pid: r.u32()?,
            result: KernelStatus(r.u32()?),
            data: r.rest().to_vec(),
        })
    }
}

/// Memory edit request; the new bytes ride behind the fixed part.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EditMemoryPacket {
    pub address: u64,
    pub kind: MemoryAddressKind,
    /// Size of each element in bytes: 1, 2, 4 or 8.
    pub byte_size: u32,
    pub pid: u32,
    pub result: KernelStatus,
    pub data: Vec<u8>,
}

impl EditMemoryPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.data.len());
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.byte_size.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            address: r.u64()?,
            kind: match r.u32()? {
                0 => MemoryAddressKind::Virtual,
                1 => MemoryAddressKind::Physical,
                _ => return None,
            },
            byte_size: r.u32()?,
            pid: r.u32()?,
            result: KernelStatus(r.u32()?),
            data: r.rest().to_vec(),
        })
    }
}

/// Memory search request; the needle rides behind the fixed part and hits
/// come back as a list of u64 addresses.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SearchMemoryPacket {
    pub start: u64,
    pub end: u64,
    pub kind: MemoryAddressKind,
    pub result: KernelStatus,
    pub needle: Vec<u8>,
}

impl SearchMemoryPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28 + self.needle.len());
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.end.to_le_bytes());
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out.extend_from_slice(&self.needle);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            start: r.u64()?,
            end: r.u64()?,
            kind: match r.u32()? {
                0 => MemoryAddressKind::Virtual,
                1 => MemoryAddressKind::Physical,
                _ => return None,
            },
            result: KernelStatus(r.u32()?),
            needle: r.rest().to_vec(),
        })
    }
}

/// Direction of an address translation request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TranslationDirection {
    VirtualToPhysical,
    PhysicalToVirtual,
}

/// `!va2pa` / `!pa2va` request/response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AddressTranslationPacket {
    pub address: u64,
    pub translated: u64,
    pub pid: u32,
    pub direction: TranslationDirection,
    pub result: KernelStatus,
}

impl AddressTranslationPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.translated.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.push(matches!(self.direction, TranslationDirection::VirtualToPhysical) as u8);
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            address: r.u64()?,
            translated: r.u64()?,
            pid: r.u32()?,
            direction: if r.u8()? != 0 {
                TranslationDirection::VirtualToPhysical
            } else {
                TranslationDirection::PhysicalToVirtual
            },
            result: KernelStatus(r.u32()?),
        })
    }
}

/// `!pte` request/response: one entry value per level plus where the walk
/// stopped.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PteDetailsPacket {
    pub address: u64,
    pub pml4e: u64,
    pub pdpte: u64,
    pub pde: u64,
    pub pte: u64,
    /// Level of the mapping leaf, 0 when unmapped.
    pub leaf_level: u8,
    pub result: KernelStatus,
}

impl PteDetailsPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(45);
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.pml4e.to_le_bytes());
        out.extend_from_slice(&self.pdpte.to_le_bytes());
        out.extend_from_slice(&self.pde.to_le_bytes());
        out.extend_from_slice(&self.pte.to_le_bytes());
        out.push(self.leaf_level);
        out.extend_from_slice(&self.result.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            address: r.u64()?,
            pml4e: r.u64()?,
            pdpte: r.u64()?,
            pde: r.u64()?,
            pte: r.u64()?,
            leaf_level: r.u8()?,
            result: KernelStatus(r.u32()?),
        })
    }
}

/// Fixed part of an event registration buffer; the condition bytecode and
/// the serialized actions ride behind it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EventRegistrationPacket {
    pub tag: u64,
    pub kind: u32,
    pub core_id: u32,
    pub process_id: u32,
    pub optional_params: [u64; 4],
    pub condition_bytecode: Vec<u8>,
}

impl EventRegistrationPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(56 + self.condition_bytecode.len());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&self.core_id.to_le_bytes());
        out.extend_from_slice(&self.process_id.to_le_bytes());
        for p in &self.optional_params {
            out.extend_from_slice(&p.to_le_bytes());
        }
        out.extend_from_slice(&(self.condition_bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.condition_bytecode);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        let tag = r.u64()?;
        let kind = r.u32()?;
        let core_id = r.u32()?;
        let process_id = r.u32()?;
        let mut optional_params = [0u64; 4];
        for p in &mut optional_params {
            *p = r.u64()?;
        }
        let cond_len = r.u32()? as usize;
        let rest = r.rest();
        if rest.len() < cond_len {
            return None;
        }
        Some(Self {
            tag,
            kind,
            core_id,
            process_id,
            optional_params,
            condition_bytecode: rest[..cond_len].to_vec(),
        })
    }
}

/// Fixed part of an add-action buffer; the script/custom-code payload
/// rides behind it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AddActionPacket {
    pub event_tag: u64,
    pub action_kind: u32,
    /// Requested size of the pre-allocated result buffer, zero for none.
    pub preallocated_buffer_size: u32,
    pub immediate_message_passing: bool,
    pub payload: Vec<u8>,
}

impl AddActionPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21 + self.payload.len());
        out.extend_from_slice(&self.event_tag.to_le_bytes());
        out.extend_from_slice(&self.action_kind.to_le_bytes());
        out.extend_from_slice(&self.preallocated_buffer_size.to_le_bytes());
        out.push(self.immediate_message_passing as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        let event_tag = r.u64()?;
        let action_kind = r.u32()?;
        let preallocated_buffer_size = r.u32()?;
        let immediate_message_passing = r.u8()? != 0;
        let len = r.u32()? as usize;
        let rest = r.rest();
        if rest.len() < len {
            return None;
        }
        Some(Self {
            event_tag,
            action_kind,
            preallocated_buffer_size,
            immediate_message_passing,
            payload: rest[..len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PausingReason;

    #[test]
    fn paused_packet_round_trips() {
        let p = PausedPacket {
            rip: 0xffff_f801_0010_0050,
            is_32bit_address: false,
            reason: PausingReason::SoftwareBreakpointHit,
            current_core: 2,
            event_tag: 0x1000_0001,
            rflags: 0x202,
            instruction_bytes: *b"\xcc\x48\x89\x5c\x24\x08\x57\x48\x83\xec\x20\x8b\xd9\x90\x90\x90",
        };
        let decoded = PausedPacket::decode(&p.encode()).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn paused_packet_rejects_short_input() {
        let p = PausedPacket {
            rip: 0,
            is_32bit_address: true,
            reason: PausingReason::Stepped,
            current_core: 0,
            event_tag: 0,
            rflags: 0,
            instruction_bytes: [0; MAXIMUM_INSTR_SIZE],
        };
        let mut enc = p.encode();
        enc.pop();
        assert!(PausedPacket::decode(&enc).is_none());
    }

    #[test]
    fn script_packet_carries_bytecode() {
        let p = ScriptPacket {
            script_buffer_pointer: 4,
            is_format: true,
            result: KernelStatus::SUCCESS,
            bytecode: vec![0x10, 0x20, 0x30],
        };
        assert_eq!(ScriptPacket::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn event_registration_round_trips() {
        let p = EventRegistrationPacket {
            tag: 0x2000_0000,
            kind: 11,
            core_id: 0xffff_ffff,
            process_id: 4,
            optional_params: [0xC000_0080, 0, 0, 0],
            condition_bytecode: vec![1, 2, 3, 4],
        };
        assert_eq!(EventRegistrationPacket::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn bp_packet_round_trips() {
        let p = BpPacket {
            address: 0xffff_f801_2233_4455,
            pid: 0xffff_ffff,
            tid: 0xffff_ffff,
            core: 0xffff_ffff,
            result: KernelStatus::SUCCESS,
        };
        assert_eq!(BpPacket::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn translation_packet_round_trips() {
        let p = AddressTranslationPacket {
            address: 0xffff_8000_0000_1000,
            translated: 0x1000,
            pid: 4,
            direction: TranslationDirection::VirtualToPhysical,
            result: KernelStatus::SUCCESS,
        };
        assert_eq!(AddressTranslationPacket::decode(&p.encode()).unwrap(), p);
    }
}
