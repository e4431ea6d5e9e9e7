//! Packet header, framing constants and checksum.

use crate::types::PacketKind;
use alloc::vec::Vec;

/// The eight-byte magic leading every packet: the ASCII text "HYPERDBG"
/// read as a big-endian integer, emitted on the wire in that byte order.
pub const INDICATOR: u64 = 0x4859_5045_5244_4247;

/// The four terminator bytes closing every frame.
pub const SENTINEL: [u8; 4] = [0x00, 0x80, 0xEE, 0xFF];

/// Size of one payload chunk carried by logging/message packets.
pub const PACKET_CHUNK_SIZE: usize = 3000;

/// Size of the buffer user-mode exchanges with the kernel:
/// a length dword, one chunk, and a terminating NUL.
pub const USERMODE_BUFFER_SIZE: usize = 4 + PACKET_CHUNK_SIZE + 1;

/// Size of the encoded header on the wire.
pub const HEADER_SIZE: usize = 16;

/// Hard cap on a serial frame, sentinel included. One byte more is a
/// protocol error and resets the receiver.
pub const MAX_SERIAL_PACKET_SIZE: usize = USERMODE_BUFFER_SIZE + HEADER_SIZE + SENTINEL.len();

/// The additive checksum: the low byte of the sum of every byte after the
/// checksum field, i.e. header bytes 1.. plus the whole payload.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A parsed packet header.
///
/// Wire layout (16 bytes, explicit; no compiler-dependent padding):
///
/// | offset | size | field |
/// |--------|------|------------------------------|
/// | 0      | 1    | checksum                     |
/// | 1      | 8    | indicator (big-endian text)  |
/// | 9      | 1    | packet kind                  |
/// | 10     | 4    | requested action (LE)        |
/// | 14     | 2    | reserved, zero               |
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    /// Direction/privilege class.
    pub kind: PacketKind,
    /// Raw requested action; interpreted against `kind` by the receiver.
    pub action: u32,
}

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketError {
    /// Not enough bytes for a header.
    Truncated,
    /// The indicator magic did not match.
    BadIndicator,
    /// The packet kind byte was not a known value.
    BadKind,
    /// The checksum over indicator..payload did not match.
    BadChecksum,
}

impl PacketHeader {
    /// Encode this header plus `payload` into a complete frame, sentinel
    /// included.
    pub fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + SENTINEL.len());
        out.push(0); // checksum placeholder
        out.extend_from_slice(&INDICATOR.to_be_bytes());
        out.push(u8::from(self.kind));
        out.extend_from_slice(&self.action.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(payload);
        out[0] = checksum(&out[1..]);
        out.extend_from_slice(&SENTINEL);
        out
    }

    /// Decode a frame body (header + payload, sentinel already stripped),
    /// validating indicator and checksum. Returns the header and payload.
    pub fn decode_frame(body: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if body.len() < HEADER_SIZE {
            return Err(PacketError::Truncated);
        }
        let indicator = u64::from_be_bytes(body[1..9].try_into().unwrap());
        if indicator != INDICATOR {
            return Err(PacketError::BadIndicator);
        }
        let kind = PacketKind::try_from(body[9]).map_err(|_| PacketError::BadKind)?;
        if checksum(&body[1..]) != body[0] {
            return Err(PacketError::BadChecksum);
        }
        let action = u32::from_le_bytes(body[10..14].try_into().unwrap());
        Ok((
            Self { kind, action },
            &body[HEADER_SIZE..],
        ))
    }
}
