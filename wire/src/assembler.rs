//! Byte-oriented frame assembly.
//!
//! The receiving side gets one byte at a time from the UART and appends
//! until the four sentinel bytes appear at the tail of the growing
//! buffer. Malformed frames restart the sentinel search; no recoverable
//! error ever aborts the connection.

use crate::packet::{PacketError, PacketHeader, MAX_SERIAL_PACKET_SIZE, SENTINEL};
use alloc::vec::Vec;

/// What the assembler produced for one input byte.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FrameEvent {
    /// Nothing complete yet.
    Pending,
    /// A complete, validated frame: header plus payload bytes.
    Frame(PacketHeader, Vec<u8>),
    /// A recoverable framing error; the assembler has already reset and
    /// resumed the sentinel search.
    Dropped(FrameError),
}

/// Recoverable frame errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameError {
    /// The buffer grew past [`MAX_SERIAL_PACKET_SIZE`] without a sentinel.
    Oversized,
    /// The frame body failed header/checksum validation.
    Malformed(PacketError),
}

/// Incremental frame assembler.
///
/// Zero-length reads and lone NUL bytes before a frame has started are
/// treated as spurious wakeups (the peer may cancel an overlapped read);
/// they produce [`FrameEvent::Pending`] without growing the buffer.
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// A fresh assembler.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed one received byte.
    pub fn push(&mut self, byte: u8) -> FrameEvent {
        if self.buffer.is_empty() && byte == 0 {
            // Spurious NUL between frames.
            return FrameEvent::Pending;
        }
        self.buffer.push(byte);

        if self.buffer.len() >= SENTINEL.len() && self.buffer[self.buffer.len() - SENTINEL.len()..] == SENTINEL {
            let mut body = core::mem::take(&mut self.buffer);
            body.truncate(body.len() - SENTINEL.len());
            return match PacketHeader::decode_frame(&body) {
                Ok((header, payload)) => FrameEvent::Frame(header, payload.to_vec()),
                Err(e) => FrameEvent::Dropped(FrameError::Malformed(e)),
            };
        }

        if self.buffer.len() >= MAX_SERIAL_PACKET_SIZE {
            // No sentinel can complete a frame within bounds any more.
            self.buffer.clear();
            return FrameEvent::Dropped(FrameError::Oversized);
        }

        FrameEvent::Pending
    }

    /// Feed a received chunk, collecting any completed frames.
    pub fn push_slice(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        let mut out = Vec::new();
        for b in bytes {
            match self.push(*b) {
                FrameEvent::Pending => {}
                ev => out.push(ev),
            }
        }
        out
    }

    /// Drop any partial frame (used after a disconnection).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketHeader, HEADER_SIZE};
    use crate::types::{DebuggerAction, PacketKind};

    fn frame(payload: &[u8]) -> Vec<u8> {
        PacketHeader {
            kind: PacketKind::DebuggerToDebuggeeVmxRoot,
            action: DebuggerAction::ReadMemory.into(),
        }
        .encode_frame(payload)
    }

    #[test]
    fn reassembles_byte_by_byte() {
        let wire = frame(b"abc");
        let mut asm = FrameAssembler::new();
        let mut events = Vec::new();
        for b in &wire {
            match asm.push(*b) {
                FrameEvent::Pending => {}
                ev => events.push(ev),
            }
        }
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Frame(h, p) => {
                assert_eq!(h.action, u32::from(DebuggerAction::ReadMemory));
                assert_eq!(p.as_slice(), b"abc");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut wire = frame(b"one");
        wire.extend_from_slice(&frame(b"two"));
        let mut asm = FrameAssembler::new();
        let events = asm.push_slice(&wire);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], FrameEvent::Frame(_, p) if p.as_slice() == b"one"));
        assert!(matches!(&events[1], FrameEvent::Frame(_, p) if p.as_slice() == b"two"));
    }

    #[test]
    fn leading_nuls_are_spurious_wakeups() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.push(0), FrameEvent::Pending);
        assert_eq!(asm.push(0), FrameEvent::Pending);
        let events = asm.push_slice(&frame(b"x"));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FrameEvent::Frame(_, _)));
    }

    #[test]
    fn corrupt_frame_is_dropped_and_stream_resynchronizes() {
        let mut bad = frame(b"payload");
        bad[2] ^= 0x55; // damage the indicator
        let mut asm = FrameAssembler::new();
        let mut events = asm.push_slice(&bad);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            FrameEvent::Dropped(FrameError::Malformed(PacketError::BadIndicator))
        ));

        // The next good frame still parses.
        events = asm.push_slice(&frame(b"good"));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FrameEvent::Frame(_, p) if p.as_slice() == b"good"));
    }

    #[test]
    fn exact_maximum_size_is_accepted_one_more_is_not() {
        // A frame whose total size is exactly MAX_SERIAL_PACKET_SIZE.
        let payload_len = MAX_SERIAL_PACKET_SIZE - HEADER_SIZE - SENTINEL.len();
        let payload = vec![0xAA; payload_len];
        let wire = frame(&payload);
        assert_eq!(wire.len(), MAX_SERIAL_PACKET_SIZE);

        let mut asm = FrameAssembler::new();
        let events = asm.push_slice(&wire);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FrameEvent::Frame(_, p) if p.len() == payload_len));

        // One extra byte of garbage in front pushes the would-be frame past
        // the cap before its sentinel arrives.
        let mut oversized = vec![0x11u8];
        oversized.extend_from_slice(&wire);
        let mut asm = FrameAssembler::new();
        let events = asm.push_slice(&oversized);
        assert!(events
            .iter()
            .any(|e| matches!(e, FrameEvent::Dropped(FrameError::Oversized))));
    }
}
