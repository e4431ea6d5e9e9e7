//! Serial transport plumbing shared by both ends of the link.

use alloc::vec::Vec;
use wire::types::PacketKind;
use wire::{FrameAssembler, FrameEvent, PacketHeader};

/// Transport failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SerialError {
    /// The peer closed the connection (zero-length read with a NUL first
    /// byte, or carrier drop).
    Disconnected,
    /// The device rejected the operation.
    Io,
}

/// A byte-oriented serial port.
///
/// The debuggee side implements this over the 16550 UART with blocking
/// reads from VMX root; the debugger side wraps its overlapped COM-port
/// handle. Both only need these two operations.
pub trait SerialIo {
    /// Write the whole buffer as one operation.
    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError>;

    /// Read one byte, blocking until it arrives.
    ///
    /// `Ok(None)` is a spurious wakeup (the peer may cancel an overlapped
    /// read); callers loop.
    fn read_byte(&mut self) -> Result<Option<u8>, SerialError>;
}

/// Send one framed packet: header, payload, end-of-buffer sentinel, as a
/// single write.
pub fn send_packet(
    io: &mut dyn SerialIo,
    kind: PacketKind,
    action: u32,
    payload: &[u8],
) -> Result<(), SerialError> {
    let frame = PacketHeader { kind, action }.encode_frame(payload);
    io.write(&frame)
}

/// Receive the next valid frame addressed to this side.
///
/// Frames failing the indicator, side, or checksum test are dropped with
/// a diagnostic and the sentinel search restarts; only a transport-level
/// failure ends the loop.
pub fn receive_packet(
    io: &mut dyn SerialIo,
    assembler: &mut FrameAssembler,
    accept: fn(PacketKind) -> bool,
) -> Result<(PacketHeader, Vec<u8>), SerialError> {
    loop {
        let byte = match io.read_byte()? {
            Some(byte) => byte,
            None => continue,
        };
        match assembler.push(byte) {
            FrameEvent::Pending => {}
            FrameEvent::Frame(header, payload) => {
                if !accept(header.kind) {
                    warn!("dropping packet of kind {:?} not meant for this side", header.kind);
                    continue;
                }
                return Ok((header, payload));
            }
            FrameEvent::Dropped(e) => {
                warn!("dropping malformed frame: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::types::DebuggerAction;

    /// Loopback transport over an in-memory byte queue.
    pub struct Loopback {
        pub bytes: alloc::collections::VecDeque<u8>,
        pub written: Vec<u8>,
    }

    impl Loopback {
        pub fn new() -> Self {
            Self {
                bytes: alloc::collections::VecDeque::new(),
                written: Vec::new(),
            }
        }
    }

    impl SerialIo for Loopback {
        fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
            self.written.extend_from_slice(bytes);
            Ok(())
        }

        fn read_byte(&mut self) -> Result<Option<u8>, SerialError> {
            match self.bytes.pop_front() {
                Some(b) => Ok(Some(b)),
                None => Err(SerialError::Disconnected),
            }
        }
    }

    #[test]
    fn send_then_receive_round_trip() {
        let mut io = Loopback::new();
        send_packet(
            &mut io,
            PacketKind::DebuggerToDebuggeeVmxRoot,
            DebuggerAction::Continue.into(),
            b"payload",
        )
        .unwrap();
        io.bytes = io.written.drain(..).collect();

        let mut assembler = FrameAssembler::new();
        let (header, payload) =
            receive_packet(&mut io, &mut assembler, PacketKind::accepted_by_debuggee).unwrap();
        assert_eq!(header.kind, PacketKind::DebuggerToDebuggeeVmxRoot);
        assert_eq!(header.action, u32::from(DebuggerAction::Continue));
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn wrong_side_packets_are_skipped() {
        let mut io = Loopback::new();
        // A debuggee-to-debugger packet followed by a proper one.
        send_packet(&mut io, PacketKind::DebuggeeToDebugger, 1, b"no").unwrap();
        send_packet(
            &mut io,
            PacketKind::DebuggerToDebuggeeVmxRoot,
            DebuggerAction::Step.into(),
            b"yes",
        )
        .unwrap();
        io.bytes = io.written.drain(..).collect();

        let mut assembler = FrameAssembler::new();
        let (header, payload) =
            receive_packet(&mut io, &mut assembler, PacketKind::accepted_by_debuggee).unwrap();
        assert_eq!(header.action, u32::from(DebuggerAction::Step));
        assert_eq!(payload, b"yes");
    }

    #[test]
    fn disconnection_surfaces() {
        let mut io = Loopback::new();
        let mut assembler = FrameAssembler::new();
        assert_eq!(
            receive_packet(&mut io, &mut assembler, PacketKind::accepted_by_debuggee),
            Err(SerialError::Disconnected)
        );
    }
}
