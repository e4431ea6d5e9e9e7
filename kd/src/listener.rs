//! The debugger-side listener.
//!
//! Mirrors the debuggee state machine on the other end of the serial
//! link: a reader loop that reassembles frames, validates them for this
//! side, and routes each packet either to the front-end (pauses, logs)
//! or to whoever is waiting for a command result. A zero-length read
//! surfaces as [`SerialError::Disconnected`] and tears the session state
//! down so a new connection starts clean.

use crate::serial::{receive_packet, SerialError, SerialIo};
use alloc::vec::Vec;
use wire::payloads::PausedPacket;
use wire::types::{DebuggeeAction, PacketKind};
use wire::FrameAssembler;

/// Front-end callbacks for packets that are not command results.
pub trait DebuggerFrontend {
    /// The debuggee came up and is listening.
    fn debuggee_started(&mut self);

    /// A core paused; `packet` carries the snapshot.
    fn paused(&mut self, packet: PausedPacket);

    /// A chunk from the debuggee's logging channel.
    fn log_arrived(&mut self, bytes: &[u8]);

    /// The result payload of a previously issued command.
    fn command_result(&mut self, action: DebuggeeAction, payload: &[u8]);
}

/// Debugger-side view of the session.
#[derive(Default)]
pub struct SessionState {
    /// Whether the debuggee is currently paused.
    pub is_paused: bool,
    /// Pause snapshots seen since connecting, newest last.
    pub pauses: Vec<PausedPacket>,
    /// Breakpoint ids the debugger believes exist.
    pub breakpoint_ids: Vec<u64>,
    /// Event tags the debugger believes are registered.
    pub event_tags: Vec<u64>,
}

impl SessionState {
    /// Forget everything; used after a disconnection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The listener loop.
pub struct Listener {
    assembler: FrameAssembler,
    pub state: SessionState,
}

impl Listener {
    pub fn new() -> Self {
        Self {
            assembler: FrameAssembler::new(),
            state: SessionState::default(),
        }
    }

    /// Service packets until the transport fails.
    ///
    /// Always returns the terminating error; on
    /// [`SerialError::Disconnected`] the session state has already been
    /// reset.
    pub fn run(
        &mut self,
        io: &mut dyn SerialIo,
        frontend: &mut dyn DebuggerFrontend,
    ) -> SerialError {
        loop {
            let (header, payload) = match receive_packet(
                io,
                &mut self.assembler,
                PacketKind::accepted_by_debugger,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    if e == SerialError::Disconnected {
                        self.state.reset();
                        self.assembler.reset();
                    }
                    return e;
                }
            };
            let Ok(action) = DebuggeeAction::try_from(header.action) else {
                warn!("unknown debuggee action {:#x}", header.action);
                continue;
            };
            self.route(action, &payload, frontend);
        }
    }

    fn route(
        &mut self,
        action: DebuggeeAction,
        payload: &[u8],
        frontend: &mut dyn DebuggerFrontend,
    ) {
        match action {
            DebuggeeAction::NoAction => {}
            DebuggeeAction::Started => {
                self.state.reset();
                frontend.debuggee_started();
            }
            DebuggeeAction::LoggingMechanism => frontend.log_arrived(payload),
            DebuggeeAction::PausedAndCurrentInstruction => {
                match PausedPacket::decode(payload) {
                    Some(packet) => {
                        self.state.is_paused = true;
                        self.state.pauses.push(packet);
                        frontend.paused(packet);
                    }
                    None => warn!("undecodable paused packet ({} bytes)", payload.len()),
                }
            }
            other => {
                if other == DebuggeeAction::ResultOfChangingCore {
                    // A successful core switch is followed by a fresh
                    // paused packet from the new conductor.
                    self.state.is_paused = false;
                }
                frontend.command_result(other, payload);
            }
        }
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::send_packet;
    use alloc::collections::VecDeque;
    use wire::error::KernelStatus;
    use wire::types::PausingReason;

    struct Script {
        bytes: VecDeque<u8>,
    }

    impl SerialIo for Script {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), SerialError> {
            Ok(())
        }

        fn read_byte(&mut self) -> Result<Option<u8>, SerialError> {
            match self.bytes.pop_front() {
                Some(b) => Ok(Some(b)),
                None => Err(SerialError::Disconnected),
            }
        }
    }

    #[derive(Default)]
    struct RecordingFrontend {
        started: usize,
        pauses: Vec<PausedPacket>,
        results: Vec<(DebuggeeAction, Vec<u8>)>,
    }

    impl DebuggerFrontend for RecordingFrontend {
        fn debuggee_started(&mut self) {
            self.started += 1;
        }

        fn paused(&mut self, packet: PausedPacket) {
            self.pauses.push(packet);
        }

        fn log_arrived(&mut self, _bytes: &[u8]) {}

        fn command_result(&mut self, action: DebuggeeAction, payload: &[u8]) {
            self.results.push((action, payload.to_vec()));
        }
    }

    fn paused_packet(core: u32) -> PausedPacket {
        PausedPacket {
            rip: 0xFFFF_F801_0010_0050,
            is_32bit_address: false,
            reason: PausingReason::SoftwareBreakpointHit,
            current_core: core,
            event_tag: 7,
            rflags: 0x202,
            instruction_bytes: [0x90; 16],
        }
    }

    fn wire_up(packets: &[(DebuggeeAction, Vec<u8>)]) -> Script {
        let mut sink = Script {
            bytes: VecDeque::new(),
        };
        let mut staging = Vec::new();
        for (action, payload) in packets {
            let mut buffer = CollectingIo(Vec::new());
            send_packet(
                &mut buffer,
                PacketKind::DebuggeeToDebugger,
                (*action).into(),
                payload,
            )
            .unwrap();
            staging.extend_from_slice(&buffer.0);
        }
        sink.bytes = staging.into();
        sink
    }

    struct CollectingIo(Vec<u8>);

    impl SerialIo for CollectingIo {
        fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
            self.0.extend_from_slice(bytes);
            Ok(())
        }

        fn read_byte(&mut self) -> Result<Option<u8>, SerialError> {
            Err(SerialError::Io)
        }
    }

    #[test]
    fn one_pause_per_core_is_recorded() {
        // A 4-core halt produces four paused packets with distinct cores.
        let mut io = wire_up(&[
            (DebuggeeAction::Started, Vec::new()),
            (DebuggeeAction::PausedAndCurrentInstruction, paused_packet(0).encode()),
            (DebuggeeAction::PausedAndCurrentInstruction, paused_packet(1).encode()),
            (DebuggeeAction::PausedAndCurrentInstruction, paused_packet(2).encode()),
            (DebuggeeAction::PausedAndCurrentInstruction, paused_packet(3).encode()),
        ]);
        let mut listener = Listener::new();
        let mut frontend = RecordingFrontend::default();
        let err = listener.run(&mut io, &mut frontend);
        assert_eq!(err, SerialError::Disconnected);

        assert_eq!(frontend.started, 1);
        let mut cores: Vec<u32> = frontend.pauses.iter().map(|p| p.current_core).collect();
        cores.sort_unstable();
        assert_eq!(cores, vec![0, 1, 2, 3]);
    }

    #[test]
    fn results_are_routed_and_disconnect_resets_state() {
        let status = KernelStatus::SUCCESS.0.to_le_bytes().to_vec();
        let mut io = wire_up(&[
            (DebuggeeAction::PausedAndCurrentInstruction, paused_packet(0).encode()),
            (DebuggeeAction::ResultOfFlush, status.clone()),
        ]);
        let mut listener = Listener::new();
        let mut frontend = RecordingFrontend::default();
        let err = listener.run(&mut io, &mut frontend);
        assert_eq!(err, SerialError::Disconnected);
        assert_eq!(frontend.results, vec![(DebuggeeAction::ResultOfFlush, status)]);
        // The disconnection wiped the session view.
        assert!(!listener.state.is_paused);
        assert!(listener.state.pauses.is_empty());
    }

    #[test]
    fn garbage_before_a_frame_resynchronizes_on_the_next_sentinel() {
        let mut io = wire_up(&[
            (DebuggeeAction::Started, Vec::new()),
            (DebuggeeAction::Started, Vec::new()),
        ]);
        // Garbage glued to the front corrupts the first frame only; the
        // sentinel search resynchronizes and the second one parses.
        let mut bytes: VecDeque<u8> = [0u8, 0, 0x55, 0xAA].into_iter().collect();
        bytes.extend(io.bytes.drain(..));
        io.bytes = bytes;

        let mut listener = Listener::new();
        let mut frontend = RecordingFrontend::default();
        listener.run(&mut io, &mut frontend);
        assert_eq!(frontend.started, 1);
    }
}
