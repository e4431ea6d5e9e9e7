//! The debugger <-> debuggee wire protocol.
//!
//! Every packet on the serial link is framed as
//!
//! ```text
//! [16-byte header][typed payload][00 80 EE FF]
//! ```
//!
//! with a one-byte additive checksum in the header covering everything
//! after the checksum byte itself. The integer values of every enum in
//! this crate are part of the protocol: both ends carry them raw, and a
//! version mismatch is only ever detected by the indicator check.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod assembler;
pub mod error;
pub mod ioctl;
pub mod packet;
pub mod payloads;
pub mod types;

pub use assembler::{FrameAssembler, FrameError, FrameEvent};
pub use error::ErrorCode;
pub use packet::{checksum, PacketHeader, HEADER_SIZE, INDICATOR, MAX_SERIAL_PACKET_SIZE, SENTINEL};
pub use types::{DebuggeeAction, DebuggerAction, PacketKind, PausingReason};
