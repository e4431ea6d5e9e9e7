//! The kernel-debugger core.
//!
//! Pausing the guest means halting every logical processor: the
//! initiating core raises an NMI broadcast, each receiver parks in a
//! VMX-root spin, and exactly one core at a time (the *conductor*)
//! talks to the remote debugger over the serial transport. Commands
//! execute right there in VMX root against the hypervisor's memory
//! mapper, EPT hook engine and event engine, and the answers travel back
//! as framed packets.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod breakpoints;
pub mod commands;
pub mod debuggee;
pub mod listener;
pub mod serial;
pub mod stepping;

pub use debuggee::Debuggee;
pub use serial::{SerialError, SerialIo};
