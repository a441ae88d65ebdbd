//! Master-side protocol engine for the RGB button chaser bus.
//!
//! A single master coordinates up to 31 addressable button nodes over a
//! half-duplex multidrop serial line. This crate implements the message
//! layer of that bus and the node-state manager on top of it: escape-based
//! framing with CRC-8 integrity, the fixed-header message codec, the
//! half-duplex transmit discipline, broadcast roll-call discovery and
//! registration, per-node command pipelining with strictly ordered
//! response matching, bounded retries, broadcast composition behind an
//! addressee mask, and the three-step time synchronisation handshake.
//!
//! The crate is hardware agnostic. Hosts provide a [`ByteChannel`] for the
//! wire and a [`Clock`] for time and cooperative yielding; everything else
//! happens inside [`ProtocolEngine`]. The engine is single threaded and
//! cooperative: every wait is a poll/yield loop, so a blocked caller never
//! starves inbound processing.

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

pub mod config;
pub mod crc;
pub mod engine;
pub mod frame;
pub mod time;
pub mod transport;
pub mod wire;

pub use crate::config::Config;
pub use crate::crc::Crc8;
pub use crate::engine::node::{ButtonState, DbgLed, NodeFlags};
pub use crate::engine::{NodeError, ProtocolEngine, SyncTarget};
pub use crate::time::Clock;
pub use crate::transport::{ByteChannel, TransportError, TransportStats};
pub use crate::wire::cmd::{Cmd, ResponseCode};
pub use crate::wire::{Header, Message, WireError};
