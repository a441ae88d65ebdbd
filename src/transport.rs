//! Half-duplex byte transport.
//!
//! Owns the receive state machine and the bounded inbound frame queue,
//! and serialises all transmissions behind the bus-silence gate: the
//! master only starts talking once the wire has been quiet for a full
//! silence window, and at most one outbound frame is in flight.

use thiserror::Error;

use crate::config::Config;
use crate::frame::{self, Deframer, FrameBuf, WireBuf};
use crate::time::Clock;

/// Decoded frames the inbound queue holds before overflowing.
const INBOUND_DEPTH: usize = 8;

/// Byte-level port onto the physical bus.
///
/// Implementations must never block in [`read_byte`](ByteChannel::read_byte).
/// Full-duplex drivers must suppress the echo of the master's own
/// transmission; with half-duplex direction control the receiver is mute
/// while transmitting and nothing needs doing.
pub trait ByteChannel {
	/// Writes the whole buffer onto the wire.
	fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

	/// Fetches the next received byte, if one is pending.
	fn read_byte(&mut self) -> Option<u8>;
}

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportError {
	/// The bus never stayed quiet long enough to transmit.
	#[error("bus did not become silent in time")]
	BusBusy,
	/// The driver rejected the write.
	#[error("channel write failed")]
	Io,
	#[error("message exceeds the frame capacity")]
	Oversize,
}

/// Monotonic transport counters, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
	pub frames_tx: u32,
	pub frames_rx: u32,
	pub crc_errors: u32,
	pub watchdog_resets: u32,
	pub rx_overflows: u32,
}

pub(crate) struct Transport<C> {
	channel: C,
	deframer: Deframer,
	inbound: heapless::Deque<FrameBuf, INBOUND_DEPTH>,
	last_activity_ms: u64,
	pub(crate) stats: TransportStats,
}

impl<C: ByteChannel> Transport<C> {
	pub fn new(channel: C) -> Self {
		Self {
			channel,
			deframer: Deframer::new(),
			inbound: heapless::Deque::new(),
			last_activity_ms: 0,
			stats: TransportStats::default(),
		}
	}

	/// Drains the channel into the deframer and runs its watchdog.
	///
	/// Completed frames land on the inbound queue. When the queue is
	/// full the *new* frame is dropped: stale replies will already be
	/// timing out, fresher ones still stand a chance on retry.
	pub fn poll(&mut self, now_ms: u64, config: &Config) {
		while let Some(byte) = self.channel.read_byte() {
			self.last_activity_ms = now_ms;
			if let Some(frame) = self.deframer.push_byte(byte, now_ms) {
				if self.inbound.is_full() {
					self.stats.rx_overflows += 1;
					warn!(target: "protocol", "inbound queue full, frame dropped");
				} else {
					self.stats.frames_rx += 1;
					let _ = self.inbound.push_back(frame);
				}
			}
		}
		if self.deframer.watchdog(now_ms, config.bus_silence_ms) {
			self.stats.watchdog_resets += 1;
			debug!(target: "protocol", "deframer reset by bus-silence watchdog");
		}
	}

	/// Takes the oldest decoded frame off the inbound queue.
	pub fn take_frame(&mut self) -> Option<FrameBuf> {
		self.inbound.pop_front()
	}

	/// Escapes, delimits and transmits one message.
	///
	/// Cooperatively waits for the bus-silence window first; gives up
	/// with [`TransportError::BusBusy`] once twice the window has passed
	/// without a gap, so contention cannot stall callers forever.
	pub fn send<K: Clock>(
		&mut self,
		msg: &[u8],
		clock: &K,
		config: &Config,
	) -> Result<(), TransportError> {
		let limit = clock.now_ms() + 2 * config.bus_silence_ms;
		loop {
			let now = clock.now_ms();
			self.poll(now, config);
			if now.saturating_sub(self.last_activity_ms) >= config.bus_silence_ms {
				break;
			}
			if now >= limit {
				return Err(TransportError::BusBusy);
			}
			clock.yield_now();
		}

		let mut wire = WireBuf::new();
		frame::encode(msg, &mut wire).map_err(|_| TransportError::Oversize)?;
		self.channel.write_all(&wire)?;
		self.stats.frames_tx += 1;
		self.last_activity_ms = clock.now_ms();
		trace!(target: "protocol", "tx {} bytes to {:#04x}", msg.len(), msg[3]);
		Ok(())
	}
}
