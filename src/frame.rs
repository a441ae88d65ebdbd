//! Escape-based frame delimiting.
//!
//! On the wire a message travels as `STX, <escaped bytes>, ETX`. Any
//! inner byte colliding with STX, ETX or DLE is replaced by the pair
//! `DLE, byte ^ DLE`. The receive side runs a three-state machine and a
//! bus-silence watchdog that recovers from interrupted frames.

use core::mem;

use thiserror::Error;

use crate::config::{DLE, ETX, MAX_FRAME, STX};

/// Worst case wire size of a frame: every byte escaped plus delimiters.
pub const MAX_WIRE: usize = 2 * MAX_FRAME + 2;

/// One deframed message, delimiters and escapes removed.
pub type FrameBuf = heapless::Vec<u8, MAX_FRAME>;

/// Escaped wire image of one frame.
pub type WireBuf = heapless::Vec<u8, MAX_WIRE>;

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
	#[error("message exceeds the frame capacity")]
	Oversize,
}

/// Escapes and delimits `msg` into `out`.
pub fn encode(msg: &[u8], out: &mut WireBuf) -> Result<(), FrameError> {
	if msg.len() > MAX_FRAME {
		return Err(FrameError::Oversize);
	}

	out.clear();
	// Capacity is sized for the fully escaped worst case, so the pushes
	// below cannot fail.
	out.push(STX).unwrap();
	for &byte in msg {
		if byte == STX || byte == ETX || byte == DLE {
			out.push(DLE).unwrap();
			out.push(byte ^ DLE).unwrap();
		} else {
			out.push(byte).unwrap();
		}
	}
	out.push(ETX).unwrap();
	Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
	/// Outside any frame; everything but STX is dropped.
	Listen,
	/// Accumulating message bytes.
	Busy,
	/// A DLE was seen; the next byte is XORed back.
	Escaping,
}

/// Receive state machine turning a byte stream back into messages.
#[derive(Debug)]
pub struct Deframer {
	state: State,
	buf: FrameBuf,
	last_byte_ms: u64,
}

impl Deframer {
	pub const fn new() -> Self {
		Self {
			state: State::Listen,
			buf: FrameBuf::new(),
			last_byte_ms: 0,
		}
	}

	/// Feeds one received byte; returns a complete message on ETX.
	pub fn push_byte(&mut self, byte: u8, now_ms: u64) -> Option<FrameBuf> {
		self.last_byte_ms = now_ms;
		match self.state {
			State::Listen => {
				if byte == STX {
					self.state = State::Busy;
					self.buf.clear();
				}
				None
			}
			State::Busy => match byte {
				DLE => {
					self.state = State::Escaping;
					None
				}
				ETX => {
					self.state = State::Listen;
					Some(mem::take(&mut self.buf))
				}
				// A raw STX inside a frame means the previous one was cut
				// short; restart so no unescaped delimiter is ever handed
				// upward.
				STX => {
					debug!(target: "protocol", "frame restarted by raw STX");
					self.buf.clear();
					None
				}
				_ => {
					self.append(byte);
					None
				}
			},
			State::Escaping => {
				self.state = State::Busy;
				self.append(byte ^ DLE);
				None
			}
		}
	}

	/// Forces the machine back to listening if mid-frame and no byte has
	/// arrived for a full silence window. Returns whether a reset fired.
	pub fn watchdog(&mut self, now_ms: u64, silence_ms: u64) -> bool {
		if self.state != State::Listen
			&& now_ms.saturating_sub(self.last_byte_ms) >= silence_ms
		{
			self.state = State::Listen;
			self.buf.clear();
			true
		} else {
			false
		}
	}

	pub fn is_idle(&self) -> bool {
		self.state == State::Listen
	}

	fn append(&mut self, byte: u8) {
		// On overflow the byte is dropped; the truncated message will be
		// rejected by its CRC.
		let _ = self.buf.push(byte);
	}
}

impl Default for Deframer {
	fn default() -> Self {
		Self::new()
	}
}
