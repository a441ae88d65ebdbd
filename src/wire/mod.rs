//! Message codec: a fixed header followed by a run of command records.
//!
//! A message is `version, id, src, dst` packed into four bytes, then the
//! concatenated command records, then one trailing CRC byte. Record
//! lengths come from the catalogue, never from the payload itself.

pub mod cmd;

use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

use self::cmd::{Cmd, ResponseCode, response_len};
use crate::config::{ADDR_MASTER, MAX_FRAME, PROTOCOL_VERSION};
use crate::crc::Crc8;

/// Packed frame header.
#[derive(
	zerocopy_derive::FromZeroes,
	zerocopy_derive::FromBytes,
	zerocopy_derive::AsBytes,
	zerocopy_derive::Unaligned,
	Clone,
	Copy,
	Debug,
	PartialEq,
	Eq,
)]
#[repr(C)]
pub struct Header {
	pub version: u8,
	pub id: u8,
	pub src: u8,
	pub dst: u8,
}

pub const HEADER_LEN: usize = core::mem::size_of::<Header>();

/// Bytes one frame can devote to command records.
pub const MAX_PAYLOAD: usize = MAX_FRAME - HEADER_LEN - 1;

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
	#[error("message would exceed the frame capacity")]
	CapacityExceeded,
	#[error("payload of {got} bytes where the catalogue wants {want}")]
	PayloadLen { want: usize, got: usize },
	#[error("frame truncated")]
	Truncated,
	#[error("crc mismatch")]
	Crc,
	#[error("unsupported protocol version {0}")]
	BadVersion(u8),
	#[error("unknown command id {0:#04x}")]
	UnknownCmd(u8),
	#[error("unknown response code {0:#04x}")]
	UnknownResponse(u8),
}

/// An outbound message under construction.
///
/// The buffer always reserves the trailing CRC byte; [`Message::finalize`]
/// consumes the builder so a frame cannot be stamped twice.
#[derive(Clone, Debug)]
pub struct Message {
	buf: heapless::Vec<u8, MAX_FRAME>,
}

impl Message {
	/// Starts a message from the master to `dst`.
	pub fn new(dst: u8) -> Self {
		let header = Header {
			version: PROTOCOL_VERSION,
			id: 0,
			src: ADDR_MASTER,
			dst,
		};
		let mut buf = heapless::Vec::new();
		buf.extend_from_slice(header.as_bytes()).unwrap();
		Self { buf }
	}

	pub fn dst(&self) -> u8 {
		self.buf[3]
	}

	/// Whether any record has been appended yet.
	pub fn is_empty(&self) -> bool {
		self.buf.len() == HEADER_LEN
	}

	/// Payload bytes still available for records.
	pub fn remaining(&self) -> usize {
		MAX_FRAME - 1 - self.buf.len()
	}

	/// Appends one command record, validated against the catalogue.
	pub fn append(&mut self, cmd: Cmd, payload: &[u8]) -> Result<(), WireError> {
		if payload.len() != cmd.mosi_len() {
			return Err(WireError::PayloadLen {
				want: cmd.mosi_len(),
				got: payload.len(),
			});
		}
		if 1 + payload.len() > self.remaining() {
			return Err(WireError::CapacityExceeded);
		}
		self.buf.push(cmd.into()).unwrap();
		self.buf.extend_from_slice(payload).unwrap();
		Ok(())
	}

	/// Stamps the sequence id, appends the CRC and returns the wire image.
	pub fn finalize(mut self, id: u8, crc: &Crc8) -> heapless::Vec<u8, MAX_FRAME> {
		self.buf[1] = id;
		let sum = crc.compute(&self.buf);
		self.buf.push(sum).unwrap();
		self.buf
	}
}

/// Splits a deframed message into header and record bytes.
///
/// Rejects frames that are too short, oversized, CRC-damaged or of a
/// foreign protocol revision.
pub fn parse<'a>(bytes: &'a [u8], crc: &Crc8) -> Result<(Header, &'a [u8]), WireError> {
	if bytes.len() < HEADER_LEN + 1 {
		return Err(WireError::Truncated);
	}
	if bytes.len() > MAX_FRAME {
		return Err(WireError::CapacityExceeded);
	}
	if !crc.validate(bytes) {
		return Err(WireError::Crc);
	}
	let header = Header::read_from_prefix(bytes).ok_or(WireError::Truncated)?;
	if header.version != PROTOCOL_VERSION {
		return Err(WireError::BadVersion(header.version));
	}
	Ok((header, &bytes[HEADER_LEN..bytes.len() - 1]))
}

/// One decoded reply record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseRecord<'a> {
	pub cmd: Cmd,
	pub code: ResponseCode,
	pub data: &'a [u8],
}

/// Walks the reply records of an inbound payload in order.
pub fn responses(payload: &[u8]) -> ResponseIter<'_> {
	ResponseIter { rest: payload }
}

pub struct ResponseIter<'a> {
	rest: &'a [u8],
}

impl<'a> Iterator for ResponseIter<'a> {
	type Item = Result<ResponseRecord<'a>, WireError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.rest.is_empty() {
			return None;
		}
		let result = self.take_record();
		if result.is_err() {
			// Poisoned tail; do not yield further records.
			self.rest = &[];
		}
		Some(result)
	}
}

impl<'a> ResponseIter<'a> {
	fn take_record(&mut self) -> Result<ResponseRecord<'a>, WireError> {
		let cmd = Cmd::try_from(self.rest[0])
			.map_err(|_| WireError::UnknownCmd(self.rest[0]))?;
		let code_byte = *self.rest.get(1).ok_or(WireError::Truncated)?;
		let code = ResponseCode::try_from(code_byte)
			.map_err(|_| WireError::UnknownResponse(code_byte))?;
		let len = response_len(cmd, code);
		if self.rest.len() < 2 + len {
			return Err(WireError::Truncated);
		}
		let data = &self.rest[2..2 + len];
		self.rest = &self.rest[2 + len..];
		Ok(ResponseRecord { cmd, code, data })
	}
}

/// One decoded outbound (master-to-node) record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandRecord<'a> {
	pub cmd: Cmd,
	pub data: &'a [u8],
}

/// Walks the command records of an outbound payload in order.
///
/// The master never parses its own direction in production; this exists
/// for bus monitors and test doubles standing in for node firmware.
pub fn commands(payload: &[u8]) -> CommandIter<'_> {
	CommandIter { rest: payload }
}

pub struct CommandIter<'a> {
	rest: &'a [u8],
}

impl<'a> Iterator for CommandIter<'a> {
	type Item = Result<CommandRecord<'a>, WireError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.rest.is_empty() {
			return None;
		}
		let cmd = match Cmd::try_from(self.rest[0]) {
			Ok(cmd) => cmd,
			Err(_) => {
				let byte = self.rest[0];
				self.rest = &[];
				return Some(Err(WireError::UnknownCmd(byte)));
			}
		};
		let len = cmd.mosi_len();
		if self.rest.len() < 1 + len {
			self.rest = &[];
			return Some(Err(WireError::Truncated));
		}
		let data = &self.rest[1..1 + len];
		self.rest = &self.rest[1 + len..];
		Some(Ok(CommandRecord { cmd, data }))
	}
}
