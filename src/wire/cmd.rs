//! Command catalogue of the button chaser bus.
//!
//! Every command carries a fixed MOSI (master-out) and MISO (reply)
//! payload size; the payload itself has no length field. Sizes and
//! broadcast eligibility are looked up here and nowhere else.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config;

/// Largest MOSI payload in the catalogue.
pub const MAX_MOSI: usize = 4;
/// Largest MISO payload in the catalogue.
pub const MAX_MISO: usize = 4;

/// `roll_call` mode byte: every node answers.
pub const ROLL_CALL_ALL: u8 = 0x00;
/// `roll_call` mode byte: only nodes without a bitmask index answer.
pub const ROLL_CALL_UNREGISTERED: u8 = 0xFF;

/// Command identifiers as they appear on the wire.
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
	RollCall = 0x00,
	BcastAddressMask = 0x01,
	SetBitmaskIndex = 0x02,
	NewAddr = 0x03,
	SetBlink = 0x10,
	SetSwitch = 0x11,
	SetDbgLed = 0x12,
	SetRgb0 = 0x13,
	SetRgb1 = 0x14,
	SetRgb2 = 0x15,
	SetTime = 0x16,
	SetSync = 0x17,
	GetBlink = 0x30,
	GetFlags = 0x31,
	GetDbgLed = 0x32,
	GetRgb0 = 0x33,
	GetRgb1 = 0x34,
	GetRgb2 = 0x35,
	GetTime = 0x36,
	GetSync = 0x37,
	GetReaction = 0x38,
	GetVersion = 0x39,
}

bitflags! {
	/// Catalogue flags qualifying where a command may appear.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct CmdFlags: u8 {
		/// May appear in a frame addressed to [`config::ADDR_BROADCAST`].
		const BROADCAST = 1 << 0;
		/// No further command may follow in the same message.
		const ENDS_MESSAGE = 1 << 1;
		/// Reserved for the addressee-mask slot heading a broadcast.
		const MASK = 1 << 2;
	}
}

impl Cmd {
	/// MOSI payload size in bytes.
	pub const fn mosi_len(self) -> usize {
		match self {
			Cmd::RollCall => 1,
			Cmd::BcastAddressMask => 4,
			Cmd::SetBitmaskIndex => 1,
			Cmd::NewAddr => 1,
			Cmd::SetBlink => 4,
			Cmd::SetSwitch => 1,
			Cmd::SetDbgLed => 1,
			Cmd::SetRgb0 | Cmd::SetRgb1 | Cmd::SetRgb2 => 3,
			Cmd::SetTime => 4,
			Cmd::SetSync => 4,
			Cmd::GetBlink
			| Cmd::GetFlags
			| Cmd::GetDbgLed
			| Cmd::GetRgb0
			| Cmd::GetRgb1
			| Cmd::GetRgb2
			| Cmd::GetTime
			| Cmd::GetSync
			| Cmd::GetReaction
			| Cmd::GetVersion => 0,
		}
	}

	/// MISO payload size of an `ok` reply, in bytes.
	pub const fn miso_len(self) -> usize {
		match self {
			Cmd::GetBlink => 4,
			Cmd::GetFlags => 1,
			Cmd::GetDbgLed => 1,
			Cmd::GetRgb0 | Cmd::GetRgb1 | Cmd::GetRgb2 => 3,
			Cmd::GetTime => 4,
			Cmd::GetSync => 4,
			Cmd::GetReaction => 4,
			Cmd::GetVersion => 2,
			_ => 0,
		}
	}

	pub const fn flags(self) -> CmdFlags {
		match self {
			Cmd::RollCall => CmdFlags::BROADCAST,
			Cmd::BcastAddressMask => {
				CmdFlags::BROADCAST.union(CmdFlags::MASK)
			}
			Cmd::SetBitmaskIndex => CmdFlags::empty(),
			Cmd::NewAddr => CmdFlags::ENDS_MESSAGE,
			Cmd::SetBlink
			| Cmd::SetDbgLed
			| Cmd::SetRgb0
			| Cmd::SetRgb1
			| Cmd::SetRgb2
			| Cmd::SetTime
			| Cmd::SetSync => CmdFlags::BROADCAST,
			_ => CmdFlags::empty(),
		}
	}

	/// Whether this command may ride in a broadcast frame.
	pub fn broadcast_eligible(self) -> bool {
		if self == Cmd::SetSwitch {
			return config::BROADCAST_SWITCH_POLICY;
		}
		self.flags().contains(CmdFlags::BROADCAST)
	}

	/// Whether nothing may follow this command in its message.
	pub fn ends_message(self) -> bool {
		self.flags().contains(CmdFlags::ENDS_MESSAGE)
	}
}

/// Status byte leading every reply record.
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
	Ok = 0x00,
	/// The node received a record whose length did not match its table.
	ErrPayloadLen = 0x01,
	/// A payload value was out of range.
	ErrRange = 0x02,
	/// The node refused the command in its current state.
	ErrReject = 0x03,
	ErrUnknownCmd = 0x04,
}

/// Reply payload size for `cmd` under `code`.
pub fn response_len(cmd: Cmd, code: ResponseCode) -> usize {
	match code {
		ResponseCode::Ok => cmd.miso_len(),
		ResponseCode::ErrPayloadLen => 1,
		ResponseCode::ErrRange => 2,
		ResponseCode::ErrReject => 1,
		ResponseCode::ErrUnknownCmd => 0,
	}
}
