//! Broadcast composition behind an addressee mask.
//!
//! Every broadcast opens with a `bcast_address_mask` naming the slots it
//! is meant for; nodes outside the mask ignore the rest of the frame.
//! Broadcasts are fire and forget: nothing is queued as pending and no
//! reply is awaited.

use super::{NodeError, ProtocolEngine};
use crate::config::ADDR_BROADCAST;
use crate::engine::node::DbgLed;
use crate::time::Clock;
use crate::transport::ByteChannel;
use crate::wire::Message;
use crate::wire::cmd::{Cmd, CmdFlags};

impl<C: ByteChannel, K: Clock> ProtocolEngine<C, K> {
	/// Starts a broadcast addressed at every node not owned by a game.
	///
	/// Replaces any broadcast still under construction.
	pub fn init_broadcast(&mut self) {
		let mask = self.table.inactive_mask();
		let mut msg = Message::new(ADDR_BROADCAST);
		msg.append(Cmd::BcastAddressMask, &mask.to_le_bytes())
			.unwrap();
		self.bcast = Some(msg);
	}

	/// Appends one broadcast-eligible command.
	pub fn append_broadcast(&mut self, cmd: Cmd, payload: &[u8]) -> Result<(), NodeError> {
		let msg = self
			.bcast
			.as_mut()
			.ok_or(NodeError::BroadcastUninitialised)?;
		if !cmd.broadcast_eligible() || cmd.flags().contains(CmdFlags::MASK) {
			return Err(NodeError::NotBroadcastEligible);
		}
		msg.append(cmd, payload)?;
		Ok(())
	}

	pub fn append_broadcast_set_rgb(
		&mut self,
		index: usize,
		colour: u32,
	) -> Result<(), NodeError> {
		let cmd = match index {
			0 => Cmd::SetRgb0,
			1 => Cmd::SetRgb1,
			2 => Cmd::SetRgb2,
			_ => return Err(NodeError::InvalidIndex),
		};
		self.append_broadcast(cmd, &super::rgb_bytes(colour))
	}

	pub fn append_broadcast_set_blink(&mut self, ms: u32) -> Result<(), NodeError> {
		self.append_broadcast(Cmd::SetBlink, &ms.to_le_bytes())
	}

	pub fn append_broadcast_set_dbg_led(&mut self, mode: DbgLed) -> Result<(), NodeError> {
		self.append_broadcast(Cmd::SetDbgLed, &[mode.into()])
	}

	pub fn append_broadcast_set_time(&mut self, ms: u32) -> Result<(), NodeError> {
		self.append_broadcast(Cmd::SetTime, &ms.to_le_bytes())
	}

	/// Starting every button at once would go unconfirmed, so this only
	/// succeeds when the catalogue policy allows it.
	pub fn append_broadcast_set_switch(&mut self, on: bool) -> Result<(), NodeError> {
		self.append_broadcast(Cmd::SetSwitch, &[on as u8])
	}

	/// Transmits the broadcast under construction. Fire and forget.
	pub fn send_broadcast_now(&mut self) -> Result<(), NodeError> {
		let msg = self.bcast.take().ok_or(NodeError::BroadcastUninitialised)?;
		let id = self.next_id();
		let frame = msg.finalize(id, &self.crc);
		self.transport.send(&frame, &self.clock, &self.config)?;
		Ok(())
	}
}
