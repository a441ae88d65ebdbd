//! Discovery and registration via the broadcast roll call.
//!
//! The master shouts a `roll_call` at everyone, collects the addresses
//! answering within a window sized for the worst-case collective reply
//! time, and then registers each newcomer individually by assigning it
//! its bitmask index.

use super::{NodeError, ProtocolEngine, validate_address};
use crate::config::{ADDR_BROADCAST, ADDR_MASTER};
use crate::time::Clock;
use crate::transport::ByteChannel;
use crate::wire::Message;
use crate::wire::cmd::{Cmd, ROLL_CALL_ALL, ROLL_CALL_UNREGISTERED};

/// Distinct node addresses the roll-call list can hold (0x01..=0xFE).
pub(crate) const ROLL_LIST: usize = 254;

/// Reply window: every possible address gets two silence windows of
/// grace, plus one maximal per-node backoff and a final gap.
pub(crate) fn roll_call_window(silence_ms: u64) -> u64 {
	u64::from(ADDR_BROADCAST) * 2 * silence_ms + 0xFF + silence_ms
}

impl<C: ByteChannel, K: Clock> ProtocolEngine<C, K> {
	/// Rebuilds the registry from scratch.
	///
	/// Clears the node table, runs a full roll call and registers every
	/// node that answered. Returns whether any node was registered.
	pub fn register_all(&mut self) -> Result<bool, NodeError> {
		self.table.clear();
		let registered = self.roll_call(ROLL_CALL_ALL)?;
		Ok(registered > 0)
	}

	/// Discovers nodes that joined (or reset) since the last roll call.
	///
	/// Runs an unregistered-only roll call without touching existing
	/// slots and returns how many new nodes were registered.
	pub fn register_new(&mut self) -> Result<usize, NodeError> {
		self.roll_call(ROLL_CALL_UNREGISTERED)
	}

	fn roll_call(&mut self, mode: u8) -> Result<usize, NodeError> {
		self.roll_replies.clear();
		self.roll_mode = Some(mode);

		let result = self.roll_call_inner(mode);
		self.roll_mode = None;
		result
	}

	fn roll_call_inner(&mut self, mode: u8) -> Result<usize, NodeError> {
		// Everyone is addressed, registered or not.
		let mut msg = Message::new(ADDR_BROADCAST);
		msg.append(Cmd::BcastAddressMask, &u32::MAX.to_le_bytes())?;
		msg.append(Cmd::RollCall, &[mode])?;
		let id = self.next_id();
		let frame = msg.finalize(id, &self.crc);
		self.transport.send(&frame, &self.clock, &self.config)?;

		let deadline = self.clock.now_ms() + roll_call_window(self.config.bus_silence_ms);
		while self.clock.now_ms() < deadline {
			self.pump();
			self.clock.yield_now();
		}
		self.pump();

		let replies = core::mem::take(&mut self.roll_replies);
		info!(
			target: "node",
			"roll call mode {mode:#04x}: {} repl{}", replies.len(),
			if replies.len() == 1 { "y" } else { "ies" }
		);

		let mut registered = 0;
		for &address in replies.iter() {
			match self.register(address) {
				Ok(slot) => {
					registered += 1;
					debug!(
						target: "node",
						"node {address:#04x} registered at slot {slot}"
					);
				}
				Err(err) => {
					warn!(
						target: "node",
						"registration of {address:#04x} failed: {err}"
					);
				}
			}
		}
		Ok(registered)
	}

	/// Collects one roll-call reply while the window is open.
	pub(crate) fn note_roll_call(&mut self, src: u8) {
		if self.roll_mode.is_none() {
			debug!(target: "node", "roll-call reply from {src:#04x} outside a window");
			return;
		}
		if src == ADDR_MASTER || src == ADDR_BROADCAST {
			debug!(target: "node", "roll-call reply with bogus source {src:#04x}");
			return;
		}
		// A registered address announcing itself again means the node
		// rebooted and lost its index; its old slot is stale.
		if let Some((slot, _)) = self.table.by_address(src) {
			info!(
				target: "node",
				"node {src:#04x} re-announced itself, dropping stale slot {slot}"
			);
			self.deregister(slot);
		}
		if !self.roll_replies.contains(&src) && self.roll_replies.push(src).is_err() {
			warn!(target: "node", "roll-call list full, ignoring {src:#04x}");
		}
	}

	/// Assigns the first free slot to `address` and confirms the node
	/// accepted its bitmask index.
	fn register(&mut self, address: u8) -> Result<usize, NodeError> {
		validate_address(address)?;
		if let Some((slot, _)) = self.table.by_address(address) {
			return Ok(slot);
		}
		let now = self.clock.now_ms();
		let slot = self
			.table
			.insert(address, now)
			.ok_or(NodeError::TableFull)?;

		let index = [slot as u8];
		if let Err(err) = self
			.append_node(slot, Cmd::SetBitmaskIndex, &index)
			.and_then(|()| self.send_node_now(slot))
		{
			// Send-and-wait failed; a timeout has already deregistered
			// the slot, anything else we unwind ourselves.
			if let Some((slot, _)) = self.table.by_address(address) {
				self.deregister(slot);
			}
			return Err(err);
		}
		// Timeout sweeps for other nodes may have shifted the index.
		self.table
			.by_address(address)
			.map(|(slot, _)| slot)
			.ok_or(NodeError::Unresponsive)
	}
}
