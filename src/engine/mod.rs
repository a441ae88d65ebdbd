//! The protocol engine: pipelined node messaging over the bus.
//!
//! [`ProtocolEngine`] owns the transport, the node registry and all
//! in-flight state. Callers build a per-node message record by record,
//! then [`send_node_now`](ProtocolEngine::send_node_now) transmits it and
//! cooperatively waits until every queued command has been answered, the
//! message expired through its retries, or the node was given up on.
//!
//! Responses are matched strictly FIFO per node: the head of a node's
//! pending queue names the only command whose reply is acceptable next.
//! Anything else is unsolicited or out of order and is dropped on the
//! floor with a log line.

mod broadcast;
pub mod node;
mod rollcall;
mod timesync;

use thiserror::Error;

use self::node::{ButtonState, DbgLed, NodeFlags, NodeSlot, NodeTable, Pending};
pub use self::timesync::SyncTarget;
use self::timesync::SyncPhase;
use crate::config::{ADDR_BROADCAST, ADDR_MASTER, Config};
use crate::crc::Crc8;
use crate::time::Clock;
use crate::transport::{ByteChannel, Transport, TransportError, TransportStats};
use crate::wire::cmd::{Cmd, ResponseCode};
use crate::wire::{self, MAX_PAYLOAD, Message, ResponseRecord, WireError};

/// Errors surfaced to engine callers.
#[derive(Error, Clone, Copy, Debug, PartialEq)]
pub enum NodeError {
	#[error("no such slot")]
	InvalidSlot,
	#[error("invalid node address {0:#04x}")]
	InvalidAddress(u8),
	#[error("node table full")]
	TableFull,
	#[error("pipeline queue full")]
	PipelineFull,
	#[error("rgb index out of range")]
	InvalidIndex,
	#[error("command is not broadcast eligible")]
	NotBroadcastEligible,
	#[error("broadcast not initialised")]
	BroadcastUninitialised,
	#[error("message sealed by an address change")]
	Sealed,
	#[error("node rejected {cmd:?}: {code:?}")]
	Remote { cmd: Cmd, code: ResponseCode },
	#[error("node unresponsive and deregistered")]
	Unresponsive,
	#[error("time sync already in progress")]
	SyncBusy,
	#[error("time sync step out of order")]
	SyncOrder,
	#[error(transparent)]
	Wire(#[from] WireError),
	#[error(transparent)]
	Bus(#[from] TransportError),
}

/// The master-side protocol engine.
pub struct ProtocolEngine<C: ByteChannel, K: Clock> {
	transport: Transport<C>,
	clock: K,
	config: Config,
	crc: Crc8,
	table: NodeTable,
	seq: u8,
	bcast: Option<Message>,
	sync: SyncPhase,
	roll_mode: Option<u8>,
	roll_replies: heapless::Vec<u8, { rollcall::ROLL_LIST }>,
}

impl<C: ByteChannel, K: Clock> ProtocolEngine<C, K> {
	pub fn new(channel: C, clock: K, config: Config) -> Self {
		debug_assert!(config.bus_silence_ms > 0);
		debug_assert!(config.frame_timeout_ms > 0);
		Self {
			transport: Transport::new(channel),
			clock,
			crc: Crc8::new(config.crc_seed),
			config,
			table: NodeTable::new(),
			seq: 0,
			bcast: None,
			sync: SyncPhase::Idle,
			roll_mode: None,
			roll_replies: heapless::Vec::new(),
		}
	}

	pub fn node_count(&self) -> usize {
		self.table.len()
	}

	pub fn is_slot_valid(&self, slot: usize) -> bool {
		self.table.is_valid(slot)
	}

	/// Cached state of a node, as of its last answered `get`.
	pub fn button_state(&self, slot: usize) -> Option<ButtonState> {
		self.table.get(slot).map(|s| s.state)
	}

	pub fn node_address(&self, slot: usize) -> Option<u8> {
		self.table.get(slot).map(|s| s.address)
	}

	/// Whether the slot is currently owned by a running game.
	pub fn is_node_active(&self, slot: usize) -> bool {
		self.table.get(slot).is_some_and(|s| s.active)
	}

	pub fn stats(&self) -> TransportStats {
		self.transport.stats
	}

	/// Drives inbound processing and the timeout sweep once.
	///
	/// Hosts call this from their idle loop so retries and watchdogs run
	/// while no caller is blocked inside the engine.
	pub fn poll(&mut self) {
		self.pump();
	}

	// ------------------------------------------------------------------
	// building and sending node messages

	/// Drops any unsent outbound message of `slot` and starts fresh.
	pub fn init_node_message(&mut self, slot: usize) -> Result<(), NodeError> {
		let s = self.table.get_mut(slot).ok_or(NodeError::InvalidSlot)?;
		s.reset_outbound();
		Ok(())
	}

	pub fn append_set_rgb(
		&mut self,
		slot: usize,
		index: usize,
		colour: u32,
	) -> Result<(), NodeError> {
		let cmd = match index {
			0 => Cmd::SetRgb0,
			1 => Cmd::SetRgb1,
			2 => Cmd::SetRgb2,
			_ => return Err(NodeError::InvalidIndex),
		};
		self.append_node(slot, cmd, &rgb_bytes(colour))
	}

	pub fn append_get_rgb(&mut self, slot: usize, index: usize) -> Result<(), NodeError> {
		let cmd = match index {
			0 => Cmd::GetRgb0,
			1 => Cmd::GetRgb1,
			2 => Cmd::GetRgb2,
			_ => return Err(NodeError::InvalidIndex),
		};
		self.append_node(slot, cmd, &[])
	}

	pub fn append_set_blink(&mut self, slot: usize, ms: u32) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::SetBlink, &ms.to_le_bytes())
	}

	pub fn append_set_switch(&mut self, slot: usize, on: bool) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::SetSwitch, &[on as u8])
	}

	pub fn append_set_dbg_led(
		&mut self,
		slot: usize,
		mode: DbgLed,
	) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::SetDbgLed, &[mode.into()])
	}

	pub fn append_set_time(&mut self, slot: usize, ms: u32) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::SetTime, &ms.to_le_bytes())
	}

	pub fn append_get_blink(&mut self, slot: usize) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::GetBlink, &[])
	}

	pub fn append_get_flags(&mut self, slot: usize) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::GetFlags, &[])
	}

	pub fn append_get_dbg_led(&mut self, slot: usize) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::GetDbgLed, &[])
	}

	pub fn append_get_time(&mut self, slot: usize) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::GetTime, &[])
	}

	pub fn append_get_sync(&mut self, slot: usize) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::GetSync, &[])
	}

	pub fn append_get_reaction(&mut self, slot: usize) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::GetReaction, &[])
	}

	pub fn append_get_version(&mut self, slot: usize) -> Result<(), NodeError> {
		self.append_node(slot, Cmd::GetVersion, &[])
	}

	/// Queues an address change; nothing may follow it in the message.
	pub fn append_new_addr(&mut self, slot: usize, address: u8) -> Result<(), NodeError> {
		validate_address(address)?;
		if self.table.contains_address(address) {
			return Err(NodeError::InvalidAddress(address));
		}
		self.append_node(slot, Cmd::NewAddr, &[address])
	}

	/// Transmits the outbound message of `slot` and waits for the reply
	/// stream.
	///
	/// Cooperative: inbound processing, retries and timeouts of *all*
	/// nodes keep running while this waits. Returns once every pending
	/// command is answered, with the first non-ok reply as `Remote`
	/// error, or `Unresponsive` after the node burned its retries and
	/// was deregistered.
	pub fn send_node_now(&mut self, slot: usize) -> Result<(), NodeError> {
		let (mut address, new_address) = {
			let s = self.table.get(slot).ok_or(NodeError::InvalidSlot)?;
			if s.pending.is_empty() {
				return Ok(());
			}
			let pending_new = s
				.pending
				.iter()
				.find(|p| p.cmd == Cmd::NewAddr)
				.and_then(|p| p.payload.first().copied());
			(s.address, pending_new)
		};
		self.dispatch_node(slot)?;

		loop {
			self.pump();
			// A granted new_addr moves the node mid-wait.
			if self.table.by_address(address).is_none() {
				match new_address {
					Some(a) if self.table.by_address(a).is_some() => address = a,
					_ => return Err(NodeError::Unresponsive),
				}
			}
			let Some((_, s)) = self.table.by_address(address) else {
				return Err(NodeError::Unresponsive);
			};
			if s.pending.is_empty() {
				s.deadline = None;
				return match s.failure.take() {
					Some((cmd, code)) => Err(NodeError::Remote { cmd, code }),
					None => Ok(()),
				};
			}
			self.clock.yield_now();
		}
	}

	// ------------------------------------------------------------------
	// internals

	/// Appends one command to a node's outbound message and pipeline.
	///
	/// The MOSI payload is captured by value: callers are free to reuse
	/// their buffers, and retries rebuild the message from these copies.
	pub(crate) fn append_node(
		&mut self,
		slot: usize,
		cmd: Cmd,
		payload: &[u8],
	) -> Result<(), NodeError> {
		let s = self.table.get_mut(slot).ok_or(NodeError::InvalidSlot)?;
		if s.sealed {
			return Err(NodeError::Sealed);
		}
		if s.pending.is_full() {
			return Err(NodeError::PipelineFull);
		}
		if s.outbound.is_empty() {
			// First record of a fresh message; forget the accounting of
			// the previous one.
			s.expected_bytes = 0;
			s.expected_messages = 0;
		}
		s.outbound.append(cmd, payload)?;

		let mut captured = heapless::Vec::new();
		captured.extend_from_slice(payload).unwrap();
		s.pending.push_back(Pending { cmd, payload: captured }).unwrap();

		// Replies may span several frames; account for where this one
		// falls so the expiry covers the whole stream.
		let record = 2 + cmd.miso_len();
		if s.expected_messages == 0 {
			s.expected_messages = 1;
			s.expected_bytes = 0;
		}
		if s.expected_bytes + record > MAX_PAYLOAD {
			s.expected_messages += 1;
			s.expected_bytes = record;
		} else {
			s.expected_bytes += record;
		}

		if cmd.ends_message() {
			s.sealed = true;
		}
		Ok(())
	}

	/// Finalizes and transmits a node's outbound message, arming the
	/// expiry. The outbound buffer is only consumed on a successful
	/// handoff to the transport.
	fn dispatch_node(&mut self, slot: usize) -> Result<(), NodeError> {
		let id = self.next_id();
		let frame = {
			let s = self.table.get_mut(slot).ok_or(NodeError::InvalidSlot)?;
			s.retries = 0;
			s.failure = None;
			s.outbound.clone().finalize(id, &self.crc)
		};
		self.transport.send(&frame, &self.clock, &self.config)?;

		let now = self.clock.now_ms();
		let s = self.table.get_mut(slot).ok_or(NodeError::InvalidSlot)?;
		s.outbound = Message::new(s.address);
		s.sealed = false;
		s.deadline =
			Some(now + u64::from(s.expected_messages.max(1)) * self.config.frame_timeout_ms);
		Ok(())
	}

	/// Fresh sequence id; bumped on every transmission attempt.
	pub(crate) fn next_id(&mut self) -> u8 {
		self.seq = self.seq.wrapping_add(1);
		self.seq
	}

	pub(crate) fn pump(&mut self) {
		let now = self.clock.now_ms();
		self.transport.poll(now, &self.config);
		while let Some(frame) = self.transport.take_frame() {
			self.handle_frame(&frame);
		}
		self.sweep(self.clock.now_ms());
	}

	fn handle_frame(&mut self, bytes: &[u8]) {
		let now = self.clock.now_ms();
		let (header, payload) = match wire::parse(bytes, &self.crc) {
			Ok(parsed) => parsed,
			Err(err) => {
				if err == WireError::Crc {
					self.transport.stats.crc_errors += 1;
				}
				debug!(target: "protocol", "inbound frame dropped: {err}");
				return;
			}
		};
		if header.dst != ADDR_MASTER {
			debug!(target: "protocol", "frame for {:#04x} ignored", header.dst);
			return;
		}
		for record in wire::responses(payload) {
			match record {
				Ok(record) => self.handle_response(header.src, record, now),
				Err(err) => {
					debug!(
						target: "protocol",
						"malformed reply from {:#04x}: {err}", header.src
					);
					break;
				}
			}
		}
	}

	fn handle_response(&mut self, src: u8, record: ResponseRecord<'_>, now: u64) {
		if record.cmd == Cmd::RollCall {
			self.note_roll_call(src);
			return;
		}
		let Some((_, s)) = self.table.by_address(src) else {
			debug!(target: "node", "unsolicited reply from {src:#04x}");
			return;
		};
		let Some(head) = s.pending.front() else {
			debug!(target: "node", "reply from {src:#04x} with empty pipeline");
			return;
		};
		if head.cmd != record.cmd {
			warn!(
				target: "node",
				"out-of-order reply from {src:#04x}: got {:?}, awaiting {:?}",
				record.cmd, head.cmd
			);
			return;
		}

		let entry = s.pending.pop_front().unwrap();
		if record.code != ResponseCode::Ok {
			debug!(
				target: "node",
				"{src:#04x} answered {:?} with {:?}", entry.cmd, record.code
			);
			if s.failure.is_none() {
				s.failure = Some((entry.cmd, record.code));
			}
		} else {
			Self::apply_reply(s, &entry, record.data, now);
		}
		if s.pending.is_empty() {
			s.retries = 0;
			s.deadline = None;
		}
	}

	/// Writes an ok reply into the slot's cache and runs the command's
	/// side effects.
	fn apply_reply(s: &mut NodeSlot, entry: &Pending, data: &[u8], now: u64) {
		match entry.cmd {
			Cmd::GetRgb0 => s.state.rgb[0] = rgb24(data),
			Cmd::GetRgb1 => s.state.rgb[1] = rgb24(data),
			Cmd::GetRgb2 => s.state.rgb[2] = rgb24(data),
			Cmd::GetBlink => s.state.blink_ms = u32le(data),
			Cmd::GetReaction => {
				let ms = u32le(data);
				s.state.reaction_ms = ms;
				// A pressed button stops its own reaction timer and
				// leaves the running game.
				if s.active && ms != 0 {
					s.active = false;
					debug!(
						target: "node",
						"{:#04x} deactivated itself (reaction {ms} ms)", s.address
					);
				}
			}
			Cmd::GetFlags => s.state.flags = NodeFlags::from_bits_truncate(data[0]),
			Cmd::GetDbgLed => match DbgLed::try_from(data[0]) {
				Ok(mode) => s.state.dbg_led = mode,
				Err(_) => {
					debug!(target: "node", "bogus dbg led state {:#04x}", data[0]);
				}
			},
			Cmd::GetTime => s.state.time_ms = u32le(data),
			Cmd::GetSync => {
				s.state.correction =
					f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
			}
			Cmd::GetVersion => s.state.version = u16::from_le_bytes([data[0], data[1]]),
			Cmd::SetSwitch => {
				s.active = entry.payload.first().is_some_and(|&b| b != 0);
			}
			Cmd::NewAddr => {
				if let Some(&address) = entry.payload.first() {
					info!(
						target: "node",
						"node {:#04x} now answers at {address:#04x}", s.address
					);
					s.address = address;
					// The idle outbound buffer still names the old
					// address; restart it.
					s.outbound = Message::new(address);
				}
			}
			_ => {}
		}
		s.last_update_ms = now;
	}

	/// Retries or deregisters every slot whose reply stream has expired.
	fn sweep(&mut self, now: u64) {
		let mut slot = 0;
		while slot < self.table.len() {
			let expired = {
				let s = self.table.get(slot).unwrap();
				!s.pending.is_empty() && s.deadline.is_some_and(|d| now >= d)
			};
			if !expired {
				slot += 1;
				continue;
			}
			let has_retries_left = {
				let s = self.table.get(slot).unwrap();
				s.retries < self.config.max_retries
			};
			if has_retries_left {
				self.retry_slot(slot);
				slot += 1;
			} else {
				let address = self.table.get(slot).unwrap().address;
				warn!(
					target: "node",
					"node {address:#04x} exhausted its retries, deregistering"
				);
				self.deregister(slot);
				// The next slot shifted into this index.
			}
		}
	}

	/// Resends the still-pending commands of an expired slot under a
	/// fresh sequence id.
	fn retry_slot(&mut self, slot: usize) {
		let id = self.next_id();
		let frame = {
			let Some(s) = self.table.get_mut(slot) else {
				return;
			};
			let mut msg = Message::new(s.address);
			for p in s.pending.iter() {
				// Rebuilt from captured payloads; a subset of the
				// original message always fits.
				if msg.append(p.cmd, &p.payload).is_err() {
					break;
				}
			}
			s.retries += 1;
			debug!(
				target: "node",
				"retry {} for node {:#04x}", s.retries, s.address
			);
			msg.finalize(id, &self.crc)
		};

		let sent = self.transport.send(&frame, &self.clock, &self.config);
		let now = self.clock.now_ms();
		if let Some(s) = self.table.get_mut(slot) {
			let span = match sent {
				Ok(()) => {
					u64::from(s.expected_messages.max(1)) * self.config.frame_timeout_ms
				}
				// Could not win the bus; try again a frame later.
				Err(_) => self.config.frame_timeout_ms,
			};
			s.deadline = Some(now + span);
		}
	}

	pub(crate) fn deregister(&mut self, slot: usize) {
		if let Some(s) = self.table.remove(slot) {
			info!(
				target: "node",
				"deregistered node {:#04x} from slot {slot}", s.address
			);
		}
	}
}

pub(crate) fn validate_address(address: u8) -> Result<(), NodeError> {
	if address == ADDR_MASTER || address == ADDR_BROADCAST {
		return Err(NodeError::InvalidAddress(address));
	}
	Ok(())
}

fn u32le(data: &[u8]) -> u32 {
	u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// Colours travel as the three low bytes of the cached word, little
/// endian.
fn rgb24(data: &[u8]) -> u32 {
	u32::from_le_bytes([data[0], data[1], data[2], 0])
}

pub(crate) fn rgb_bytes(colour: u32) -> [u8; 3] {
	let bytes = colour.to_le_bytes();
	[bytes[0], bytes[1], bytes[2]]
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::PIPELINE_DEPTH;

	struct NullChannel;

	impl ByteChannel for NullChannel {
		fn write_all(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
			Ok(())
		}

		fn read_byte(&mut self) -> Option<u8> {
			None
		}
	}

	struct NullClock;

	impl Clock for NullClock {
		fn now_ms(&self) -> u64 {
			0
		}

		fn yield_now(&self) {}
	}

	fn engine_with_node() -> ProtocolEngine<NullChannel, NullClock> {
		let mut engine = ProtocolEngine::new(NullChannel, NullClock, Config::default());
		engine.table.insert(0x42, 0).unwrap();
		engine
	}

	#[test]
	fn reply_accounting_spans_frames() {
		let mut engine = engine_with_node();
		// 2 + 4 reply bytes per get; four fit a 27-byte frame.
		for _ in 0..10 {
			engine.append_get_blink(0).unwrap();
		}
		let s = engine.table.get(0).unwrap();
		assert_eq!(s.expected_messages, 3);
		assert_eq!(s.pending.len(), 10);
	}

	#[test]
	fn pipeline_depth_is_enforced() {
		let mut engine = engine_with_node();
		for _ in 0..PIPELINE_DEPTH {
			engine.append_get_flags(0).unwrap();
		}
		assert_eq!(
			engine.append_get_flags(0),
			Err(NodeError::PipelineFull)
		);
	}

	#[test]
	fn new_addr_seals_the_message() {
		let mut engine = engine_with_node();
		engine.append_set_blink(0, 250).unwrap();
		engine.append_new_addr(0, 0x55).unwrap();
		assert_eq!(engine.append_get_blink(0), Err(NodeError::Sealed));
		engine.init_node_message(0).unwrap();
		engine.append_get_blink(0).unwrap();
	}

	#[test]
	fn rgb_index_bounds() {
		let mut engine = engine_with_node();
		assert_eq!(
			engine.append_set_rgb(0, 3, 0xFF_00_00),
			Err(NodeError::InvalidIndex)
		);
		assert_eq!(engine.append_get_rgb(0, 4), Err(NodeError::InvalidIndex));
		engine.append_set_rgb(0, 2, 0x00_FF_00).unwrap();
	}

	#[test]
	fn reserved_addresses_are_rejected() {
		let mut engine = engine_with_node();
		assert_eq!(
			engine.append_new_addr(0, ADDR_MASTER),
			Err(NodeError::InvalidAddress(ADDR_MASTER))
		);
		assert_eq!(
			engine.append_new_addr(0, ADDR_BROADCAST),
			Err(NodeError::InvalidAddress(ADDR_BROADCAST))
		);
	}

	#[test]
	fn unknown_slot_is_an_error() {
		let mut engine = ProtocolEngine::new(NullChannel, NullClock, Config::default());
		assert_eq!(engine.append_get_blink(7), Err(NodeError::InvalidSlot));
		assert_eq!(engine.send_node_now(7), Err(NodeError::InvalidSlot));
		assert!(!engine.is_slot_valid(0));
	}
}
