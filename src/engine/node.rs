//! Node registry and the cached button state.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::{MAX_NODES, PIPELINE_DEPTH};
use crate::wire::Message;
use crate::wire::cmd::{Cmd, MAX_MOSI, ResponseCode};

bitflags! {
	/// Event and state bits a node reports via `get_flags`.
	#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
	pub struct NodeFlags: u8 {
		const SHORT_PRESS = 1 << 0;
		const LONG_PRESS = 1 << 1;
		const DOUBLE_PRESS = 1 << 2;
		const ACTIVATED = 1 << 3;
		const DEACTIVATED = 1 << 4;
		const SW_STOPPED = 1 << 5;
		const BLINKING = 1 << 6;
		const UNREGISTERED = 1 << 7;
	}
}

/// Debug LED mode of a node.
#[derive(
	IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, Default, PartialEq, Eq,
)]
#[repr(u8)]
pub enum DbgLed {
	#[default]
	Off = 0,
	On = 1,
	Blink50 = 2,
	Blink200 = 3,
	Blink500 = 4,
}

/// Last known state of one button node, fed by `get_*` replies.
///
/// Colours are cached as `0x00RRGGBB`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ButtonState {
	pub rgb: [u32; 3],
	pub blink_ms: u32,
	pub reaction_ms: u32,
	pub flags: NodeFlags,
	pub dbg_led: DbgLed,
	pub time_ms: u32,
	pub correction: f32,
	pub version: u16,
}

impl Default for ButtonState {
	fn default() -> Self {
		Self {
			rgb: [0; 3],
			blink_ms: 0,
			reaction_ms: 0,
			flags: NodeFlags::empty(),
			dbg_led: DbgLed::Off,
			time_ms: 0,
			correction: 1.0,
			version: 0,
		}
	}
}

/// A command awaiting its reply, MOSI payload captured by value.
#[derive(Clone, Debug)]
pub(crate) struct Pending {
	pub cmd: Cmd,
	pub payload: heapless::Vec<u8, MAX_MOSI>,
}

/// One registered node.
pub(crate) struct NodeSlot {
	pub address: u8,
	/// Owned by a running game; excluded from ordinary broadcasts.
	pub active: bool,
	pub state: ButtonState,
	pub outbound: Message,
	/// Set once `new_addr` lands in the outbound message.
	pub sealed: bool,
	pub pending: heapless::Deque<Pending, PIPELINE_DEPTH>,
	/// Reply bytes the open response frame is expected to carry.
	pub expected_bytes: usize,
	/// Frames the full reply stream may span.
	pub expected_messages: u32,
	pub deadline: Option<u64>,
	pub retries: u8,
	pub last_update_ms: u64,
	/// First non-ok reply of the in-flight message.
	pub failure: Option<(Cmd, ResponseCode)>,
}

impl NodeSlot {
	fn new(address: u8, now_ms: u64) -> Self {
		Self {
			address,
			active: false,
			state: ButtonState::default(),
			outbound: Message::new(address),
			sealed: false,
			pending: heapless::Deque::new(),
			expected_bytes: 0,
			expected_messages: 0,
			deadline: None,
			retries: 0,
			last_update_ms: now_ms,
			failure: None,
		}
	}

	/// Drops the in-construction message and everything queued for it.
	pub fn reset_outbound(&mut self) {
		self.outbound = Message::new(self.address);
		self.sealed = false;
		self.pending.clear();
		self.expected_bytes = 0;
		self.expected_messages = 0;
		self.failure = None;
	}
}

/// Fixed-capacity registry of registered nodes.
///
/// Slot indices are dense: removal compacts the vector, so the occupied
/// indices are always `0..len`. The index doubles as the node's bit in
/// broadcast addressee masks.
pub(crate) struct NodeTable {
	slots: heapless::Vec<NodeSlot, MAX_NODES>,
}

impl NodeTable {
	pub const fn new() -> Self {
		Self {
			slots: heapless::Vec::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_valid(&self, slot: usize) -> bool {
		slot < self.slots.len()
	}

	pub fn get(&self, slot: usize) -> Option<&NodeSlot> {
		self.slots.get(slot)
	}

	pub fn get_mut(&mut self, slot: usize) -> Option<&mut NodeSlot> {
		self.slots.get_mut(slot)
	}

	pub fn by_address(&mut self, address: u8) -> Option<(usize, &mut NodeSlot)> {
		self.slots
			.iter_mut()
			.enumerate()
			.find(|(_, s)| s.address == address)
	}

	pub fn contains_address(&self, address: u8) -> bool {
		self.slots.iter().any(|s| s.address == address)
	}

	/// Allocates the first free slot for `address`; `None` when full.
	pub fn insert(&mut self, address: u8, now_ms: u64) -> Option<usize> {
		let slot = self.slots.len();
		self.slots.push(NodeSlot::new(address, now_ms)).ok()?;
		Some(slot)
	}

	/// Removes a slot; later entries shift down to keep indices dense.
	pub fn remove(&mut self, slot: usize) -> Option<NodeSlot> {
		if slot < self.slots.len() {
			Some(self.slots.remove(slot))
		} else {
			None
		}
	}

	pub fn clear(&mut self) {
		self.slots.clear();
	}

	pub fn iter(&self) -> impl Iterator<Item = &NodeSlot> {
		self.slots.iter()
	}

	/// Addressee mask of every slot not owned by a game.
	pub fn inactive_mask(&self) -> u32 {
		self.slots
			.iter()
			.enumerate()
			.filter(|(_, s)| !s.active)
			.fold(0, |mask, (i, _)| mask | 1 << i)
	}
}
