//! Test doubles: a shared clock and a scripted slave fleet behind the
//! byte channel.
//!
//! The mock bus decodes every master frame with the crate's own codec,
//! lets each scripted slave act on it and schedules the reply bytes at
//! future clock ticks, so inbound traffic trickles in the way a real
//! half-duplex wire would instead of arriving as one burst.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use buttonbus::frame::{self, WireBuf};
use buttonbus::wire::cmd::{
	Cmd, ROLL_CALL_ALL, ROLL_CALL_UNREGISTERED, ResponseCode, response_len,
};
use buttonbus::wire::{self, CommandRecord, MAX_PAYLOAD};
use buttonbus::{ByteChannel, Clock, Config, Crc8, ProtocolEngine, TransportError};

pub const SILENCE_MS: u64 = 5;

/// Shared, manually advanced clock. Every yield is one millisecond.
#[derive(Clone, Default)]
pub struct TestClock {
	ms: Rc<Cell<u64>>,
}

impl TestClock {
	pub fn now(&self) -> u64 {
		self.ms.get()
	}

	pub fn advance(&self, ms: u64) {
		self.ms.set(self.ms.get() + ms);
	}
}

impl Clock for TestClock {
	fn now_ms(&self) -> u64 {
		self.ms.get()
	}

	fn yield_now(&self) {
		self.ms.set(self.ms.get() + 1);
	}
}

/// One scripted slave node.
pub struct Slave {
	pub address: u8,
	pub bitmask_index: Option<u8>,
	/// Never answers anything.
	pub muted: bool,
	/// Answer `.0` as if it had been `.1` (wrong-command reply).
	pub wrong_reply: Option<(Cmd, Cmd)>,
	/// Misbehave only on the first occasion.
	pub wrong_once: bool,
	/// Force this response code for one command.
	pub forced_code: Option<(Cmd, ResponseCode)>,
	pub rgb: [u32; 3],
	pub blink_ms: u32,
	pub reaction_ms: u32,
	pub flags: u8,
	pub dbg_led: u8,
	pub time_ms: u32,
	pub correction: f32,
	pub version: u16,
	pub switch_on: bool,
}

impl Slave {
	pub fn new(address: u8) -> Self {
		Self {
			address,
			bitmask_index: None,
			muted: false,
			wrong_reply: None,
			wrong_once: false,
			forced_code: None,
			rgb: [0; 3],
			blink_ms: 0,
			reaction_ms: 0,
			flags: 0,
			dbg_led: 0,
			time_ms: 0,
			correction: 1.0,
			version: 0x0102,
			switch_on: false,
		}
	}

	fn addressed_by(&self, mask: u32) -> bool {
		self.bitmask_index
			.is_some_and(|index| mask & (1 << index) != 0)
	}

	/// Applies a set command; returns the reply record for any command.
	fn respond(&mut self, record: &CommandRecord<'_>) -> (Cmd, ResponseCode, Vec<u8>) {
		if let Some((asked, answered)) = self.wrong_reply {
			if asked == record.cmd {
				if self.wrong_once {
					self.wrong_reply = None;
				}
				return (answered, ResponseCode::Ok, vec![0; answered.miso_len()]);
			}
		}
		if let Some((cmd, code)) = self.forced_code {
			if cmd == record.cmd {
				return (cmd, code, vec![0xEE; response_len(cmd, code)]);
			}
		}

		let data = record.data;
		let reply: Vec<u8> = match record.cmd {
			Cmd::SetBitmaskIndex => {
				self.bitmask_index = Some(data[0]);
				vec![]
			}
			// The reply still goes out under the old address; the bus
			// re-homes the slave afterwards.
			Cmd::NewAddr => vec![],
			Cmd::SetBlink => {
				self.blink_ms = u32::from_le_bytes(data.try_into().unwrap());
				vec![]
			}
			Cmd::SetSwitch => {
				self.switch_on = data[0] != 0;
				vec![]
			}
			Cmd::SetDbgLed => {
				self.dbg_led = data[0];
				vec![]
			}
			Cmd::SetRgb0 | Cmd::SetRgb1 | Cmd::SetRgb2 => {
				let index = match record.cmd {
					Cmd::SetRgb0 => 0,
					Cmd::SetRgb1 => 1,
					_ => 2,
				};
				self.rgb[index] = u32::from_le_bytes([data[0], data[1], data[2], 0]);
				vec![]
			}
			Cmd::SetTime => {
				self.time_ms = u32::from_le_bytes(data.try_into().unwrap());
				vec![]
			}
			Cmd::SetSync => {
				let value = u32::from_le_bytes(data.try_into().unwrap());
				match value {
					0xFFFF_FFFF => self.correction = 1.0,
					0 => {}
					elapsed => self.correction = 1.0 + elapsed as f32 * 1.0e-6,
				}
				vec![]
			}
			Cmd::GetBlink => self.blink_ms.to_le_bytes().to_vec(),
			Cmd::GetFlags => vec![self.flags],
			Cmd::GetDbgLed => vec![self.dbg_led],
			Cmd::GetRgb0 => self.rgb[0].to_le_bytes()[..3].to_vec(),
			Cmd::GetRgb1 => self.rgb[1].to_le_bytes()[..3].to_vec(),
			Cmd::GetRgb2 => self.rgb[2].to_le_bytes()[..3].to_vec(),
			Cmd::GetTime => self.time_ms.to_le_bytes().to_vec(),
			Cmd::GetSync => self.correction.to_le_bytes().to_vec(),
			Cmd::GetReaction => self.reaction_ms.to_le_bytes().to_vec(),
			Cmd::GetVersion => self.version.to_le_bytes().to_vec(),
			Cmd::RollCall | Cmd::BcastAddressMask => vec![],
		};
		(record.cmd, ResponseCode::Ok, reply)
	}
}

struct BusInner {
	crc: Crc8,
	slaves: Vec<Slave>,
	/// Reply bytes with the tick they become visible to the master.
	rx: VecDeque<(u64, u8)>,
	/// Every decoded message the master transmitted, in order.
	tx_log: Vec<Vec<u8>>,
	deframer: frame::Deframer,
}

impl BusInner {
	/// Serialises reply records into frames and schedules their bytes,
	/// splitting across frames like a real node when they do not fit.
	fn queue_reply(
		&mut self,
		src: u8,
		id: u8,
		records: &[(Cmd, ResponseCode, Vec<u8>)],
		at_ms: u64,
	) {
		let mut chunks: Vec<Vec<u8>> = Vec::new();
		let mut payload: Vec<u8> = Vec::new();
		for (cmd, code, data) in records {
			if !payload.is_empty() && payload.len() + 2 + data.len() > MAX_PAYLOAD {
				chunks.push(std::mem::take(&mut payload));
			}
			payload.push(u8::from(*cmd));
			payload.push(u8::from(*code));
			payload.extend_from_slice(data);
		}
		if !payload.is_empty() {
			chunks.push(payload);
		}

		let mut at = at_ms;
		for chunk in chunks {
			let mut msg = vec![0x00, id, src, 0x00];
			msg.extend_from_slice(&chunk);
			msg.push(self.crc.compute(&msg));
			let mut wire = WireBuf::new();
			frame::encode(&msg, &mut wire).unwrap();
			for &b in wire.iter() {
				self.rx.push_back((at, b));
			}
			at += 2;
		}
	}

	fn dispatch(&mut self, msg: &[u8], now: u64) {
		self.tx_log.push(msg.to_vec());
		let crc = self.crc;
		let (header, payload) = wire::parse(msg, &crc).expect("master sent a bad frame");
		let records: Vec<CommandRecord<'_>> = wire::commands(payload)
			.collect::<Result<_, _>>()
			.expect("master sent a bad payload");

		if header.dst == 0xFF {
			let mask_record = records.first().expect("broadcast without records");
			assert_eq!(
				mask_record.cmd,
				Cmd::BcastAddressMask,
				"broadcast must open with the addressee mask"
			);
			let mask = u32::from_le_bytes(mask_record.data.try_into().unwrap());
			for i in 0..self.slaves.len() {
				let mut replies = Vec::new();
				let slave = &mut self.slaves[i];
				for record in &records[1..] {
					if record.cmd == Cmd::RollCall {
						let mode = record.data[0];
						let answers = !slave.muted
							&& match mode {
								ROLL_CALL_ALL => true,
								ROLL_CALL_UNREGISTERED => slave.bitmask_index.is_none(),
								_ => false,
							};
						if answers {
							replies.push((Cmd::RollCall, ResponseCode::Ok, Vec::new()));
						}
					} else if slave.addressed_by(mask) {
						// Broadcast sets are applied silently.
						let _ = slave.respond(record);
					}
				}
				if !replies.is_empty() {
					let address = self.slaves[i].address;
					// Nodes stagger their roll-call replies by address.
					let at = now + u64::from(address) * 2 * SILENCE_MS;
					self.queue_reply(address, header.id, &replies, at);
				}
			}
		} else {
			let Some(index) = self.slaves.iter().position(|s| s.address == header.dst)
			else {
				return;
			};
			if self.slaves[index].muted {
				return;
			}
			let mut replies = Vec::new();
			let mut new_address = None;
			{
				let slave = &mut self.slaves[index];
				for record in &records {
					replies.push(slave.respond(record));
					if record.cmd == Cmd::NewAddr {
						new_address = Some(record.data[0]);
					}
				}
			}
			let src = self.slaves[index].address;
			self.queue_reply(src, header.id, &replies, now + 1);
			if let Some(address) = new_address {
				self.slaves[index].address = address;
			}
		}
	}
}

/// The mock bus; cloneable handle, one shared state.
#[derive(Clone)]
pub struct MockBus {
	clock: TestClock,
	inner: Rc<RefCell<BusInner>>,
}

impl MockBus {
	pub fn new(clock: TestClock) -> Self {
		Self {
			clock,
			inner: Rc::new(RefCell::new(BusInner {
				crc: Crc8::new(0),
				slaves: Vec::new(),
				rx: VecDeque::new(),
				tx_log: Vec::new(),
				deframer: frame::Deframer::new(),
			})),
		}
	}

	pub fn add_slave(&self, slave: Slave) {
		self.inner.borrow_mut().slaves.push(slave);
	}

	pub fn with_slave<R>(&self, address: u8, f: impl FnOnce(&mut Slave) -> R) -> R {
		let mut inner = self.inner.borrow_mut();
		let slave = inner
			.slaves
			.iter_mut()
			.find(|s| s.address == address)
			.expect("no such slave");
		f(slave)
	}

	/// Messages the master transmitted so far (header + payload + CRC).
	pub fn tx_log(&self) -> Vec<Vec<u8>> {
		self.inner.borrow().tx_log.clone()
	}

	pub fn tx_count(&self) -> usize {
		self.inner.borrow().tx_log.len()
	}
}

impl ByteChannel for MockBus {
	fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
		let now = self.clock.now();
		let mut inner = self.inner.borrow_mut();
		let mut decoded = Vec::new();
		for &b in bytes {
			if let Some(frame) = inner.deframer.push_byte(b, now) {
				decoded.push(frame);
			}
		}
		for frame in decoded {
			inner.dispatch(&frame, now);
		}
		Ok(())
	}

	fn read_byte(&mut self) -> Option<u8> {
		let now = self.clock.now();
		let mut inner = self.inner.borrow_mut();
		let due = matches!(inner.rx.front(), Some(&(at, _)) if at <= now);
		if due {
			inner.rx.pop_front().map(|(_, byte)| byte)
		} else {
			None
		}
	}
}

/// Engine plus harness handles most tests start from.
pub fn harness(
	addresses: &[u8],
) -> (ProtocolEngine<MockBus, TestClock>, MockBus, TestClock) {
	let clock = TestClock::default();
	let bus = MockBus::new(clock.clone());
	for &address in addresses {
		bus.add_slave(Slave::new(address));
	}
	let engine = ProtocolEngine::new(bus.clone(), clock.clone(), Config::default());
	(engine, bus, clock)
}

/// Registers the fleet and asserts it all arrived.
pub fn registered_harness(
	addresses: &[u8],
) -> (ProtocolEngine<MockBus, TestClock>, MockBus, TestClock) {
	let (mut engine, bus, clock) = harness(addresses);
	assert_eq!(engine.register_all(), Ok(!addresses.is_empty()));
	assert_eq!(engine.node_count(), addresses.len());
	(engine, bus, clock)
}
