//! Protocol constants and runtime configuration.

/// Start-of-frame delimiter.
pub const STX: u8 = 0x02;
/// End-of-frame delimiter.
pub const ETX: u8 = 0x03;
/// Escape byte; a special byte inside a frame travels as `DLE, byte ^ DLE`.
pub const DLE: u8 = 0x10;

/// Bus address of the master.
pub const ADDR_MASTER: u8 = 0x00;
/// Bus address reaching every node at once.
pub const ADDR_BROADCAST: u8 = 0xFF;

/// Maximum unescaped frame size, header and CRC included.
pub const MAX_FRAME: usize = 32;

/// Upper bound on registered nodes; also the width of the addressee mask.
pub const MAX_NODES: usize = 31;

/// Commands a single node message may leave awaiting responses.
pub const PIPELINE_DEPTH: usize = 10;

/// The only wire format revision a frame header may carry.
pub const PROTOCOL_VERSION: u8 = 0;

/// Whether `set_switch` is eligible for broadcast frames.
///
/// A broadcast start carries no individual confirmation, so it stays
/// disabled until the integrators re-enable it here.
pub const BROADCAST_SWITCH_POLICY: bool = false;

/// Runtime tuning knobs of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
	/// Minimum period of bus inactivity before the master may transmit.
	pub bus_silence_ms: u64,
	/// Time allowed for one reply frame before a node message expires.
	pub frame_timeout_ms: u64,
	/// Resend attempts before an unresponsive node is deregistered.
	pub max_retries: u8,
	/// Seed of the frame CRC.
	pub crc_seed: u8,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bus_silence_ms: 5,
			frame_timeout_ms: 50,
			max_retries: 3,
			crc_seed: 0,
		}
	}
}
