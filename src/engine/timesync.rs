//! The three-step time synchronisation handshake.
//!
//! A sync run is reset → start → end: reset arms the node's stopwatch,
//! start zeroes both sides, and end carries the master's elapsed
//! milliseconds so the node can derive its clock-skew correction factor.
//! The factor itself is fetched afterwards with an ordinary `get_sync`.

use super::{NodeError, ProtocolEngine};
use crate::time::Clock;
use crate::transport::ByteChannel;
use crate::wire::cmd::Cmd;

/// `set_sync` payload arming a reset.
const SYNC_RESET: u32 = 0xFFFF_FFFF;
/// `set_sync` payload starting the stopwatch.
const SYNC_START: u32 = 0;
/// Longest elapsed time the end step can report.
const SYNC_ELAPSED_MAX: u64 = 0xFFFF_FFFE;

/// Whom a sync step is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncTarget {
	/// One registered node.
	Slot(usize),
	/// Every node reachable through the ordinary broadcast mask.
	All,
}

/// Progress of the one sync run allowed at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncPhase {
	Idle,
	Armed { target: SyncTarget },
	Running { target: SyncTarget, started_ms: u64 },
}

impl<C: ByteChannel, K: Clock> ProtocolEngine<C, K> {
	pub fn is_time_sync_busy(&self) -> bool {
		self.sync != SyncPhase::Idle
	}

	/// Arms a sync run; fails while another run is in progress.
	pub fn sync_reset(&mut self, target: SyncTarget) -> Result<(), NodeError> {
		if self.sync != SyncPhase::Idle {
			return Err(NodeError::SyncBusy);
		}
		self.send_sync(target, SYNC_RESET)?;
		self.sync = SyncPhase::Armed { target };
		Ok(())
	}

	/// Starts the stopwatch on both sides of an armed run.
	pub fn sync_start(&mut self, target: SyncTarget) -> Result<(), NodeError> {
		match self.sync {
			SyncPhase::Armed { target: armed } if armed == target => {}
			_ => return Err(NodeError::SyncOrder),
		}
		self.send_sync(target, SYNC_START)?;
		self.sync = SyncPhase::Running {
			target,
			started_ms: self.clock.now_ms(),
		};
		Ok(())
	}

	/// Stops the run, reporting the master's elapsed milliseconds.
	pub fn sync_end(&mut self, target: SyncTarget) -> Result<(), NodeError> {
		let started_ms = match self.sync {
			SyncPhase::Running { target: running, started_ms } if running == target => {
				started_ms
			}
			_ => return Err(NodeError::SyncOrder),
		};
		let elapsed = self
			.clock
			.now_ms()
			.saturating_sub(started_ms)
			.min(SYNC_ELAPSED_MAX) as u32;
		self.send_sync(target, elapsed)?;
		self.sync = SyncPhase::Idle;
		debug!(target: "node", "time sync finished after {elapsed} ms");
		Ok(())
	}

	fn send_sync(&mut self, target: SyncTarget, value: u32) -> Result<(), NodeError> {
		match target {
			SyncTarget::Slot(slot) => {
				self.init_node_message(slot)?;
				self.append_node(slot, Cmd::SetSync, &value.to_le_bytes())?;
				self.send_node_now(slot)
			}
			SyncTarget::All => {
				self.init_broadcast();
				self.append_broadcast(Cmd::SetSync, &value.to_le_bytes())?;
				self.send_broadcast_now()
			}
		}
	}
}
