// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the adapter, stack and forwarder.
#[derive(Debug, Default)]
pub struct StackStats {
	pub packets_in: AtomicU64,
	pub packets_out: AtomicU64,
	pub dropped_out: AtomicU64,
	pub connections_accepted: AtomicU64,
	pub connections_rejected: AtomicU64,
	pub connections_inbound: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
	pub packets_in: u64,
	pub packets_out: u64,
	pub dropped_out: u64,
	pub connections_accepted: u64,
	pub connections_rejected: u64,
	pub connections_inbound: u64,
}

impl StackStats {
	pub fn incr(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			packets_in: self.packets_in.load(Ordering::Relaxed),
			packets_out: self.packets_out.load(Ordering::Relaxed),
			dropped_out: self.dropped_out.load(Ordering::Relaxed),
			connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
			connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
			connections_inbound: self.connections_inbound.load(Ordering::Relaxed),
		}
	}
}
