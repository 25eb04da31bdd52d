// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::adapter::{AdapterConfig, NetstackTun};
use crate::device::{NetStack, StackConfig};
use crate::error::Result;
use crate::forwarder::{Forwarder, ForwarderConfig};
use crate::overlay::Overlay;
use crate::pump::spawn_packet_pump;
use crate::stats::{StackStats, StatsSnapshot};
use lopower_wg::TunDevice;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
	pub v4: Ipv4Addr,
	pub v6: Ipv6Addr,
	pub adapter: AdapterConfig,
	pub forwarder: ForwarderConfig,
}

impl BridgeConfig {
	pub fn new(v4: Ipv4Addr, v6: Ipv6Addr) -> Self {
		Self {
			v4,
			v6,
			adapter: AdapterConfig::default(),
			forwarder: ForwarderConfig::default(),
		}
	}
}

/// The adapter, stack, forwarder and packet pump wired together. Hand
/// [`tun`](Self::tun) to the WireGuard device.
pub struct Bridge {
	tun: Arc<NetstackTun>,
	stack: NetStack,
	forwarder: Arc<Forwarder>,
	pump: Mutex<Option<JoinHandle<()>>>,
	shutdown_tx: watch::Sender<bool>,
}

impl Bridge {
	#[instrument(skip(config, overlay), fields(v4 = %config.v4, v6 = %config.v6))]
	pub fn start(config: BridgeConfig, overlay: Arc<dyn Overlay>) -> Result<Self> {
		let (tun, port) = NetstackTun::new(config.adapter.clone());
		let stats = Arc::new(StackStats::default());
		let stack = NetStack::new(
			StackConfig {
				v4: config.v4,
				v6: config.v6,
				mtu: tun.mtu(),
			},
			port.outbound,
			stats,
		)?;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let forwarder = Forwarder::new(
			stack.clone(),
			overlay,
			config.forwarder,
			shutdown_rx.clone(),
		);
		forwarder.spawn_accept_loop();

		let pump = spawn_packet_pump(
			stack.clone(),
			Arc::clone(&forwarder),
			port.inbound,
			port.closed,
			shutdown_rx,
		);

		info!("bridge started");
		Ok(Self {
			tun: Arc::new(tun),
			stack,
			forwarder,
			pump: Mutex::new(Some(pump)),
			shutdown_tx,
		})
	}

	pub fn tun(&self) -> Arc<NetstackTun> {
		Arc::clone(&self.tun)
	}

	pub fn stack(&self) -> &NetStack {
		&self.stack
	}

	pub fn forwarder(&self) -> &Arc<Forwarder> {
		&self.forwarder
	}

	pub fn stats(&self) -> StatsSnapshot {
		self.stack.stats().snapshot()
	}

	/// Signals every task, closes the adapter and waits up to `grace` for
	/// the pump and forwarded connections to finish.
	#[instrument(skip(self))]
	pub async fn shutdown(&self, grace: Duration) {
		if self.shutdown_tx.send_replace(true) {
			return;
		}
		self.tun.close();

		if let Some(pump) = self.pump.lock().await.take() {
			if tokio::time::timeout(grace, pump).await.is_err() {
				warn!("packet pump did not stop in time");
			}
		}
		self.forwarder.shutdown(grace).await;

		let stats = self.stats();
		info!(
			packets_in = stats.packets_in,
			packets_out = stats.packets_out,
			dropped_out = stats.dropped_out,
			accepted = stats.connections_accepted,
			rejected = stats.connections_rejected,
			inbound = stats.connections_inbound,
			"bridge stopped"
		);
	}
}
