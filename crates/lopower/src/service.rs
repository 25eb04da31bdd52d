// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The running bridge: persisted identity, network stack, forwarder and
//! WireGuard device wired together, with reload and shutdown.

use crate::signals::{SignalEvent, Signals};
use anyhow::{bail, Context, Result};
use lopower_common::{Config, ConfigStore};
use lopower_netstack::{Bridge, BridgeConfig, ForwarderConfig, NetstackTun, Overlay};
use lopower_wg::{DeviceConfig, PeerConfig, WgDevice};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
	pub listen_port: u16,
	pub forwarder: ForwarderConfig,
	pub shutdown_grace: Duration,
}

impl Default for ServiceOptions {
	fn default() -> Self {
		Self {
			listen_port: lopower_wg::DEFAULT_LISTEN_PORT,
			forwarder: ForwarderConfig::default(),
			shutdown_grace: Duration::from_secs(5),
		}
	}
}

pub fn peer_configs(config: &Config) -> Vec<PeerConfig> {
	config.peers.iter().map(PeerConfig::from).collect()
}

pub struct Service {
	store: ConfigStore,
	config: Config,
	bridge: Bridge,
	device: Arc<WgDevice<NetstackTun>>,
	listen_addr: SocketAddr,
	grace: Duration,
}

impl Service {
	/// Loads the configuration and brings up the stack and the device. Every
	/// failure here is fatal to the process.
	#[instrument(skip_all, fields(path = %store.path().display()))]
	pub async fn start(store: ConfigStore, options: ServiceOptions, overlay: Arc<dyn Overlay>) -> Result<Self> {
		let config = store
			.load()
			.await
			.with_context(|| format!("failed to load configuration from {}", store.path().display()))?;
		info!(
			public_key = %config.public_key(),
			v4 = %config.v4,
			v6 = %config.v6,
			peers = config.peers.len(),
			"loaded configuration"
		);

		let mut bridge_config = BridgeConfig::new(config.v4, config.v6);
		bridge_config.forwarder = options.forwarder;
		bridge_config.forwarder.peer_networks = vec![config.v4_cidr.into(), config.v6_cidr.into()];
		let bridge = Bridge::start(bridge_config, overlay).context("failed to start network stack")?;

		let device = Arc::new(WgDevice::new(
			bridge.tun(),
			DeviceConfig {
				listen_port: options.listen_port,
				..DeviceConfig::default()
			},
		));

		let listen_addr = match device.up().await {
			Ok(addr) => addr,
			Err(e) => {
				bridge.shutdown(options.shutdown_grace).await;
				return Err(e).context("failed to bring up WireGuard device");
			}
		};
		if let Err(e) = device.configure(&config.keypair(), &peer_configs(&config)).await {
			device.close().await;
			bridge.shutdown(options.shutdown_grace).await;
			return Err(e).context("failed to configure WireGuard device");
		}

		info!(%listen_addr, "bridge running");
		Ok(Self {
			store,
			config,
			bridge,
			device,
			listen_addr,
			grace: options.shutdown_grace,
		})
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn bridge(&self) -> &Bridge {
		&self.bridge
	}

	pub fn device(&self) -> &Arc<WgDevice<NetstackTun>> {
		&self.device
	}

	pub fn listen_addr(&self) -> SocketAddr {
		self.listen_addr
	}

	/// Re-reads the stored configuration and swaps the device's peer table.
	/// On any error the running configuration stays in place.
	#[instrument(skip(self))]
	pub async fn reload(&mut self) -> Result<()> {
		let next = self
			.store
			.read()
			.await
			.context("failed to read configuration")?;

		if next.v4 != self.config.v4 || next.v6 != self.config.v6 {
			bail!(
				"local addresses changed from {}/{} to {}/{}; restart required",
				self.config.v4,
				self.config.v6,
				next.v4,
				next.v6
			);
		}

		self.device
			.configure(&next.keypair(), &peer_configs(&next))
			.await
			.context("failed to apply peer table")?;

		info!(peers = next.peers.len(), "reloaded configuration");
		self.config = next;
		Ok(())
	}

	/// Serves until SIGINT/SIGTERM or the device stops, reloading on SIGHUP.
	pub async fn run(mut self) -> Result<()> {
		let mut signals = Signals::new().context("failed to install signal handlers")?;

		loop {
			let event = tokio::select! {
				event = signals.next() => event,
				_ = self.device.wait() => {
					warn!("WireGuard device stopped");
					SignalEvent::Shutdown
				}
			};

			match event {
				SignalEvent::Reload => {
					if let Err(e) = self.reload().await {
						warn!(error = %format!("{e:#}"), "reload failed, keeping previous configuration");
					}
				}
				SignalEvent::Shutdown => {
					info!("shutdown requested");
					break;
				}
			}
		}

		self.shutdown().await;
		Ok(())
	}

	/// Closes the device, which closes the adapter, then gives forwarded
	/// connections the grace period to finish.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		self.device.close().await;
		self.bridge.shutdown(self.grace).await;
		info!("bridge shut down");
	}
}
