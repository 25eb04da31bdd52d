// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Relays TCP connections between WireGuard peers and the overlay.
//!
//! A SYN for a new flow is held while the overlay destination is dialed. On
//! success a listening socket bound to the exact destination is created and
//! the SYN is handed to the stack, which completes the handshake locally. On
//! failure the SYN is handed over with no socket to receive it and the stack
//! answers with a reset. Everything that is not TCP, ICMP included, goes to
//! the stack untouched and is answered there.

use crate::device::NetStack;
use crate::flow::{classify, FlowKey};
use crate::overlay::{InboundConnection, Overlay, OverlayStream, DEFAULT_DIAL_TIMEOUT};
use crate::stats::StackStats;
use crate::stream::VirtualTcpStream;
use ipnet::IpNet;
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_MAX_IN_FLIGHT_SYN: usize = 8192;
pub const DEFAULT_ALLOW: &[&str] = &["100.64.0.0/10", "fd7a:115c:a1e0::/48"];

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LINGER: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

pub fn default_allow() -> Vec<IpNet> {
	DEFAULT_ALLOW.iter().filter_map(|s| s.parse().ok()).collect()
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
	/// Destinations that may be dialed in the overlay.
	pub allow: Vec<IpNet>,
	/// Peer address pools that overlay-initiated connections may target.
	pub peer_networks: Vec<IpNet>,
	pub max_connections: usize,
	pub max_in_flight_syn: usize,
	pub dial_timeout: Duration,
	pub handshake_timeout: Duration,
	/// How long a closed connection may take to finish its FIN exchange.
	pub linger: Duration,
}

impl Default for ForwarderConfig {
	fn default() -> Self {
		Self {
			allow: default_allow(),
			peer_networks: Vec::new(),
			max_connections: DEFAULT_MAX_CONNECTIONS,
			max_in_flight_syn: DEFAULT_MAX_IN_FLIGHT_SYN,
			dial_timeout: DEFAULT_DIAL_TIMEOUT,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
			linger: DEFAULT_LINGER,
		}
	}
}

pub(crate) async fn cancelled(mut shutdown: watch::Receiver<bool>) {
	let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct Forwarder {
	stack: NetStack,
	overlay: Arc<dyn Overlay>,
	config: ForwarderConfig,
	pending: Mutex<HashSet<FlowKey>>,
	active: Mutex<HashSet<FlowKey>>,
	permits: Arc<Semaphore>,
	shutdown: watch::Receiver<bool>,
	tasks: TaskTracker,
}

impl Forwarder {
	pub fn new(
		stack: NetStack,
		overlay: Arc<dyn Overlay>,
		config: ForwarderConfig,
		shutdown: watch::Receiver<bool>,
	) -> Arc<Self> {
		info!(
			allow = ?config.allow,
			peer_networks = ?config.peer_networks,
			max_connections = config.max_connections,
			max_in_flight_syn = config.max_in_flight_syn,
			"created connection forwarder"
		);
		Arc::new(Self {
			stack,
			overlay,
			permits: Arc::new(Semaphore::new(config.max_connections)),
			config,
			pending: Mutex::new(HashSet::new()),
			active: Mutex::new(HashSet::new()),
			shutdown,
			tasks: TaskTracker::new(),
		})
	}

	pub fn config(&self) -> &ForwarderConfig {
		&self.config
	}

	pub fn allows(&self, dst: IpAddr) -> bool {
		self.config.allow.iter().any(|net| net.contains(&dst))
	}

	/// Whether an overlay-initiated connection may be opened toward `dst`:
	/// a peer pool address other than the stack's own.
	pub fn accepts_inbound(&self, dst: IpAddr) -> bool {
		let own = self.stack.config();
		dst != IpAddr::V4(own.v4)
			&& dst != IpAddr::V6(own.v6)
			&& self.config.peer_networks.iter().any(|net| net.contains(&dst))
	}

	pub fn pending_count(&self) -> usize {
		self.pending.lock().map(|p| p.len()).unwrap_or(0)
	}

	pub fn active_count(&self) -> usize {
		self.active.lock().map(|a| a.len()).unwrap_or(0)
	}

	fn is_pending(&self, key: &FlowKey) -> bool {
		self.pending.lock().map(|p| p.contains(key)).unwrap_or(false)
	}

	fn is_active(&self, key: &FlowKey) -> bool {
		self.active.lock().map(|a| a.contains(key)).unwrap_or(false)
	}

	/// Entry point for every packet leaving the adapter. Never blocks on the
	/// overlay.
	pub fn dispatch(self: &Arc<Self>, packet: Vec<u8>) {
		StackStats::incr(&self.stack.stats().packets_in);

		match classify(&packet) {
			Some(seg) if self.is_pending(&seg.key) => {
				trace!(flow = %seg.key, "dropping segment for flow still dialing");
			}
			Some(seg) if seg.is_initial_syn() && !self.is_active(&seg.key) => {
				self.on_syn(seg.key, packet);
			}
			_ => self.inject(packet),
		}
	}

	fn inject(&self, packet: Vec<u8>) {
		if let Err(e) = self.stack.inject(packet) {
			warn!(error = %e, "failed to inject packet");
		}
	}

	/// Hands the SYN to the stack with no socket behind it, which makes the
	/// stack answer with RST.
	fn reject(&self, key: &FlowKey, syn: Vec<u8>) {
		StackStats::incr(&self.stack.stats().connections_rejected);
		debug!(flow = %key, "rejecting connection");
		self.inject(syn);
		self.stack.forget_flow(key);
	}

	fn on_syn(self: &Arc<Self>, key: FlowKey, syn: Vec<u8>) {
		if !self.allows(key.dst.ip()) {
			debug!(flow = %key, "destination outside overlay policy");
			return self.reject(&key, syn);
		}

		let permit = {
			let Ok(mut pending) = self.pending.lock() else {
				return;
			};
			if pending.len() >= self.config.max_in_flight_syn {
				warn!(flow = %key, limit = self.config.max_in_flight_syn, "in-flight SYN ceiling reached, dropping");
				StackStats::incr(&self.stack.stats().connections_rejected);
				return;
			}
			let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
				drop(pending);
				warn!(flow = %key, limit = self.config.max_connections, "connection limit reached");
				return self.reject(&key, syn);
			};
			pending.insert(key);
			permit
		};

		self.tasks.spawn(Arc::clone(self).forward(key, syn, permit));
	}

	#[instrument(skip(self, syn, _permit), fields(flow = %key))]
	async fn forward(self: Arc<Self>, key: FlowKey, syn: Vec<u8>, _permit: OwnedSemaphorePermit) {
		let dialed = tokio::select! {
			_ = cancelled(self.shutdown.clone()) => {
				Err(io::Error::new(io::ErrorKind::Interrupted, "shutting down"))
			}
			result = tokio::time::timeout(self.config.dial_timeout, self.overlay.dial(key.dst)) => {
				result.unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "overlay dial timed out")))
			}
		};

		let remote = match dialed {
			Ok(remote) => remote,
			Err(e) => {
				debug!(error = %e, "overlay destination unreachable");
				self.reject(&key, syn);
				self.clear_pending(&key);
				return;
			}
		};

		let handle = match self.stack.accept_syn(key.dst, syn) {
			Ok(handle) => handle,
			Err((e, syn)) => {
				warn!(error = %e, "failed to accept held SYN");
				self.reject(&key, syn);
				self.clear_pending(&key);
				return;
			}
		};
		if let Ok(mut active) = self.active.lock() {
			active.insert(key);
		}
		self.clear_pending(&key);
		StackStats::incr(&self.stack.stats().connections_accepted);

		let local = VirtualTcpStream::new(self.stack.clone(), handle);
		self.relay(local, remote).await;

		if let Ok(mut active) = self.active.lock() {
			active.remove(&key);
		}
		self.stack.forget_flow(&key);
	}

	fn clear_pending(&self, key: &FlowKey) {
		if let Ok(mut pending) = self.pending.lock() {
			pending.remove(key);
		}
	}

	/// Splices bytes until both directions finish, then releases the socket.
	async fn relay(&self, mut local: VirtualTcpStream, mut remote: OverlayStream) {
		let handle = local.handle();

		match tokio::time::timeout(self.config.handshake_timeout, local.wait_established()).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				debug!(error = %e, "handshake failed");
				self.stack.abort(handle);
				self.stack.release(handle);
				return;
			}
			Err(_) => {
				debug!("handshake timed out");
				self.stack.abort(handle);
				self.stack.release(handle);
				return;
			}
		}

		let graceful = tokio::select! {
			_ = cancelled(self.shutdown.clone()) => {
				debug!("relay cancelled by shutdown");
				false
			}
			result = copy_bidirectional(&mut local, &mut remote) => match result {
				Ok((to_overlay, to_peer)) => {
					debug!(to_overlay, to_peer, "relay finished");
					true
				}
				Err(e) => {
					debug!(error = %e, "relay ended with error");
					false
				}
			},
		};
		drop(remote);

		if graceful {
			if tokio::time::timeout(self.config.linger, local.wait_closed())
				.await
				.is_err()
			{
				trace!("linger expired, aborting");
				self.stack.abort(handle);
			}
		} else {
			self.stack.abort(handle);
		}
		self.stack.release(handle);
	}

	/// Accepts overlay-initiated connections and opens them toward the
	/// addressed peer from the local address of the same family.
	/// Destinations outside the peer pools are refused.
	pub fn spawn_accept_loop(self: &Arc<Self>) {
		let this = Arc::clone(self);
		self.tasks.spawn(async move {
			loop {
				let next = tokio::select! {
					_ = cancelled(this.shutdown.clone()) => break,
					next = this.overlay.accept() => next,
				};
				match next {
					Ok(Some(conn)) => this.on_inbound(conn),
					Ok(None) => {
						debug!("overlay provider offers no inbound connections");
						break;
					}
					Err(e) => {
						warn!(error = %e, "overlay accept failed");
						tokio::select! {
							_ = cancelled(this.shutdown.clone()) => break,
							_ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
						}
					}
				}
			}
			debug!("overlay accept loop stopped");
		});
	}

	fn on_inbound(self: &Arc<Self>, conn: InboundConnection) {
		let destination = conn.destination;
		if !self.accepts_inbound(destination.ip()) {
			warn!(%destination, "inbound connection not addressed to a peer, refusing");
			StackStats::incr(&self.stack.stats().connections_rejected);
			return;
		}
		let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
			warn!(%destination, "connection limit reached, refusing inbound connection");
			StackStats::incr(&self.stack.stats().connections_rejected);
			return;
		};

		let handle = match self.stack.connect(destination) {
			Ok(handle) => handle,
			Err(e) => {
				warn!(%destination, error = %e, "failed to open connection to peer");
				return;
			}
		};
		StackStats::incr(&self.stack.stats().connections_inbound);
		debug!(%destination, "relaying inbound overlay connection");

		let this = Arc::clone(self);
		self.tasks.spawn(async move {
			let local = VirtualTcpStream::new(this.stack.clone(), handle);
			this.relay(local, conn.stream).await;
			drop(permit);
		});
	}

	/// Waits for forwarding tasks after the shutdown signal fired.
	pub async fn shutdown(&self, grace: Duration) {
		self.tasks.close();
		if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
			warn!(remaining = self.tasks.len(), "forwarding tasks still running after grace period");
		}
	}
}
