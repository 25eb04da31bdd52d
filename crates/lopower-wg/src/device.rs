// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{DeviceError, Result};
use crate::packet::extract_dst;
use crate::peers::{PeerConfig, PeerSlot, PeerTable};
use crate::tun::{TunDevice, TunError};
use defguard_boringtun::noise::handshake::parse_handshake_anon;
use defguard_boringtun::noise::{Packet, Tunn, TunnResult};
use lopower_common::{WgKeyPair, WgPublicKey};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

pub const DEFAULT_LISTEN_PORT: u16 = 51820;

const MAX_DATAGRAM: usize = 65536;
const TIMER_INTERVAL: Duration = Duration::from_millis(250);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DeviceConfig {
	pub name: String,
	pub listen_port: u16,
}

impl Default for DeviceConfig {
	fn default() -> Self {
		Self {
			name: lopower_common::INTERFACE_NAME.to_string(),
			listen_port: DEFAULT_LISTEN_PORT,
		}
	}
}

/// WireGuard endpoint bound to a UDP port, moving plaintext packets to and
/// from a [`TunDevice`].
pub struct WgDevice<T: TunDevice> {
	config: DeviceConfig,
	tun: Arc<T>,
	table: RwLock<Option<Arc<PeerTable>>>,
	next_index: AtomicU32,
	local_addr: OnceLock<SocketAddr>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	running: AtomicBool,
	closed: AtomicBool,
}

impl<T: TunDevice> WgDevice<T> {
	#[instrument(skip(tun, config), fields(name = %config.name, tun = tun.name(), mtu = tun.mtu()))]
	pub fn new(tun: Arc<T>, config: DeviceConfig) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		info!("created WireGuard device");

		Self {
			config,
			tun,
			table: RwLock::new(None),
			next_index: AtomicU32::new(1),
			local_addr: OnceLock::new(),
			tasks: Mutex::new(Vec::new()),
			shutdown_tx,
			shutdown_rx,
			running: AtomicBool::new(false),
			closed: AtomicBool::new(false),
		}
	}

	pub fn config(&self) -> &DeviceConfig {
		&self.config
	}

	pub fn tun(&self) -> &Arc<T> {
		&self.tun
	}

	/// UDP address the device listens on once [`up`](Self::up) succeeded.
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.local_addr.get().copied()
	}

	/// Current peer table snapshot.
	pub async fn peers(&self) -> Option<Arc<PeerTable>> {
		self.table.read().await.clone()
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Replaces identity and peers in one step. Peers keeping their key keep
	/// their live session. On error the active table is left untouched.
	#[instrument(skip(self, identity, peers), fields(public_key = %identity.public_key(), peers = peers.len()))]
	pub async fn configure(&self, identity: &WgKeyPair, peers: &[PeerConfig]) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(DeviceError::Closed);
		}

		let mut table = self.table.write().await;
		let next = PeerTable::build(identity, peers, table.as_deref(), &self.next_index)?;
		let reused = match table.as_deref() {
			Some(previous) => next
				.slots()
				.filter(|slot| {
					previous
						.peer(slot.public_key())
						.is_some_and(|old| Arc::ptr_eq(old, slot))
				})
				.count(),
			None => 0,
		};
		*table = Some(Arc::new(next));

		info!(reused, "applied device configuration");
		Ok(())
	}

	/// Binds the UDP socket and starts the receive, send and timer loops.
	#[instrument(skip(self), fields(name = %self.config.name, port = self.config.listen_port))]
	pub async fn up(self: &Arc<Self>) -> Result<SocketAddr> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(DeviceError::Closed);
		}
		if self.running.swap(true, Ordering::SeqCst) {
			return Err(DeviceError::AlreadyRunning);
		}

		let socket = match bind(self.config.listen_port).await {
			Ok(socket) => Arc::new(socket),
			Err(e) => {
				self.running.store(false, Ordering::SeqCst);
				return Err(e.into());
			}
		};
		let local_addr = socket.local_addr()?;
		let _ = self.local_addr.set(local_addr);

		let mut tasks = self.tasks.lock().await;
		tasks.push(Arc::clone(self).spawn_recv_loop(Arc::clone(&socket)));
		tasks.push(Arc::clone(self).spawn_send_loop(Arc::clone(&socket)));
		tasks.push(Arc::clone(self).spawn_timer_loop(socket));

		info!(%local_addr, "WireGuard device up");
		Ok(local_addr)
	}

	/// Stops all loops and closes the adapter. Safe to call more than once.
	#[instrument(skip(self), fields(name = %self.config.name))]
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		info!("closing WireGuard device");
		let _ = self.shutdown_tx.send(true);
		self.tun.close();

		let handles = std::mem::take(&mut *self.tasks.lock().await);
		for handle in handles {
			let abort = handle.abort_handle();
			if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
				warn!("device task did not stop in time, aborting");
				abort.abort();
			}
		}

		self.running.store(false, Ordering::SeqCst);
		*self.table.write().await = None;
		info!("WireGuard device closed");
	}

	/// Resolves once [`close`](Self::close) has been called.
	pub async fn wait(&self) {
		let mut rx = self.shutdown_rx.clone();
		while !*rx.borrow() {
			if rx.changed().await.is_err() {
				break;
			}
		}
	}

	fn spawn_recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut buf = vec![0u8; MAX_DATAGRAM];
			let mut dst_buf = vec![0u8; MAX_DATAGRAM];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("recv loop shutting down");
							break;
						}
					}

					result = socket.recv_from(&mut buf) => {
						match result {
							Ok((len, from)) => {
								trace!(len, %from, "received datagram");
								match self.handle_datagram(&socket, &buf[..len], from, &mut dst_buf).await {
									Ok(()) => {}
									Err(TunError::Closed) => {
										info!("adapter closed, recv loop stopping");
										break;
									}
									Err(e) => warn!(error = %e, "failed to deliver packet to adapter"),
								}
							}
							Err(e) => {
								warn!(error = %e, "UDP recv error");
							}
						}
					}
				}
			}
		})
	}

	async fn handle_datagram(
		&self,
		socket: &UdpSocket,
		datagram: &[u8],
		from: SocketAddr,
		dst_buf: &mut [u8],
	) -> std::result::Result<(), TunError> {
		let Some(table) = self.peers().await else {
			trace!("no configuration yet, dropping datagram");
			return Ok(());
		};

		let Some(slot) = demux(&table, datagram) else {
			debug!(%from, "datagram matches no peer");
			return Ok(());
		};

		let plaintext = {
			let mut tunn = slot.tunn.lock().await;
			let mut flush = false;
			let plaintext = match tunn.decapsulate(Some(from.ip()), datagram, dst_buf) {
				TunnResult::Done => {
					slot.set_endpoint(from);
					None
				}
				TunnResult::WriteToNetwork(data) => {
					slot.set_endpoint(from);
					send_to(socket, data, from).await;
					flush = true;
					None
				}
				TunnResult::WriteToTunnelV4(data, src) => {
					slot.set_endpoint(from);
					accept_plaintext(&table, &slot, data, IpAddr::V4(src))
				}
				TunnResult::WriteToTunnelV6(data, src) => {
					slot.set_endpoint(from);
					accept_plaintext(&table, &slot, data, IpAddr::V6(src))
				}
				TunnResult::Err(e) => {
					debug!(peer = %slot.public_key(), ?e, "tunnel decapsulate error");
					None
				}
			};
			// Packets queued behind a completed handshake.
			if flush {
				while let TunnResult::WriteToNetwork(queued) = tunn.decapsulate(None, &[], dst_buf) {
					send_to(socket, queued, from).await;
				}
			}
			plaintext
		};
		slot.add_rx(datagram.len());

		if let Some(packet) = plaintext {
			self.tun.write(&[packet]).await?;
		}
		Ok(())
	}

	fn spawn_send_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut packets = Vec::with_capacity(self.tun.batch_size());
			let mut dst_buf = vec![0u8; MAX_DATAGRAM];

			loop {
				packets.clear();
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("send loop shutting down");
							break;
						}
					}

					result = self.tun.read(&mut packets) => {
						match result {
							Ok(_) => {
								for packet in &packets {
									self.send_packet(&socket, packet, &mut dst_buf).await;
								}
							}
							Err(TunError::Closed) => {
								info!("adapter closed, send loop stopping");
								break;
							}
							Err(e) => {
								warn!(error = %e, "adapter read error");
							}
						}
					}
				}
			}
		})
	}

	async fn send_packet(&self, socket: &UdpSocket, packet: &[u8], dst_buf: &mut [u8]) {
		let Some(dst) = extract_dst(packet) else {
			trace!(len = packet.len(), "dropping non-IP packet");
			return;
		};
		let Some(table) = self.peers().await else {
			return;
		};
		let Some(slot) = table.route(dst) else {
			trace!(%dst, "no peer for destination");
			return;
		};

		let mut tunn = slot.tunn.lock().await;
		match tunn.encapsulate(packet, dst_buf) {
			TunnResult::WriteToNetwork(data) => match slot.endpoint() {
				Some(endpoint) => {
					trace!(len = data.len(), peer = %slot.public_key(), "sending encrypted packet");
					slot.add_tx(data.len());
					send_to(socket, data, endpoint).await;
				}
				None => {
					debug!(peer = %slot.public_key(), "peer endpoint unknown, dropping packet");
				}
			},
			TunnResult::Done => {
				trace!("encapsulate done, no output");
			}
			TunnResult::Err(e) => {
				debug!(peer = %slot.public_key(), ?e, "tunnel encapsulate error");
			}
			_ => {}
		}
	}

	fn spawn_timer_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; MAX_DATAGRAM];
			let mut ticker = tokio::time::interval(TIMER_INTERVAL);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("timer loop shutting down");
							break;
						}
					}

					_ = ticker.tick() => {
						let Some(table) = self.peers().await else {
							continue;
						};
						for slot in table.slots() {
							let mut tunn = slot.tunn.lock().await;
							match tunn.update_timers(&mut dst_buf) {
								TunnResult::WriteToNetwork(data) => {
									if let Some(endpoint) = slot.endpoint() {
										trace!(len = data.len(), peer = %slot.public_key(), "sending keepalive/handshake");
										send_to(&socket, data, endpoint).await;
									}
								}
								TunnResult::Done => {}
								TunnResult::Err(e) => {
									trace!(peer = %slot.public_key(), ?e, "timer update error");
								}
								_ => {}
							}
						}
					}
				}
			}
		})
	}
}

/// Finds the peer a datagram belongs to: by static key for handshake
/// initiations, by receiver index for everything else.
fn demux(table: &PeerTable, datagram: &[u8]) -> Option<Arc<PeerSlot>> {
	let packet = match Tunn::parse_incoming_packet(datagram) {
		Ok(packet) => packet,
		Err(e) => {
			trace!(?e, "not a WireGuard message");
			return None;
		}
	};

	let slot = match packet {
		Packet::HandshakeInit(ref init) => {
			let half = parse_handshake_anon(table.secret(), table.public(), init).ok()?;
			table.peer(&WgPublicKey::from_bytes(half.peer_static_public))
		}
		Packet::HandshakeResponse(ref resp) => table.by_index(resp.receiver_idx >> 8),
		Packet::PacketCookieReply(ref reply) => table.by_index(reply.receiver_idx >> 8),
		Packet::PacketData(ref data) => table.by_index(data.receiver_idx >> 8),
	};
	slot.cloned()
}

fn accept_plaintext(table: &PeerTable, slot: &PeerSlot, data: &[u8], src: IpAddr) -> Option<Vec<u8>> {
	if table.allows(slot, src) {
		trace!(len = data.len(), %src, "decrypted packet for adapter");
		Some(data.to_vec())
	} else {
		debug!(peer = %slot.public_key(), %src, "source address not allowed for peer, dropping");
		None
	}
}

async fn bind(port: u16) -> std::io::Result<UdpSocket> {
	match UdpSocket::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))).await {
		Ok(socket) => Ok(socket),
		Err(e) => {
			debug!(error = %e, "dual-stack bind failed, falling back to IPv4");
			UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
		}
	}
}

async fn send_to(socket: &UdpSocket, data: &[u8], addr: SocketAddr) {
	let target = match socket.local_addr() {
		Ok(SocketAddr::V6(_)) => to_v6(addr),
		_ => addr,
	};
	if let Err(e) = socket.send_to(data, target).await {
		warn!(%addr, error = %e, "UDP send failed");
	}
}

/// IPv4 endpoints must be v4-mapped to go out of a dual-stack socket.
fn to_v6(addr: SocketAddr) -> SocketAddr {
	match addr {
		SocketAddr::V4(v4) => SocketAddr::from((v4.ip().to_ipv6_mapped(), v4.port())),
		v6 => v6,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tun::TunEvent;
	use async_trait::async_trait;
	use std::sync::Mutex as StdMutex;
	use tokio::sync::mpsc;

	struct NullTun {
		closed: AtomicBool,
		written: StdMutex<Vec<Vec<u8>>>,
	}

	impl NullTun {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				closed: AtomicBool::new(false),
				written: StdMutex::new(Vec::new()),
			})
		}
	}

	#[async_trait]
	impl TunDevice for NullTun {
		fn name(&self) -> &str {
			"null"
		}

		fn mtu(&self) -> usize {
			1500
		}

		fn events(&self) -> Option<mpsc::Receiver<TunEvent>> {
			None
		}

		async fn read(&self, _packets: &mut Vec<Vec<u8>>) -> std::result::Result<usize, TunError> {
			loop {
				if self.closed.load(Ordering::SeqCst) {
					return Err(TunError::Closed);
				}
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		}

		async fn write(&self, packets: &[Vec<u8>]) -> std::result::Result<usize, TunError> {
			self.written.lock().unwrap().extend(packets.iter().cloned());
			Ok(packets.len())
		}

		fn close(&self) {
			self.closed.store(true, Ordering::SeqCst);
		}
	}

	fn device() -> Arc<WgDevice<NullTun>> {
		Arc::new(WgDevice::new(
			NullTun::new(),
			DeviceConfig {
				name: "test".to_string(),
				listen_port: 0,
			},
		))
	}

	#[tokio::test]
	async fn test_configure_installs_table() {
		let dev = device();
		let identity = WgKeyPair::generate();
		let peer = PeerConfig::new(*WgKeyPair::generate().public_key())
			.with_allowed_ip("10.90.0.2".parse().unwrap());

		dev.configure(&identity, &[peer.clone()]).await.unwrap();

		let table = dev.peers().await.unwrap();
		assert_eq!(table.local_key(), identity.public_key());
		assert!(table.peer(&peer.public_key).is_some());
	}

	#[tokio::test]
	async fn test_invalid_configure_keeps_previous_table() {
		let dev = device();
		let identity = WgKeyPair::generate();
		let peer = PeerConfig::new(*WgKeyPair::generate().public_key())
			.with_allowed_ip("10.90.0.2".parse().unwrap());
		dev.configure(&identity, &[peer.clone()]).await.unwrap();

		let result = dev.configure(&identity, &[peer.clone(), peer.clone()]).await;
		assert!(matches!(result, Err(DeviceError::InvalidPeers(_))));

		let table = dev.peers().await.unwrap();
		assert_eq!(table.len(), 1);
	}

	#[tokio::test]
	async fn test_up_twice_fails() {
		let dev = device();
		let addr = dev.up().await.unwrap();
		assert_ne!(addr.port(), 0);
		assert_eq!(dev.local_addr(), Some(addr));

		assert!(matches!(dev.up().await, Err(DeviceError::AlreadyRunning)));
		dev.close().await;
	}

	#[tokio::test]
	async fn test_close_is_idempotent_and_closes_adapter() {
		let dev = device();
		dev.up().await.unwrap();

		dev.close().await;
		dev.close().await;

		assert!(dev.tun().closed.load(Ordering::SeqCst));
		assert!(!dev.is_running());
		assert!(matches!(dev.up().await, Err(DeviceError::Closed)));
		tokio::time::timeout(Duration::from_secs(1), dev.wait())
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn test_garbage_datagram_is_ignored() {
		let dev = device();
		dev.configure(&WgKeyPair::generate(), &[]).await.unwrap();
		let addr = dev.up().await.unwrap();

		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		client
			.send_to(b"not wireguard", ("127.0.0.1", addr.port()))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;

		assert!(dev.tun().written.lock().unwrap().is_empty());
		dev.close().await;
	}

	#[test]
	fn test_to_v6_maps_ipv4() {
		let v4: SocketAddr = "127.0.0.1:51820".parse().unwrap();
		assert_eq!(to_v6(v4), "[::ffff:127.0.0.1]:51820".parse().unwrap());

		let v6: SocketAddr = "[::1]:51820".parse().unwrap();
		assert_eq!(to_v6(v6), v6);
	}
}
