// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{NetstackError, Result};
use crate::flow::FlowKey;
use crate::stats::StackStats;
use crate::translate::Ipv6Translator;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::{Duration as SmoltcpDuration, Instant as SmoltcpInstant};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Waker;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, instrument, trace, warn};

const DEFAULT_TCP_RX_BUFFER_SIZE: usize = 65536;
const DEFAULT_TCP_TX_BUFFER_SIZE: usize = 65536;

/// Bound on packets injected but not yet consumed by the interface.
const MAX_RX_QUEUE: usize = 1024;

const TCP_KEEP_ALIVE: SmoltcpDuration = SmoltcpDuration::from_secs(30);
const TCP_IDLE_TIMEOUT: SmoltcpDuration = SmoltcpDuration::from_secs(300);

const EPHEMERAL_PORT_BASE: u16 = 49152;

fn smoltcp_now() -> SmoltcpInstant {
	static START: std::sync::OnceLock<StdInstant> = std::sync::OnceLock::new();
	let start = START.get_or_init(StdInstant::now);
	SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

/// IP-medium link whose receive side is a local queue and whose transmit
/// side is the adapter's outbound queue.
struct QueueDevice {
	rx_queue: VecDeque<Vec<u8>>,
	outbound: mpsc::Sender<Vec<u8>>,
	translator: Ipv6Translator,
	stats: Arc<StackStats>,
	mtu: usize,
}

struct QueueRxToken {
	data: Vec<u8>,
}

impl RxToken for QueueRxToken {
	fn consume<R, F>(mut self, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		f(&mut self.data)
	}
}

struct QueueTxToken<'a> {
	outbound: &'a mpsc::Sender<Vec<u8>>,
	translator: &'a Ipv6Translator,
	stats: &'a StackStats,
}

impl<'a> TxToken for QueueTxToken<'a> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut buffer = vec![0u8; len];
		let result = f(&mut buffer);
		self.translator.outbound(&mut buffer);
		match self.outbound.try_send(buffer) {
			Ok(()) => StackStats::incr(&self.stats.packets_out),
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(queue = "outbound", "packet queue full, dropping packet");
				StackStats::incr(&self.stats.dropped_out);
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				trace!("adapter gone, dropping packet");
				StackStats::incr(&self.stats.dropped_out);
			}
		}
		result
	}
}

impl Device for QueueDevice {
	type RxToken<'a> = QueueRxToken;
	type TxToken<'a> = QueueTxToken<'a>;

	fn receive(
		&mut self,
		_timestamp: SmoltcpInstant,
	) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		let data = self.rx_queue.pop_front()?;
		Some((
			QueueRxToken { data },
			QueueTxToken {
				outbound: &self.outbound,
				translator: &self.translator,
				stats: &self.stats,
			},
		))
	}

	fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
		Some(QueueTxToken {
			outbound: &self.outbound,
			translator: &self.translator,
			stats: &self.stats,
		})
	}

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.max_transmission_unit = self.mtu;
		caps.medium = Medium::Ip;
		caps
	}
}

pub(crate) struct StackInner {
	device: QueueDevice,
	iface: Interface,
	pub(crate) sockets: SocketSet<'static>,
	wakers: Vec<Waker>,
}

impl StackInner {
	pub(crate) fn poll(&mut self) -> bool {
		let changed = self
			.iface
			.poll(smoltcp_now(), &mut self.device, &mut self.sockets);
		for waker in self.wakers.drain(..) {
			waker.wake();
		}
		changed
	}

	pub(crate) fn register_waker(&mut self, waker: &Waker) {
		if !self.wakers.iter().any(|w| w.will_wake(waker)) {
			self.wakers.push(waker.clone());
		}
	}

	pub(crate) fn tcp(&mut self, handle: SocketHandle) -> &mut TcpSocket<'static> {
		self.sockets.get_mut::<TcpSocket>(handle)
	}

	fn enqueue(&mut self, mut packet: Vec<u8>) {
		if !self.device.translator.inbound(&mut packet) {
			return;
		}
		if self.device.rx_queue.len() >= MAX_RX_QUEUE {
			warn!(queue = "rx", "packet queue full, dropping oldest packet");
			self.device.rx_queue.pop_front();
		}
		self.device.rx_queue.push_back(packet);
	}
}

#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
	pub v4: Ipv4Addr,
	pub v6: Ipv6Addr,
	pub mtu: usize,
}

/// Handle to the embedded TCP/IP stack. Clones share one interface.
///
/// The interface accepts IPv4 packets for any destination (`any_ip`) and
/// routes every destination through itself. IPv6 has no `any_ip` in
/// smoltcp, so foreign IPv6 destinations are translated to the local
/// address at the device boundary. Either way the stack stands in for all
/// addresses a WireGuard peer might talk to.
#[derive(Clone)]
pub struct NetStack {
	config: StackConfig,
	inner: Arc<Mutex<StackInner>>,
	activity: Arc<Notify>,
	stats: Arc<StackStats>,
}

impl NetStack {
	#[instrument(skip(outbound, stats), fields(v4 = %config.v4, v6 = %config.v6, mtu = config.mtu))]
	pub fn new(
		config: StackConfig,
		outbound: mpsc::Sender<Vec<u8>>,
		stats: Arc<StackStats>,
	) -> Result<Self> {
		let mut device = QueueDevice {
			rx_queue: VecDeque::new(),
			outbound,
			translator: Ipv6Translator::new(config.v6),
			stats: Arc::clone(&stats),
			mtu: config.mtu,
		};

		let mut iface_config = Config::new(HardwareAddress::Ip);
		iface_config.random_seed = fastrand::u64(..);
		let mut iface = Interface::new(iface_config, &mut device, smoltcp_now());

		iface.set_any_ip(true);
		let mut pushed = Ok(());
		iface.update_ip_addrs(|addrs| {
			pushed = addrs
				.push(IpCidr::new(IpAddress::from(IpAddr::V4(config.v4)), 32))
				.and_then(|_| addrs.push(IpCidr::new(IpAddress::from(IpAddr::V6(config.v6)), 128)));
		});
		pushed.map_err(|_| NetstackError::Stack("interface address table full".to_string()))?;

		iface
			.routes_mut()
			.add_default_ipv4_route(config.v4.into())
			.map_err(|e| NetstackError::Stack(format!("default IPv4 route: {e:?}")))?;
		iface
			.routes_mut()
			.add_default_ipv6_route(config.v6.into())
			.map_err(|e| NetstackError::Stack(format!("default IPv6 route: {e:?}")))?;

		debug!("created network stack");

		Ok(Self {
			config,
			inner: Arc::new(Mutex::new(StackInner {
				device,
				iface,
				sockets: SocketSet::new(vec![]),
				wakers: Vec::new(),
			})),
			activity: Arc::new(Notify::new()),
			stats,
		})
	}

	pub fn config(&self) -> &StackConfig {
		&self.config
	}

	pub fn stats(&self) -> &Arc<StackStats> {
		&self.stats
	}

	pub(crate) fn lock(&self) -> std::io::Result<MutexGuard<'_, StackInner>> {
		self.inner
			.lock()
			.map_err(|e| std::io::Error::other(format!("lock poisoned: {}", e)))
	}

	fn lock_stack(&self) -> Result<MutexGuard<'_, StackInner>> {
		self.inner
			.lock()
			.map_err(|e| NetstackError::Stack(format!("lock poisoned: {}", e)))
	}

	/// Feeds one IP packet to the interface and processes it to completion.
	#[instrument(skip(self, packet), fields(len = packet.len()))]
	pub fn inject(&self, packet: Vec<u8>) -> Result<()> {
		let mut inner = self.lock_stack()?;
		inner.enqueue(packet);
		inner.poll();
		trace!("injected packet");
		Ok(())
	}

	/// Runs timers and flushes pending output.
	pub fn poll(&self) -> bool {
		match self.inner.lock() {
			Ok(mut inner) => inner.poll(),
			Err(_) => false,
		}
	}

	/// How long until the interface next needs polling.
	pub fn poll_delay(&self) -> Option<Duration> {
		let mut inner = self.inner.lock().ok()?;
		let StackInner { iface, sockets, .. } = &mut *inner;
		iface
			.poll_delay(smoltcp_now(), sockets)
			.map(|d| Duration::from_micros(d.total_micros()))
	}

	/// Signals the packet pump that socket state changed outside of it.
	pub(crate) fn notify_activity(&self) {
		self.activity.notify_one();
	}

	pub(crate) async fn activity(&self) {
		self.activity.notified().await;
	}

	fn create_tcp_socket() -> TcpSocket<'static> {
		let rx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_RX_BUFFER_SIZE]);
		let tx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_TX_BUFFER_SIZE]);
		let mut socket = TcpSocket::new(rx_buffer, tx_buffer);
		socket.set_nagle_enabled(false);
		socket.set_keep_alive(Some(TCP_KEEP_ALIVE));
		socket.set_timeout(Some(TCP_IDLE_TIMEOUT));
		socket
	}

	/// Creates a socket listening on exactly `local` (the local address for
	/// a foreign IPv6 destination) and hands it the held SYN in the same
	/// critical section, so no other flow can claim it. On failure the SYN
	/// is returned untouched.
	#[instrument(skip(self, syn), fields(%local))]
	pub fn accept_syn(
		&self,
		local: SocketAddr,
		syn: Vec<u8>,
	) -> std::result::Result<SocketHandle, (NetstackError, Vec<u8>)> {
		let mut inner = match self.lock_stack() {
			Ok(inner) => inner,
			Err(e) => return Err((e, syn)),
		};

		let listen = inner.device.translator.local_endpoint(local);
		let mut socket = Self::create_tcp_socket();
		if let Err(e) = socket.listen(IpListenEndpoint {
			addr: Some(IpAddress::from(listen.ip())),
			port: listen.port(),
		}) {
			return Err((NetstackError::Stack(format!("listen failed: {e:?}")), syn));
		}

		let handle = inner.sockets.add(socket);
		inner.enqueue(syn);
		inner.poll();

		debug!("accepted SYN into listening socket");
		Ok(handle)
	}

	/// Opens a connection from the local address of `remote`'s family.
	#[instrument(skip(self), fields(%remote))]
	pub fn connect(&self, remote: SocketAddr) -> Result<SocketHandle> {
		let local_ip = match remote.ip() {
			IpAddr::V4(_) => IpAddr::V4(self.config.v4),
			IpAddr::V6(_) => IpAddr::V6(self.config.v6),
		};
		let mut inner = self.lock_stack()?;

		let mut socket = Self::create_tcp_socket();
		let local_port = EPHEMERAL_PORT_BASE + (fastrand::u16(..) % (u16::MAX - EPHEMERAL_PORT_BASE));
		let local_endpoint = IpEndpoint::new(IpAddress::from(local_ip), local_port);

		let StackInner { iface, sockets, .. } = &mut *inner;
		socket
			.connect(iface.context(), IpEndpoint::from(remote), local_endpoint)
			.map_err(|e| NetstackError::TcpConnect(format!("connect failed: {e:?}")))?;
		let handle = sockets.add(socket);
		inner.poll();

		debug!(%local_ip, local_port, "connecting to peer");
		Ok(handle)
	}

	pub fn socket_state(&self, handle: SocketHandle) -> Option<TcpState> {
		let mut inner = self.inner.lock().ok()?;
		Some(inner.tcp(handle).state())
	}

	pub fn abort(&self, handle: SocketHandle) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.tcp(handle).abort();
			inner.poll();
		}
	}

	/// Forgets the IPv6 translation of a finished or refused flow.
	pub fn forget_flow(&self, key: &FlowKey) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.device.translator.forget_tcp(key.src, key.dst);
		}
	}

	/// Drops a socket from the set. Its handle must not be used afterwards.
	pub fn release(&self, handle: SocketHandle) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.sockets.remove(handle);
			trace!("released socket");
		}
	}

	pub fn socket_count(&self) -> usize {
		self.inner
			.lock()
			.map(|inner| inner.sockets.iter().count())
			.unwrap_or(0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn stack() -> (NetStack, mpsc::Receiver<Vec<u8>>) {
		let (tx, rx) = mpsc::channel(16);
		let stack = NetStack::new(
			StackConfig {
				v4: "10.90.0.1".parse().unwrap(),
				v6: "fd7a:115c:a1e0:1900::1".parse().unwrap(),
				mtu: 1500,
			},
			tx,
			Arc::new(StackStats::default()),
		)
		.unwrap();
		(stack, rx)
	}

	#[test]
	fn test_stack_creation() {
		let (stack, _rx) = stack();
		assert_eq!(stack.config().mtu, 1500);
		assert_eq!(stack.socket_count(), 0);
		stack.poll();
	}

	#[test]
	fn test_connect_emits_syn() {
		let (stack, mut rx) = stack();
		let handle = stack.connect("10.90.0.2:8080".parse().unwrap()).unwrap();

		assert_eq!(stack.socket_state(handle), Some(TcpState::SynSent));
		let packet = rx.try_recv().unwrap();
		assert_eq!(packet[0] >> 4, 4);
		assert_eq!(&packet[12..16], &[10, 90, 0, 1]);
		assert_eq!(&packet[16..20], &[10, 90, 0, 2]);
		assert_eq!(stack.stats().snapshot().packets_out, 1);

		stack.abort(handle);
		stack.release(handle);
		assert_eq!(stack.socket_count(), 0);
	}

	#[test]
	fn test_full_outbound_queue_drops() {
		let (tx, _rx) = mpsc::channel(1);
		let stack = NetStack::new(
			StackConfig {
				v4: "10.90.0.1".parse().unwrap(),
				v6: "fd7a:115c:a1e0:1900::1".parse().unwrap(),
				mtu: 1500,
			},
			tx,
			Arc::new(StackStats::default()),
		)
		.unwrap();

		stack.connect("10.90.0.2:1".parse().unwrap()).unwrap();
		stack.connect("10.90.0.3:1".parse().unwrap()).unwrap();

		let snap = stack.stats().snapshot();
		assert_eq!(snap.packets_out, 1);
		assert_eq!(snap.dropped_out, 1);
	}

	#[test]
	fn test_accept_syn_returns_syn_on_failure() {
		let (stack, _rx) = stack();
		let syn = crate::flow::tests::tcp_packet(
			"10.90.0.2:40000".parse().unwrap(),
			"100.64.0.5:0".parse().unwrap(),
			true,
			false,
		);

		let (_, returned) = stack
			.accept_syn("100.64.0.5:0".parse().unwrap(), syn.clone())
			.unwrap_err();
		assert_eq!(returned, syn);
		assert_eq!(stack.socket_count(), 0);
	}

	#[test]
	fn test_ipv6_foreign_destination_completes_handshake() {
		use smoltcp::wire::{Ipv6Packet, TcpPacket};

		let (stack, mut rx) = stack();
		let peer: SocketAddr = "[fd7a:115c:a1e0:1900::2]:40000".parse().unwrap();
		let dst: SocketAddr = "[fd7a:115c:a1e0::5]:443".parse().unwrap();
		let syn = crate::flow::tests::tcp_packet(peer, dst, true, false);

		let handle = stack.accept_syn(dst, syn).unwrap();
		assert_eq!(stack.socket_state(handle), Some(TcpState::SynReceived));

		let reply = rx.try_recv().unwrap();
		let ip = Ipv6Packet::new_checked(&reply[..]).unwrap();
		assert_eq!(Ipv6Addr::from(ip.src_addr()), "fd7a:115c:a1e0::5".parse::<Ipv6Addr>().unwrap());
		assert_eq!(Ipv6Addr::from(ip.dst_addr()), "fd7a:115c:a1e0:1900::2".parse::<Ipv6Addr>().unwrap());
		let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
		assert!(tcp.syn() && tcp.ack());
		assert_eq!(tcp.src_port(), 443);

		let key = FlowKey { src: peer, dst };
		stack.forget_flow(&key);
		stack.abort(handle);
		stack.release(handle);
	}
}
