// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Runs the whole bridge and talks to it as a WireGuard client would.

use defguard_boringtun::noise::{Tunn, TunnResult};
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use lopower::{Service, ServiceOptions};
use lopower_common::{Config, ConfigStore, WgKeyPair};
use lopower_netstack::DirectOverlay;
use lopower_wg::{TunDevice, TunError};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;

const TIMEOUT: Duration = Duration::from_secs(5);

fn options() -> ServiceOptions {
	ServiceOptions {
		listen_port: 0,
		shutdown_grace: Duration::from_secs(1),
		..ServiceOptions::default()
	}
}

async fn seeded_store(dir: &TempDir, peers: &[&WgKeyPair]) -> (ConfigStore, Config) {
	let store = ConfigStore::new(dir.path().join("config.json"));
	let mut config = store.load().await.unwrap();
	for peer in peers {
		config.add_peer(*peer.public_key()).unwrap();
	}
	store.store(&config).await.unwrap();
	(store, config)
}

async fn start(store: ConfigStore) -> Service {
	Service::start(store, options(), Arc::new(DirectOverlay::default()))
		.await
		.unwrap()
}

fn echo_request(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
	let icmp = Icmpv4Repr::EchoRequest {
		ident: 7,
		seq_no: 1,
		data: b"lopower",
	};
	let ip = Ipv4Repr {
		src_addr: src.into(),
		dst_addr: dst.into(),
		next_header: IpProtocol::Icmp,
		payload_len: icmp.buffer_len(),
		hop_limit: 64,
	};
	let caps = ChecksumCapabilities::default();
	let mut buf = vec![0u8; ip.buffer_len() + icmp.buffer_len()];
	ip.emit(&mut Ipv4Packet::new_unchecked(&mut buf), &caps);
	let mut packet = Ipv4Packet::new_unchecked(&mut buf);
	icmp.emit(&mut Icmpv4Packet::new_unchecked(packet.payload_mut()), &caps);
	buf
}

struct Client {
	tunn: Tunn,
	socket: UdpSocket,
	server: SocketAddr,
}

impl Client {
	async fn new(keys: &WgKeyPair, server_key: &WgKeyPair, port: u16) -> Self {
		Self {
			tunn: Tunn::new(
				StaticSecret::from(*keys.private_key().expose_bytes()),
				PublicKey::from(*server_key.public_key().as_bytes()),
				None,
				None,
				11,
				None,
			),
			socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
			server: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
		}
	}

	async fn send(&mut self, packet: &[u8]) {
		let mut out = vec![0u8; 2048];
		if let TunnResult::WriteToNetwork(data) = self.tunn.encapsulate(packet, &mut out) {
			self.socket.send_to(data, self.server).await.unwrap();
		}
	}

	/// Next decrypted IPv4 packet, answering handshake traffic on the way.
	async fn recv(&mut self) -> Vec<u8> {
		let mut buf = vec![0u8; 2048];
		let mut out = vec![0u8; 2048];
		loop {
			let (len, _) = tokio::time::timeout(TIMEOUT, self.socket.recv_from(&mut buf))
				.await
				.unwrap()
				.unwrap();
			let mut flush = false;
			match self.tunn.decapsulate(None, &buf[..len], &mut out) {
				TunnResult::WriteToTunnelV4(data, _) => return data.to_vec(),
				TunnResult::WriteToNetwork(data) => {
					self.socket.send_to(data, self.server).await.unwrap();
					flush = true;
				}
				_ => {}
			}
			if flush {
				while let TunnResult::WriteToNetwork(data) = self.tunn.decapsulate(None, &[], &mut out) {
					self.socket.send_to(data, self.server).await.unwrap();
				}
			}
		}
	}
}

#[tokio::test]
async fn test_ping_through_tunnel_is_answered() {
	let dir = TempDir::new().unwrap();
	let client_keys = WgKeyPair::generate();
	let (store, config) = seeded_store(&dir, &[&client_keys]).await;
	let service = start(store).await;

	let mut client = Client::new(&client_keys, &config.keypair(), service.listen_addr().port()).await;
	let peer_v4 = config.peers[0].v4;
	let target = Ipv4Addr::new(100, 64, 0, 5);

	client.send(&echo_request(peer_v4, target)).await;
	let reply = client.recv().await;

	let ip = Ipv4Packet::new_checked(&reply).unwrap();
	assert_eq!(Ipv4Addr::from(ip.src_addr()), target);
	assert_eq!(Ipv4Addr::from(ip.dst_addr()), peer_v4);
	let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
	assert_eq!(icmp.msg_type(), Icmpv4Message::EchoReply);

	service.shutdown().await;
}

#[tokio::test]
async fn test_reload_applies_new_peers_and_keeps_table_on_error() {
	let dir = TempDir::new().unwrap();
	let (store, _) = seeded_store(&dir, &[]).await;
	let mut service = start(store.clone()).await;
	assert_eq!(service.device().peers().await.unwrap().len(), 0);

	let mut config = store.read().await.unwrap();
	config.add_peer(*WgKeyPair::generate().public_key()).unwrap();
	store.store(&config).await.unwrap();

	service.reload().await.unwrap();
	assert_eq!(service.device().peers().await.unwrap().len(), 1);
	assert_eq!(service.config().peers.len(), 1);

	std::fs::write(store.path(), b"{ not json").unwrap();
	assert!(service.reload().await.is_err());
	assert_eq!(service.device().peers().await.unwrap().len(), 1);
	assert_eq!(service.config(), &config);

	service.shutdown().await;
}

#[tokio::test]
async fn test_reload_rejects_changed_local_addresses() {
	let dir = TempDir::new().unwrap();
	let (store, original) = seeded_store(&dir, &[]).await;
	let mut service = start(store.clone()).await;

	let mut moved = Config::generate(
		"10.91.0.0/24".parse().unwrap(),
		"fd7a:115c:a1e0:1901::/64".parse().unwrap(),
	)
	.unwrap();
	moved.private_key = original.private_key.clone();
	store.store(&moved).await.unwrap();

	assert!(service.reload().await.is_err());
	assert_eq!(service.config(), &original);

	service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_adapter_and_device() {
	let dir = TempDir::new().unwrap();
	let (store, _) = seeded_store(&dir, &[]).await;
	let service = start(store).await;
	let tun = service.bridge().tun();

	service.shutdown().await;

	assert!(!service.device().is_running());
	let mut packets = Vec::new();
	assert_eq!(tun.read(&mut packets).await, Err(TunError::Closed));
}

#[tokio::test]
async fn test_corrupt_config_is_fatal() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("config.json");
	std::fs::write(&path, b"{\"PrivKey\": 1}").unwrap();

	let result = Service::start(ConfigStore::new(path), options(), Arc::new(DirectOverlay::default())).await;
	assert!(result.is_err());
}
