// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{DeviceError, Result};
use crate::router::Router;
use defguard_boringtun::noise::Tunn;
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use lopower_common::{Peer, WgKeyPair, WgPublicKey};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Session indices are 24 bits; boringtun owns the low byte.
const PEER_INDEX_MASK: u32 = 0x00ff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
	pub public_key: WgPublicKey,
	pub allowed_ips: Vec<IpAddr>,
	pub endpoint: Option<SocketAddr>,
	pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			allowed_ips: Vec::new(),
			endpoint: None,
			persistent_keepalive: None,
		}
	}

	pub fn with_allowed_ip(mut self, ip: IpAddr) -> Self {
		self.allowed_ips.push(ip);
		self
	}

	pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
		self.endpoint = Some(endpoint);
		self
	}

	pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
		self.persistent_keepalive = Some(seconds);
		self
	}
}

impl From<&Peer> for PeerConfig {
	fn from(peer: &Peer) -> Self {
		Self::new(peer.public_key)
			.with_allowed_ip(IpAddr::V4(peer.v4))
			.with_allowed_ip(IpAddr::V6(peer.v6))
	}
}

/// Live WireGuard state for one peer. Survives reconfiguration as long as
/// the peer keeps its key.
pub struct PeerSlot {
	public_key: WgPublicKey,
	index: u32,
	pub(crate) tunn: Mutex<Tunn>,
	endpoint: std::sync::Mutex<Option<SocketAddr>>,
	rx_bytes: AtomicU64,
	tx_bytes: AtomicU64,
}

impl PeerSlot {
	fn new(secret: &StaticSecret, config: &PeerConfig, index: u32) -> Self {
		let tunn = Tunn::new(
			secret.clone(),
			PublicKey::from(*config.public_key.as_bytes()),
			None,
			config.persistent_keepalive,
			index,
			None,
		);

		Self {
			public_key: config.public_key,
			index,
			tunn: Mutex::new(tunn),
			endpoint: std::sync::Mutex::new(config.endpoint),
			rx_bytes: AtomicU64::new(0),
			tx_bytes: AtomicU64::new(0),
		}
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public_key
	}

	pub fn index(&self) -> u32 {
		self.index
	}

	pub fn endpoint(&self) -> Option<SocketAddr> {
		self.endpoint.lock().ok().and_then(|e| *e)
	}

	pub fn set_endpoint(&self, addr: SocketAddr) {
		if let Ok(mut endpoint) = self.endpoint.lock() {
			if *endpoint != Some(addr) {
				debug!(peer = %self.public_key, %addr, "peer endpoint updated");
				*endpoint = Some(addr);
			}
		}
	}

	pub(crate) fn add_rx(&self, bytes: usize) {
		self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
	}

	pub(crate) fn add_tx(&self, bytes: usize) {
		self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
	}

	pub fn rx_bytes(&self) -> u64 {
		self.rx_bytes.load(Ordering::Relaxed)
	}

	pub fn tx_bytes(&self) -> u64 {
		self.tx_bytes.load(Ordering::Relaxed)
	}
}

impl fmt::Debug for PeerSlot {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PeerSlot")
			.field("public_key", &self.public_key)
			.field("index", &self.index)
			.field("endpoint", &self.endpoint())
			.finish()
	}
}

/// Immutable snapshot of the device identity and its peers.
pub struct PeerTable {
	secret: StaticSecret,
	public: PublicKey,
	local_key: WgPublicKey,
	peers: HashMap<WgPublicKey, Arc<PeerSlot>>,
	by_index: HashMap<u32, Arc<PeerSlot>>,
	router: Router,
}

impl PeerTable {
	pub fn empty(identity: &WgKeyPair) -> Self {
		let secret = StaticSecret::from(*identity.private_key().expose_bytes());
		let public = PublicKey::from(&secret);
		Self {
			secret,
			public,
			local_key: *identity.public_key(),
			peers: HashMap::new(),
			by_index: HashMap::new(),
			router: Router::new(),
		}
	}

	/// Builds a table for `peers`, reusing the live slot of every peer that
	/// is also in `previous` under the same identity. Nothing is built if the
	/// peer list is inconsistent.
	#[instrument(skip_all, fields(peers = peers.len()))]
	pub fn build(
		identity: &WgKeyPair,
		peers: &[PeerConfig],
		previous: Option<&PeerTable>,
		next_index: &AtomicU32,
	) -> Result<Self> {
		let mut table = Self::empty(identity);
		let previous = previous.filter(|p| p.local_key == table.local_key);

		for peer in peers {
			if peer.public_key == table.local_key {
				return Err(DeviceError::InvalidPeers(format!(
					"peer {} uses the device's own key",
					peer.public_key
				)));
			}
			if table.peers.contains_key(&peer.public_key) {
				return Err(DeviceError::InvalidPeers(format!(
					"peer {} listed twice",
					peer.public_key
				)));
			}
			for ip in &peer.allowed_ips {
				table.router.insert(*ip, peer.public_key).map_err(|owner| {
					DeviceError::InvalidPeers(format!(
						"address {} claimed by both {} and {}",
						ip, owner, peer.public_key
					))
				})?;
			}

			let slot = match previous.and_then(|p| p.peers.get(&peer.public_key)) {
				Some(existing) => Arc::clone(existing),
				None => {
					let index = next_index.fetch_add(1, Ordering::Relaxed) & PEER_INDEX_MASK;
					Arc::new(PeerSlot::new(&table.secret, peer, index))
				}
			};
			table.by_index.insert(slot.index(), Arc::clone(&slot));
			table.peers.insert(peer.public_key, slot);
		}

		debug!(routes = table.router.len(), "built peer table");
		Ok(table)
	}

	pub fn local_key(&self) -> &WgPublicKey {
		&self.local_key
	}

	pub(crate) fn secret(&self) -> &StaticSecret {
		&self.secret
	}

	pub(crate) fn public(&self) -> &PublicKey {
		&self.public
	}

	pub fn peer(&self, key: &WgPublicKey) -> Option<&Arc<PeerSlot>> {
		self.peers.get(key)
	}

	pub fn by_index(&self, index: u32) -> Option<&Arc<PeerSlot>> {
		self.by_index.get(&index)
	}

	/// Peer that owns destination `ip`.
	pub fn route(&self, ip: IpAddr) -> Option<&Arc<PeerSlot>> {
		self.router.route(ip).and_then(|key| self.peers.get(key))
	}

	pub fn allows(&self, slot: &PeerSlot, src: IpAddr) -> bool {
		self.router.allows(slot.public_key(), src)
	}

	pub fn slots(&self) -> impl Iterator<Item = &Arc<PeerSlot>> {
		self.peers.values()
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}
}

impl fmt::Debug for PeerTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PeerTable")
			.field("local_key", &self.local_key)
			.field("peers", &self.peers.len())
			.field("routes", &self.router.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn peer(last_octet: u8) -> PeerConfig {
		PeerConfig::new(*WgKeyPair::generate().public_key())
			.with_allowed_ip(IpAddr::from([10, 90, 0, last_octet]))
	}

	#[test]
	fn test_build_routes_peers() {
		let identity = WgKeyPair::generate();
		let next = AtomicU32::new(1);
		let a = peer(2);
		let b = peer(3);

		let table = PeerTable::build(&identity, &[a.clone(), b.clone()], None, &next).unwrap();

		assert_eq!(table.len(), 2);
		let routed = table.route(IpAddr::from([10, 90, 0, 3])).unwrap();
		assert_eq!(routed.public_key(), &b.public_key);
		assert!(table.by_index(routed.index()).is_some());
		assert!(table.allows(routed, IpAddr::from([10, 90, 0, 3])));
		assert!(!table.allows(routed, IpAddr::from([10, 90, 0, 2])));
	}

	#[test]
	fn test_build_reuses_live_slots() {
		let identity = WgKeyPair::generate();
		let next = AtomicU32::new(1);
		let a = peer(2);
		let b = peer(3);
		let c = peer(4);

		let first = PeerTable::build(&identity, &[a.clone(), b.clone()], None, &next).unwrap();
		let second = PeerTable::build(&identity, &[a.clone(), c.clone()], Some(&first), &next).unwrap();

		let old_a = first.peer(&a.public_key).unwrap();
		let new_a = second.peer(&a.public_key).unwrap();
		assert!(Arc::ptr_eq(old_a, new_a));
		assert!(second.peer(&b.public_key).is_none());
		assert!(second.route(IpAddr::from([10, 90, 0, 3])).is_none());
		assert_ne!(
			second.peer(&c.public_key).unwrap().index(),
			old_a.index()
		);
	}

	#[test]
	fn test_build_does_not_reuse_across_identities() {
		let next = AtomicU32::new(1);
		let a = peer(2);

		let first = PeerTable::build(&WgKeyPair::generate(), &[a.clone()], None, &next).unwrap();
		let second =
			PeerTable::build(&WgKeyPair::generate(), &[a.clone()], Some(&first), &next).unwrap();

		assert!(!Arc::ptr_eq(
			first.peer(&a.public_key).unwrap(),
			second.peer(&a.public_key).unwrap()
		));
	}

	#[test]
	fn test_build_rejects_duplicate_peer() {
		let identity = WgKeyPair::generate();
		let next = AtomicU32::new(1);
		let a = peer(2);

		let result = PeerTable::build(&identity, &[a.clone(), a], None, &next);
		assert!(matches!(result, Err(DeviceError::InvalidPeers(_))));
	}

	#[test]
	fn test_build_rejects_shared_address() {
		let identity = WgKeyPair::generate();
		let next = AtomicU32::new(1);

		let result = PeerTable::build(&identity, &[peer(2), peer(2)], None, &next);
		assert!(matches!(result, Err(DeviceError::InvalidPeers(_))));
	}

	#[test]
	fn test_build_rejects_own_key() {
		let identity = WgKeyPair::generate();
		let next = AtomicU32::new(1);
		let me = PeerConfig::new(*identity.public_key());

		let result = PeerTable::build(&identity, &[me], None, &next);
		assert!(matches!(result, Err(DeviceError::InvalidPeers(_))));
	}

	#[test]
	fn test_peer_config_from_config_peer() {
		let peer = Peer {
			public_key: *WgKeyPair::generate().public_key(),
			v4: "10.90.0.2".parse().unwrap(),
			v6: "fd7a:115c:a1e0:1900::2".parse().unwrap(),
		};
		let config = PeerConfig::from(&peer);
		assert_eq!(config.allowed_ips, peer.addresses().to_vec());
	}
}
