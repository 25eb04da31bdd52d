// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use lopower_common::WgPublicKey;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;

/// Allowed-address table: which peer owns each tunnel address.
///
/// Peers are allocated single host addresses, so lookups are exact matches
/// and an address has at most one owner.
#[derive(Debug, Clone, Default)]
pub struct Router {
	routes: HashMap<IpAddr, WgPublicKey>,
}

impl Router {
	pub fn new() -> Self {
		Self::default()
	}

	/// Assigns `ip` to `peer`. Fails with the current owner if another peer
	/// already holds it; re-adding the same pair is a no-op.
	pub fn insert(&mut self, ip: IpAddr, peer: WgPublicKey) -> Result<(), WgPublicKey> {
		match self.routes.entry(ip) {
			Entry::Occupied(owner) if *owner.get() != peer => Err(*owner.get()),
			Entry::Occupied(_) => Ok(()),
			Entry::Vacant(slot) => {
				slot.insert(peer);
				Ok(())
			}
		}
	}

	pub fn route(&self, ip: IpAddr) -> Option<&WgPublicKey> {
		self.routes.get(&ip)
	}

	/// Whether `peer` may use `ip` as a packet source.
	pub fn allows(&self, peer: &WgPublicKey, ip: IpAddr) -> bool {
		self.routes.get(&ip) == Some(peer)
	}

	pub fn len(&self) -> usize {
		self.routes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.routes.is_empty()
	}

	pub fn addresses_of<'a>(&'a self, peer: &'a WgPublicKey) -> impl Iterator<Item = IpAddr> + 'a {
		self.routes
			.iter()
			.filter(move |(_, owner)| *owner == peer)
			.map(|(ip, _)| *ip)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use lopower_common::WgKeyPair;

	fn key() -> WgPublicKey {
		*WgKeyPair::generate().public_key()
	}

	#[test]
	fn routes_both_families() {
		let mut router = Router::new();
		let pk = key();
		let v4: IpAddr = "10.90.0.2".parse().unwrap();
		let v6: IpAddr = "fd7a:115c:a1e0:1900::2".parse().unwrap();

		router.insert(v4, pk).unwrap();
		router.insert(v6, pk).unwrap();

		assert_eq!(router.route(v4), Some(&pk));
		assert_eq!(router.route(v6), Some(&pk));
		assert!(router.route("10.90.0.3".parse().unwrap()).is_none());
		assert_eq!(router.addresses_of(&pk).count(), 2);
	}

	#[test]
	fn source_check_matches_owner_only() {
		let mut router = Router::new();
		let owner = key();
		let other = key();
		let ip: IpAddr = "10.90.0.2".parse().unwrap();

		router.insert(ip, owner).unwrap();

		assert!(router.allows(&owner, ip));
		assert!(!router.allows(&other, ip));
		assert!(!router.allows(&owner, "10.90.0.9".parse().unwrap()));
	}

	#[test]
	fn conflicting_owner_is_rejected() {
		let mut router = Router::new();
		let first = key();
		let second = key();
		let ip: IpAddr = "10.90.0.2".parse().unwrap();

		router.insert(ip, first).unwrap();
		router.insert(ip, first).unwrap();

		assert_eq!(router.insert(ip, second), Err(first));
		assert_eq!(router.route(ip), Some(&first));
		assert_eq!(router.len(), 1);
	}
}
