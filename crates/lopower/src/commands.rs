// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Offline operations on the stored configuration. Each returns the text
//! to print. A running bridge picks up changes on SIGHUP.

use crate::cli::{AddPeerArgs, RemovePeerArgs};
use anyhow::{anyhow, Context, Result};
use lopower_common::ConfigStore;
use std::fmt::Write as _;
use tracing::instrument;

#[instrument(skip_all, fields(peer = %args.public_key))]
pub async fn add_peer(store: &ConfigStore, args: &AddPeerArgs) -> Result<String> {
	let mut config = store.load().await.context("failed to load configuration")?;
	let peer = config.add_peer(args.public_key)?;
	store.store(&config).await.context("failed to store configuration")?;

	let mut out = String::new();
	writeln!(out, "Added peer {}", peer.public_key)?;
	writeln!(out, "  IPv4: {}", peer.v4)?;
	writeln!(out, "  IPv6: {}", peer.v6)?;
	writeln!(out)?;
	out.push_str(&config.peer_client_config(&peer, args.endpoint.as_deref(), &args.routes));
	Ok(out)
}

#[instrument(skip_all, fields(peer = %args.public_key))]
pub async fn remove_peer(store: &ConfigStore, args: &RemovePeerArgs) -> Result<String> {
	let mut config = store.read().await.context("failed to read configuration")?;
	let peer = config
		.remove_peer(&args.public_key)
		.ok_or_else(|| anyhow!("peer {} is not configured", args.public_key))?;
	store.store(&config).await.context("failed to store configuration")?;

	Ok(format!("Removed peer {} ({}, {})\n", peer.public_key, peer.v4, peer.v6))
}

pub async fn show(store: &ConfigStore) -> Result<String> {
	let config = store.load().await.context("failed to load configuration")?;

	let mut out = String::new();
	writeln!(out, "Config:     {}", store.path().display())?;
	writeln!(out, "Public key: {}", config.public_key())?;
	writeln!(out, "Node key:   {}", config.public_key().to_text())?;
	writeln!(out, "IPv4:       {} (pool {})", config.v4, config.v4_cidr)?;
	writeln!(out, "IPv6:       {} (pool {})", config.v6, config.v6_cidr)?;
	if config.peers.is_empty() {
		writeln!(out, "Peers:      none")?;
	} else {
		writeln!(out, "Peers:")?;
		for peer in &config.peers {
			writeln!(out, "  {}  {}  {}", peer.public_key, peer.v4, peer.v6)?;
		}
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use lopower_common::WgKeyPair;
	use tempfile::TempDir;

	fn store_in(dir: &TempDir) -> ConfigStore {
		ConfigStore::new(dir.path().join("config.json"))
	}

	#[tokio::test]
	async fn add_peer_persists_and_renders_client_config() {
		let dir = TempDir::new().unwrap();
		let store = store_in(&dir);
		let key = *WgKeyPair::generate().public_key();

		let out = add_peer(
			&store,
			&AddPeerArgs {
				public_key: key,
				endpoint: Some("vpn.example.com:51820".to_string()),
				routes: vec![],
			},
		)
		.await
		.unwrap();

		assert!(out.contains("IPv4: 10.90.0.2"));
		assert!(out.contains("Endpoint = vpn.example.com:51820"));
		let config = store.read().await.unwrap();
		assert_eq!(config.peers.len(), 1);
		assert_eq!(config.peers[0].public_key, key);
	}

	#[tokio::test]
	async fn add_duplicate_peer_fails_without_writing() {
		let dir = TempDir::new().unwrap();
		let store = store_in(&dir);
		let args = AddPeerArgs {
			public_key: *WgKeyPair::generate().public_key(),
			endpoint: None,
			routes: vec![],
		};

		add_peer(&store, &args).await.unwrap();
		let before = std::fs::read(store.path()).unwrap();
		assert!(add_peer(&store, &args).await.is_err());
		assert_eq!(std::fs::read(store.path()).unwrap(), before);
	}

	#[tokio::test]
	async fn remove_peer_frees_address() {
		let dir = TempDir::new().unwrap();
		let store = store_in(&dir);
		let first = *WgKeyPair::generate().public_key();

		add_peer(
			&store,
			&AddPeerArgs {
				public_key: first,
				endpoint: None,
				routes: vec![],
			},
		)
		.await
		.unwrap();
		remove_peer(&store, &RemovePeerArgs { public_key: first })
			.await
			.unwrap();
		assert!(store.read().await.unwrap().peers.is_empty());

		let err = remove_peer(&store, &RemovePeerArgs { public_key: first }).await;
		assert!(err.is_err());
	}

	#[tokio::test]
	async fn show_lists_peers() {
		let dir = TempDir::new().unwrap();
		let store = store_in(&dir);
		let empty = show(&store).await.unwrap();
		assert!(empty.contains("Peers:      none"));

		let key = *WgKeyPair::generate().public_key();
		add_peer(
			&store,
			&AddPeerArgs {
				public_key: key,
				endpoint: None,
				routes: vec![],
			},
		)
		.await
		.unwrap();

		let out = show(&store).await.unwrap();
		assert!(out.contains(&key.to_base64()));
		assert!(out.contains("10.90.0.2"));
	}
}
