// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPrivateKey, WgPublicKey};
use crate::pool::{self, PoolError};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

pub const DEFAULT_V4_CIDR: &str = "10.90.0.0/24";
pub const DEFAULT_V6_CIDR: &str = "fd7a:115c:a1e0:1900::/64";

/// Name given to the WireGuard interface in device configuration.
pub const INTERFACE_NAME: &str = "lopower0";

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("I/O error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_json::Error),

	#[error("invalid config: {0}")]
	Invalid(String),

	#[error("address pool error: {0}")]
	Pool(#[from] PoolError),

	#[error("peer {0} already exists")]
	DuplicatePeer(WgPublicKey),

	#[error("failed to get home directory")]
	NoHomeDir,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
	move |source| ConfigError::Io {
		path: path.to_path_buf(),
		source,
	}
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
	D: Deserializer<'de>,
	T: Deserialize<'de>,
{
	Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A WireGuard client admitted to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
	#[serde(rename = "PubKey")]
	pub public_key: WgPublicKey,
	#[serde(rename = "V4")]
	pub v4: Ipv4Addr,
	#[serde(rename = "V6")]
	pub v6: Ipv6Addr,
}

impl Peer {
	pub fn addresses(&self) -> [IpAddr; 2] {
		[IpAddr::V4(self.v4), IpAddr::V6(self.v6)]
	}
}

/// The node's identity and addressing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
	#[serde(rename = "PrivKey", with = "crate::keys::private_key_text")]
	pub private_key: WgPrivateKey,

	#[serde(rename = "Peers", default, deserialize_with = "null_as_empty")]
	pub peers: Vec<Peer>,

	/// Local IPv4 address; first usable address of `v4_cidr`.
	#[serde(rename = "V4")]
	pub v4: Ipv4Addr,
	/// Local IPv6 address; first usable address of `v6_cidr`.
	#[serde(rename = "V6")]
	pub v6: Ipv6Addr,

	#[serde(rename = "V4CIDR")]
	pub v4_cidr: Ipv4Net,
	#[serde(rename = "V6CIDR")]
	pub v6_cidr: Ipv6Net,
}

impl Config {
	/// A fresh identity with local addresses taken from the given pools.
	pub fn generate(v4_cidr: Ipv4Net, v6_cidr: Ipv6Net) -> Result<Self> {
		let v4_cidr = v4_cidr.trunc();
		let v6_cidr = v6_cidr.trunc();
		Ok(Self {
			private_key: WgPrivateKey::generate(),
			peers: Vec::new(),
			v4: pool::first_usable_v4(v4_cidr)?,
			v6: pool::first_usable_v6(v6_cidr)?,
			v4_cidr,
			v6_cidr,
		})
	}

	pub fn with_default_pools() -> Result<Self> {
		let v4: Ipv4Net = DEFAULT_V4_CIDR
			.parse()
			.map_err(|_| ConfigError::Invalid(format!("bad default pool {DEFAULT_V4_CIDR}")))?;
		let v6: Ipv6Net = DEFAULT_V6_CIDR
			.parse()
			.map_err(|_| ConfigError::Invalid(format!("bad default pool {DEFAULT_V6_CIDR}")))?;
		Self::generate(v4, v6)
	}

	pub fn keypair(&self) -> WgKeyPair {
		WgKeyPair::from_private_key(self.private_key.clone())
	}

	pub fn public_key(&self) -> WgPublicKey {
		self.private_key.public_key()
	}

	pub fn local_addresses(&self) -> [IpAddr; 2] {
		[IpAddr::V4(self.v4), IpAddr::V6(self.v6)]
	}

	pub fn peer(&self, public_key: &WgPublicKey) -> Option<&Peer> {
		self.peers.iter().find(|p| &p.public_key == public_key)
	}

	/// Peer owning `addr`, if any.
	pub fn peer_for_address(&self, addr: IpAddr) -> Option<&Peer> {
		self.peers.iter().find(|p| p.addresses().contains(&addr))
	}

	/// Checks the addressing invariants: local addresses are the first usable
	/// address of each pool, and every peer address is in its pool, unique, and
	/// distinct from the local addresses.
	pub fn validate(&self) -> Result<()> {
		if self.v4 != pool::first_usable_v4(self.v4_cidr)? {
			return Err(ConfigError::Invalid(format!(
				"local address {} is not the first usable address of {}",
				self.v4, self.v4_cidr
			)));
		}
		if self.v6 != pool::first_usable_v6(self.v6_cidr)? {
			return Err(ConfigError::Invalid(format!(
				"local address {} is not the first usable address of {}",
				self.v6, self.v6_cidr
			)));
		}

		let mut keys = HashSet::new();
		let mut addrs: HashSet<IpAddr> = self.local_addresses().into_iter().collect();
		for peer in &self.peers {
			if !keys.insert(peer.public_key) {
				return Err(ConfigError::DuplicatePeer(peer.public_key));
			}
			if !self.v4_cidr.contains(&peer.v4) || peer.v4 == self.v4_cidr.broadcast() {
				return Err(ConfigError::Invalid(format!(
					"peer {} address {} is outside {}",
					peer.public_key, peer.v4, self.v4_cidr
				)));
			}
			if !self.v6_cidr.contains(&peer.v6) {
				return Err(ConfigError::Invalid(format!(
					"peer {} address {} is outside {}",
					peer.public_key, peer.v6, self.v6_cidr
				)));
			}
			for addr in peer.addresses() {
				if !addrs.insert(addr) {
					return Err(ConfigError::Invalid(format!(
						"address {} of peer {} is already in use",
						addr, peer.public_key
					)));
				}
			}
		}
		Ok(())
	}

	/// Admits a peer, allocating the lowest free address from each pool.
	#[instrument(skip(self), fields(peer = %public_key))]
	pub fn add_peer(&mut self, public_key: WgPublicKey) -> Result<Peer> {
		if self.peer(&public_key).is_some() {
			return Err(ConfigError::DuplicatePeer(public_key));
		}

		let mut used_v4: HashSet<Ipv4Addr> = self.peers.iter().map(|p| p.v4).collect();
		used_v4.insert(self.v4);
		let mut used_v6: HashSet<Ipv6Addr> = self.peers.iter().map(|p| p.v6).collect();
		used_v6.insert(self.v6);

		let peer = Peer {
			public_key,
			v4: pool::next_free_v4(self.v4_cidr, &used_v4)?,
			v6: pool::next_free_v6(self.v6_cidr, &used_v6)?,
		};
		self.peers.push(peer.clone());

		info!(v4 = %peer.v4, v6 = %peer.v6, "admitted peer");
		Ok(peer)
	}

	#[instrument(skip(self), fields(peer = %public_key))]
	pub fn remove_peer(&mut self, public_key: &WgPublicKey) -> Option<Peer> {
		let idx = self.peers.iter().position(|p| &p.public_key == public_key)?;
		let removed = self.peers.remove(idx);
		info!("removed peer");
		Some(removed)
	}

	/// A wg-quick style configuration for the client side of `peer`.
	pub fn peer_client_config(&self, peer: &Peer, endpoint: Option<&str>, allowed: &[IpNet]) -> String {
		let allowed = if allowed.is_empty() {
			"0.0.0.0/0, ::/0".to_string()
		} else {
			allowed
				.iter()
				.map(ToString::to_string)
				.collect::<Vec<_>>()
				.join(", ")
		};

		let mut out = String::new();
		let _ = writeln!(out, "[Interface]");
		let _ = writeln!(out, "PrivateKey = <private key matching {}>", peer.public_key);
		let _ = writeln!(out, "Address = {}/32, {}/128", peer.v4, peer.v6);
		let _ = writeln!(out);
		let _ = writeln!(out, "[Peer]");
		let _ = writeln!(out, "PublicKey = {}", self.public_key());
		let _ = writeln!(out, "AllowedIPs = {}", allowed);
		if let Some(endpoint) = endpoint {
			let _ = writeln!(out, "Endpoint = {}", endpoint);
		}
		let _ = writeln!(out, "PersistentKeepalive = 25");
		out
	}
}

/// Loads and persists the [`Config`] document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
	path: PathBuf,
}

impl ConfigStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// `$HOME/.config/lopower/config.json`.
	pub fn default_path() -> Result<PathBuf> {
		dirs::home_dir()
			.map(|h| h.join(".config").join("lopower").join("config.json"))
			.ok_or(ConfigError::NoHomeDir)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Reads the stored config, creating and persisting a fresh one when the
	/// file does not exist yet.
	#[instrument(skip(self), fields(path = %self.path.display()))]
	pub async fn load(&self) -> Result<Config> {
		match fs::read(&self.path).await {
			Ok(bytes) => Self::decode(&bytes),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				let config = Config::with_default_pools()?;
				self.store(&config).await?;
				info!(public_key = %config.public_key(), "generated new identity");
				Ok(config)
			}
			Err(e) => Err(io_err(&self.path)(e)),
		}
	}

	/// Reads the stored config; a missing file is an error.
	#[instrument(skip(self), fields(path = %self.path.display()))]
	pub async fn read(&self) -> Result<Config> {
		let bytes = fs::read(&self.path).await.map_err(io_err(&self.path))?;
		Self::decode(&bytes)
	}

	fn decode(bytes: &[u8]) -> Result<Config> {
		let config: Config = serde_json::from_slice(bytes)?;
		config.validate()?;
		debug!(peers = config.peers.len(), "loaded config");
		Ok(config)
	}

	/// Replaces the stored config. The document is written to a sibling
	/// temporary file, synced, then renamed over the target.
	#[instrument(skip(self, config), fields(path = %self.path.display()))]
	pub async fn store(&self, config: &Config) -> Result<()> {
		let path = self.path.as_path();
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await.map_err(io_err(parent))?;
			#[cfg(unix)]
			{
				use std::os::unix::fs::PermissionsExt;
				fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
					.await
					.map_err(io_err(parent))?;
			}
		}

		let mut content = serde_json::to_vec_pretty(config)?;
		content.push(b'\n');

		let tmp_path = path.with_extension("json.tmp");
		{
			let mut options = fs::OpenOptions::new();
			options.write(true).create(true).truncate(true);
			#[cfg(unix)]
			options.mode(0o600);

			let mut file = options.open(&tmp_path).await.map_err(io_err(&tmp_path))?;
			file.write_all(&content).await.map_err(io_err(&tmp_path))?;
			file.sync_all().await.map_err(io_err(&tmp_path))?;
		}
		fs::rename(&tmp_path, path).await.map_err(io_err(path))?;

		debug!(bytes = content.len(), "stored config");
		Ok(())
	}
}
