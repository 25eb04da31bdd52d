// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Text prefix of a persisted private key.
pub const PRIVATE_KEY_PREFIX: &str = "privkey:";
/// Text prefix of a persisted public key.
pub const PUBLIC_KEY_PREFIX: &str = "nodekey:";

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),

	#[error("missing key prefix {0:?}")]
	MissingPrefix(&'static str),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn to_array(bytes: Vec<u8>) -> Result<[u8; 32]> {
	if bytes.len() != 32 {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; 32];
	arr.copy_from_slice(&bytes);
	Ok(arr)
}

fn decode_base64(s: &str) -> Result<[u8; 32]> {
	let bytes = match STANDARD.decode(s) {
		Ok(bytes) => bytes,
		Err(_) => STANDARD_NO_PAD.decode(s)?,
	};
	to_array(bytes)
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; 32],
}

impl WgPrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
		}
	}

	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: to_array(hex::decode(s)?)?,
		})
	}

	/// Parses the persisted `privkey:<hex>` form.
	pub fn from_text(s: &str) -> Result<Self> {
		let hex_part = s
			.strip_prefix(PRIVATE_KEY_PREFIX)
			.ok_or(KeyError::MissingPrefix(PRIVATE_KEY_PREFIX))?;
		Self::from_hex(hex_part)
	}

	/// Persisted `privkey:<hex>` form. Only the config store should call this.
	pub fn to_text(&self) -> String {
		format!("{}{}", PRIVATE_KEY_PREFIX, hex::encode(self.bytes))
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		let public = PublicKey::from(&secret);
		WgPublicKey {
			bytes: *public.as_bytes(),
		}
	}

	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl PartialEq for WgPrivateKey {
	fn eq(&self, other: &Self) -> bool {
		self.bytes == other.bytes
	}
}

impl Eq for WgPrivateKey {}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

/// Serde adapter that writes the real `privkey:<hex>` text. Used by the
/// persisted config; the key itself never serializes in the clear.
pub mod private_key_text {
	use super::WgPrivateKey;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(key: &WgPrivateKey, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&key.to_text())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<WgPrivateKey, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		WgPrivateKey::from_text(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey {
	bytes: [u8; 32],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: to_array(hex::decode(s)?)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	/// Persisted `nodekey:<hex>` form.
	pub fn to_text(&self) -> String {
		format!("{}{}", PUBLIC_KEY_PREFIX, self.to_hex())
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl FromStr for WgPublicKey {
	type Err = KeyError;

	/// Accepts `nodekey:<hex>` or WireGuard base64.
	fn from_str(s: &str) -> Result<Self> {
		let s = s.trim();
		match s.strip_prefix(PUBLIC_KEY_PREFIX) {
			Some(hex_part) => Self::from_hex(hex_part),
			None => Self::from_base64(s),
		}
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = self.to_base64();
		let prefix = if b64.len() >= 8 { &b64[..8] } else { &b64 };
		f.debug_struct("WgPublicKey")
			.field("prefix", &format!("{}...", prefix))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_text())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(WgPrivateKey::generate())
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}
