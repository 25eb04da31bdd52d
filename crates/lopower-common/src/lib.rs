// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identity and addressing state for the lopower bridge.
//!
//! A single [`Config`] record holds the node's WireGuard private key, its
//! local IPv4/IPv6 addresses, the pools peers are allocated from, and the
//! admitted peers. [`ConfigStore`] loads and atomically persists it.

pub mod config;
pub mod keys;
pub mod pool;

pub use config::{
	Config, ConfigError, ConfigStore, Peer, DEFAULT_V4_CIDR, DEFAULT_V6_CIDR, INTERFACE_NAME,
};
pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use pool::{first_usable_v4, first_usable_v6, next_free_v4, next_free_v6, PoolError};
