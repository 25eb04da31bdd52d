// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Userspace WireGuard device.
//!
//! [`WgDevice`] terminates WireGuard sessions for a static set of peers on a
//! UDP socket and exchanges plaintext IP packets with any [`TunDevice`]
//! implementation. The peer set is held as an immutable [`PeerTable`]
//! snapshot that [`WgDevice::configure`] replaces atomically.

pub mod device;
pub mod error;
pub mod packet;
pub mod peers;
pub mod router;
pub mod tun;

pub use device::{DeviceConfig, WgDevice, DEFAULT_LISTEN_PORT};
pub use error::{DeviceError, Result};
pub use peers::{PeerConfig, PeerSlot, PeerTable};
pub use router::Router;
pub use tun::{TunDevice, TunError, TunEvent};
