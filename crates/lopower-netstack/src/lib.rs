// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User-space network side of the bridge.
//!
//! [`NetstackTun`] satisfies the packet-device contract of the WireGuard
//! device with two bounded queues. The packet pump feeds what the device
//! writes into an embedded smoltcp interface that answers for every address,
//! and the [`Forwarder`] turns the TCP connections peers open into
//! connections inside the overlay.

pub mod adapter;
pub mod bridge;
pub mod device;
pub mod error;
pub mod flow;
pub mod forwarder;
pub mod overlay;
pub mod pump;
pub mod stats;
pub mod stream;
mod translate;

pub use adapter::{AdapterConfig, NetstackTun, StackPort, DEFAULT_MTU};
pub use bridge::{Bridge, BridgeConfig};
pub use device::{NetStack, StackConfig};
pub use error::{NetstackError, Result};
pub use flow::{classify, FlowKey, TcpSegment};
pub use forwarder::{
	default_allow, Forwarder, ForwarderConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_IN_FLIGHT_SYN,
};
pub use overlay::{DirectOverlay, InboundConnection, Overlay, OverlayIo, OverlayStream};
pub use stats::{StackStats, StatsSnapshot};
pub use stream::VirtualTcpStream;
