// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The overlay connectivity provider as seen by the forwarder.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub trait OverlayIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> OverlayIo for T {}

pub type OverlayStream = Box<dyn OverlayIo>;

/// A connection initiated from inside the overlay toward a WireGuard peer.
pub struct InboundConnection {
	pub stream: OverlayStream,
	/// Peer address and port the overlay side asked for.
	pub destination: SocketAddr,
}

#[async_trait]
pub trait Overlay: Send + Sync + 'static {
	async fn dial(&self, addr: SocketAddr) -> io::Result<OverlayStream>;

	/// Next inbound connection, or `None` when the provider does not accept
	/// connections (or has stopped).
	async fn accept(&self) -> io::Result<Option<InboundConnection>> {
		Ok(None)
	}
}

/// Reaches overlay destinations through the host network, for hosts joined
/// to the overlay by a system daemon.
#[derive(Debug, Clone)]
pub struct DirectOverlay {
	dial_timeout: Duration,
}

impl DirectOverlay {
	pub fn new(dial_timeout: Duration) -> Self {
		Self { dial_timeout }
	}
}

impl Default for DirectOverlay {
	fn default() -> Self {
		Self::new(DEFAULT_DIAL_TIMEOUT)
	}
}

#[async_trait]
impl Overlay for DirectOverlay {
	#[instrument(skip(self), fields(%addr))]
	async fn dial(&self, addr: SocketAddr) -> io::Result<OverlayStream> {
		let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "overlay dial timed out"))??;
		stream.set_nodelay(true)?;
		debug!("dialed overlay destination");
		Ok(Box::new(stream))
	}
}
