// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
	/// SIGHUP: re-read the configuration.
	Reload,
	/// SIGINT or SIGTERM.
	Shutdown,
}

#[cfg(unix)]
pub struct Signals {
	hangup: tokio::signal::unix::Signal,
	terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
	pub fn new() -> io::Result<Self> {
		use tokio::signal::unix::{signal, SignalKind};
		Ok(Self {
			hangup: signal(SignalKind::hangup())?,
			terminate: signal(SignalKind::terminate())?,
		})
	}

	pub async fn next(&mut self) -> SignalEvent {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => SignalEvent::Shutdown,
			_ = self.terminate.recv() => SignalEvent::Shutdown,
			_ = self.hangup.recv() => SignalEvent::Reload,
		}
	}
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
	pub fn new() -> io::Result<Self> {
		Ok(Self)
	}

	pub async fn next(&mut self) -> SignalEvent {
		let _ = tokio::signal::ctrl_c().await;
		SignalEvent::Shutdown
	}
}
