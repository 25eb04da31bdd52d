// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The network-interface contract [`WgDevice`](crate::WgDevice) consumes.
//!
//! A kernel TUN device satisfies the same shape: a fixed MTU and name, a
//! lifecycle event stream, and batched packet read/write. `read` blocks until
//! a packet is available or the device closes.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
	Up,
	Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunError {
	/// End of stream. Returned by every read and write once the device is closed.
	#[error("device closed")]
	Closed,

	#[error("packet of {len} bytes exceeds MTU {mtu}")]
	TooLarge { len: usize, mtu: usize },
}

#[async_trait]
pub trait TunDevice: Send + Sync + 'static {
	fn name(&self) -> &str;

	fn mtu(&self) -> usize;

	/// Upper bound on packets moved by one `read` or `write` call.
	fn batch_size(&self) -> usize {
		1
	}

	/// Lifecycle events. The receiver can be taken once; the stream ends after
	/// [`TunEvent::Closed`].
	fn events(&self) -> Option<mpsc::Receiver<TunEvent>>;

	/// Appends up to `batch_size` packets to `packets`, waiting for at least one.
	async fn read(&self, packets: &mut Vec<Vec<u8>>) -> Result<usize, TunError>;

	/// Hands packets to the device and returns how many were accepted.
	async fn write(&self, packets: &[Vec<u8>]) -> Result<usize, TunError>;

	/// Idempotent. Wakes pending reads with [`TunError::Closed`].
	fn close(&self);
}
