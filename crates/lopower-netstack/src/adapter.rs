// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Queue-backed stand-in for a kernel TUN device.
//!
//! Two bounded queues connect the WireGuard device to the stack: packets the
//! device writes land in `inbound` for the packet pump, packets the stack
//! emits land in `outbound` for the device to read. The queues never share a
//! lock, so a blocked read cannot stall a write or the pump.

use async_trait::async_trait;
use lopower_wg::{TunDevice, TunError, TunEvent};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, instrument, trace};

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_NAME: &str = "nstun";
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_BATCH_SIZE: usize = 32;

const EVENT_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
	pub name: String,
	pub mtu: usize,
	pub queue_depth: usize,
	pub batch_size: usize,
}

impl Default for AdapterConfig {
	fn default() -> Self {
		Self {
			name: DEFAULT_NAME.to_string(),
			mtu: DEFAULT_MTU,
			queue_depth: DEFAULT_QUEUE_DEPTH,
			batch_size: DEFAULT_BATCH_SIZE,
		}
	}
}

/// Stack-side ends of the adapter queues.
#[derive(Debug)]
pub struct StackPort {
	/// Packets written by the WireGuard device, drained by the packet pump.
	pub inbound: mpsc::Receiver<Vec<u8>>,
	/// Where the stack queues packets for the WireGuard device to read.
	pub outbound: mpsc::Sender<Vec<u8>>,
	/// Flips to `true` when the adapter closes.
	pub closed: watch::Receiver<bool>,
}

pub struct NetstackTun {
	config: AdapterConfig,
	inbound: mpsc::Sender<Vec<u8>>,
	outbound: Mutex<mpsc::Receiver<Vec<u8>>>,
	closed_tx: watch::Sender<bool>,
	events_tx: StdMutex<Option<mpsc::Sender<TunEvent>>>,
	events_rx: StdMutex<Option<mpsc::Receiver<TunEvent>>>,
}

impl NetstackTun {
	#[instrument(skip_all, fields(name = %config.name, mtu = config.mtu, depth = config.queue_depth))]
	pub fn new(config: AdapterConfig) -> (Self, StackPort) {
		let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_depth.max(1));
		let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_depth.max(1));
		let (closed_tx, closed_rx) = watch::channel(false);
		let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

		let _ = events_tx.try_send(TunEvent::Up);
		debug!("created virtual adapter");

		let tun = Self {
			config,
			inbound: inbound_tx,
			outbound: Mutex::new(outbound_rx),
			closed_tx,
			events_tx: StdMutex::new(Some(events_tx)),
			events_rx: StdMutex::new(Some(events_rx)),
		};
		let port = StackPort {
			inbound: inbound_rx,
			outbound: outbound_tx,
			closed: closed_rx,
		};
		(tun, port)
	}

	pub fn is_closed(&self) -> bool {
		*self.closed_tx.borrow()
	}

	async fn wait_closed(&self) {
		let mut closed = self.closed_tx.subscribe();
		let _ = closed.wait_for(|c| *c).await;
	}
}

#[async_trait]
impl TunDevice for NetstackTun {
	fn name(&self) -> &str {
		&self.config.name
	}

	fn mtu(&self) -> usize {
		self.config.mtu
	}

	fn batch_size(&self) -> usize {
		self.config.batch_size.max(1)
	}

	fn events(&self) -> Option<mpsc::Receiver<TunEvent>> {
		self.events_rx.lock().ok()?.take()
	}

	async fn read(&self, packets: &mut Vec<Vec<u8>>) -> Result<usize, TunError> {
		if self.is_closed() {
			return Err(TunError::Closed);
		}

		let mut outbound = tokio::select! {
			biased;
			_ = self.wait_closed() => return Err(TunError::Closed),
			guard = self.outbound.lock() => guard,
		};

		let first = tokio::select! {
			biased;
			_ = self.wait_closed() => return Err(TunError::Closed),
			packet = outbound.recv() => packet.ok_or(TunError::Closed)?,
		};
		packets.push(first);

		let mut count = 1;
		while count < self.batch_size() {
			match outbound.try_recv() {
				Ok(packet) => {
					packets.push(packet);
					count += 1;
				}
				Err(_) => break,
			}
		}
		trace!(count, "adapter read");
		Ok(count)
	}

	async fn write(&self, packets: &[Vec<u8>]) -> Result<usize, TunError> {
		if self.is_closed() {
			return Err(TunError::Closed);
		}

		for packet in packets {
			if packet.len() > self.config.mtu {
				return Err(TunError::TooLarge {
					len: packet.len(),
					mtu: self.config.mtu,
				});
			}
		}

		for packet in packets {
			tokio::select! {
				biased;
				_ = self.wait_closed() => return Err(TunError::Closed),
				sent = self.inbound.send(packet.clone()) => sent.map_err(|_| TunError::Closed)?,
			}
		}
		trace!(count = packets.len(), "adapter write");
		Ok(packets.len())
	}

	fn close(&self) {
		if self.closed_tx.send_replace(true) {
			return;
		}

		if let Ok(mut events) = self.events_tx.lock() {
			if let Some(tx) = events.take() {
				let _ = tx.try_send(TunEvent::Closed);
			}
		}
		info!(name = %self.config.name, "virtual adapter closed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::time::Duration;

	fn adapter(depth: usize) -> (Arc<NetstackTun>, StackPort) {
		let (tun, port) = NetstackTun::new(AdapterConfig {
			queue_depth: depth,
			..AdapterConfig::default()
		});
		(Arc::new(tun), port)
	}

	#[tokio::test]
	async fn test_write_reaches_stack_once_in_order() {
		let (tun, mut port) = adapter(8);

		let written = tun
			.write(&[vec![1u8; 20], vec![2u8; 20], vec![3u8; 20]])
			.await
			.unwrap();
		assert_eq!(written, 3);

		assert_eq!(port.inbound.recv().await.unwrap(), vec![1u8; 20]);
		assert_eq!(port.inbound.recv().await.unwrap(), vec![2u8; 20]);
		assert_eq!(port.inbound.recv().await.unwrap(), vec![3u8; 20]);
		assert!(port.inbound.try_recv().is_err());
	}

	#[tokio::test]
	async fn test_read_returns_stack_packets_in_batches() {
		let (tun, port) = adapter(8);
		for i in 0..3u8 {
			port.outbound.send(vec![i; 10]).await.unwrap();
		}

		let mut packets = Vec::new();
		let n = tun.read(&mut packets).await.unwrap();
		assert_eq!(n, 3);
		assert_eq!(packets, vec![vec![0u8; 10], vec![1u8; 10], vec![2u8; 10]]);
	}

	#[tokio::test]
	async fn test_close_unblocks_pending_read() {
		let (tun, _port) = adapter(8);

		let reader = {
			let tun = Arc::clone(&tun);
			tokio::spawn(async move {
				let mut packets = Vec::new();
				tun.read(&mut packets).await
			})
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		tun.close();

		let result = tokio::time::timeout(Duration::from_secs(1), reader)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(result, Err(TunError::Closed));
	}

	#[tokio::test]
	async fn test_read_and_write_fail_after_close() {
		let (tun, port) = adapter(8);
		port.outbound.send(vec![0u8; 10]).await.unwrap();
		tun.close();
		tun.close();

		let mut packets = Vec::new();
		assert_eq!(tun.read(&mut packets).await, Err(TunError::Closed));
		assert_eq!(tun.write(&[vec![0u8; 10]]).await, Err(TunError::Closed));
		assert!(packets.is_empty());
	}

	#[tokio::test]
	async fn test_write_blocks_when_queue_full_until_close() {
		let (tun, _port) = adapter(1);
		tun.write(&[vec![0u8; 10]]).await.unwrap();

		let writer = {
			let tun = Arc::clone(&tun);
			tokio::spawn(async move { tun.write(&[vec![1u8; 10]]).await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!writer.is_finished());

		tun.close();
		let result = tokio::time::timeout(Duration::from_secs(1), writer)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(result, Err(TunError::Closed));
	}

	#[tokio::test]
	async fn test_oversized_packet_rejected() {
		let (tun, _port) = adapter(8);
		let result = tun.write(&[vec![0u8; DEFAULT_MTU + 1]]).await;
		assert_eq!(
			result,
			Err(TunError::TooLarge {
				len: DEFAULT_MTU + 1,
				mtu: DEFAULT_MTU
			})
		);
	}

	#[tokio::test]
	async fn test_events_up_then_closed_then_end() {
		let (tun, _port) = adapter(8);
		let mut events = tun.events().unwrap();
		assert!(tun.events().is_none());

		assert_eq!(events.recv().await, Some(TunEvent::Up));
		tun.close();
		assert_eq!(events.recv().await, Some(TunEvent::Closed));
		assert_eq!(events.recv().await, None);
	}

	#[test]
	fn test_identity() {
		let (tun, _port) = NetstackTun::new(AdapterConfig::default());
		assert_eq!(tun.name(), DEFAULT_NAME);
		assert_eq!(tun.mtu(), DEFAULT_MTU);
		assert_eq!(tun.batch_size(), DEFAULT_BATCH_SIZE);
	}
}
