// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::device::NetStack;
use crate::forwarder::{cancelled, Forwarder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Upper bound on how long the pump sleeps without input.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Drains packets written to the adapter into the forwarder and keeps the
/// stack's timers running, until shutdown or adapter close.
pub fn spawn_packet_pump(
	stack: NetStack,
	forwarder: Arc<Forwarder>,
	mut inbound: mpsc::Receiver<Vec<u8>>,
	adapter_closed: watch::Receiver<bool>,
	shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		info!("packet pump started");

		loop {
			let delay = stack
				.poll_delay()
				.map_or(MAX_POLL_INTERVAL, |d| d.min(MAX_POLL_INTERVAL));

			tokio::select! {
				biased;

				_ = cancelled(shutdown.clone()) => {
					debug!("packet pump cancelled");
					break;
				}

				_ = cancelled(adapter_closed.clone()) => {
					debug!("adapter closed, packet pump stopping");
					break;
				}

				packet = inbound.recv() => match packet {
					Some(packet) => forwarder.dispatch(packet),
					None => break,
				},

				_ = stack.activity() => {
					stack.poll();
				}

				_ = tokio::time::sleep(delay) => {
					stack.poll();
				}
			}
		}

		info!("packet pump stopped");
	})
}
