// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::device::NetStack;
use crate::error::{NetstackError, Result};
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::State as TcpState;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A TCP connection terminated inside the embedded stack.
pub struct VirtualTcpStream {
	stack: NetStack,
	handle: SocketHandle,
}

impl VirtualTcpStream {
	pub(crate) fn new(stack: NetStack, handle: SocketHandle) -> Self {
		Self { stack, handle }
	}

	pub fn handle(&self) -> SocketHandle {
		self.handle
	}

	pub fn state(&self) -> Option<TcpState> {
		self.stack.socket_state(self.handle)
	}

	/// Resolves once the handshake completes, or fails if the connection
	/// dies first.
	pub async fn wait_established(&self) -> Result<()> {
		poll_fn(|cx| {
			let mut inner = match self.stack.lock() {
				Ok(inner) => inner,
				Err(e) => return Poll::Ready(Err(NetstackError::Io(e))),
			};
			match inner.tcp(self.handle).state() {
				TcpState::Established => Poll::Ready(Ok(())),
				TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
					inner.register_waker(cx.waker());
					Poll::Pending
				}
				state => Poll::Ready(Err(NetstackError::TcpConnect(format!(
					"connection ended in state {}",
					state
				)))),
			}
		})
		.await
	}

	/// Resolves once the socket has fully closed.
	pub async fn wait_closed(&self) {
		poll_fn(|cx| {
			let Ok(mut inner) = self.stack.lock() else {
				return Poll::Ready(());
			};
			match inner.tcp(self.handle).state() {
				TcpState::Closed | TcpState::TimeWait => Poll::Ready(()),
				_ => {
					inner.register_waker(cx.waker());
					Poll::Pending
				}
			}
		})
		.await
	}
}

impl AsyncRead for VirtualTcpStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let mut inner = self.stack.lock()?;
		inner.poll();

		let socket = inner.tcp(self.handle);
		if socket.can_recv() {
			let n = socket
				.recv_slice(buf.initialize_unfilled())
				.map_err(|e| io::Error::other(format!("{e:?}")))?;
			buf.advance(n);
			// Freed receive window must be advertised.
			inner.poll();
			drop(inner);
			self.stack.notify_activity();
			Poll::Ready(Ok(()))
		} else if socket.may_recv() {
			inner.register_waker(cx.waker());
			Poll::Pending
		} else {
			Poll::Ready(Ok(()))
		}
	}
}

impl AsyncWrite for VirtualTcpStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let mut inner = self.stack.lock()?;

		let socket = inner.tcp(self.handle);
		if socket.can_send() {
			let n = socket
				.send_slice(buf)
				.map_err(|e| io::Error::other(format!("{e:?}")))?;
			inner.poll();
			drop(inner);
			self.stack.notify_activity();
			Poll::Ready(Ok(n))
		} else if socket.may_send() {
			inner.register_waker(cx.waker());
			Poll::Pending
		} else {
			Poll::Ready(Err(io::Error::new(
				io::ErrorKind::BrokenPipe,
				"connection closed",
			)))
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.stack.poll();
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let mut inner = self.stack.lock()?;
		inner.tcp(self.handle).close();
		inner.poll();
		drop(inner);
		self.stack.notify_activity();
		Poll::Ready(Ok(()))
	}
}
