// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! IPv6 destination translation.
//!
//! smoltcp only accepts packets for foreign addresses (`any_ip`) on IPv4 and
//! drops IPv6 packets whose destination is not one of its own. TCP segments
//! and echo requests a peer sends to any other IPv6 address are readdressed
//! to the stack's own address on the way in, and the matching replies get the
//! original destination back as their source on the way out.

use smoltcp::wire::{Icmpv6Message, Icmpv6Packet, IpAddress, IpProtocol, Ipv6Packet, TcpPacket};
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

const MAX_BINDINGS: usize = 16384;

/// Longer than the stack's TCP idle timeout, so live connections keep
/// their binding.
const BINDING_IDLE_TIMEOUT: Duration = Duration::from_secs(330);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
	Tcp,
	Echo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Binding {
	kind: Kind,
	peer: Ipv6Addr,
	/// Peer's TCP port or echo identifier.
	peer_id: u16,
	/// Destination TCP port, zero for echo.
	port: u16,
}

#[derive(Debug, Clone, Copy)]
struct Original {
	addr: Ipv6Addr,
	last_seen: Instant,
}

enum Transport {
	Tcp { src_port: u16, dst_port: u16 },
	EchoRequest { ident: u16 },
	EchoReply { ident: u16 },
}

struct Headers {
	src: Ipv6Addr,
	dst: Ipv6Addr,
	transport: Transport,
}

fn parse(packet: &[u8]) -> Option<Headers> {
	if packet.first()? >> 4 != 6 {
		return None;
	}
	let ip = Ipv6Packet::new_checked(packet).ok()?;
	let transport = match ip.next_header() {
		IpProtocol::Tcp => {
			let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
			Transport::Tcp {
				src_port: tcp.src_port(),
				dst_port: tcp.dst_port(),
			}
		}
		IpProtocol::Icmpv6 => {
			let icmp = Icmpv6Packet::new_checked(ip.payload()).ok()?;
			match icmp.msg_type() {
				Icmpv6Message::EchoRequest => Transport::EchoRequest {
					ident: icmp.echo_ident(),
				},
				Icmpv6Message::EchoReply => Transport::EchoReply {
					ident: icmp.echo_ident(),
				},
				_ => return None,
			}
		}
		_ => return None,
	};
	Some(Headers {
		src: Ipv6Addr::from(ip.src_addr()),
		dst: Ipv6Addr::from(ip.dst_addr()),
		transport,
	})
}

/// Sets both addresses and recomputes the transport checksum.
fn readdress(packet: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr) {
	let mut ip = Ipv6Packet::new_unchecked(packet);
	ip.set_src_addr(src.into());
	ip.set_dst_addr(dst.into());
	let src = IpAddress::Ipv6(src.into());
	let dst = IpAddress::Ipv6(dst.into());
	match ip.next_header() {
		IpProtocol::Tcp => TcpPacket::new_unchecked(ip.payload_mut()).fill_checksum(&src, &dst),
		IpProtocol::Icmpv6 => Icmpv6Packet::new_unchecked(ip.payload_mut()).fill_checksum(&src, &dst),
		_ => {}
	}
}

fn is_foreign_unicast(addr: Ipv6Addr, local: Ipv6Addr) -> bool {
	addr != local && !addr.is_multicast() && !addr.is_loopback() && !addr.is_unspecified()
}

pub(crate) struct Ipv6Translator {
	local: Ipv6Addr,
	bindings: HashMap<Binding, Original>,
}

impl Ipv6Translator {
	pub(crate) fn new(local: Ipv6Addr) -> Self {
		Self {
			local,
			bindings: HashMap::new(),
		}
	}

	/// Readdresses a packet from a peer to the local address, remembering
	/// where it was headed. Returns false if the packet must be dropped.
	pub(crate) fn inbound(&mut self, packet: &mut [u8]) -> bool {
		let Some(headers) = parse(packet) else {
			return true;
		};
		let binding = match headers.transport {
			Transport::Tcp { src_port, dst_port } => Binding {
				kind: Kind::Tcp,
				peer: headers.src,
				peer_id: src_port,
				port: dst_port,
			},
			Transport::EchoRequest { ident } => Binding {
				kind: Kind::Echo,
				peer: headers.src,
				peer_id: ident,
				port: 0,
			},
			Transport::EchoReply { .. } => return true,
		};

		if headers.dst == self.local {
			self.bindings.remove(&binding);
			return true;
		}
		if !is_foreign_unicast(headers.dst, self.local) {
			return true;
		}

		let now = Instant::now();
		if !self.bindings.contains_key(&binding) && self.bindings.len() >= MAX_BINDINGS {
			self.expire(now);
			if self.bindings.len() >= MAX_BINDINGS {
				warn!(limit = MAX_BINDINGS, "IPv6 translation table full, dropping packet");
				return false;
			}
		}
		self.bindings.insert(
			binding,
			Original {
				addr: headers.dst,
				last_seen: now,
			},
		);
		readdress(packet, headers.src, self.local);
		true
	}

	/// Restores the original destination as the source of a reply.
	pub(crate) fn outbound(&self, packet: &mut [u8]) {
		let Some(headers) = parse(packet) else {
			return;
		};
		if headers.src != self.local {
			return;
		}
		let binding = match headers.transport {
			Transport::Tcp { src_port, dst_port } => Binding {
				kind: Kind::Tcp,
				peer: headers.dst,
				peer_id: dst_port,
				port: src_port,
			},
			Transport::EchoReply { ident } => Binding {
				kind: Kind::Echo,
				peer: headers.dst,
				peer_id: ident,
				port: 0,
			},
			Transport::EchoRequest { .. } => return,
		};
		if let Some(original) = self.bindings.get(&binding) {
			readdress(packet, original.addr, headers.dst);
		}
	}

	/// The address the stack listens on for a TCP flow toward `dst`.
	pub(crate) fn local_endpoint(&self, dst: SocketAddr) -> SocketAddr {
		match dst {
			SocketAddr::V6(v6) if is_foreign_unicast(*v6.ip(), self.local) => {
				SocketAddr::new(self.local.into(), dst.port())
			}
			_ => dst,
		}
	}

	/// Drops the binding of a finished TCP flow.
	pub(crate) fn forget_tcp(&mut self, src: SocketAddr, dst: SocketAddr) {
		if let SocketAddr::V6(peer) = src {
			let binding = Binding {
				kind: Kind::Tcp,
				peer: *peer.ip(),
				peer_id: peer.port(),
				port: dst.port(),
			};
			if self.bindings.remove(&binding).is_some() {
				trace!(%src, %dst, "dropped IPv6 translation");
			}
		}
	}

	fn expire(&mut self, now: Instant) {
		self.bindings
			.retain(|_, original| now.duration_since(original.last_seen) < BINDING_IDLE_TIMEOUT);
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.bindings.len()
	}
}
