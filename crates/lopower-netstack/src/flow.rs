// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address/port tuple of a TCP flow as seen from the WireGuard side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
	pub src: SocketAddr,
	pub dst: SocketAddr,
}

impl fmt::Display for FlowKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} -> {}", self.src, self.dst)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
	pub key: FlowKey,
	pub syn: bool,
	pub ack: bool,
}

impl TcpSegment {
	/// Opening segment of a new connection.
	pub fn is_initial_syn(&self) -> bool {
		self.syn && !self.ack
	}
}

/// Extracts the TCP flow of an IP packet, if it carries one.
pub fn classify(packet: &[u8]) -> Option<TcpSegment> {
	match packet.first()? >> 4 {
		4 => {
			let ip = Ipv4Packet::new_checked(packet).ok()?;
			if ip.next_header() != IpProtocol::Tcp || ip.frag_offset() != 0 {
				return None;
			}
			let src = IpAddr::V4(Ipv4Addr::from(ip.src_addr()));
			let dst = IpAddr::V4(Ipv4Addr::from(ip.dst_addr()));
			segment(src, dst, ip.payload())
		}
		6 => {
			let ip = Ipv6Packet::new_checked(packet).ok()?;
			if ip.next_header() != IpProtocol::Tcp {
				return None;
			}
			let src = IpAddr::V6(Ipv6Addr::from(ip.src_addr()));
			let dst = IpAddr::V6(Ipv6Addr::from(ip.dst_addr()));
			segment(src, dst, ip.payload())
		}
		_ => None,
	}
}

fn segment(src: IpAddr, dst: IpAddr, payload: &[u8]) -> Option<TcpSegment> {
	let tcp = TcpPacket::new_checked(payload).ok()?;
	Some(TcpSegment {
		key: FlowKey {
			src: SocketAddr::new(src, tcp.src_port()),
			dst: SocketAddr::new(dst, tcp.dst_port()),
		},
		syn: tcp.syn(),
		ack: tcp.ack(),
	})
}
