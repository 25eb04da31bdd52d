// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Destination address of a plaintext IP packet.
pub fn extract_dst(packet: &[u8]) -> Option<IpAddr> {
	match packet.first()? >> 4 {
		4 if packet.len() >= IPV4_HEADER_LEN => {
			let octets: [u8; 4] = packet[16..20].try_into().ok()?;
			Some(IpAddr::V4(Ipv4Addr::from(octets)))
		}
		6 if packet.len() >= IPV6_HEADER_LEN => {
			let octets: [u8; 16] = packet[24..40].try_into().ok()?;
			Some(IpAddr::V6(Ipv6Addr::from(octets)))
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_extract_ipv4_dst() {
		let mut packet = vec![0u8; 20];
		packet[0] = 0x45;
		packet[16..20].copy_from_slice(&[10, 90, 0, 2]);

		assert_eq!(extract_dst(&packet), Some("10.90.0.2".parse().unwrap()));
	}

	#[test]
	fn test_extract_ipv6_dst() {
		let mut packet = vec![0u8; 40];
		packet[0] = 0x60;
		let dst: Ipv6Addr = "fd7a:115c:a1e0:1900::2".parse().unwrap();
		packet[24..40].copy_from_slice(&dst.octets());

		assert_eq!(extract_dst(&packet), Some(IpAddr::V6(dst)));
	}

	#[test]
	fn test_extract_dst_too_short() {
		assert!(extract_dst(&[0x45; 10]).is_none());
		assert!(extract_dst(&[0x60; 20]).is_none());
		assert!(extract_dst(&[]).is_none());
	}

	#[test]
	fn test_extract_dst_wrong_version() {
		let packet = vec![0x50u8; 40];
		assert!(extract_dst(&packet).is_none());
	}
}
