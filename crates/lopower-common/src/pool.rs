// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
	#[error("address pool {0} exhausted")]
	Exhausted(String),

	#[error("address pool {0} has no usable host addresses")]
	TooSmall(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

fn v4_host_range(net: Ipv4Net) -> Result<(u32, u32)> {
	let base = u32::from(net.network());
	let last = u32::from(net.broadcast());
	// /31 and /32 have no network/broadcast split worth keeping, and no room for peers.
	if net.prefix_len() > 30 {
		return Err(PoolError::TooSmall(net.to_string()));
	}
	Ok((base + 1, last - 1))
}

fn v6_host_range(net: Ipv6Net) -> Result<(u128, u128)> {
	let base = u128::from(net.network());
	let last = u128::from(net.broadcast());
	if net.prefix_len() > 126 {
		return Err(PoolError::TooSmall(net.to_string()));
	}
	Ok((base + 1, last))
}

/// The local address of a pool: the first address after the network address.
pub fn first_usable_v4(net: Ipv4Net) -> Result<Ipv4Addr> {
	let (first, _) = v4_host_range(net)?;
	Ok(Ipv4Addr::from(first))
}

pub fn first_usable_v6(net: Ipv6Net) -> Result<Ipv6Addr> {
	let (first, _) = v6_host_range(net)?;
	Ok(Ipv6Addr::from(first))
}

/// Lowest host address in `net` not present in `used`.
pub fn next_free_v4(net: Ipv4Net, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
	let (first, last) = v4_host_range(net)?;
	(first..=last)
		.map(Ipv4Addr::from)
		.find(|addr| !used.contains(addr))
		.ok_or_else(|| PoolError::Exhausted(net.to_string()))
}

pub fn next_free_v6(net: Ipv6Net, used: &HashSet<Ipv6Addr>) -> Result<Ipv6Addr> {
	let (first, last) = v6_host_range(net)?;
	let mut candidate = first;
	loop {
		let addr = Ipv6Addr::from(candidate);
		if !used.contains(&addr) {
			return Ok(addr);
		}
		if candidate == last {
			return Err(PoolError::Exhausted(net.to_string()));
		}
		candidate += 1;
	}
}
