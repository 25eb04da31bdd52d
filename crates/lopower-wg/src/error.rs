// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::tun::TunError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("adapter error: {0}")]
	Tun(#[from] TunError),

	#[error("invalid peer configuration: {0}")]
	InvalidPeers(String),

	#[error("already running")]
	AlreadyRunning,

	#[error("not running")]
	NotRunning,

	#[error("device closed")]
	Closed,
}

pub type Result<T> = std::result::Result<T, DeviceError>;
