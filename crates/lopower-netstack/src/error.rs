// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetstackError {
	#[error("stack error: {0}")]
	Stack(String),

	#[error("TCP connect failed: {0}")]
	TcpConnect(String),

	#[error("no local {0} address for destination")]
	NoLocalAddress(&'static str),

	#[error("already running")]
	AlreadyRunning,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetstackError>;
