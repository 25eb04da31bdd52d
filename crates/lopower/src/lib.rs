// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The lopower process: command line, logging, peer administration and the
//! long-running bridge service.

pub mod cli;
pub mod commands;
pub mod logging;
pub mod service;
pub mod signals;

pub use cli::{Cli, Command};
pub use service::{peer_configs, Service, ServiceOptions};
