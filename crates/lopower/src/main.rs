// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::{Context, Result};
use clap::Parser;
use lopower::cli::{Cli, Command};
use lopower::{commands, logging, Service, ServiceOptions};
use lopower_common::ConfigStore;
use lopower_netstack::DirectOverlay;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	logging::init(cli.log_json);

	let path = match &cli.config {
		Some(path) => path.clone(),
		None => ConfigStore::default_path().context("cannot locate configuration directory")?,
	};
	let store = ConfigStore::new(path);

	match cli.into_command() {
		Command::Run(args) => {
			let options = ServiceOptions {
				listen_port: args.listen_port,
				forwarder: args.forwarder_config(),
				shutdown_grace: args.shutdown_grace(),
			};
			let overlay = Arc::new(DirectOverlay::default());
			let service = Service::start(store, options, overlay).await?;
			service.run().await?;
		}
		Command::AddPeer(args) => print!("{}", commands::add_peer(&store, &args).await?),
		Command::RemovePeer(args) => print!("{}", commands::remove_peer(&store, &args).await?),
		Command::Show => print!("{}", commands::show(&store).await?),
	}

	Ok(())
}
