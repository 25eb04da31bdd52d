// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::{Args, Parser, Subcommand};
use ipnet::IpNet;
use lopower_common::WgPublicKey;
use lopower_netstack::{default_allow, ForwarderConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_IN_FLIGHT_SYN};
use lopower_wg::DEFAULT_LISTEN_PORT;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "lopower", version, about = "Userspace WireGuard endpoint bridged into an overlay network")]
pub struct Cli {
	/// Path of the identity and peer configuration
	#[arg(long, global = true, env = "LOPOWER_CONFIG")]
	pub config: Option<PathBuf>,

	/// Emit logs as JSON lines
	#[arg(long, global = true, env = "LOPOWER_LOG_JSON")]
	pub log_json: bool,

	#[command(subcommand)]
	pub command: Option<Command>,

	#[command(flatten)]
	pub run: RunArgs,
}

impl Cli {
	/// The selected command; bare invocation runs the bridge.
	pub fn into_command(self) -> Command {
		self.command.unwrap_or(Command::Run(self.run))
	}
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Run the bridge until interrupted
	Run(RunArgs),
	/// Admit a peer and print its client configuration
	AddPeer(AddPeerArgs),
	/// Remove an admitted peer
	RemovePeer(RemovePeerArgs),
	/// Print the identity, pools and peers
	Show,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
	/// UDP port WireGuard listens on
	#[arg(long, env = "LOPOWER_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
	pub listen_port: u16,

	/// Overlay destinations peers may reach (repeatable)
	#[arg(long = "allow", env = "LOPOWER_ALLOW", value_delimiter = ',')]
	pub allow: Vec<IpNet>,

	/// Concurrent forwarded connections
	#[arg(long, env = "LOPOWER_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
	pub max_connections: usize,

	/// Connections still dialing the overlay
	#[arg(long, env = "LOPOWER_MAX_IN_FLIGHT_SYN", default_value_t = DEFAULT_MAX_IN_FLIGHT_SYN)]
	pub max_in_flight_syn: usize,

	/// Seconds to wait for tasks at shutdown
	#[arg(long, env = "LOPOWER_SHUTDOWN_GRACE", default_value_t = 5)]
	pub shutdown_grace: u64,
}

impl RunArgs {
	pub fn forwarder_config(&self) -> ForwarderConfig {
		let allow = if self.allow.is_empty() {
			default_allow()
		} else {
			self.allow.clone()
		};
		ForwarderConfig {
			allow,
			max_connections: self.max_connections,
			max_in_flight_syn: self.max_in_flight_syn,
			..ForwarderConfig::default()
		}
	}

	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_secs(self.shutdown_grace)
	}
}

#[derive(Debug, Clone, Args)]
pub struct AddPeerArgs {
	/// Peer public key, base64 or nodekey:<hex>
	pub public_key: WgPublicKey,

	/// Address clients use to reach this node
	#[arg(long)]
	pub endpoint: Option<String>,

	/// AllowedIPs written into the client configuration
	#[arg(long = "route", value_delimiter = ',')]
	pub routes: Vec<IpNet>,
}

#[derive(Debug, Clone, Args)]
pub struct RemovePeerArgs {
	pub public_key: WgPublicKey,
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;
	use lopower_common::WgKeyPair;

	#[test]
	fn verify_cli() {
		Cli::command().debug_assert();
	}

	#[test]
	fn bare_invocation_runs_with_defaults() {
		let cli = Cli::try_parse_from(["lopower"]).unwrap();
		match cli.into_command() {
			Command::Run(args) => {
				assert_eq!(args.listen_port, 51820);
				assert_eq!(args.max_connections, 1024);
				assert_eq!(args.max_in_flight_syn, 8192);
				assert_eq!(args.forwarder_config().allow, default_allow());
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn run_flags_without_subcommand() {
		let cli = Cli::try_parse_from([
			"lopower",
			"--listen-port",
			"4000",
			"--allow",
			"100.100.0.0/16",
			"--allow",
			"fd00::/8",
		])
		.unwrap();
		let Command::Run(args) = cli.into_command() else {
			panic!("expected run");
		};
		assert_eq!(args.listen_port, 4000);
		let allow: Vec<IpNet> = vec!["100.100.0.0/16".parse().unwrap(), "fd00::/8".parse().unwrap()];
		assert_eq!(args.forwarder_config().allow, allow);
	}

	#[test]
	fn add_peer_parses_key_and_endpoint() {
		let key = *WgKeyPair::generate().public_key();
		let encoded = key.to_base64();
		let cli = Cli::try_parse_from([
			"lopower",
			"--config",
			"/tmp/lopower.json",
			"add-peer",
			encoded.as_str(),
			"--endpoint",
			"vpn.example.com:51820",
		])
		.unwrap();
		assert_eq!(cli.config, Some(PathBuf::from("/tmp/lopower.json")));
		let Command::AddPeer(args) = cli.into_command() else {
			panic!("expected add-peer");
		};
		assert_eq!(args.public_key, key);
		assert_eq!(args.endpoint.as_deref(), Some("vpn.example.com:51820"));
	}

	#[test]
	fn global_flags_precede_subcommands() {
		let cli = Cli::try_parse_from(["lopower", "--log-json", "--config", "/tmp/lopower.json", "show"]).unwrap();
		assert!(cli.log_json);
		assert!(matches!(cli.into_command(), Command::Show));

		let cli = Cli::try_parse_from(["lopower", "run", "--config", "/tmp/lopower.json", "--listen-port", "4000"]).unwrap();
		assert_eq!(cli.config, Some(PathBuf::from("/tmp/lopower.json")));
		let Command::Run(args) = cli.into_command() else {
			panic!("expected run");
		};
		assert_eq!(args.listen_port, 4000);
	}

	#[test]
	fn rejects_malformed_key() {
		assert!(Cli::try_parse_from(["lopower", "remove-peer", "not-a-key"]).is_err());
	}
}
