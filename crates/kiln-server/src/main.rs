// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kiln CI server binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kiln_server::{encryption_status, version, Server};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Kiln server - continuous integration with secrets encrypted at rest.
#[derive(Parser, Debug)]
#[command(name = "kiln-server", about = "Kiln CI server", version)]
struct Args {
	/// Config file to use instead of /etc/kiln/server.toml
	#[arg(long, env = "KILN_SERVER_CONFIG")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Show version and build information
	Version,
	/// Report whether encryption is enabled, without changing anything
	EncryptionStatus,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	if let Some(Command::Version) = args.command {
		println!("{}", version::format_version_info());
		return Ok(());
	}

	dotenvy::dotenv().ok();

	let config = match &args.config {
		Some(path) => kiln_server_config::load_config_with_file(path)?,
		None => kiln_server_config::load_config()?,
	};

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| config.logging.level.clone().into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	if let Some(Command::EncryptionStatus) = args.command {
		println!("{}", encryption_status(&config).await?);
		return Ok(());
	}

	tracing::info!(database = %config.database.url, "starting kiln-server");

	let cancel = CancellationToken::new();
	let shutdown = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			tracing::error!(error = %e, "failed to listen for shutdown signal");
			std::future::pending::<()>().await;
		}
	};
	let Some(server) = Server::start_with_shutdown(&config, cancel.clone(), shutdown).await? else {
		tracing::info!("Server shutdown complete");
		return Ok(());
	};

	tokio::signal::ctrl_c().await?;
	tracing::info!("Received shutdown signal");
	cancel.cancel();
	server.shutdown().await;

	tracing::info!("Server shutdown complete");
	Ok(())
}
