// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kiln server wiring: database, encryption at rest and the secret service.

pub mod version;

use std::future::Future;
use std::sync::Arc;

use kiln_server_config::{ConfigError, ServerConfig};
use kiln_server_db::{
	create_pool, run_migrations, DbError, SecretRepository, ServerConfigRepository,
	ServerConfigStore,
};
use kiln_server_encryption::{Encryption, EncryptionBuilder, EncryptionError, CIPHERTEXT_SAMPLE_KEY};
use kiln_server_secrets::{EncryptedSecretStore, SecretService};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("database error: {0}")]
	Database(#[from] DbError),

	#[error("encryption error: {0}")]
	Encryption(#[from] EncryptionError),
}

/// A started server.
pub struct Server {
	pub pool: SqlitePool,
	pub encryption: Encryption,
	pub secrets: Arc<SecretService>,
}

impl Server {
	/// Opens the database and runs the encryption startup pass. Cancelling
	/// `cancel` stops bulk re-encryption after the current batch and stops
	/// the keyset watcher.
	pub async fn start(config: &ServerConfig, cancel: CancellationToken) -> Result<Self, ServerError> {
		let pool = create_pool(&config.database.url).await?;
		run_migrations(&pool).await?;

		let store = Arc::new(
			EncryptedSecretStore::new(
				Arc::new(SecretRepository::new(pool.clone())),
				config.encryption.batch_size,
			)
			.with_cancellation(cancel.clone()),
		);

		let encryption = EncryptionBuilder::new(
			config.encryption.clone(),
			Arc::new(ServerConfigRepository::new(pool.clone())),
		)
		.with_client(store.clone())
		.with_cancellation(cancel)
		.build()
		.await?;

		info!(
			state = ?encryption.state(),
			algorithm = encryption.handle().current().algorithm(),
			watching = encryption.is_watching(),
			"encryption ready"
		);

		Ok(Self {
			pool,
			encryption,
			secrets: Arc::new(SecretService::new(store)),
		})
	}

	/// Like [`start`](Self::start), but cancels `cancel` as soon as
	/// `shutdown` completes and then keeps waiting, so a bulk re-encryption
	/// in progress stops after its current batch rather than mid-write.
	/// Returns `None` when startup was interrupted.
	pub async fn start_with_shutdown<F>(
		config: &ServerConfig,
		cancel: CancellationToken,
		shutdown: F,
	) -> Result<Option<Self>, ServerError>
	where
		F: Future<Output = ()>,
	{
		let start = Self::start(config, cancel.clone());
		tokio::pin!(start);

		let finished = tokio::select! {
			biased;
			_ = shutdown => None,
			result = &mut start => Some(result),
		};
		let result = match finished {
			Some(result) => result,
			None => {
				info!("shutdown requested during startup; waiting for the current batch");
				cancel.cancel();
				start.await
			}
		};

		match result {
			Ok(server) if cancel.is_cancelled() => {
				server.shutdown().await;
				Ok(None)
			}
			Ok(server) => Ok(Some(server)),
			Err(ServerError::Encryption(e)) if e.is_cancelled() => {
				warn!("startup interrupted; encryption transition will resume on next start");
				Ok(None)
			}
			Err(e) => Err(e),
		}
	}

	pub async fn shutdown(self) {
		self.encryption.shutdown().await;
		self.pool.close().await;
	}
}

/// Encryption state as seen from the database and configuration, without
/// changing either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionStatus {
	pub enabled: bool,
	pub key_source: &'static str,
	pub disable_requested: bool,
}

impl std::fmt::Display for EncryptionStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(
			f,
			"Encryption:   {}",
			if self.enabled { "enabled" } else { "disabled" }
		)?;
		writeln!(f, "Key source:   {}", self.key_source)?;
		write!(f, "Disable flag: {}", self.disable_requested)
	}
}

pub async fn encryption_status(config: &ServerConfig) -> Result<EncryptionStatus, ServerError> {
	let pool = create_pool(&config.database.url).await?;
	run_migrations(&pool).await?;

	let sample = ServerConfigRepository::new(pool.clone())
		.server_config_get(CIPHERTEXT_SAMPLE_KEY)
		.await?;
	pool.close().await;

	Ok(EncryptionStatus {
		enabled: sample.is_some(),
		key_source: config.encryption.key_source.kind(),
		disable_requested: config.encryption.disable,
	})
}
