// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Generic server-owned key/value settings.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use crate::error::Result;

#[async_trait]
pub trait ServerConfigStore: Send + Sync {
	/// `Ok(None)` when the key has never been set.
	async fn server_config_get(&self, key: &str) -> Result<Option<String>>;
	/// Insert or overwrite.
	async fn server_config_set(&self, key: &str, value: &str) -> Result<()>;
	/// Removing a missing key is not an error.
	async fn server_config_delete(&self, key: &str) -> Result<()>;
}

/// Repository for the `server_configs` table.
#[derive(Clone)]
pub struct ServerConfigRepository {
	pool: SqlitePool,
}

impl ServerConfigRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self))]
	pub async fn get(&self, key: &str) -> Result<Option<String>> {
		let value: Option<String> =
			sqlx::query_scalar("SELECT value FROM server_configs WHERE key = ?")
				.bind(key)
				.fetch_optional(&self.pool)
				.await?;
		Ok(value)
	}

	#[tracing::instrument(skip(self, value))]
	pub async fn set(&self, key: &str, value: &str) -> Result<()> {
		sqlx::query(
			r#"
			INSERT INTO server_configs (key, value) VALUES (?, ?)
			ON CONFLICT (key) DO UPDATE SET value = excluded.value
			"#,
		)
		.bind(key)
		.bind(value)
		.execute(&self.pool)
		.await?;

		tracing::debug!(key = %key, "server config set");
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn delete(&self, key: &str) -> Result<()> {
		let result = sqlx::query("DELETE FROM server_configs WHERE key = ?")
			.bind(key)
			.execute(&self.pool)
			.await?;

		tracing::debug!(key = %key, deleted = result.rows_affected(), "server config deleted");
		Ok(())
	}
}

#[async_trait]
impl ServerConfigStore for ServerConfigRepository {
	async fn server_config_get(&self, key: &str) -> Result<Option<String>> {
		self.get(key).await
	}

	async fn server_config_set(&self, key: &str, value: &str) -> Result<()> {
		self.set(key, value).await
	}

	async fn server_config_delete(&self, key: &str) -> Result<()> {
		self.delete(key).await
	}
}
