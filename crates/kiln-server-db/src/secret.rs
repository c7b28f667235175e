// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Secrets repository for database operations.
//!
//! The `value` column is opaque to this layer: it holds plaintext, or a
//! `_<algorithm>_<payload>` ciphertext written by the encrypting store that
//! sits in front of the repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};

use crate::error::{is_unique_constraint_error, DbError, Result};

const SECRET_COLUMNS: &str =
	"id, org_id, repo_id, name, value, images, events, created_at, updated_at";

/// Which owner a secret belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretScope {
	Global,
	Org(i64),
	Repo(i64),
}

impl SecretScope {
	/// `(org_id, repo_id)` as stored; 0 means "not scoped".
	pub fn columns(&self) -> (i64, i64) {
		match *self {
			SecretScope::Global => (0, 0),
			SecretScope::Org(org_id) => (org_id, 0),
			SecretScope::Repo(repo_id) => (0, repo_id),
		}
	}

	pub fn from_columns(org_id: i64, repo_id: i64) -> Result<Self> {
		match (org_id, repo_id) {
			(0, 0) => Ok(SecretScope::Global),
			(org_id, 0) => Ok(SecretScope::Org(org_id)),
			(0, repo_id) => Ok(SecretScope::Repo(repo_id)),
			(org_id, repo_id) => Err(DbError::Internal(format!(
				"secret scoped to both org {org_id} and repo {repo_id}"
			))),
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			SecretScope::Global => "global",
			SecretScope::Org(_) => "org",
			SecretScope::Repo(_) => "repo",
		}
	}
}

/// A stored pipeline secret.
#[derive(Clone, PartialEq)]
pub struct Secret {
	pub id: i64,
	pub org_id: i64,
	pub repo_id: i64,
	pub name: String,
	pub value: String,
	pub images: Vec<String>,
	pub events: Vec<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Secret {
	/// An unsaved secret; `id` is assigned by [`SecretStore::secret_create`].
	pub fn new(scope: SecretScope, name: impl Into<String>, value: impl Into<String>) -> Self {
		let (org_id, repo_id) = scope.columns();
		let now = Utc::now();
		Self {
			id: 0,
			org_id,
			repo_id,
			name: name.into(),
			value: value.into(),
			images: Vec::new(),
			events: Vec::new(),
			created_at: now,
			updated_at: now,
		}
	}

	pub fn scope(&self) -> Result<SecretScope> {
		SecretScope::from_columns(self.org_id, self.repo_id)
	}
}

impl std::fmt::Debug for Secret {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Secret")
			.field("id", &self.id)
			.field("org_id", &self.org_id)
			.field("repo_id", &self.repo_id)
			.field("name", &self.name)
			.field("value", &"[REDACTED]")
			.field("images", &self.images)
			.field("events", &self.events)
			.finish()
	}
}

#[async_trait]
pub trait SecretStore: Send + Sync {
	async fn secret_find(&self, scope: SecretScope, name: &str) -> Result<Option<Secret>>;
	async fn secret_find_by_id(&self, id: i64) -> Result<Option<Secret>>;
	async fn secret_list(&self, scope: SecretScope) -> Result<Vec<Secret>>;
	/// Global, org and repo secrets visible to a pipeline, ordered by name.
	async fn secret_list_for_pipeline(&self, org_id: i64, repo_id: i64) -> Result<Vec<Secret>>;
	/// One page of every secret, ordered by id, starting after `after_id`.
	async fn secret_list_all(&self, after_id: i64, limit: u32) -> Result<Vec<Secret>>;
	/// Inserts and assigns `id`, `created_at` and `updated_at`.
	async fn secret_create(&self, secret: &mut Secret) -> Result<()>;
	/// Updates value, images and events of an existing secret.
	async fn secret_update(&self, secret: &mut Secret) -> Result<()>;
	async fn secret_delete(&self, scope: SecretScope, name: &str) -> Result<()>;
	async fn secret_delete_by_id(&self, id: i64) -> Result<()>;
}

/// Repository for the `secrets` table.
#[derive(Clone)]
pub struct SecretRepository {
	pool: SqlitePool,
}

impl SecretRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self), fields(scope = scope.as_str()))]
	pub async fn find(&self, scope: SecretScope, name: &str) -> Result<Option<Secret>> {
		let (org_id, repo_id) = scope.columns();
		let row = sqlx::query(&format!(
			"SELECT {SECRET_COLUMNS} FROM secrets WHERE org_id = ? AND repo_id = ? AND name = ?"
		))
		.bind(org_id)
		.bind(repo_id)
		.bind(name)
		.fetch_optional(&self.pool)
		.await?;

		row.as_ref().map(parse_secret_row).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn find_by_id(&self, id: i64) -> Result<Option<Secret>> {
		let row = sqlx::query(&format!("SELECT {SECRET_COLUMNS} FROM secrets WHERE id = ?"))
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;

		row.as_ref().map(parse_secret_row).transpose()
	}

	#[tracing::instrument(skip(self), fields(scope = scope.as_str()))]
	pub async fn list(&self, scope: SecretScope) -> Result<Vec<Secret>> {
		let (org_id, repo_id) = scope.columns();
		let rows = sqlx::query(&format!(
			"SELECT {SECRET_COLUMNS} FROM secrets WHERE org_id = ? AND repo_id = ? ORDER BY name ASC"
		))
		.bind(org_id)
		.bind(repo_id)
		.fetch_all(&self.pool)
		.await?;

		rows.iter().map(parse_secret_row).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_for_pipeline(&self, org_id: i64, repo_id: i64) -> Result<Vec<Secret>> {
		let rows = sqlx::query(&format!(
			r#"
			SELECT {SECRET_COLUMNS} FROM secrets
			WHERE (org_id = 0 AND repo_id = 0)
			   OR (org_id = ? AND repo_id = 0)
			   OR (org_id = 0 AND repo_id = ?)
			ORDER BY name ASC, id ASC
			"#
		))
		.bind(org_id)
		.bind(repo_id)
		.fetch_all(&self.pool)
		.await?;

		rows.iter().map(parse_secret_row).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_all(&self, after_id: i64, limit: u32) -> Result<Vec<Secret>> {
		let rows = sqlx::query(&format!(
			"SELECT {SECRET_COLUMNS} FROM secrets WHERE id > ? ORDER BY id ASC LIMIT ?"
		))
		.bind(after_id)
		.bind(i64::from(limit))
		.fetch_all(&self.pool)
		.await?;

		rows.iter().map(parse_secret_row).collect()
	}

	/// Returns `Err(DbError::Conflict)` if the name is taken within the scope.
	#[tracing::instrument(skip(self, secret), fields(name = %secret.name))]
	pub async fn create(&self, secret: &mut Secret) -> Result<()> {
		let now = Utc::now();
		let result = sqlx::query(
			r#"
			INSERT INTO secrets (org_id, repo_id, name, value, images, events, created_at, updated_at)
			VALUES (?, ?, ?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(secret.org_id)
		.bind(secret.repo_id)
		.bind(&secret.name)
		.bind(&secret.value)
		.bind(serde_json::to_string(&secret.images)?)
		.bind(serde_json::to_string(&secret.events)?)
		.bind(now.to_rfc3339())
		.bind(now.to_rfc3339())
		.execute(&self.pool)
		.await;

		match result {
			Ok(done) => {
				secret.id = done.last_insert_rowid();
				secret.created_at = now;
				secret.updated_at = now;
				tracing::debug!(secret_id = secret.id, name = %secret.name, "secret created");
				Ok(())
			}
			Err(e) if is_unique_constraint_error(&e) => Err(DbError::Conflict(format!(
				"secret already exists: {}",
				secret.name
			))),
			Err(e) => Err(DbError::Sqlx(e)),
		}
	}

	#[tracing::instrument(skip(self, secret), fields(secret_id = secret.id))]
	pub async fn update(&self, secret: &mut Secret) -> Result<()> {
		let now = Utc::now();
		let result = sqlx::query(
			"UPDATE secrets SET value = ?, images = ?, events = ?, updated_at = ? WHERE id = ?",
		)
		.bind(&secret.value)
		.bind(serde_json::to_string(&secret.images)?)
		.bind(serde_json::to_string(&secret.events)?)
		.bind(now.to_rfc3339())
		.bind(secret.id)
		.execute(&self.pool)
		.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("secret {}", secret.id)));
		}

		secret.updated_at = now;
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(scope = scope.as_str()))]
	pub async fn delete(&self, scope: SecretScope, name: &str) -> Result<()> {
		let (org_id, repo_id) = scope.columns();
		let result = sqlx::query("DELETE FROM secrets WHERE org_id = ? AND repo_id = ? AND name = ?")
			.bind(org_id)
			.bind(repo_id)
			.bind(name)
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("secret {name}")));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn delete_by_id(&self, id: i64) -> Result<()> {
		let result = sqlx::query("DELETE FROM secrets WHERE id = ?")
			.bind(id)
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("secret {id}")));
		}
		Ok(())
	}
}

#[async_trait]
impl SecretStore for SecretRepository {
	async fn secret_find(&self, scope: SecretScope, name: &str) -> Result<Option<Secret>> {
		self.find(scope, name).await
	}

	async fn secret_find_by_id(&self, id: i64) -> Result<Option<Secret>> {
		self.find_by_id(id).await
	}

	async fn secret_list(&self, scope: SecretScope) -> Result<Vec<Secret>> {
		self.list(scope).await
	}

	async fn secret_list_for_pipeline(&self, org_id: i64, repo_id: i64) -> Result<Vec<Secret>> {
		self.list_for_pipeline(org_id, repo_id).await
	}

	async fn secret_list_all(&self, after_id: i64, limit: u32) -> Result<Vec<Secret>> {
		self.list_all(after_id, limit).await
	}

	async fn secret_create(&self, secret: &mut Secret) -> Result<()> {
		self.create(secret).await
	}

	async fn secret_update(&self, secret: &mut Secret) -> Result<()> {
		self.update(secret).await
	}

	async fn secret_delete(&self, scope: SecretScope, name: &str) -> Result<()> {
		self.delete(scope, name).await
	}

	async fn secret_delete_by_id(&self, id: i64) -> Result<()> {
		self.delete_by_id(id).await
	}
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|_| DbError::Internal(format!("invalid {column} timestamp: {value}")))
}

fn parse_secret_row(row: &sqlx::sqlite::SqliteRow) -> Result<Secret> {
	let images: String = row.get("images");
	let events: String = row.get("events");
	let created_at: String = row.get("created_at");
	let updated_at: String = row.get("updated_at");

	Ok(Secret {
		id: row.get("id"),
		org_id: row.get("org_id"),
		repo_id: row.get("repo_id"),
		name: row.get("name"),
		value: row.get("value"),
		images: serde_json::from_str(&images)?,
		events: serde_json::from_str(&events)?,
		created_at: parse_timestamp("created_at", &created_at)?,
		updated_at: parse_timestamp("updated_at", &updated_at)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::create_migrated_test_pool;

	async fn repo() -> SecretRepository {
		SecretRepository::new(create_migrated_test_pool().await)
	}

	#[tokio::test]
	async fn create_assigns_id_and_roundtrips() {
		let repo = repo().await;
		let mut secret = Secret::new(SecretScope::Repo(7), "DOCKER_PASSWORD", "hunter2");
		secret.events = vec!["push".to_string()];
		repo.create(&mut secret).await.unwrap();
		assert!(secret.id > 0);

		let found = repo
			.find(SecretScope::Repo(7), "DOCKER_PASSWORD")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(found.id, secret.id);
		assert_eq!(found.value, "hunter2");
		assert_eq!(found.events, vec!["push".to_string()]);
	}

	#[tokio::test]
	async fn duplicate_name_in_scope_conflicts() {
		let repo = repo().await;
		repo.create(&mut Secret::new(SecretScope::Org(1), "TOKEN", "a"))
			.await
			.unwrap();
		let err = repo
			.create(&mut Secret::new(SecretScope::Org(1), "TOKEN", "b"))
			.await
			.unwrap_err();
		assert!(matches!(err, DbError::Conflict(_)));

		repo.create(&mut Secret::new(SecretScope::Org(2), "TOKEN", "c"))
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn list_all_pages_by_id() {
		let repo = repo().await;
		for i in 0..5 {
			repo.create(&mut Secret::new(SecretScope::Global, format!("S{i}"), "v"))
				.await
				.unwrap();
		}

		let first = repo.list_all(0, 2).await.unwrap();
		assert_eq!(first.len(), 2);
		let second = repo.list_all(first[1].id, 2).await.unwrap();
		assert_eq!(second.len(), 2);
		assert!(second[0].id > first[1].id);
		let last = repo.list_all(second[1].id, 2).await.unwrap();
		assert_eq!(last.len(), 1);
	}

	#[tokio::test]
	async fn list_for_pipeline_includes_all_visible_scopes() {
		let repo = repo().await;
		repo.create(&mut Secret::new(SecretScope::Global, "A", "g"))
			.await
			.unwrap();
		repo.create(&mut Secret::new(SecretScope::Org(1), "B", "o"))
			.await
			.unwrap();
		repo.create(&mut Secret::new(SecretScope::Repo(9), "C", "r"))
			.await
			.unwrap();
		repo.create(&mut Secret::new(SecretScope::Org(2), "D", "other org"))
			.await
			.unwrap();

		let names: Vec<_> = repo
			.list_for_pipeline(1, 9)
			.await
			.unwrap()
			.into_iter()
			.map(|s| s.name)
			.collect();
		assert_eq!(names, vec!["A", "B", "C"]);
	}

	#[tokio::test]
	async fn update_missing_secret_is_not_found() {
		let repo = repo().await;
		let mut secret = Secret::new(SecretScope::Global, "GHOST", "v");
		secret.id = 404;
		assert!(matches!(
			repo.update(&mut secret).await,
			Err(DbError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn delete_by_scope_and_name() {
		let repo = repo().await;
		repo.create(&mut Secret::new(SecretScope::Repo(3), "X", "v"))
			.await
			.unwrap();
		repo.delete(SecretScope::Repo(3), "X").await.unwrap();
		assert!(repo.find(SecretScope::Repo(3), "X").await.unwrap().is_none());
		assert!(matches!(
			repo.delete(SecretScope::Repo(3), "X").await,
			Err(DbError::NotFound(_))
		));
	}

	#[test]
	fn debug_redacts_value() {
		let secret = Secret::new(SecretScope::Global, "TOKEN", "hunter2");
		assert!(!format!("{secret:?}").contains("hunter2"));
	}

	#[test]
	fn scope_columns_roundtrip() {
		for scope in [SecretScope::Global, SecretScope::Org(4), SecretScope::Repo(5)] {
			let (org_id, repo_id) = scope.columns();
			assert_eq!(SecretScope::from_columns(org_id, repo_id).unwrap(), scope);
		}
		assert!(SecretScope::from_columns(1, 1).is_err());
	}
}
