// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::str::FromStr;

use crate::error::DbError;

const MIGRATIONS: &[(&str, &str)] = &[
	(
		"001_server_configs",
		include_str!("../migrations/001_server_configs.sql"),
	),
	("002_secrets", include_str!("../migrations/002_secrets.sql")),
];

/// Create a SqlitePool with WAL mode and common settings.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:./kiln.db")
///
/// # Errors
/// Returns `DbError::Internal` if the URL is invalid or connection fails.
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, DbError> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| DbError::Internal(format!("Invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

/// Apply the embedded schema. Every statement is idempotent.
#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
	for (name, sql) in MIGRATIONS {
		for stmt in split_statements(sql) {
			sqlx::query(&stmt).execute(pool).await?;
		}
		tracing::debug!(migration = name, "migration applied");
	}
	Ok(())
}

/// Comment lines are dropped before splitting on `;`, so a `;` inside a
/// `--` comment never starts a new statement.
fn split_statements(sql: &str) -> Vec<String> {
	let code = sql
		.lines()
		.filter(|line| !line.trim_start().starts_with("--"))
		.collect::<Vec<_>>()
		.join("\n");

	code
		.split(';')
		.map(str::trim)
		.filter(|stmt| !stmt.is_empty())
		.map(str::to_string)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_statements_skips_comment_only_chunks() {
		let sql = "-- header\nCREATE TABLE a (x INTEGER);\n-- trailing comment\n";
		let stmts = split_statements(sql);
		assert_eq!(stmts.len(), 1);
		assert!(stmts[0].contains("CREATE TABLE a"));
	}

	#[test]
	fn split_statements_ignores_semicolons_in_comments() {
		let sql = "-- one; two\nCREATE TABLE a (x INTEGER);\n-- three; four\nCREATE TABLE b (y INTEGER);\n";
		let stmts = split_statements(sql);
		assert_eq!(
			stmts,
			vec!["CREATE TABLE a (x INTEGER)", "CREATE TABLE b (y INTEGER)"]
		);
	}

	#[test]
	fn bundled_migrations_split_into_schema_statements() {
		for (name, sql) in MIGRATIONS {
			for stmt in split_statements(sql) {
				assert!(
					stmt.starts_with("CREATE TABLE") || stmt.starts_with("CREATE INDEX"),
					"{name}: unexpected statement {stmt:?}"
				);
			}
		}
	}

	#[tokio::test]
	async fn bundled_migrations_create_tables_on_fresh_pool() {
		let pool = crate::testing::create_test_pool().await;
		run_migrations(&pool).await.unwrap();

		let tables: Vec<String> = sqlx::query_scalar(
			"SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('server_configs', 'secrets') ORDER BY name",
		)
		.fetch_all(&pool)
		.await
		.unwrap();
		assert_eq!(tables, vec!["secrets", "server_configs"]);
	}

	#[tokio::test]
	async fn migrations_are_idempotent() {
		let pool = crate::testing::create_test_pool().await;
		run_migrations(&pool).await.unwrap();
		run_migrations(&pool).await.unwrap();

		let count: i64 = sqlx::query_scalar(
			"SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('server_configs', 'secrets')",
		)
		.fetch_one(&pool)
		.await
		.unwrap();
		assert_eq!(count, 2);
	}
}
