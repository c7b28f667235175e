// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for secret operations.

use kiln_server_db::DbError;
use kiln_server_encryption::EncryptionError;
use thiserror::Error;

/// Result type alias for secret operations.
pub type SecretsResult<T> = Result<T, SecretsError>;

#[derive(Debug, Error)]
pub enum SecretsError {
	#[error("invalid secret: {0}")]
	Validation(String),

	#[error("secret not found: {0}")]
	NotFound(String),

	#[error("secret already exists: {0}")]
	AlreadyExists(String),

	#[error("secret encryption failed: {0}")]
	Encryption(String),

	#[error("database error: {0}")]
	Database(DbError),
}

impl SecretsError {
	/// Returns the HTTP status code for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			SecretsError::Validation(_) => 400,
			SecretsError::NotFound(_) => 404,
			SecretsError::AlreadyExists(_) => 409,
			SecretsError::Encryption(_) | SecretsError::Database(_) => 500,
		}
	}
}

impl From<DbError> for SecretsError {
	fn from(e: DbError) -> Self {
		match e {
			DbError::NotFound(what) => SecretsError::NotFound(what),
			DbError::Conflict(what) => SecretsError::AlreadyExists(what),
			DbError::Encryption(message) => SecretsError::Encryption(message),
			other => SecretsError::Database(other),
		}
	}
}

impl From<EncryptionError> for SecretsError {
	fn from(e: EncryptionError) -> Self {
		SecretsError::Encryption(e.to_string())
	}
}
