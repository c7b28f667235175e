// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for encryption at rest.

use kiln_server_db::DbError;
use thiserror::Error;

/// Result type alias for encryption operations.
pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// Errors raised by backends, the state machine and encryption clients.
#[derive(Debug, Error)]
pub enum EncryptionError {
	// =========================================================================
	// Configuration Errors
	// =========================================================================
	#[error("encryption configuration error: {0}")]
	Configuration(String),

	#[error("invalid keyset: {0}")]
	Keyset(String),

	// =========================================================================
	// Key State Errors
	// =========================================================================
	/// The ciphertext sample does not match the configured key.
	#[error("encryption key is invalid: {0}")]
	KeyInvalid(String),

	/// The ciphertext sample was written under a different key of the same keyset.
	#[error("encryption key was rotated: {0}")]
	KeyRotated(String),

	// =========================================================================
	// Cryptographic Operation Errors
	// =========================================================================
	#[error("encryption failed: {0}")]
	Encryption(String),

	#[error("decryption failed: {0}")]
	Decryption(String),

	// =========================================================================
	// Client Errors
	// =========================================================================
	#[error("encryption client {client} failed: {source}")]
	Client {
		client: String,
		#[source]
		source: Box<EncryptionError>,
	},

	#[error("encryption client {0} already has an encryption service")]
	ClientAlreadyInitialized(String),

	#[error("encryption client {0} has no encryption service")]
	ClientNotInitialized(String),

	// =========================================================================
	// Transition Errors
	// =========================================================================
	#[error("another encryption state change is in progress")]
	RotationInProgress,

	#[error("encryption state change cancelled")]
	Cancelled,

	// =========================================================================
	// Infrastructure Errors
	// =========================================================================
	#[error("store error: {0}")]
	Store(#[from] DbError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl EncryptionError {
	/// Wraps an error raised by the named client.
	pub fn client(client: impl Into<String>, source: EncryptionError) -> Self {
		EncryptionError::Client {
			client: client.into(),
			source: Box::new(source),
		}
	}

	/// Returns true if the server must not start when this error surfaces
	/// during bootstrap.
	pub fn is_fatal(&self) -> bool {
		!matches!(
			self,
			EncryptionError::KeyRotated(_)
				| EncryptionError::Encryption(_)
				| EncryptionError::Decryption(_)
				| EncryptionError::RotationInProgress
		)
	}

	/// Returns true if the operation stopped because of a shutdown request.
	pub fn is_cancelled(&self) -> bool {
		match self {
			EncryptionError::Cancelled => true,
			EncryptionError::Client { source, .. } => source.is_cancelled(),
			_ => false,
		}
	}
}
