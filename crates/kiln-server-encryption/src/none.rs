// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EncryptionError, EncryptionResult};
use crate::service::EncryptionService;

/// Identity backend used while encryption is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl NoEncryption {
	pub const ALGORITHM: &'static str = "none";
}

impl EncryptionService for NoEncryption {
	fn encrypt(&self, plaintext: &str, _associated_data: &str) -> EncryptionResult<String> {
		Ok(plaintext.to_string())
	}

	fn decrypt(&self, ciphertext: &str, _associated_data: &str) -> EncryptionResult<String> {
		Ok(ciphertext.to_string())
	}

	fn algorithm(&self) -> &'static str {
		Self::ALGORITHM
	}

	fn key_id(&self) -> &str {
		""
	}

	fn verify_key_id(&self, _recorded: &str) -> EncryptionResult<()> {
		Err(EncryptionError::KeyInvalid(
			"encryption was enabled but no key is configured".into(),
		))
	}
}
