// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The encryption service abstraction and the stored-value envelope.
//!
//! Values written to the database by an encrypting store have the form
//! `_<algorithm>_<payload>`, where the algorithm is one of the encrypting
//! backends and the payload is base64 at least one nonce and tag long.
//! Anything else, including user values that merely start with an
//! underscore, is treated as plaintext.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;

use crate::aes::{AesEncryption, NONCE_SIZE, TAG_SIZE};
use crate::error::EncryptionResult;
use crate::keyset::KeysetEncryption;

/// Server config key holding the ciphertext sample.
pub const CIPHERTEXT_SAMPLE_KEY: &str = "encryption-ciphertext-sample";

/// Associated data used when sealing the ciphertext sample.
pub const CIPHERTEXT_SAMPLE_AD: &str = "Primary key id";

/// An AEAD over UTF-8 strings.
///
/// Implementations must be safe for concurrent use; the active instance is
/// shared by every request and is only ever replaced, never mutated.
pub trait EncryptionService: Send + Sync {
	/// Seals `plaintext`, binding it to `associated_data`.
	fn encrypt(&self, plaintext: &str, associated_data: &str) -> EncryptionResult<String>;

	/// Opens a value sealed by [`encrypt`](Self::encrypt). Fails if the
	/// ciphertext was altered or `associated_data` differs.
	fn decrypt(&self, ciphertext: &str, associated_data: &str) -> EncryptionResult<String>;

	/// Short identifier written into the stored-value header.
	fn algorithm(&self) -> &'static str;

	/// Identity of the active key. Safe to persist; never key material.
	fn key_id(&self) -> &str;

	/// Checks a key id recovered from the ciphertext sample against this
	/// service's key.
	///
	/// Returns `KeyInvalid` when the key cannot be the one that wrote the
	/// sample and `KeyRotated` when it belongs to the same keyset but a newer
	/// primary key is active.
	fn verify_key_id(&self, recorded: &str) -> EncryptionResult<()>;

	/// Whether the service can take over data written under a previous key.
	fn supports_rotation(&self) -> bool {
		false
	}

	/// Releases backend resources once the service is no longer active.
	fn disable(&self) -> EncryptionResult<()> {
		Ok(())
	}
}

/// A value as read from the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredValue<'a> {
	Plaintext(&'a str),
	Encrypted {
		algorithm: &'a str,
		payload: &'a str,
	},
}

impl<'a> StoredValue<'a> {
	pub fn parse(value: &'a str) -> Self {
		let Some(rest) = value.strip_prefix('_') else {
			return StoredValue::Plaintext(value);
		};
		match rest.split_once('_') {
			Some((algorithm, payload)) if is_sealed_payload(algorithm, payload) => {
				StoredValue::Encrypted { algorithm, payload }
			}
			_ => StoredValue::Plaintext(value),
		}
	}

	pub fn is_encrypted(&self) -> bool {
		matches!(self, StoredValue::Encrypted { .. })
	}
}

fn is_sealed_payload(algorithm: &str, payload: &str) -> bool {
	let decoded = match algorithm {
		AesEncryption::ALGORITHM => STANDARD_NO_PAD.decode(payload),
		KeysetEncryption::ALGORITHM => STANDARD.decode(payload),
		_ => return false,
	};
	decoded.is_ok_and(|raw| raw.len() >= NONCE_SIZE + TAG_SIZE)
}

/// Encrypts `plaintext` with `service` and prepends the algorithm header.
///
/// The no-op backend stores values unchanged so that a disabled server keeps
/// writing plain rows.
pub fn seal(
	service: &dyn EncryptionService,
	plaintext: &str,
	associated_data: &str,
) -> EncryptionResult<String> {
	if service.algorithm() == crate::none::NoEncryption::ALGORITHM {
		return Ok(plaintext.to_string());
	}
	let ciphertext = service.encrypt(plaintext, associated_data)?;
	Ok(format!("_{}_{}", service.algorithm(), ciphertext))
}

#[cfg(test)]
mod tests {
	use super::*;
	use kiln_common_secret::SecretString;

	#[test]
	fn parses_encrypted_header() {
		let payload = STANDARD_NO_PAD.encode([7u8; NONCE_SIZE + TAG_SIZE]);
		let stored = format!("_aes_{payload}");
		assert_eq!(
			StoredValue::parse(&stored),
			StoredValue::Encrypted {
				algorithm: "aes",
				payload: &payload,
			}
		);
	}

	#[test]
	fn parses_sealed_values_from_each_backend() {
		let aes = AesEncryption::new(&SecretString::from("passphrase")).unwrap();
		let stored = seal(&aes, "value", "1").unwrap();
		assert!(StoredValue::parse(&stored).is_encrypted());

		let fixture = crate::testing::KeysetFixture::new(1);
		let keyset = KeysetEncryption::from_json(&fixture.to_json()).unwrap();
		let stored = seal(&keyset, "value", "1").unwrap();
		assert!(StoredValue::parse(&stored).is_encrypted());
	}

	#[test]
	fn values_without_header_are_plaintext() {
		for value in ["", "hunter2", "_", "__x", "_no-header", "_a b_c"] {
			assert_eq!(StoredValue::parse(value), StoredValue::Plaintext(value));
		}
	}

	#[test]
	fn underscore_shaped_user_values_are_plaintext() {
		let short = format!("_aes_{}", STANDARD_NO_PAD.encode(b"short"));
		for value in [
			"_my_token",
			"_ghp_abc123",
			"_aes_not base64!",
			"_tink_a_b",
			short.as_str(),
		] {
			assert_eq!(StoredValue::parse(value), StoredValue::Plaintext(value));
		}
	}

	#[test]
	fn seal_with_no_encryption_keeps_plaintext() {
		let sealed = seal(&crate::none::NoEncryption, "value", "1").unwrap();
		assert_eq!(sealed, "value");
	}
}
