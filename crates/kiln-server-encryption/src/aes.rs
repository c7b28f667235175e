// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Password-derived AES-256-GCM backend.
//!
//! The cipher key is the SHA-256 digest of the passphrase. Each value gets a
//! fresh 96-bit random nonce, stored ahead of the sealed bytes:
//! `base64_nopad(nonce || ciphertext || tag)`.
//!
//! The key id is an Argon2id PHC string of the passphrase, so the ciphertext
//! sample can record which passphrase enabled encryption without revealing it.

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng, Payload},
	Aes256Gcm, Key, Nonce,
};
use argon2::{
	password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
	Argon2,
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use kiln_common_secret::SecretString;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{EncryptionError, EncryptionResult};
use crate::service::EncryptionService;

/// Size of AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Argon2 instance used for the key id.
///
/// Tests use minimal parameters; verification reads the parameters from the
/// PHC string, so hashes from either configuration verify correctly.
fn argon2_instance() -> Argon2<'static> {
	#[cfg(test)]
	{
		use argon2::{Algorithm, Params, Version};
		let params = Params::new(1024, 1, 1, None).expect("valid Argon2 params for tests");
		Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
	}

	#[cfg(not(test))]
	{
		Argon2::default()
	}
}

pub struct AesEncryption {
	cipher: Aes256Gcm,
	key_id: String,
	passphrase: SecretString,
}

impl AesEncryption {
	pub const ALGORITHM: &'static str = "aes";

	/// Derives the cipher and hashes the passphrase into a key id.
	pub fn new(passphrase: &SecretString) -> EncryptionResult<Self> {
		if passphrase.expose().is_empty() {
			return Err(EncryptionError::Configuration(
				"encryption passphrase must not be empty".into(),
			));
		}

		let digest: Zeroizing<[u8; 32]> =
			Zeroizing::new(Sha256::digest(passphrase.expose().as_bytes()).into());
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()));

		let salt = SaltString::generate(&mut OsRng);
		let key_id = argon2_instance()
			.hash_password(passphrase.expose().as_bytes(), &salt)
			.map_err(|e| EncryptionError::Configuration(format!("failed to hash passphrase: {e}")))?
			.to_string();

		Ok(Self {
			cipher,
			key_id,
			passphrase: passphrase.clone(),
		})
	}
}

impl std::fmt::Debug for AesEncryption {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AesEncryption")
			.field("key_id", &self.key_id)
			.finish_non_exhaustive()
	}
}

impl EncryptionService for AesEncryption {
	fn encrypt(&self, plaintext: &str, associated_data: &str) -> EncryptionResult<String> {
		let mut nonce_bytes = [0u8; NONCE_SIZE];
		OsRng.fill_bytes(&mut nonce_bytes);

		let sealed = self
			.cipher
			.encrypt(
				Nonce::from_slice(&nonce_bytes),
				Payload {
					msg: plaintext.as_bytes(),
					aad: associated_data.as_bytes(),
				},
			)
			.map_err(|e| EncryptionError::Encryption(format!("aes seal failed: {e}")))?;

		let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
		out.extend_from_slice(&nonce_bytes);
		out.extend_from_slice(&sealed);
		Ok(STANDARD_NO_PAD.encode(out))
	}

	fn decrypt(&self, ciphertext: &str, associated_data: &str) -> EncryptionResult<String> {
		let raw = STANDARD_NO_PAD
			.decode(ciphertext.as_bytes())
			.map_err(|e| EncryptionError::Decryption(format!("invalid base64: {e}")))?;

		if raw.len() < NONCE_SIZE + TAG_SIZE {
			return Err(EncryptionError::Decryption(format!(
				"ciphertext too short: {} bytes",
				raw.len()
			)));
		}

		let (nonce, sealed) = raw.split_at(NONCE_SIZE);
		let plaintext = self
			.cipher
			.decrypt(
				Nonce::from_slice(nonce),
				Payload {
					msg: sealed,
					aad: associated_data.as_bytes(),
				},
			)
			.map_err(|e| EncryptionError::Decryption(format!("aes open failed: {e}")))?;

		String::from_utf8(plaintext)
			.map_err(|_| EncryptionError::Decryption("plaintext is not valid UTF-8".into()))
	}

	fn algorithm(&self) -> &'static str {
		Self::ALGORITHM
	}

	fn key_id(&self) -> &str {
		&self.key_id
	}

	fn verify_key_id(&self, recorded: &str) -> EncryptionResult<()> {
		let parsed = PasswordHash::new(recorded).map_err(|e| {
			EncryptionError::KeyInvalid(format!("recorded key id is not a password hash: {e}"))
		})?;

		argon2_instance()
			.verify_password(self.passphrase.expose().as_bytes(), &parsed)
			.map_err(|_| {
				EncryptionError::KeyInvalid(
					"configured passphrase does not match the one that enabled encryption".into(),
				)
			})
	}
}
