// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encryption-at-rest configuration.
//!
//! Exactly one key source may be configured: a passphrase (password-derived
//! AES-GCM) or a path to a keyset file (AEAD keyset with hot rotation).
//! Configuring both is rejected when the layer is finalized.

use std::path::PathBuf;
use std::time::Duration;

use kiln_common_secret::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_WATCH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Where the encryption key material comes from.
#[derive(Debug, Clone, Default)]
pub enum KeySource {
	/// No key configured; secrets are stored as plaintext.
	#[default]
	None,
	/// Operator-supplied passphrase, fixed for the process lifetime.
	Passphrase(SecretString),
	/// Path to a keyset file that may be rotated while the server runs.
	KeysetFile(PathBuf),
}

impl KeySource {
	pub fn is_configured(&self) -> bool {
		!matches!(self, KeySource::None)
	}

	pub fn kind(&self) -> &'static str {
		match self {
			KeySource::None => "none",
			KeySource::Passphrase(_) => "passphrase",
			KeySource::KeysetFile(_) => "keyset",
		}
	}
}

/// Encryption configuration (runtime, fully resolved).
#[derive(Debug, Clone)]
pub struct EncryptionConfig {
	pub key_source: KeySource,
	/// Decrypt all data back to plaintext and remove the ciphertext sample.
	pub disable: bool,
	/// How often the keyset file is checked for changes.
	pub watch_interval: Duration,
	/// Rows re-encrypted per page during enable/rotate/disable.
	pub batch_size: usize,
}

impl Default for EncryptionConfig {
	fn default() -> Self {
		Self {
			key_source: KeySource::None,
			disable: false,
			watch_interval: Duration::from_secs(DEFAULT_WATCH_INTERVAL_SECS),
			batch_size: DEFAULT_BATCH_SIZE,
		}
	}
}

/// Encryption configuration layer (partial, for merging).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionConfigLayer {
	#[serde(default)]
	pub passphrase: Option<SecretString>,
	#[serde(default)]
	pub keyset_file: Option<PathBuf>,
	#[serde(default)]
	pub disable: Option<bool>,
	#[serde(default)]
	pub watch_interval_secs: Option<u64>,
	#[serde(default)]
	pub batch_size: Option<usize>,
}

impl EncryptionConfigLayer {
	pub fn merge(&mut self, other: EncryptionConfigLayer) {
		if other.passphrase.is_some() {
			self.passphrase = other.passphrase;
		}
		if other.keyset_file.is_some() {
			self.keyset_file = other.keyset_file;
		}
		if other.disable.is_some() {
			self.disable = other.disable;
		}
		if other.watch_interval_secs.is_some() {
			self.watch_interval_secs = other.watch_interval_secs;
		}
		if other.batch_size.is_some() {
			self.batch_size = other.batch_size;
		}
	}

	pub fn finalize(self) -> Result<EncryptionConfig, ConfigError> {
		let passphrase = self.passphrase.filter(|p| !p.is_empty());
		let keyset_file = self
			.keyset_file
			.filter(|p| !p.as_os_str().is_empty());

		let key_source = match (passphrase, keyset_file) {
			(Some(_), Some(_)) => {
				return Err(ConfigError::Validation(
					"an encryption passphrase and an encryption keyset file are both configured; \
					 choose one"
						.to_string(),
				));
			}
			(Some(passphrase), None) => KeySource::Passphrase(passphrase),
			(None, Some(path)) => KeySource::KeysetFile(path),
			(None, None) => KeySource::None,
		};

		let watch_interval_secs = self
			.watch_interval_secs
			.unwrap_or(DEFAULT_WATCH_INTERVAL_SECS);
		if watch_interval_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "encryption.watch_interval_secs".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}

		let batch_size = self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
		if batch_size == 0 {
			return Err(ConfigError::InvalidValue {
				key: "encryption.batch_size".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}

		Ok(EncryptionConfig {
			key_source,
			disable: self.disable.unwrap_or(false),
			watch_interval: Duration::from_secs(watch_interval_secs),
			batch_size,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_have_no_key() {
		let config = EncryptionConfigLayer::default().finalize().unwrap();
		assert!(!config.key_source.is_configured());
		assert!(!config.disable);
		assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
		assert_eq!(
			config.watch_interval,
			Duration::from_secs(DEFAULT_WATCH_INTERVAL_SECS)
		);
	}

	#[test]
	fn both_key_sources_are_rejected() {
		let layer = EncryptionConfigLayer {
			passphrase: Some(SecretString::from("passphrase")),
			keyset_file: Some(PathBuf::from("/etc/kiln/keyset.json")),
			..Default::default()
		};
		let err = layer.finalize().unwrap_err();
		assert!(matches!(err, ConfigError::Validation(_)));
	}

	#[test]
	fn empty_passphrase_counts_as_unset() {
		let layer = EncryptionConfigLayer {
			passphrase: Some(SecretString::from("")),
			keyset_file: Some(PathBuf::from("/etc/kiln/keyset.json")),
			..Default::default()
		};
		let config = layer.finalize().unwrap();
		assert_eq!(config.key_source.kind(), "keyset");
	}

	#[test]
	fn zero_batch_size_is_rejected() {
		let layer = EncryptionConfigLayer {
			batch_size: Some(0),
			..Default::default()
		};
		assert!(matches!(
			layer.finalize(),
			Err(ConfigError::InvalidValue { .. })
		));
	}

	#[test]
	fn merge_prefers_later_layer() {
		let mut base = EncryptionConfigLayer {
			passphrase: Some(SecretString::from("first")),
			batch_size: Some(10),
			..Default::default()
		};
		base.merge(EncryptionConfigLayer {
			passphrase: Some(SecretString::from("second")),
			disable: Some(true),
			..Default::default()
		});

		let config = base.finalize().unwrap();
		match config.key_source {
			KeySource::Passphrase(p) => assert_eq!(p.expose(), "second"),
			other => panic!("unexpected key source: {other:?}"),
		}
		assert!(config.disable);
		assert_eq!(config.batch_size, 10);
	}

	#[test]
	fn debug_does_not_leak_passphrase() {
		let config = EncryptionConfigLayer {
			passphrase: Some(SecretString::from("super-secret-passphrase")),
			..Default::default()
		}
		.finalize()
		.unwrap();
		assert!(!format!("{config:?}").contains("super-secret-passphrase"));
	}
}
