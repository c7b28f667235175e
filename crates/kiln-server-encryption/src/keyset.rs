// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Keyset-file AEAD backend.
//!
//! Reads a cleartext JSON keyset of AES-GCM keys:
//!
//! ```json
//! {"primaryKeyId": 42,
//!  "key": [{"keyData": {"typeUrl": "type.googleapis.com/google.crypto.tink.AesGcmKey",
//!                       "value": "<base64 AesGcmKey message>",
//!                       "keyMaterialType": "SYMMETRIC"},
//!           "status": "ENABLED", "keyId": 42, "outputPrefixType": "TINK"}]}
//! ```
//!
//! New values are sealed under the primary key. Every enabled key can still
//! open values it sealed, which is what lets data written before a rotation be
//! migrated to the new primary.
//!
//! Ciphertext layout: `prefix || nonce(12) || ciphertext || tag`, standard
//! base64. The prefix is `0x01 || key_id (u32 BE)` for `TINK` keys,
//! `0x00 || key_id` for `LEGACY`/`CRUNCHY` keys and empty for `RAW` keys.

use std::path::Path;

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng, Payload},
	Aes128Gcm, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::aes::{NONCE_SIZE, TAG_SIZE};
use crate::error::{EncryptionError, EncryptionResult};
use crate::service::EncryptionService;

pub const AES_GCM_TYPE_URL: &str = "type.googleapis.com/google.crypto.tink.AesGcmKey";

const TINK_START_BYTE: u8 = 0x01;
const LEGACY_START_BYTE: u8 = 0x00;
const PREFIX_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
	Enabled,
	Disabled,
	Destroyed,
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputPrefixType {
	Tink,
	Legacy,
	Raw,
	Crunchy,
	#[serde(other)]
	Unknown,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysetDocument {
	primary_key_id: u32,
	#[serde(default)]
	key: Vec<KeyDocument>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDocument {
	key_data: KeyDataDocument,
	status: KeyStatus,
	key_id: u32,
	output_prefix_type: OutputPrefixType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDataDocument {
	type_url: String,
	value: String,
}

enum AesGcmCipher {
	Aes128(Aes128Gcm),
	Aes256(Aes256Gcm),
}

impl AesGcmCipher {
	fn new(key: &[u8]) -> EncryptionResult<Self> {
		let invalid = |_| EncryptionError::Keyset("invalid AES-GCM key".into());
		match key.len() {
			16 => Aes128Gcm::new_from_slice(key)
				.map(AesGcmCipher::Aes128)
				.map_err(invalid),
			32 => Aes256Gcm::new_from_slice(key)
				.map(AesGcmCipher::Aes256)
				.map_err(invalid),
			n => Err(EncryptionError::Keyset(format!(
				"unsupported AES-GCM key size: {n} bytes"
			))),
		}
	}

	fn seal(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>, aes_gcm::Error> {
		let nonce = Nonce::from_slice(nonce);
		match self {
			AesGcmCipher::Aes128(cipher) => cipher.encrypt(nonce, payload),
			AesGcmCipher::Aes256(cipher) => cipher.encrypt(nonce, payload),
		}
	}

	fn open(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>, aes_gcm::Error> {
		let nonce = Nonce::from_slice(nonce);
		match self {
			AesGcmCipher::Aes128(cipher) => cipher.decrypt(nonce, payload),
			AesGcmCipher::Aes256(cipher) => cipher.decrypt(nonce, payload),
		}
	}
}

struct KeysetKey {
	key_id: u32,
	prefix: Vec<u8>,
	cipher: AesGcmCipher,
}

impl KeysetKey {
	/// `data` is the ciphertext with any output prefix already removed.
	fn open(&self, data: &[u8], associated_data: &str) -> Option<Vec<u8>> {
		if data.len() < NONCE_SIZE + TAG_SIZE {
			return None;
		}
		let (nonce, sealed) = data.split_at(NONCE_SIZE);
		self.cipher
			.open(
				nonce,
				Payload {
					msg: sealed,
					aad: associated_data.as_bytes(),
				},
			)
			.ok()
	}
}

pub struct KeysetEncryption {
	keys: Vec<KeysetKey>,
	primary: usize,
	key_id: String,
}

impl KeysetEncryption {
	pub const ALGORITHM: &'static str = "tink";

	/// Loads a cleartext keyset file.
	pub fn from_file(path: &Path) -> EncryptionResult<Self> {
		let json = std::fs::read_to_string(path).map_err(|e| {
			EncryptionError::Keyset(format!("failed to read {}: {e}", path.display()))
		})?;
		Self::from_json(&json)
	}

	pub fn from_json(json: &str) -> EncryptionResult<Self> {
		let document: KeysetDocument = serde_json::from_str(json)
			.map_err(|e| EncryptionError::Keyset(format!("malformed keyset JSON: {e}")))?;

		let mut keys = Vec::new();
		for key in document
			.key
			.iter()
			.filter(|k| k.status == KeyStatus::Enabled)
		{
			keys.push(load_key(key)?);
		}

		let mut primaries = keys
			.iter()
			.enumerate()
			.filter(|(_, k)| k.key_id == document.primary_key_id);
		let primary = match (primaries.next(), primaries.next()) {
			(Some((index, _)), None) => index,
			(None, _) => {
				return Err(EncryptionError::Keyset(format!(
					"primary key {} is missing or not enabled",
					document.primary_key_id
				)))
			}
			(Some(_), Some(_)) => {
				return Err(EncryptionError::Keyset(format!(
					"primary key {} appears more than once",
					document.primary_key_id
				)))
			}
		};

		Ok(Self {
			keys,
			primary,
			key_id: document.primary_key_id.to_string(),
		})
	}

	pub fn primary_key_id(&self) -> u32 {
		self.keys[self.primary].key_id
	}

	/// Ids of the keys that can decrypt, primary included.
	pub fn enabled_key_ids(&self) -> Vec<u32> {
		self.keys.iter().map(|k| k.key_id).collect()
	}
}

impl std::fmt::Debug for KeysetEncryption {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeysetEncryption")
			.field("primary_key_id", &self.primary_key_id())
			.field("enabled_key_ids", &self.enabled_key_ids())
			.finish()
	}
}

impl EncryptionService for KeysetEncryption {
	fn encrypt(&self, plaintext: &str, associated_data: &str) -> EncryptionResult<String> {
		let primary = &self.keys[self.primary];

		let mut nonce = [0u8; NONCE_SIZE];
		OsRng.fill_bytes(&mut nonce);

		let sealed = primary
			.cipher
			.seal(
				&nonce,
				Payload {
					msg: plaintext.as_bytes(),
					aad: associated_data.as_bytes(),
				},
			)
			.map_err(|e| EncryptionError::Encryption(format!("keyset seal failed: {e}")))?;

		let mut out = Vec::with_capacity(primary.prefix.len() + NONCE_SIZE + sealed.len());
		out.extend_from_slice(&primary.prefix);
		out.extend_from_slice(&nonce);
		out.extend_from_slice(&sealed);
		Ok(STANDARD.encode(out))
	}

	fn decrypt(&self, ciphertext: &str, associated_data: &str) -> EncryptionResult<String> {
		let raw = STANDARD
			.decode(ciphertext.as_bytes())
			.map_err(|e| EncryptionError::Decryption(format!("invalid base64: {e}")))?;

		let prefixed = self
			.keys
			.iter()
			.filter(|k| !k.prefix.is_empty() && raw.starts_with(&k.prefix))
			.find_map(|k| k.open(&raw[PREFIX_SIZE..], associated_data));
		let plaintext = match prefixed {
			Some(plaintext) => plaintext,
			None => self
				.keys
				.iter()
				.filter(|k| k.prefix.is_empty())
				.find_map(|k| k.open(&raw, associated_data))
				.ok_or_else(|| {
					EncryptionError::Decryption("no key in the keyset could decrypt the value".into())
				})?,
		};

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
		if recorded == self.key_id {
			return Ok(());
		}
		match recorded.parse::<u32>() {
			Ok(_) => Err(EncryptionError::KeyRotated(format!(
				"primary key changed from {recorded} to {}",
				self.key_id
			))),
			Err(_) => Err(EncryptionError::KeyInvalid(format!(
				"recorded key id {recorded:?} is not a keyset key id"
			))),
		}
	}

	fn supports_rotation(&self) -> bool {
		true
	}
}

fn load_key(key: &KeyDocument) -> EncryptionResult<KeysetKey> {
	if key.key_data.type_url != AES_GCM_TYPE_URL {
		return Err(EncryptionError::Keyset(format!(
			"key {} has unsupported type {}",
			key.key_id, key.key_data.type_url
		)));
	}

	let serialized = Zeroizing::new(STANDARD.decode(key.key_data.value.as_bytes()).map_err(
		|e| EncryptionError::Keyset(format!("key {} value is not base64: {e}", key.key_id)),
	)?);
	let material = decode_aes_gcm_key(&serialized)
		.map_err(|e| EncryptionError::Keyset(format!("key {}: {e}", key.key_id)))?;

	Ok(KeysetKey {
		key_id: key.key_id,
		prefix: output_prefix(key.output_prefix_type, key.key_id)?,
		cipher: AesGcmCipher::new(&material)?,
	})
}

fn output_prefix(prefix_type: OutputPrefixType, key_id: u32) -> EncryptionResult<Vec<u8>> {
	let start = match prefix_type {
		OutputPrefixType::Tink => TINK_START_BYTE,
		OutputPrefixType::Legacy | OutputPrefixType::Crunchy => LEGACY_START_BYTE,
		OutputPrefixType::Raw => return Ok(Vec::new()),
		OutputPrefixType::Unknown => {
			return Err(EncryptionError::Keyset(format!(
				"key {key_id} has an unknown output prefix type"
			)))
		}
	};
	let mut prefix = Vec::with_capacity(PREFIX_SIZE);
	prefix.push(start);
	prefix.extend_from_slice(&key_id.to_be_bytes());
	Ok(prefix)
}

/// Decodes an `AesGcmKey` protobuf message: `version` (field 1) must be 0,
/// `key_value` is field 3.
fn decode_aes_gcm_key(bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>, String> {
	let mut pos = 0;
	let mut version = 0;
	let mut key_value = None;

	while pos < bytes.len() {
		let tag = read_varint(bytes, &mut pos)?;
		let field = tag >> 3;
		match tag & 0x7 {
			0 => {
				let value = read_varint(bytes, &mut pos)?;
				if field == 1 {
					version = value;
				}
			}
			2 => {
				let len = usize::try_from(read_varint(bytes, &mut pos)?)
					.map_err(|_| "length overflow".to_string())?;
				let end = pos
					.checked_add(len)
					.filter(|end| *end <= bytes.len())
					.ok_or_else(|| "truncated key message".to_string())?;
				if field == 3 {
					key_value = Some(Zeroizing::new(bytes[pos..end].to_vec()));
				}
				pos = end;
			}
			1 => pos = skip(bytes, pos, 8)?,
			5 => pos = skip(bytes, pos, 4)?,
			wire => return Err(format!("unsupported wire type {wire}")),
		}
	}

	if version != 0 {
		return Err(format!("unsupported AesGcmKey version {version}"));
	}
	key_value.ok_or_else(|| "key message has no key value".to_string())
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, String> {
	let mut value = 0u64;
	for shift in (0..64).step_by(7) {
		let byte = *bytes
			.get(*pos)
			.ok_or_else(|| "truncated varint".to_string())?;
		*pos += 1;
		value |= u64::from(byte & 0x7f) << shift;
		if byte & 0x80 == 0 {
			return Ok(value);
		}
	}
	Err("varint too long".to_string())
}

fn skip(bytes: &[u8], pos: usize, len: usize) -> Result<usize, String> {
	pos.checked_add(len)
		.filter(|end| *end <= bytes.len())
		.ok_or_else(|| "truncated key message".to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::KeysetFixture;
	use proptest::prelude::*;

	#[test]
	fn roundtrip_under_primary() {
		let svc = KeysetEncryption::from_json(&KeysetFixture::new(42).to_json()).unwrap();
		assert_eq!(svc.key_id(), "42");
		assert_eq!(svc.primary_key_id(), 42);

		let large = "k".repeat(2048);
		for plaintext in ["", "hello", large.as_str()] {
			let ciphertext = svc.encrypt(plaintext, "7").unwrap();
			assert_eq!(svc.decrypt(&ciphertext, "7").unwrap(), plaintext);
		}
	}

	#[test]
	fn tink_prefix_carries_key_id() {
		let svc = KeysetEncryption::from_json(&KeysetFixture::new(0x0102_0304).to_json()).unwrap();
		let raw = STANDARD.decode(svc.encrypt("v", "").unwrap()).unwrap();
		assert_eq!(&raw[..PREFIX_SIZE], &[0x01, 0x01, 0x02, 0x03, 0x04]);
		assert_eq!(raw.len(), PREFIX_SIZE + NONCE_SIZE + 1 + TAG_SIZE);
	}

	#[test]
	fn raw_keys_have_no_prefix() {
		let fixture = KeysetFixture::new(1).with_raw_key(2).rotate_to(2);
		let svc = KeysetEncryption::from_json(&fixture.to_json()).unwrap();
		let raw = STANDARD.decode(svc.encrypt("v", "").unwrap()).unwrap();
		assert_eq!(raw.len(), NONCE_SIZE + 1 + TAG_SIZE);
		assert_eq!(svc.decrypt(&STANDARD.encode(&raw), "").unwrap(), "v");
	}

	#[test]
	fn rotated_keyset_decrypts_old_values() {
		let a = KeysetFixture::new(1);
		let b = a.clone().rotate_to(2);
		let old = KeysetEncryption::from_json(&a.to_json()).unwrap();
		let new = KeysetEncryption::from_json(&b.to_json()).unwrap();

		let ciphertext = old.encrypt("value", "9").unwrap();
		assert_eq!(new.decrypt(&ciphertext, "9").unwrap(), "value");

		let newer = new.encrypt("value", "9").unwrap();
		assert!(old.decrypt(&newer, "9").is_err());
	}

	#[test]
	fn disabled_keys_cannot_decrypt() {
		let a = KeysetFixture::new(1);
		let b = a.clone().rotate_to(2).disable_key(1);
		let old = KeysetEncryption::from_json(&a.to_json()).unwrap();
		let new = KeysetEncryption::from_json(&b.to_json()).unwrap();

		let ciphertext = old.encrypt("value", "").unwrap();
		assert!(new.decrypt(&ciphertext, "").is_err());
		assert_eq!(new.enabled_key_ids(), vec![2]);
	}

	#[test]
	fn wrong_associated_data_fails() {
		let svc = KeysetEncryption::from_json(&KeysetFixture::new(5).to_json()).unwrap();
		let ciphertext = svc.encrypt("value", "1").unwrap();
		assert!(matches!(
			svc.decrypt(&ciphertext, "2"),
			Err(EncryptionError::Decryption(_))
		));
	}

	#[test]
	fn verify_key_id_classifies_mismatch() {
		let svc = KeysetEncryption::from_json(&KeysetFixture::new(2).to_json()).unwrap();
		svc.verify_key_id("2").unwrap();
		assert!(matches!(
			svc.verify_key_id("1"),
			Err(EncryptionError::KeyRotated(_))
		));
		assert!(matches!(
			svc.verify_key_id("$argon2id$v=19$..."),
			Err(EncryptionError::KeyInvalid(_))
		));
	}

	#[test]
	fn primary_must_be_enabled() {
		let fixture = KeysetFixture::new(1).with_key(2).disable_key(1);
		assert!(matches!(
			KeysetEncryption::from_json(&fixture.to_json()),
			Err(EncryptionError::Keyset(_))
		));
	}

	#[test]
	fn rejects_malformed_documents() {
		for json in [
			"",
			"{}",
			"not json",
			r#"{"primaryKeyId": 1, "key": []}"#,
			r#"{"primaryKeyId": 1, "key": [{"keyData": {"typeUrl": "type.googleapis.com/google.crypto.tink.AesSivKey", "value": "AA=="}, "status": "ENABLED", "keyId": 1, "outputPrefixType": "TINK"}]}"#,
			r#"{"primaryKeyId": 1, "key": [{"keyData": {"typeUrl": "type.googleapis.com/google.crypto.tink.AesGcmKey", "value": "!!"}, "status": "ENABLED", "keyId": 1, "outputPrefixType": "TINK"}]}"#,
		] {
			assert!(KeysetEncryption::from_json(json).is_err(), "accepted {json:?}");
		}
	}

	#[test]
	fn decodes_key_message_with_params() {
		// version=0, params={key_size=32}, key_value=16 bytes
		let mut message = vec![0x08, 0x00, 0x12, 0x02, 0x10, 0x20, 0x1a, 0x10];
		message.extend_from_slice(&[7u8; 16]);
		assert_eq!(decode_aes_gcm_key(&message).unwrap().as_slice(), &[7u8; 16]);
	}

	#[test]
	fn rejects_nonzero_version() {
		let mut message = vec![0x08, 0x01, 0x1a, 0x10];
		message.extend_from_slice(&[7u8; 16]);
		assert!(decode_aes_gcm_key(&message).is_err());
	}

	#[test]
	fn rejects_truncated_key_messages() {
		let cases: [&[u8]; 5] = [
			&[0x1a, 0x10, 0x07],
			&[0x1a],
			&[0x08, 0x80],
			&[0x1a, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01],
			&[0x08, 0x00],
		];
		for message in cases {
			assert!(decode_aes_gcm_key(message).is_err(), "{message:?}");
		}
	}

	#[test]
	fn from_file_reads_keyset() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("keyset.json");
		KeysetFixture::new(9).write(&path).unwrap();
		assert_eq!(KeysetEncryption::from_file(&path).unwrap().key_id(), "9");
		assert!(KeysetEncryption::from_file(&dir.path().join("missing.json")).is_err());
	}

	proptest! {
		#![proptest_config(ProptestConfig::with_cases(64))]

		#[test]
		fn prop_roundtrip(plaintext in ".{0,2048}", ad in ".{0,64}") {
			let svc = KeysetEncryption::from_json(&KeysetFixture::new(3).to_json()).unwrap();
			let ciphertext = svc.encrypt(&plaintext, &ad).unwrap();
			prop_assert_eq!(svc.decrypt(&ciphertext, &ad).unwrap(), plaintext);
		}

		#[test]
		fn prop_arbitrary_key_messages_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
			let _ = decode_aes_gcm_key(&bytes);
		}

		#[test]
		fn prop_flipped_byte_fails(plaintext in ".{0,256}", idx in any::<usize>(), bit in 0u8..8) {
			let svc = KeysetEncryption::from_json(&KeysetFixture::new(3).to_json()).unwrap();
			let mut raw = STANDARD.decode(svc.encrypt(&plaintext, "ad").unwrap()).unwrap();
			let i = idx % raw.len();
			raw[i] ^= 1 << bit;
			prop_assert!(svc.decrypt(&STANDARD.encode(raw), "ad").is_err());
		}
	}
}
