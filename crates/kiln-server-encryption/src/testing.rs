// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fixtures for tests in this and downstream crates: keysets, recording
//! clients and config stores.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use kiln_server_db::{ServerConfigRepository, ServerConfigStore};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::json;

use crate::client::{EncryptionClient, HandleSlot};
use crate::error::{EncryptionError, EncryptionResult};
use crate::handle::EncryptionHandle;
use crate::keyset::AES_GCM_TYPE_URL;
use crate::service::EncryptionService;

#[derive(Clone)]
struct FixtureKey {
	key_id: u32,
	material: [u8; 32],
	status: &'static str,
	prefix: &'static str,
}

/// Builds keyset JSON with freshly generated AES-256-GCM keys.
///
/// Cloning a fixture keeps the key material, so `a.clone().rotate_to(2)`
/// produces the next generation of the same keyset.
#[derive(Clone)]
pub struct KeysetFixture {
	keys: Vec<FixtureKey>,
	primary: u32,
}

impl KeysetFixture {
	/// A keyset with one enabled `TINK` key, which is primary.
	pub fn new(primary_key_id: u32) -> Self {
		Self {
			keys: Vec::new(),
			primary: primary_key_id,
		}
		.push_key(primary_key_id, "TINK")
	}

	pub fn with_key(self, key_id: u32) -> Self {
		self.push_key(key_id, "TINK")
	}

	pub fn with_raw_key(self, key_id: u32) -> Self {
		self.push_key(key_id, "RAW")
	}

	/// Makes `key_id` primary, adding a new key if it does not exist yet.
	pub fn rotate_to(mut self, key_id: u32) -> Self {
		if !self.keys.iter().any(|k| k.key_id == key_id) {
			self = self.push_key(key_id, "TINK");
		}
		self.primary = key_id;
		self
	}

	pub fn disable_key(mut self, key_id: u32) -> Self {
		for key in self.keys.iter_mut().filter(|k| k.key_id == key_id) {
			key.status = "DISABLED";
		}
		self
	}

	pub fn primary_key_id(&self) -> u32 {
		self.primary
	}

	pub fn to_json(&self) -> String {
		let keys: Vec<_> = self
			.keys
			.iter()
			.map(|key| {
				let mut message = vec![0x08, 0x00, 0x1a, key.material.len() as u8];
				message.extend_from_slice(&key.material);
				json!({
					"keyData": {
						"typeUrl": AES_GCM_TYPE_URL,
						"value": STANDARD.encode(&message),
						"keyMaterialType": "SYMMETRIC",
					},
					"status": key.status,
					"keyId": key.key_id,
					"outputPrefixType": key.prefix,
				})
			})
			.collect();

		json!({ "primaryKeyId": self.primary, "key": keys }).to_string()
	}

	/// Writes the keyset through a temporary file and a rename, so a reader
	/// never sees a partial document.
	pub fn write(&self, path: &Path) -> std::io::Result<()> {
		let tmp = path.with_extension("tmp");
		std::fs::write(&tmp, self.to_json())?;
		std::fs::rename(&tmp, path)
	}

	fn push_key(mut self, key_id: u32, prefix: &'static str) -> Self {
		let mut material = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut material);
		self.keys.push(FixtureKey {
			key_id,
			material,
			status: "ENABLED",
			prefix,
		});
		self
	}
}

/// Callback recorded by a [`RecordingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCall {
	Enable,
	Migrate,
	Disable,
}

/// Log shared by several clients to observe callback order.
pub type CallLog = Arc<Mutex<Vec<(String, ClientCall)>>>;

/// An [`EncryptionClient`] that owns no data and records its callbacks.
pub struct RecordingClient {
	name: String,
	slot: HandleSlot,
	log: CallLog,
	fail_on: Option<ClientCall>,
}

impl RecordingClient {
	pub fn new(name: &str, log: CallLog) -> Self {
		Self {
			name: name.to_string(),
			slot: HandleSlot::new(),
			log,
			fail_on: None,
		}
	}

	/// Makes the given callback fail with a decryption error.
	pub fn failing_on(mut self, call: ClientCall) -> Self {
		self.fail_on = Some(call);
		self
	}

	pub fn handle(&self) -> Option<EncryptionHandle> {
		self.slot.get(&self.name).ok().cloned()
	}

	fn record(&self, call: ClientCall) -> EncryptionResult<()> {
		self.log.lock().push((self.name.clone(), call));
		if self.fail_on == Some(call) {
			return Err(EncryptionError::Decryption(format!("{call:?} failed")));
		}
		Ok(())
	}
}

#[async_trait]
impl EncryptionClient for RecordingClient {
	fn name(&self) -> &str {
		&self.name
	}

	fn set_encryption_service(&self, handle: EncryptionHandle) -> EncryptionResult<()> {
		self.slot.set(&self.name, handle)
	}

	async fn on_enable_encryption(&self) -> EncryptionResult<()> {
		self.record(ClientCall::Enable)
	}

	async fn on_migrate_encryption(
		&self,
		_new_service: Arc<dyn EncryptionService>,
	) -> EncryptionResult<()> {
		self.record(ClientCall::Migrate)
	}

	async fn on_disable_encryption(&self) -> EncryptionResult<()> {
		self.record(ClientCall::Disable)
	}
}

/// Wraps a [`ServerConfigStore`] and counts writes.
pub struct CountingConfigStore {
	inner: Arc<dyn ServerConfigStore>,
	sets: AtomicUsize,
}

impl CountingConfigStore {
	pub fn new(inner: Arc<dyn ServerConfigStore>) -> Self {
		Self {
			inner,
			sets: AtomicUsize::new(0),
		}
	}

	pub fn sets(&self) -> usize {
		self.sets.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ServerConfigStore for CountingConfigStore {
	async fn server_config_get(&self, key: &str) -> kiln_server_db::Result<Option<String>> {
		self.inner.server_config_get(key).await
	}

	async fn server_config_set(&self, key: &str, value: &str) -> kiln_server_db::Result<()> {
		self.sets.fetch_add(1, Ordering::SeqCst);
		self.inner.server_config_set(key, value).await
	}

	async fn server_config_delete(&self, key: &str) -> kiln_server_db::Result<()> {
		self.inner.server_config_delete(key).await
	}
}

/// A server config store on a fresh in-memory database.
pub async fn create_config_store() -> Arc<dyn ServerConfigStore> {
	let pool = kiln_server_db::testing::create_migrated_test_pool().await;
	Arc::new(ServerConfigRepository::new(pool))
}
