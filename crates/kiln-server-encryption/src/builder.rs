// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Startup wiring: backend selection, client registration and the one-time
//! enable / rotate / disable pass.

use std::sync::Arc;

use kiln_server_config::{EncryptionConfig, KeySource};
use kiln_server_db::ServerConfigStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aes::AesEncryption;
use crate::client::EncryptionClient;
use crate::error::{EncryptionError, EncryptionResult};
use crate::handle::EncryptionHandle;
use crate::keyset::KeysetEncryption;
use crate::manager::{EncryptionManager, EncryptionState};
use crate::none::NoEncryption;
use crate::service::EncryptionService;
use crate::watcher::KeysetWatcher;

/// The running encryption subsystem.
pub struct Encryption {
	handle: EncryptionHandle,
	manager: Arc<EncryptionManager>,
	watcher: Option<KeysetWatcher>,
	state: EncryptionState,
}

impl Encryption {
	pub fn handle(&self) -> &EncryptionHandle {
		&self.handle
	}

	pub fn manager(&self) -> &Arc<EncryptionManager> {
		&self.manager
	}

	/// State after the startup pass: `Enabled` or `Disabled`.
	pub fn state(&self) -> EncryptionState {
		self.state
	}

	pub fn is_watching(&self) -> bool {
		self.watcher.is_some()
	}

	pub async fn shutdown(self) {
		if let Some(watcher) = self.watcher {
			watcher.stop().await;
		}
	}
}

pub struct EncryptionBuilder {
	config: EncryptionConfig,
	config_store: Arc<dyn ServerConfigStore>,
	clients: Vec<Arc<dyn EncryptionClient>>,
	cancel: CancellationToken,
}

impl EncryptionBuilder {
	pub fn new(config: EncryptionConfig, config_store: Arc<dyn ServerConfigStore>) -> Self {
		Self {
			config,
			config_store,
			clients: Vec::new(),
			cancel: CancellationToken::new(),
		}
	}

	/// Registers a client; callbacks run in registration order.
	pub fn with_client(mut self, client: Arc<dyn EncryptionClient>) -> Self {
		self.clients.push(client);
		self
	}

	/// Token whose cancellation stops the keyset watcher.
	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	/// Selects the backend and brings stored data in line with the
	/// configuration. Any error returned here should stop the server.
	pub async fn build(self) -> EncryptionResult<Encryption> {
		let service = load_service(&self.config.key_source)?;

		let handle = EncryptionHandle::new(
			service
				.clone()
				.unwrap_or_else(|| Arc::new(NoEncryption) as Arc<dyn EncryptionService>),
		);
		let mut manager = EncryptionManager::new(self.config_store, handle.clone());
		for client in self.clients {
			manager.register_client(client)?;
		}
		let manager = Arc::new(manager);

		let state = match service {
			None => {
				if manager.read_sample().await?.is_some() {
					return Err(EncryptionError::Configuration(
						"encryption was enabled but no key is configured; configure the key that \
						 enabled it, and set disable to decrypt stored data"
							.into(),
					));
				}
				info!("encryption at rest is not configured");
				EncryptionState::Disabled
			}
			Some(_) => reconcile(&manager, self.config.disable).await?,
		};

		let watcher = match (&self.config.key_source, state) {
			(KeySource::KeysetFile(path), EncryptionState::Enabled) => Some(
				KeysetWatcher::start(
					path.clone(),
					self.config.watch_interval,
					manager.clone(),
					self.cancel.child_token(),
				)
				.await?,
			),
			_ => None,
		};

		Ok(Encryption {
			handle,
			manager,
			watcher,
			state,
		})
	}
}

fn load_service(key_source: &KeySource) -> EncryptionResult<Option<Arc<dyn EncryptionService>>> {
	let service: Arc<dyn EncryptionService> = match key_source {
		KeySource::None => return Ok(None),
		KeySource::Passphrase(passphrase) => Arc::new(AesEncryption::new(passphrase)?),
		KeySource::KeysetFile(path) => {
			warn!(
				path = %path.display(),
				"keyset file is not wrapped by a master key; restrict its permissions to the server user"
			);
			Arc::new(KeysetEncryption::from_file(path)?)
		}
	};
	info!(algorithm = service.algorithm(), "loaded encryption key");
	Ok(Some(service))
}

async fn reconcile(manager: &EncryptionManager, disable: bool) -> EncryptionResult<EncryptionState> {
	let state = manager.detect_state().await?;
	info!(?state, disable, "detected encryption state");

	match state {
		EncryptionState::Disabled if disable => {
			manager.handle().swap(Arc::new(NoEncryption)).disable()?;
			info!("encryption stays disabled");
			Ok(EncryptionState::Disabled)
		}
		EncryptionState::Disabled => {
			manager.enable().await?;
			Ok(EncryptionState::Enabled)
		}
		EncryptionState::Enabled if disable => {
			manager.disable().await?;
			Ok(EncryptionState::Disabled)
		}
		EncryptionState::Enabled => Ok(EncryptionState::Enabled),
		EncryptionState::KeyChanged => {
			manager.adopt_rotated_key().await?;
			if disable {
				manager.disable().await?;
				return Ok(EncryptionState::Disabled);
			}
			Ok(EncryptionState::Enabled)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::service::CIPHERTEXT_SAMPLE_KEY;
	use crate::testing::{
		create_config_store, CallLog, ClientCall, CountingConfigStore, KeysetFixture,
		RecordingClient,
	};
	use kiln_common_secret::SecretString;
	use std::time::Duration;

	fn config(key_source: KeySource) -> EncryptionConfig {
		EncryptionConfig {
			key_source,
			watch_interval: Duration::from_millis(20),
			..EncryptionConfig::default()
		}
	}

	fn passphrase(value: &str) -> KeySource {
		KeySource::Passphrase(SecretString::from(value))
	}

	#[tokio::test]
	async fn no_key_and_no_sample_selects_no_encryption() {
		let encryption = EncryptionBuilder::new(config(KeySource::None), create_config_store().await)
			.build()
			.await
			.unwrap();

		assert_eq!(encryption.state(), EncryptionState::Disabled);
		let current = encryption.handle().current();
		assert_eq!(current.algorithm(), NoEncryption::ALGORITHM);
		for value in ["", "plain", "_aes_looks_encrypted"] {
			assert_eq!(current.encrypt(value, "ad").unwrap(), value);
		}
	}

	#[tokio::test]
	async fn no_key_with_sample_refuses_to_start() {
		let store = create_config_store().await;
		EncryptionBuilder::new(config(passphrase("pw")), store.clone())
			.build()
			.await
			.unwrap();

		let err = EncryptionBuilder::new(config(KeySource::None), store)
			.build()
			.await
			.err()
			.unwrap();
		assert!(matches!(err, EncryptionError::Configuration(_)));
		assert!(err.is_fatal());
	}

	#[tokio::test]
	async fn bootstrap_twice_writes_sample_once() {
		let store = Arc::new(CountingConfigStore::new(create_config_store().await));

		for _ in 0..2 {
			let log = CallLog::default();
			let encryption = EncryptionBuilder::new(config(passphrase("pw")), store.clone())
				.with_client(Arc::new(RecordingClient::new("secrets", log)))
				.build()
				.await
				.unwrap();
			assert_eq!(encryption.state(), EncryptionState::Enabled);
		}

		assert_eq!(store.sets(), 1);
	}

	#[tokio::test]
	async fn enable_sample_decrypts_to_key_id() {
		let store = create_config_store().await;
		let encryption = EncryptionBuilder::new(config(passphrase("pw")), store.clone())
			.build()
			.await
			.unwrap();

		let sample = store
			.server_config_get(CIPHERTEXT_SAMPLE_KEY)
			.await
			.unwrap()
			.unwrap();
		let current = encryption.handle().current();
		assert_eq!(
			current
				.decrypt(&sample, crate::service::CIPHERTEXT_SAMPLE_AD)
				.unwrap(),
			current.key_id()
		);
	}

	#[tokio::test]
	async fn wrong_passphrase_is_fatal() {
		let store = create_config_store().await;
		EncryptionBuilder::new(config(passphrase("pw")), store.clone())
			.build()
			.await
			.unwrap();

		let err = EncryptionBuilder::new(config(passphrase("other")), store)
			.build()
			.await
			.err()
			.unwrap();
		assert!(matches!(err, EncryptionError::KeyInvalid(_)));
		assert!(err.is_fatal());
	}

	#[tokio::test]
	async fn disable_flag_decrypts_and_removes_sample() {
		let store = create_config_store().await;
		EncryptionBuilder::new(config(passphrase("pw")), store.clone())
			.build()
			.await
			.unwrap();

		let log = CallLog::default();
		let mut cfg = config(passphrase("pw"));
		cfg.disable = true;
		let encryption = EncryptionBuilder::new(cfg, store.clone())
			.with_client(Arc::new(RecordingClient::new("secrets", log.clone())))
			.build()
			.await
			.unwrap();

		assert_eq!(encryption.state(), EncryptionState::Disabled);
		assert!(!encryption.handle().is_enabled());
		assert_eq!(log.lock().clone(), vec![("secrets".to_string(), ClientCall::Disable)]);
		assert!(store
			.server_config_get(CIPHERTEXT_SAMPLE_KEY)
			.await
			.unwrap()
			.is_none());
	}

	#[tokio::test]
	async fn disable_flag_without_prior_enable_keeps_plaintext() {
		let store = create_config_store().await;
		let log = CallLog::default();
		let mut cfg = config(passphrase("pw"));
		cfg.disable = true;
		let encryption = EncryptionBuilder::new(cfg, store.clone())
			.with_client(Arc::new(RecordingClient::new("secrets", log.clone())))
			.build()
			.await
			.unwrap();

		assert_eq!(encryption.state(), EncryptionState::Disabled);
		assert!(!encryption.handle().is_enabled());
		assert!(log.lock().is_empty());
	}

	#[tokio::test]
	async fn rotated_keyset_is_migrated_at_startup_and_watched() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("keyset.json");
		let store = create_config_store().await;
		let a = KeysetFixture::new(1);
		a.write(&path).unwrap();

		let first = EncryptionBuilder::new(config(KeySource::KeysetFile(path.clone())), store.clone())
			.build()
			.await
			.unwrap();
		assert!(first.is_watching());
		first.shutdown().await;

		a.clone().rotate_to(2).write(&path).unwrap();
		let log = CallLog::default();
		let second = EncryptionBuilder::new(config(KeySource::KeysetFile(path)), store)
			.with_client(Arc::new(RecordingClient::new("secrets", log.clone())))
			.build()
			.await
			.unwrap();

		assert_eq!(second.state(), EncryptionState::Enabled);
		assert_eq!(second.handle().current().key_id(), "2");
		assert_eq!(log.lock().clone(), vec![("secrets".to_string(), ClientCall::Migrate)]);
		second.shutdown().await;
	}

	#[tokio::test]
	async fn passphrase_backend_is_not_watched() {
		let encryption = EncryptionBuilder::new(config(passphrase("pw")), create_config_store().await)
			.build()
			.await
			.unwrap();
		assert!(!encryption.is_watching());
	}

	#[tokio::test]
	async fn unreadable_keyset_is_fatal() {
		let dir = tempfile::tempdir().unwrap();
		let err = EncryptionBuilder::new(
			config(KeySource::KeysetFile(dir.path().join("missing.json"))),
			create_config_store().await,
		)
		.build()
		.await
		.err()
		.unwrap();
		assert!(matches!(err, EncryptionError::Keyset(_)));
		assert!(err.is_fatal());
	}

	#[tokio::test]
	async fn client_failure_during_enable_is_fatal() {
		let store = create_config_store().await;
		let err = EncryptionBuilder::new(config(passphrase("pw")), store.clone())
			.with_client(Arc::new(
				RecordingClient::new("secrets", CallLog::default()).failing_on(ClientCall::Enable),
			))
			.build()
			.await
			.err()
			.unwrap();

		assert!(matches!(err, EncryptionError::Client { .. }));
		assert!(err.is_fatal());
		assert!(store
			.server_config_get(CIPHERTEXT_SAMPLE_KEY)
			.await
			.unwrap()
			.is_none());
	}
}
