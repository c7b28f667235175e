// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encryption state machine.
//!
//! The ciphertext sample in the server config store is the single source of
//! truth: it exists exactly when encryption is enabled, and it decrypts to the
//! key id of the service that wrote it. Every transition updates it last, so
//! an interrupted transition is re-run on the next attempt.

use std::sync::Arc;

use kiln_server_db::ServerConfigStore;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::client::EncryptionClient;
use crate::error::{EncryptionError, EncryptionResult};
use crate::handle::EncryptionHandle;
use crate::none::NoEncryption;
use crate::service::{EncryptionService, CIPHERTEXT_SAMPLE_AD, CIPHERTEXT_SAMPLE_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
	/// No ciphertext sample.
	Disabled,
	/// The sample decrypts to the active key id.
	Enabled,
	/// The sample was written under an older primary key of the active keyset.
	KeyChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
	Rotated { from: String, to: String },
	/// The proposed service has the active key id.
	Unchanged,
}

pub struct EncryptionManager {
	config_store: Arc<dyn ServerConfigStore>,
	handle: EncryptionHandle,
	clients: Vec<Arc<dyn EncryptionClient>>,
	transition: Mutex<()>,
}

impl EncryptionManager {
	pub fn new(config_store: Arc<dyn ServerConfigStore>, handle: EncryptionHandle) -> Self {
		Self {
			config_store,
			handle,
			clients: Vec::new(),
			transition: Mutex::new(()),
		}
	}

	/// Gives `client` the shared handle and appends it to the callback list.
	pub fn register_client(&mut self, client: Arc<dyn EncryptionClient>) -> EncryptionResult<()> {
		client.set_encryption_service(self.handle.clone())?;
		debug!(client = client.name(), "registered encryption client");
		self.clients.push(client);
		Ok(())
	}

	pub fn handle(&self) -> &EncryptionHandle {
		&self.handle
	}

	pub async fn read_sample(&self) -> EncryptionResult<Option<String>> {
		Ok(self
			.config_store
			.server_config_get(CIPHERTEXT_SAMPLE_KEY)
			.await?)
	}

	/// Classifies the stored sample against the active service.
	///
	/// A sample the active service cannot decrypt, or one naming a key the
	/// service cannot rotate from, is `KeyInvalid`.
	#[instrument(skip(self))]
	pub async fn detect_state(&self) -> EncryptionResult<EncryptionState> {
		let Some(sample) = self.read_sample().await? else {
			return Ok(EncryptionState::Disabled);
		};

		let current = self.handle.current();
		let recorded = current
			.decrypt(&sample, CIPHERTEXT_SAMPLE_AD)
			.map_err(|e| {
				EncryptionError::KeyInvalid(format!(
					"ciphertext sample cannot be decrypted with the configured key: {e}"
				))
			})?;

		match current.verify_key_id(&recorded) {
			Ok(()) => Ok(EncryptionState::Enabled),
			Err(EncryptionError::KeyRotated(reason)) if current.supports_rotation() => {
				info!(%reason, "encryption key changed since last start");
				Ok(EncryptionState::KeyChanged)
			}
			Err(EncryptionError::KeyRotated(reason)) => Err(EncryptionError::KeyInvalid(reason)),
			Err(e) => Err(e),
		}
	}

	/// Encrypts every client's data with the active service, then writes the
	/// sample.
	#[instrument(skip(self))]
	pub async fn enable(&self) -> EncryptionResult<()> {
		let _guard = self.transition.lock().await;
		let current = self.handle.current();
		if current.algorithm() == NoEncryption::ALGORITHM {
			return Err(EncryptionError::Configuration(
				"cannot enable encryption without a key".into(),
			));
		}

		info!(algorithm = current.algorithm(), "enabling encryption");
		for client in &self.clients {
			client
				.on_enable_encryption()
				.await
				.map_err(|e| EncryptionError::client(client.name(), e))?;
			debug!(client = client.name(), "client data encrypted");
		}

		self.write_sample(current.as_ref()).await?;
		info!(algorithm = current.algorithm(), "encryption enabled");
		Ok(())
	}

	/// Decrypts every client's data, removes the sample and switches the
	/// handle to [`NoEncryption`].
	#[instrument(skip(self))]
	pub async fn disable(&self) -> EncryptionResult<()> {
		let _guard = self.transition.lock().await;

		info!("disabling encryption");
		for client in &self.clients {
			client
				.on_disable_encryption()
				.await
				.map_err(|e| EncryptionError::client(client.name(), e))?;
			debug!(client = client.name(), "client data decrypted");
		}

		self.config_store
			.server_config_delete(CIPHERTEXT_SAMPLE_KEY)
			.await?;
		let previous = self.handle.swap(Arc::new(NoEncryption));
		previous.disable()?;
		info!("encryption disabled");
		Ok(())
	}

	/// Migrates every client to `new_service` and makes it active.
	///
	/// Overlapping calls fail with `RotationInProgress`. On failure the
	/// previous service stays active and `new_service` remains registered as
	/// a decrypt fallback for rows that were already migrated.
	#[instrument(skip(self, new_service), fields(to = new_service.key_id()))]
	pub async fn rotate(
		&self,
		new_service: Arc<dyn EncryptionService>,
	) -> EncryptionResult<RotationOutcome> {
		let _guard = self
			.transition
			.try_lock()
			.map_err(|_| EncryptionError::RotationInProgress)?;

		self_test(new_service.as_ref())?;

		let current = self.handle.current();
		if current.algorithm() == NoEncryption::ALGORITHM {
			return Err(EncryptionError::Configuration(
				"cannot rotate while encryption is disabled".into(),
			));
		}
		if current.key_id() == new_service.key_id() {
			debug!("primary key unchanged; nothing to rotate");
			return Ok(RotationOutcome::Unchanged);
		}

		let from = current.key_id().to_string();
		let to = new_service.key_id().to_string();
		self.migrate(new_service).await?;
		Ok(RotationOutcome::Rotated { from, to })
	}

	/// Completes a rotation detected at startup: the active keyset already has
	/// the new primary, but client data and the sample are still under an
	/// older key.
	#[instrument(skip(self))]
	pub async fn adopt_rotated_key(&self) -> EncryptionResult<()> {
		let _guard = self.transition.lock().await;
		let current = self.handle.current();
		self_test(current.as_ref())?;
		self.migrate(current).await
	}

	async fn migrate(&self, new_service: Arc<dyn EncryptionService>) -> EncryptionResult<()> {
		info!(to = new_service.key_id(), "rotating encryption key");
		self.handle.propose(new_service.clone());

		for client in &self.clients {
			client
				.on_migrate_encryption(new_service.clone())
				.await
				.map_err(|e| EncryptionError::client(client.name(), e))?;
			debug!(client = client.name(), "client data migrated");
		}

		self.write_sample(new_service.as_ref()).await?;
		self.handle.swap(new_service.clone());
		info!(key_id = new_service.key_id(), "encryption key rotated");
		Ok(())
	}

	async fn write_sample(&self, service: &dyn EncryptionService) -> EncryptionResult<()> {
		let sample = service.encrypt(service.key_id(), CIPHERTEXT_SAMPLE_AD)?;
		self.config_store
			.server_config_set(CIPHERTEXT_SAMPLE_KEY, &sample)
			.await?;
		Ok(())
	}
}

fn self_test(service: &dyn EncryptionService) -> EncryptionResult<()> {
	let sealed = service.encrypt(service.key_id(), CIPHERTEXT_SAMPLE_AD)?;
	let opened = service.decrypt(&sealed, CIPHERTEXT_SAMPLE_AD)?;
	if opened != service.key_id() {
		return Err(EncryptionError::Encryption(
			"self test returned a different value".into(),
		));
	}
	Ok(())
}
