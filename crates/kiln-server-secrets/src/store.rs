// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encrypting decorator over a [`SecretStore`].
//!
//! Values are sealed with the secret's id as associated data, so a value
//! copied onto another row fails to decrypt. Callers always see plaintext.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_server_db::{DbError, Secret, SecretScope, SecretStore};
use kiln_server_encryption::{
	seal, EncryptionClient, EncryptionError, EncryptionHandle, EncryptionResult,
	EncryptionService, HandleSlot, StoredValue,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Name this client reports to the encryption manager.
pub const CLIENT_NAME: &str = "secrets";

pub struct EncryptedSecretStore {
	inner: Arc<dyn SecretStore>,
	slot: HandleSlot,
	batch_size: u32,
	cancel: CancellationToken,
}

impl EncryptedSecretStore {
	/// `batch_size` bounds the rows loaded per page during bulk transforms.
	pub fn new(inner: Arc<dyn SecretStore>, batch_size: usize) -> Self {
		Self {
			inner,
			slot: HandleSlot::new(),
			batch_size: u32::try_from(batch_size).unwrap_or(u32::MAX).max(1),
			cancel: CancellationToken::new(),
		}
	}

	/// Bulk transforms stop between pages once `cancel` fires.
	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	fn handle(&self) -> EncryptionResult<&EncryptionHandle> {
		self.slot.get(CLIENT_NAME)
	}

	fn open(&self, mut secret: Secret) -> kiln_server_db::Result<Secret> {
		let handle = self.handle().map_err(codec_error)?;
		secret.value = handle
			.decrypt(&secret.value, &associated_data(&secret))
			.map_err(|e| codec_error(row_error(&secret, e)))?;
		Ok(secret)
	}

	fn open_all(&self, secrets: Vec<Secret>) -> kiln_server_db::Result<Vec<Secret>> {
		secrets.into_iter().map(|s| self.open(s)).collect()
	}

	/// Pages through every row by id and writes back the values `rewrite`
	/// returns. Rows it leaves alone (`None`) are not written.
	async fn rewrite_all<F>(&self, action: &'static str, mut rewrite: F) -> EncryptionResult<usize>
	where
		F: FnMut(&Secret) -> EncryptionResult<Option<String>> + Send,
	{
		let mut after_id = 0;
		let mut rows = 0;

		loop {
			if self.cancel.is_cancelled() {
				warn!(action, rows, "stopping secret re-encryption on shutdown");
				return Err(EncryptionError::Cancelled);
			}

			let page = self.inner.secret_list_all(after_id, self.batch_size).await?;
			let Some(last) = page.last() else {
				break;
			};
			after_id = last.id;
			let full_page = page.len() == self.batch_size as usize;

			for mut secret in page {
				let Some(value) = rewrite(&secret).map_err(|e| row_error(&secret, e))? else {
					continue;
				};
				secret.value = value;
				self.inner.secret_update(&mut secret).await?;
				rows += 1;
			}

			if !full_page {
				break;
			}
		}

		info!(action, rows, "secrets rewritten");
		Ok(rows)
	}
}

fn associated_data(secret: &Secret) -> String {
	secret.id.to_string()
}

fn row_error(secret: &Secret, e: EncryptionError) -> EncryptionError {
	match e {
		EncryptionError::Encryption(message) => {
			EncryptionError::Encryption(format!("secret {}: {message}", secret.id))
		}
		EncryptionError::Decryption(message) => {
			EncryptionError::Decryption(format!("secret {}: {message}", secret.id))
		}
		other => other,
	}
}

fn codec_error(e: EncryptionError) -> DbError {
	DbError::Encryption(e.to_string())
}

#[async_trait]
impl SecretStore for EncryptedSecretStore {
	async fn secret_find(&self, scope: SecretScope, name: &str) -> kiln_server_db::Result<Option<Secret>> {
		self.inner
			.secret_find(scope, name)
			.await?
			.map(|s| self.open(s))
			.transpose()
	}

	async fn secret_find_by_id(&self, id: i64) -> kiln_server_db::Result<Option<Secret>> {
		self.inner
			.secret_find_by_id(id)
			.await?
			.map(|s| self.open(s))
			.transpose()
	}

	async fn secret_list(&self, scope: SecretScope) -> kiln_server_db::Result<Vec<Secret>> {
		self.open_all(self.inner.secret_list(scope).await?)
	}

	async fn secret_list_for_pipeline(
		&self,
		org_id: i64,
		repo_id: i64,
	) -> kiln_server_db::Result<Vec<Secret>> {
		self.open_all(self.inner.secret_list_for_pipeline(org_id, repo_id).await?)
	}

	async fn secret_list_all(&self, after_id: i64, limit: u32) -> kiln_server_db::Result<Vec<Secret>> {
		self.open_all(self.inner.secret_list_all(after_id, limit).await?)
	}

	/// Inserts with an empty value to obtain the id, then writes the value
	/// sealed under that id. The row is removed if the second write fails.
	#[instrument(skip(self, secret), fields(name = %secret.name))]
	async fn secret_create(&self, secret: &mut Secret) -> kiln_server_db::Result<()> {
		let handle = self.handle().map_err(codec_error)?.clone();
		if !handle.is_enabled() {
			return self.inner.secret_create(secret).await;
		}

		let plaintext = std::mem::take(&mut secret.value);
		if let Err(e) = self.inner.secret_create(secret).await {
			secret.value = plaintext;
			return Err(e);
		}

		let sealed = handle
			.encrypt(&plaintext, &associated_data(secret))
			.map_err(codec_error);
		let stored = match sealed {
			Ok(value) => {
				secret.value = value;
				self.inner.secret_update(secret).await
			}
			Err(e) => Err(e),
		};
		secret.value = plaintext;

		if let Err(e) = stored {
			if let Err(cleanup) = self.inner.secret_delete_by_id(secret.id).await {
				warn!(secret_id = secret.id, error = %cleanup, "failed to remove partially created secret");
			}
			return Err(e);
		}
		Ok(())
	}

	#[instrument(skip(self, secret), fields(secret_id = secret.id))]
	async fn secret_update(&self, secret: &mut Secret) -> kiln_server_db::Result<()> {
		let handle = self.handle().map_err(codec_error)?;
		let sealed = handle
			.encrypt(&secret.value, &associated_data(secret))
			.map_err(codec_error)?;

		let plaintext = std::mem::replace(&mut secret.value, sealed);
		let result = self.inner.secret_update(secret).await;
		secret.value = plaintext;
		result
	}

	async fn secret_delete(&self, scope: SecretScope, name: &str) -> kiln_server_db::Result<()> {
		self.inner.secret_delete(scope, name).await
	}

	async fn secret_delete_by_id(&self, id: i64) -> kiln_server_db::Result<()> {
		self.inner.secret_delete_by_id(id).await
	}
}

#[async_trait]
impl EncryptionClient for EncryptedSecretStore {
	fn name(&self) -> &str {
		CLIENT_NAME
	}

	fn set_encryption_service(&self, handle: EncryptionHandle) -> EncryptionResult<()> {
		self.slot.set(CLIENT_NAME, handle)
	}

	/// Seals every row the active service cannot already open. A legacy
	/// value that only looks sealed is encrypted like any other plaintext.
	async fn on_enable_encryption(&self) -> EncryptionResult<()> {
		let handle = self.handle()?.clone();
		let current = handle.current();
		self.rewrite_all("enable", |secret| {
			let ad = associated_data(secret);
			if StoredValue::parse(&secret.value).is_encrypted() {
				if handle.decrypt(&secret.value, &ad).is_ok() {
					return Ok(None);
				}
				debug!(secret_id = secret.id, "sealing plaintext that resembles ciphertext");
			}
			seal(current.as_ref(), &secret.value, &ad).map(Some)
		})
		.await?;
		Ok(())
	}

	async fn on_migrate_encryption(
		&self,
		new_service: Arc<dyn EncryptionService>,
	) -> EncryptionResult<()> {
		let handle = self.handle()?.clone();
		self.rewrite_all("migrate", |secret| {
			let ad = associated_data(secret);
			let plaintext = match StoredValue::parse(&secret.value) {
				StoredValue::Plaintext(plaintext) => plaintext.to_string(),
				StoredValue::Encrypted { .. } => handle.decrypt(&secret.value, &ad)?,
			};
			seal(new_service.as_ref(), &plaintext, &ad).map(Some)
		})
		.await?;
		Ok(())
	}

	async fn on_disable_encryption(&self) -> EncryptionResult<()> {
		let handle = self.handle()?.clone();
		self.rewrite_all("disable", |secret| match StoredValue::parse(&secret.value) {
			StoredValue::Plaintext(_) => Ok(None),
			StoredValue::Encrypted { .. } => handle
				.decrypt(&secret.value, &associated_data(secret))
				.map(Some),
		})
		.await?;
		Ok(())
	}
}
