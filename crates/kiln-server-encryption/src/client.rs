// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Callback protocol for components that keep encrypted data at rest.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::error::{EncryptionError, EncryptionResult};
use crate::handle::EncryptionHandle;
use crate::service::EncryptionService;

/// A component owning data encrypted by the active service.
///
/// Callbacks run sequentially, in registration order, and must be safe to
/// re-run after a partial failure.
#[async_trait]
pub trait EncryptionClient: Send + Sync {
	/// Name used in logs and in [`EncryptionError::Client`].
	fn name(&self) -> &str;

	/// Hands the client the shared handle. Called once per process; a second
	/// call returns [`EncryptionError::ClientAlreadyInitialized`] and keeps
	/// the first handle.
	fn set_encryption_service(&self, handle: EncryptionHandle) -> EncryptionResult<()>;

	/// Encrypt every plaintext record with the active service.
	async fn on_enable_encryption(&self) -> EncryptionResult<()>;

	/// Re-encrypt every record under `new_service`.
	async fn on_migrate_encryption(
		&self,
		new_service: Arc<dyn EncryptionService>,
	) -> EncryptionResult<()>;

	/// Decrypt every record back to plaintext.
	async fn on_disable_encryption(&self) -> EncryptionResult<()>;
}

/// Write-once holder for a client's [`EncryptionHandle`].
#[derive(Debug, Default)]
pub struct HandleSlot {
	handle: OnceLock<EncryptionHandle>,
}

impl HandleSlot {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, client: &str, handle: EncryptionHandle) -> EncryptionResult<()> {
		self.handle
			.set(handle)
			.map_err(|_| EncryptionError::ClientAlreadyInitialized(client.to_string()))
	}

	pub fn get(&self, client: &str) -> EncryptionResult<&EncryptionHandle> {
		self.handle
			.get()
			.ok_or_else(|| EncryptionError::ClientNotInitialized(client.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::aes::AesEncryption;
	use kiln_common_secret::SecretString;

	#[test]
	fn second_set_fails_and_keeps_first() {
		let slot = HandleSlot::new();
		slot.set("secrets", EncryptionHandle::disabled()).unwrap();

		let aes = AesEncryption::new(&SecretString::from("passphrase")).unwrap();
		let err = slot
			.set("secrets", EncryptionHandle::new(Arc::new(aes)))
			.unwrap_err();
		assert!(matches!(err, EncryptionError::ClientAlreadyInitialized(ref name) if name == "secrets"));
		assert!(!slot.get("secrets").unwrap().is_enabled());
	}

	#[test]
	fn get_before_set_fails() {
		assert!(matches!(
			HandleSlot::new().get("secrets"),
			Err(EncryptionError::ClientNotInitialized(_))
		));
	}
}
