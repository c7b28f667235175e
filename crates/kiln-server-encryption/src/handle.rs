// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared, swappable reference to the active encryption service.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{EncryptionError, EncryptionResult};
use crate::none::NoEncryption;
use crate::service::{seal, EncryptionService, StoredValue};

struct Services {
	current: Arc<dyn EncryptionService>,
	/// Service a rotation is migrating to. Only used to decrypt.
	proposed: Option<Arc<dyn EncryptionService>>,
}

/// Cloneable handle to the active [`EncryptionService`].
///
/// The lock is held only long enough to clone an `Arc`; encryption runs on
/// the cloned service, so a swap never blocks or breaks an in-flight call.
#[derive(Clone)]
pub struct EncryptionHandle {
	inner: Arc<RwLock<Services>>,
}

impl EncryptionHandle {
	pub fn new(service: Arc<dyn EncryptionService>) -> Self {
		Self {
			inner: Arc::new(RwLock::new(Services {
				current: service,
				proposed: None,
			})),
		}
	}

	pub fn disabled() -> Self {
		Self::new(Arc::new(NoEncryption))
	}

	pub fn current(&self) -> Arc<dyn EncryptionService> {
		self.inner.read().current.clone()
	}

	pub fn proposed(&self) -> Option<Arc<dyn EncryptionService>> {
		self.inner.read().proposed.clone()
	}

	pub fn is_enabled(&self) -> bool {
		self.current().algorithm() != NoEncryption::ALGORITHM
	}

	/// Registers the rotation target as a decrypt fallback.
	pub fn propose(&self, service: Arc<dyn EncryptionService>) {
		self.inner.write().proposed = Some(service);
	}

	/// Makes `service` active and clears any proposal. Returns the previous
	/// service.
	pub fn swap(&self, service: Arc<dyn EncryptionService>) -> Arc<dyn EncryptionService> {
		let mut services = self.inner.write();
		services.proposed = None;
		std::mem::replace(&mut services.current, service)
	}

	/// Encrypts `plaintext` into a stored value with the algorithm header.
	pub fn encrypt(&self, plaintext: &str, associated_data: &str) -> EncryptionResult<String> {
		seal(self.current().as_ref(), plaintext, associated_data)
	}

	/// Recovers the plaintext of a stored value.
	///
	/// While encryption is disabled every value is returned unchanged.
	/// Otherwise values without a header are returned unchanged, and headed
	/// values are opened by the active service, then by a proposed rotation
	/// target with the same algorithm.
	pub fn decrypt(&self, stored: &str, associated_data: &str) -> EncryptionResult<String> {
		let candidates = {
			let services = self.inner.read();
			if services.proposed.is_none() && services.current.algorithm() == NoEncryption::ALGORITHM
			{
				return Ok(stored.to_string());
			}
			let mut candidates = vec![services.current.clone()];
			candidates.extend(services.proposed.clone());
			candidates
		};

		let (algorithm, payload) = match StoredValue::parse(stored) {
			StoredValue::Plaintext(value) => return Ok(value.to_string()),
			StoredValue::Encrypted { algorithm, payload } => (algorithm, payload),
		};

		let mut last_error = None;
		for service in candidates.iter().filter(|s| s.algorithm() == algorithm) {
			match service.decrypt(payload, associated_data) {
				Ok(plaintext) => return Ok(plaintext),
				Err(e) => last_error = Some(e),
			}
		}

		Err(last_error.unwrap_or_else(|| {
			EncryptionError::Decryption(format!(
				"value was encrypted with {algorithm}, which is not active"
			))
		}))
	}
}

impl std::fmt::Debug for EncryptionHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let services = self.inner.read();
		f.debug_struct("EncryptionHandle")
			.field("algorithm", &services.current.algorithm())
			.field("proposed", &services.proposed.as_ref().map(|s| s.algorithm()))
			.finish()
	}
}
