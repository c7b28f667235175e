// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Pipeline secrets for the Kiln server.
//!
//! - [`EncryptedSecretStore`] decorates any [`SecretStore`] so values are
//!   encrypted at rest, and takes part in enable / rotate / disable as an
//!   [`EncryptionClient`](kiln_server_encryption::EncryptionClient).
//! - [`SecretService`] validates input and resolves the secrets a pipeline
//!   sees across global, org and repo scopes.

pub mod error;
pub mod service;
pub mod store;
pub mod validation;

pub use error::{SecretsError, SecretsResult};
pub use kiln_server_db::{Secret, SecretScope, SecretStore};
pub use service::{CreateSecretInput, SecretService, UpdateSecretInput};
pub use store::{EncryptedSecretStore, CLIENT_NAME};
