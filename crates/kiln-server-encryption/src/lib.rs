// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encryption at rest for Kiln server data.
//!
//! # Overview
//!
//! - [`EncryptionService`]: string AEAD with three backends:
//!   [`AesEncryption`] (passphrase), [`KeysetEncryption`] (keyset file with
//!   rotation) and [`NoEncryption`] (identity).
//! - [`EncryptionHandle`]: the shared, swappable reference to the active
//!   service handed to every consumer.
//! - [`EncryptionClient`]: implemented by anything that stores encrypted data,
//!   so it can be told to encrypt, migrate or decrypt all of it.
//! - [`EncryptionManager`]: the enable / rotate / disable state machine, keyed
//!   on a ciphertext sample in the server config store.
//! - [`KeysetWatcher`]: rotates when the keyset file changes.
//! - [`EncryptionBuilder`]: startup wiring.
//!
//! # Stored values
//!
//! Encrypted values are stored as `_<algorithm>_<payload>`; values without a
//! header are legacy plaintext. See [`StoredValue`].

pub mod aes;
pub mod builder;
pub mod client;
pub mod error;
pub mod handle;
pub mod keyset;
pub mod manager;
pub mod none;
pub mod service;
pub mod testing;
pub mod watcher;

pub use aes::AesEncryption;
pub use builder::{Encryption, EncryptionBuilder};
pub use client::{EncryptionClient, HandleSlot};
pub use error::{EncryptionError, EncryptionResult};
pub use handle::EncryptionHandle;
pub use keyset::KeysetEncryption;
pub use manager::{EncryptionManager, EncryptionState, RotationOutcome};
pub use none::NoEncryption;
pub use service::{
	seal, EncryptionService, StoredValue, CIPHERTEXT_SAMPLE_AD, CIPHERTEXT_SAMPLE_KEY,
};
pub use watcher::KeysetWatcher;
