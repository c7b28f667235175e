// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sections for kiln-server.

pub mod database;
pub mod encryption;
pub mod logging;

pub use database::{DatabaseConfig, DatabaseConfigLayer};
pub use encryption::{EncryptionConfig, EncryptionConfigLayer, KeySource};
pub use logging::{LoggingConfig, LoggingConfigLayer};
