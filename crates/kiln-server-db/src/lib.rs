// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! # kiln-server-db
//!
//! Persistence layer for the Kiln server using SQLite via sqlx.
//!
//! ## Repository Pattern
//!
//! Each domain has two components:
//! - **`*Store` trait**: the interface consumed by higher layers (`SecretStore`,
//!   `ServerConfigStore`), so those layers can be decorated or faked in tests
//! - **`*Repository` struct**: concrete implementation holding a `SqlitePool`
//!
//! ## Error Handling
//!
//! | Variant | When to use |
//! |---------|-------------|
//! | `NotFound` | An update/delete targeted a row that does not exist |
//! | `Conflict` | Unique constraint violation |
//! | `Sqlx` | Unexpected database errors, propagated via `?` |
//! | `Internal` | Invalid stored data (e.g. unparseable timestamp) |
//! | `Encryption` | A decorating store failed to encrypt or decrypt a value |
//!
//! Lookups where absence is normal return `Result<Option<T>>`.

pub mod error;
pub mod pool;
pub mod secret;
pub mod server_config;
pub mod testing;

pub use error::{DbError, Result};
pub use pool::{create_pool, run_migrations};
pub use secret::{Secret, SecretRepository, SecretScope, SecretStore};
pub use server_config::{ServerConfigRepository, ServerConfigStore};
