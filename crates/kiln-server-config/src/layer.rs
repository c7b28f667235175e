// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration layer for merging from multiple sources.

use serde::Deserialize;

use crate::sections::{DatabaseConfigLayer, EncryptionConfigLayer, LoggingConfigLayer};

/// Server configuration layer - all fields are Option for merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigLayer {
	#[serde(default)]
	pub database: Option<DatabaseConfigLayer>,
	#[serde(default)]
	pub logging: Option<LoggingConfigLayer>,
	#[serde(default)]
	pub encryption: Option<EncryptionConfigLayer>,
}

impl ServerConfigLayer {
	/// Merge another layer into this one. Other layer takes precedence.
	pub fn merge(&mut self, other: ServerConfigLayer) {
		merge_option(
			&mut self.database,
			other.database,
			DatabaseConfigLayer::merge,
		);
		merge_option(&mut self.logging, other.logging, LoggingConfigLayer::merge);
		merge_option(
			&mut self.encryption,
			other.encryption,
			EncryptionConfigLayer::merge,
		);
	}
}

fn merge_option<T, F>(target: &mut Option<T>, source: Option<T>, merge_fn: F)
where
	F: FnOnce(&mut T, T),
{
	match (target.as_mut(), source) {
		(Some(t), Some(s)) => merge_fn(t, s),
		(None, Some(s)) => *target = Some(s),
		_ => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_merge_fills_missing_sections() {
		let mut base = ServerConfigLayer::default();
		base.merge(ServerConfigLayer {
			encryption: Some(EncryptionConfigLayer {
				batch_size: Some(50),
				..Default::default()
			}),
			..Default::default()
		});
		assert_eq!(base.encryption.unwrap().batch_size, Some(50));
	}

	#[test]
	fn test_merge_keeps_base_fields_not_overridden() {
		let mut base = ServerConfigLayer {
			encryption: Some(EncryptionConfigLayer {
				keyset_file: Some("/etc/kiln/keyset.json".into()),
				..Default::default()
			}),
			..Default::default()
		};
		base.merge(ServerConfigLayer {
			encryption: Some(EncryptionConfigLayer {
				disable: Some(true),
				..Default::default()
			}),
			..Default::default()
		});

		let encryption = base.encryption.unwrap();
		assert!(encryption.keyset_file.is_some());
		assert_eq!(encryption.disable, Some(true));
	}
}
