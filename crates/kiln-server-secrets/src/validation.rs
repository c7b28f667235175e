// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{SecretsError, SecretsResult};

/// Maximum secret name length.
pub const MAX_NAME_LENGTH: usize = 255;

/// Pipeline events a secret can be exposed to.
pub const VALID_EVENTS: &[&str] = &["push", "pull_request", "tag", "deployment", "cron", "manual"];

/// Events used when a secret lists none.
pub const DEFAULT_EVENTS: &[&str] = &["push", "tag", "deployment", "manual"];

pub fn validate_name(name: &str) -> SecretsResult<()> {
	if name.is_empty() {
		return Err(SecretsError::Validation("name must not be empty".into()));
	}
	if name.len() > MAX_NAME_LENGTH {
		return Err(SecretsError::Validation(format!(
			"name must be at most {MAX_NAME_LENGTH} characters"
		)));
	}
	if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
		return Err(SecretsError::Validation(format!(
			"name {name:?} may only contain letters, digits and underscores"
		)));
	}
	Ok(())
}

pub fn validate_value(value: &str) -> SecretsResult<()> {
	if value.is_empty() {
		return Err(SecretsError::Validation("value must not be empty".into()));
	}
	Ok(())
}

/// Checks each event and fills in [`DEFAULT_EVENTS`] for an empty list.
pub fn normalize_events(events: Vec<String>) -> SecretsResult<Vec<String>> {
	if events.is_empty() {
		return Ok(DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect());
	}

	let mut normalized: Vec<String> = Vec::with_capacity(events.len());
	for event in events {
		if !VALID_EVENTS.contains(&event.as_str()) {
			return Err(SecretsError::Validation(format!("unknown event {event:?}")));
		}
		if !normalized.contains(&event) {
			normalized.push(event);
		}
	}
	Ok(normalized)
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn accepts_typical_names() {
		for name in ["DOCKER_PASSWORD", "token", "a1_B2"] {
			validate_name(name).unwrap();
		}
	}

	#[test]
	fn rejects_bad_names() {
		let long = "A".repeat(MAX_NAME_LENGTH + 1);
		for name in ["", "with space", "dash-name", "dot.name", long.as_str()] {
			assert!(validate_name(name).is_err(), "accepted {name:?}");
		}
	}

	#[test]
	fn empty_value_is_rejected() {
		assert!(validate_value("").is_err());
		validate_value("x").unwrap();
	}

	#[test]
	fn empty_events_get_defaults() {
		assert_eq!(
			normalize_events(vec![]).unwrap(),
			vec!["push", "tag", "deployment", "manual"]
		);
	}

	#[test]
	fn unknown_event_is_rejected() {
		assert!(normalize_events(vec!["push".into(), "release".into()]).is_err());
	}

	#[test]
	fn duplicate_events_are_collapsed() {
		assert_eq!(
			normalize_events(vec!["cron".into(), "cron".into()]).unwrap(),
			vec!["cron"]
		);
	}

	proptest! {
		#[test]
		fn prop_valid_names_pass(name in "[A-Za-z0-9_]{1,255}") {
			prop_assert!(validate_name(&name).is_ok());
		}
	}
}
