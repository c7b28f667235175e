// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Scope-aware secret operations with input validation.
//!
//! The service is normally built over an
//! [`EncryptedSecretStore`](crate::EncryptedSecretStore), so everything here
//! sees plaintext values.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_common_secret::SecretString;
use kiln_server_db::{Secret, SecretScope, SecretStore};
use tracing::{info, instrument};

use crate::error::{SecretsError, SecretsResult};
use crate::validation::{normalize_events, validate_name, validate_value};

/// Input for [`SecretService::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateSecretInput {
	pub name: String,
	pub value: SecretString,
	pub images: Vec<String>,
	/// Empty means the default event set.
	pub events: Vec<String>,
}

/// Fields to change in [`SecretService::update`]; `None` keeps the current
/// value.
#[derive(Debug, Clone, Default)]
pub struct UpdateSecretInput {
	pub value: Option<SecretString>,
	pub images: Option<Vec<String>>,
	pub events: Option<Vec<String>>,
}

pub struct SecretService {
	store: Arc<dyn SecretStore>,
}

impl SecretService {
	pub fn new(store: Arc<dyn SecretStore>) -> Self {
		Self { store }
	}

	#[instrument(skip(self), fields(scope = scope.as_str()))]
	pub async fn find(&self, scope: SecretScope, name: &str) -> SecretsResult<Secret> {
		self.store
			.secret_find(scope, name)
			.await?
			.ok_or_else(|| SecretsError::NotFound(name.to_string()))
	}

	pub async fn list(&self, scope: SecretScope) -> SecretsResult<Vec<Secret>> {
		Ok(self.store.secret_list(scope).await?)
	}

	#[instrument(skip(self, input), fields(scope = scope.as_str(), name = %input.name))]
	pub async fn create(&self, scope: SecretScope, input: CreateSecretInput) -> SecretsResult<Secret> {
		validate_name(&input.name)?;
		validate_value(input.value.expose())?;
		let events = normalize_events(input.events)?;

		let mut secret = Secret::new(scope, input.name, input.value.expose().clone());
		secret.images = input.images;
		secret.events = events;
		self.store.secret_create(&mut secret).await?;

		info!(secret_id = secret.id, "created secret");
		Ok(secret)
	}

	#[instrument(skip(self, input), fields(scope = scope.as_str()))]
	pub async fn update(
		&self,
		scope: SecretScope,
		name: &str,
		input: UpdateSecretInput,
	) -> SecretsResult<Secret> {
		let mut secret = self.find(scope, name).await?;

		if let Some(value) = input.value {
			validate_value(value.expose())?;
			secret.value = value.expose().clone();
		}
		if let Some(images) = input.images {
			secret.images = images;
		}
		if let Some(events) = input.events {
			secret.events = normalize_events(events)?;
		}

		self.store.secret_update(&mut secret).await?;
		info!(secret_id = secret.id, "updated secret");
		Ok(secret)
	}

	#[instrument(skip(self), fields(scope = scope.as_str()))]
	pub async fn delete(&self, scope: SecretScope, name: &str) -> SecretsResult<()> {
		self.store.secret_delete(scope, name).await?;
		info!("deleted secret");
		Ok(())
	}

	/// Secrets visible to a pipeline of `repo_id` in `org_id`, one per name:
	/// a repo secret shadows an org secret, which shadows a global one.
	#[instrument(skip(self))]
	pub async fn list_for_pipeline(&self, org_id: i64, repo_id: i64) -> SecretsResult<Vec<Secret>> {
		let mut effective: BTreeMap<String, (u8, Secret)> = BTreeMap::new();

		for secret in self.store.secret_list_for_pipeline(org_id, repo_id).await? {
			let rank = match secret.scope()? {
				SecretScope::Global => 0,
				SecretScope::Org(_) => 1,
				SecretScope::Repo(_) => 2,
			};
			match effective.get(&secret.name) {
				Some((existing, _)) if *existing >= rank => {}
				_ => {
					effective.insert(secret.name.clone(), (rank, secret));
				}
			}
		}

		Ok(effective.into_values().map(|(_, secret)| secret).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use kiln_server_db::testing::create_migrated_test_pool;
	use kiln_server_db::SecretRepository;

	async fn service() -> SecretService {
		SecretService::new(Arc::new(SecretRepository::new(
			create_migrated_test_pool().await,
		)))
	}

	fn input(name: &str, value: &str) -> CreateSecretInput {
		CreateSecretInput {
			name: name.to_string(),
			value: SecretString::from(value),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn create_applies_default_events() {
		let svc = service().await;
		let secret = svc.create(SecretScope::Repo(1), input("TOKEN", "v")).await.unwrap();
		assert_eq!(secret.events, vec!["push", "tag", "deployment", "manual"]);
		assert_eq!(svc.find(SecretScope::Repo(1), "TOKEN").await.unwrap().value, "v");
	}

	#[tokio::test]
	async fn create_validates_input() {
		let svc = service().await;
		assert!(matches!(
			svc.create(SecretScope::Global, input("bad name", "v")).await,
			Err(SecretsError::Validation(_))
		));
		assert!(matches!(
			svc.create(SecretScope::Global, input("EMPTY", "")).await,
			Err(SecretsError::Validation(_))
		));
	}

	#[tokio::test]
	async fn duplicate_is_already_exists() {
		let svc = service().await;
		svc.create(SecretScope::Org(1), input("TOKEN", "a")).await.unwrap();
		assert!(matches!(
			svc.create(SecretScope::Org(1), input("TOKEN", "b")).await,
			Err(SecretsError::AlreadyExists(_))
		));
	}

	#[tokio::test]
	async fn update_changes_only_given_fields() {
		let svc = service().await;
		let mut create = input("TOKEN", "old");
		create.images = vec!["alpine".into()];
		svc.create(SecretScope::Global, create).await.unwrap();

		let updated = svc
			.update(
				SecretScope::Global,
				"TOKEN",
				UpdateSecretInput {
					value: Some(SecretString::from("new")),
					..Default::default()
				},
			)
			.await
			.unwrap();
		assert_eq!(updated.value, "new");
		assert_eq!(updated.images, vec!["alpine"]);

		assert!(matches!(
			svc.update(SecretScope::Global, "MISSING", UpdateSecretInput::default())
				.await,
			Err(SecretsError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn delete_missing_is_not_found() {
		let svc = service().await;
		assert!(matches!(
			svc.delete(SecretScope::Global, "NOPE").await,
			Err(SecretsError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn pipeline_secrets_shadow_by_scope() {
		let svc = service().await;
		svc.create(SecretScope::Global, input("SHARED", "global")).await.unwrap();
		svc.create(SecretScope::Global, input("ONLY_GLOBAL", "g")).await.unwrap();
		svc.create(SecretScope::Org(1), input("SHARED", "org")).await.unwrap();
		svc.create(SecretScope::Org(1), input("ORG_AND_REPO", "org")).await.unwrap();
		svc.create(SecretScope::Repo(5), input("ORG_AND_REPO", "repo")).await.unwrap();
		svc.create(SecretScope::Repo(6), input("SHARED", "other repo")).await.unwrap();

		let effective: Vec<_> = svc
			.list_for_pipeline(1, 5)
			.await
			.unwrap()
			.into_iter()
			.map(|s| (s.name, s.value))
			.collect();
		assert_eq!(
			effective,
			vec![
				("ONLY_GLOBAL".to_string(), "g".to_string()),
				("ORG_AND_REPO".to_string(), "repo".to_string()),
				("SHARED".to_string(), "org".to_string()),
			]
		);
	}
}
