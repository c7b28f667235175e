// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background task that rotates to a changed keyset file.
//!
//! The file is polled: each tick hashes its contents and, when the digest
//! changes, loads the keyset and proposes it to the [`EncryptionManager`].
//! Rotations run one at a time inside the task; a failed rotation is logged
//! and the previous service stays active until the file changes again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EncryptionError, EncryptionResult};
use crate::keyset::KeysetEncryption;
use crate::manager::{EncryptionManager, RotationOutcome};

type Fingerprint = [u8; 32];

pub struct KeysetWatcher {
	path: PathBuf,
	cancel: CancellationToken,
	task: JoinHandle<()>,
}

impl KeysetWatcher {
	/// Starts polling `path`. Fails if the file cannot be read now.
	pub async fn start(
		path: PathBuf,
		interval: Duration,
		manager: Arc<EncryptionManager>,
		cancel: CancellationToken,
	) -> EncryptionResult<Self> {
		let initial = fingerprint(&path).await.map_err(|e| {
			EncryptionError::Configuration(format!(
				"cannot watch keyset file {}: {e}",
				path.display()
			))
		})?;

		let task = tokio::spawn(watch(
			path.clone(),
			interval,
			manager,
			cancel.clone(),
			initial,
		));
		info!(
			path = %path.display(),
			interval_secs = interval.as_secs(),
			"watching keyset file for rotation"
		);

		Ok(Self { path, cancel, task })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Stops polling. A rotation already running stops after its current batch.
	pub async fn stop(self) {
		self.cancel.cancel();
		if let Err(e) = self.task.await {
			warn!(error = %e, "keyset watcher task failed");
		}
	}
}

async fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
	let contents = tokio::fs::read(path).await?;
	Ok(Sha256::digest(&contents).into())
}

async fn watch(
	path: PathBuf,
	interval: Duration,
	manager: Arc<EncryptionManager>,
	cancel: CancellationToken,
	mut last: Fingerprint,
) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
	ticker.tick().await;

	loop {
		tokio::select! {
			_ = cancel.cancelled() => {
				debug!("keyset watcher stopped");
				break;
			}
			_ = ticker.tick() => {}
		}

		let current = match fingerprint(&path).await {
			Ok(current) => current,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "failed to read keyset file");
				continue;
			}
		};
		if current == last {
			continue;
		}
		last = current;
		debug!(digest = %hex::encode(&current[..8]), "keyset file changed");

		let service = match KeysetEncryption::from_file(&path) {
			Ok(service) => service,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "ignoring unreadable keyset");
				continue;
			}
		};

		match manager.rotate(Arc::new(service)).await {
			Ok(RotationOutcome::Rotated { from, to }) => {
				info!(from = %from, to = %to, "keyset rotation complete");
			}
			Ok(RotationOutcome::Unchanged) => {
				debug!("keyset primary key unchanged");
			}
			Err(e) if e.is_cancelled() => {
				info!("keyset rotation cancelled by shutdown");
				break;
			}
			Err(e) => {
				error!(error = %e, "keyset rotation failed; previous key remains active");
			}
		}
	}
}
