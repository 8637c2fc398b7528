// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Materializes the agent's mounted authorized keys into the file sshd reads.

use crate::error::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polls a projected secret file and copies it to a local path whenever its
/// modification time advances
pub struct SecretWatcher {
    source: PathBuf,
    target: PathBuf,
    interval: Duration,
    last_modified: Option<SystemTime>,
}

impl SecretWatcher {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            interval,
            last_modified: None,
        }
    }

    /// Copy the source when it changed since the last copy. Returns whether a
    /// copy happened. A missing source is not an error; the secret may not be
    /// projected yet.
    pub async fn sync_once(&mut self) -> Result<bool> {
        let metadata = match tokio::fs::metadata(&self.source).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not present yet", self.source.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let modified = metadata.modified()?;
        if self.last_modified.is_some_and(|seen| modified <= seen) {
            return Ok(false);
        }

        let contents = tokio::fs::read(&self.source).await?;
        materialize(&self.target, &contents).await?;
        self.last_modified = Some(modified);

        info!(
            "Updated {} from {} ({} bytes)",
            self.target.display(),
            self.source.display(),
            contents.len()
        );
        Ok(true)
    }

    /// Poll until cancelled. Failed polls are logged and retried on the next tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Secret watcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!("Failed to sync {}: {}", self.target.display(), e);
                    }
                }
            }
        }
    }
}

/// Write `contents` to `target` atomically with mode 0600, creating the parent
/// directory with mode 0700
async fn materialize(target: &Path, contents: &[u8]) -> Result<()> {
    if let Some(dir) = target.parent() {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .await?;
    }

    let staging = target.with_extension("tmp");
    tokio::fs::write(&staging, contents).await?;
    tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600)).await?;
    tokio::fs::rename(&staging, target).await?;
    Ok(())
}
