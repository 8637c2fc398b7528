// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The agent's SSH endpoint: a foreground sshd serving rsync.

use crate::config::AgentConfig;
use crate::error::{DrSyncError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub struct SshServer {
    sshd_path: PathBuf,
    port: u16,
    authorized_keys_path: PathBuf,
}

impl SshServer {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            sshd_path: config.sshd_path.clone(),
            port: config.ssh_port,
            authorized_keys_path: config.authorized_keys_path.clone(),
        }
    }

    /// Arguments for a foreground sshd that only accepts keys from the
    /// materialized authorized keys file
    pub fn args(&self) -> Vec<String> {
        vec![
            "-D".to_string(),
            "-e".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("AuthorizedKeysFile {}", self.authorized_keys_path.display()),
            "-o".to_string(),
            "PasswordAuthentication no".to_string(),
            "-o".to_string(),
            "PermitRootLogin prohibit-password".to_string(),
        ]
    }

    /// Generate missing host keys, then spawn sshd. The child is killed when
    /// its handle is dropped.
    pub async fn start(&self) -> Result<Child> {
        let keygen = Command::new("ssh-keygen")
            .arg("-A")
            .output()
            .await
            .map_err(|e| DrSyncError::Configuration(format!("Failed to run ssh-keygen: {}", e)))?;
        if !keygen.status.success() {
            return Err(DrSyncError::Configuration(format!(
                "ssh-keygen -A failed: {}",
                String::from_utf8_lossy(&keygen.stderr).trim()
            )));
        }
        debug!("Host keys present");

        let child = Command::new(&self.sshd_path)
            .args(self.args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DrSyncError::Configuration(format!(
                    "Failed to start {}: {}",
                    self.sshd_path.display(),
                    e
                ))
            })?;

        info!("sshd listening on port {}", self.port);
        Ok(child)
    }
}
