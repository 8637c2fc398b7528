// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-node agent: serves the node's volumes over SSH and, when elected,
//! keeps key material fresh and sweeps leaked temp pods.

use crate::agent::leader::{self, LeaderElectionConfig, LeaderStatus};
use crate::agent::sshd::SshServer;
use crate::config::AgentConfig;
use crate::constants::{agent_duties, defaults};
use crate::pvc::TempPodManager;
use crate::ssh::{KeyManager, SecretWatcher};
use anyhow::{anyhow, Context};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct AgentDaemon {
    client: Client,
    config: AgentConfig,
}

/// Singleton work done only by the elected agent
struct LeaderDuties {
    namespace: String,
    keys: KeyManager,
    temp_pods: Arc<TempPodManager>,
}

impl LeaderDuties {
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn perform(&self) {
        match self.keys.ensure_agent_key_pair(&self.namespace).await {
            Ok(pair) => debug!("Agent key pair current: {}", pair.fingerprint),
            Err(e) => warn!("Failed to ensure agent key pair: {}", e),
        }

        let max_age = chrono::Duration::minutes(agent_duties::STALE_TEMP_POD_MINUTES);
        match self.temp_pods.cleanup_stale_temp_pods(max_age).await {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale temp pod(s)", n),
            Err(e) => warn!("Failed to sweep stale temp pods: {}", e),
        }
    }
}

impl AgentDaemon {
    pub fn new(client: Client, config: AgentConfig) -> Self {
        Self { client, config }
    }

    /// Run until `shutdown` fires or sshd dies. Cleanup after either is
    /// bounded by the configured shutdown timeout.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let config = &self.config;
        info!(
            "Starting dr-syncer agent on node {} (namespace {})",
            config.node_name, config.namespace
        );

        // Fixed order: SSH endpoint, then temp pods, then keys
        let mut sshd = SshServer::new(config)
            .start()
            .await
            .context("Failed to start SSH server")?;
        let temp_pods = Arc::new(TempPodManager::new(
            self.client.clone(),
            defaults::TEMP_POD_IMAGE,
            Duration::from_secs(300),
        ));
        let keys = KeyManager::new(self.client.clone(), config.key_rotation, config.key_bits);

        let cancel = shutdown.child_token();
        let mut tasks = Vec::new();

        let watcher = SecretWatcher::new(
            config.keys_mount_path.clone(),
            config.authorized_keys_path.clone(),
            config.secret_poll_interval,
        );
        tasks.push(tokio::spawn(watcher.run(cancel.clone())));

        let status = LeaderStatus::new();
        let election = LeaderElectionConfig::new(
            config.lease_name.clone(),
            config.namespace.clone(),
            config.pod_name.clone(),
        );
        if config.leader_election {
            tasks.push(tokio::spawn(leader::run(
                self.client.clone(),
                election.clone(),
                status.clone(),
                cancel.clone(),
            )));
        } else {
            info!("Leader election disabled, performing singleton duties");
            status.force_leader();
        }

        let duties = LeaderDuties {
            namespace: config.namespace.clone(),
            keys,
            temp_pods: temp_pods.clone(),
        };
        tasks.push(tokio::spawn(run_duties(
            duties,
            status,
            Duration::from_secs(agent_duties::INTERVAL_SECS),
            cancel.clone(),
        )));

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                Ok(())
            }
            exit = sshd.wait() => Err(anyhow!("sshd exited unexpectedly: {:?}", exit)),
        };

        cancel.cancel();
        let cleanup = async {
            if config.leader_election {
                leader::step_down(&self.client, &election).await;
            }
            if let Err(e) = sshd.kill().await {
                debug!("sshd already gone: {}", e);
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Agent task ended abnormally: {}", e);
                }
            }
            let removed = temp_pods.shutdown_cleanup().await;
            if removed > 0 {
                info!("Removed {} temp pod(s) on shutdown", removed);
            }
        };
        if tokio::time::timeout(config.shutdown_timeout, cleanup).await.is_err() {
            warn!("Agent cleanup did not finish within {:?}", config.shutdown_timeout);
        }

        result
    }
}

async fn run_duties(duties: LeaderDuties, status: LeaderStatus, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if status.is_leader() {
                    duties.perform().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{annotations, labels, secrets};
    use crate::test_utils::FakeApiServer;
    use serde_json::json;

    const PODS: &str = "/api/v1/namespaces/app/pods";

    fn duties(server: &FakeApiServer) -> LeaderDuties {
        let client = server.client();
        LeaderDuties {
            namespace: "dr-syncer".to_string(),
            keys: KeyManager::new(client.clone(), chrono::Duration::hours(24), 1024),
            temp_pods: Arc::new(TempPodManager::new(client, "rsync", Duration::from_secs(5))),
        }
    }

    fn temp_pod(name: &str, age: chrono::Duration) -> serde_json::Value {
        let created = (chrono::Utc::now() - age).to_rfc3339();
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "app",
                "labels": { (labels::TEMP_POD): "true" },
                "annotations": { (annotations::CREATED_AT): created }
            }
        })
    }

    #[tokio::test]
    async fn test_duties_create_agent_keys_and_sweep_stale_pods() {
        let server = FakeApiServer::new();
        server.insert(PODS, temp_pod("old", chrono::Duration::hours(3)));
        server.insert(PODS, temp_pod("fresh", chrono::Duration::minutes(1)));

        duties(&server).perform().await;

        let secret = server
            .get("/api/v1/namespaces/dr-syncer/secrets", secrets::AGENT_SECRET_NAME)
            .unwrap();
        assert!(secret["data"][secrets::AUTHORIZED_KEYS].is_string());
        assert!(server.get(PODS, "old").is_none());
        assert!(server.get(PODS, "fresh").is_some());
    }

    #[tokio::test]
    async fn test_duties_skipped_when_not_leader() {
        let server = FakeApiServer::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_duties(
            duties(&server),
            LeaderStatus::new(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(server.requests().len(), 0);
    }
}
