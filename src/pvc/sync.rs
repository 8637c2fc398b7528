// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Copies one PVC's data from the source cluster to the destination cluster.
//!
//! The destination side runs rsync in a temp pod that mounts the destination
//! PVC and a freshly minted key. The source side is the agent running on the
//! node that hosts the source volume, which serves the kubelet's mount of
//! that volume over SSH once the temp key is in its authorized keys.

use crate::config::Config;
use crate::constants::{defaults, labels};
use crate::error::{DrSyncError, Result};
use crate::kubernetes::ClusterConnection;
use crate::pvc::locator::{LocateStrategy, PvcNodeLocator};
use crate::pvc::temp_pod::{TempPodLease, TempPodManager, TempPodSpec, SYNC_CONTAINER};
use crate::remote::{
    EndpointRole, ExecRequest, ExecTransport, KubeExecTransport, RemoteExecutor, TracingObserver,
};
use crate::ssh::{temp_secret_name, KeyManager};
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Settings for PVC data transfer, taken from the controller config
#[derive(Clone, Debug)]
pub struct PvcSyncSettings {
    pub agent_namespace: String,
    pub ssh_port: u16,
    pub key_propagation_delay: Duration,
    pub exec_max_retries: u32,
    pub exec_backoff: Duration,
    pub temp_pod_image: String,
    pub ready_timeout: Duration,
    pub key_rotation: chrono::Duration,
    pub key_bits: usize,
}

impl PvcSyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_namespace: config.agent_namespace.clone(),
            ssh_port: config.agent_ssh_port,
            key_propagation_delay: config.key_propagation_delay,
            exec_max_retries: config.exec_max_retries,
            exec_backoff: config.exec_backoff,
            temp_pod_image: config.temp_pod_image.clone(),
            ready_timeout: config.temp_pod_ready_timeout,
            key_rotation: config.key_rotation,
            key_bits: config.key_bits,
        }
    }
}

/// Outcome of one PVC copy
#[derive(Clone, Debug)]
pub struct PvcSyncReport {
    pub pvc: String,
    pub source_node: String,
    pub strategy: LocateStrategy,
    pub attempts: u32,
}

/// Everything a transfer created that has to be undone afterwards
#[derive(Default)]
struct Acquired {
    source_lease: Option<TempPodLease>,
    destination_lease: Option<TempPodLease>,
    authorized_key: Option<String>,
    temp_key: Option<(String, String)>,
}

pub struct PvcDataSyncer {
    source: ClusterConnection,
    locator: PvcNodeLocator,
    source_pods: Arc<TempPodManager>,
    destination_pods: Arc<TempPodManager>,
    source_keys: KeyManager,
    destination_keys: KeyManager,
    executor: RemoteExecutor,
    settings: PvcSyncSettings,
}

impl PvcDataSyncer {
    pub fn new(source: ClusterConnection, destination: ClusterConnection, settings: PvcSyncSettings) -> Self {
        Self::with_transport(source, destination, settings, Arc::new(KubeExecTransport))
    }

    pub fn with_transport(
        source: ClusterConnection,
        destination: ClusterConnection,
        settings: PvcSyncSettings,
        transport: Arc<dyn ExecTransport>,
    ) -> Self {
        let temp_pods = |conn: &ClusterConnection| {
            Arc::new(TempPodManager::new(
                conn.client.clone(),
                settings.temp_pod_image.clone(),
                settings.ready_timeout,
            ))
        };
        let source_pods = temp_pods(&source);
        let destination_pods = temp_pods(&destination);

        Self {
            locator: PvcNodeLocator::new(source.client.clone(), source_pods.clone()),
            source_keys: KeyManager::new(source.client.clone(), settings.key_rotation, settings.key_bits),
            destination_keys: KeyManager::new(
                destination.client.clone(),
                settings.key_rotation,
                settings.key_bits,
            ),
            executor: RemoteExecutor::with_transport(destination.clone(), transport)
                .with_endpoints(source.clone(), destination),
            source_pods,
            destination_pods,
            source,
            settings,
        }
    }

    /// Copy the data of `pvc` from `source_namespace` into the PVC of the same
    /// name in `destination_namespace`. Everything created along the way is
    /// removed afterwards, whether or not the copy succeeded.
    #[instrument(skip(self, cancel))]
    pub async fn sync_pvc(
        &self,
        source_namespace: &str,
        destination_namespace: &str,
        pvc: &str,
        cancel: &CancellationToken,
    ) -> Result<PvcSyncReport> {
        let operation = format!("{}-{:08x}", pvc.to_lowercase(), rand::random::<u32>());
        let mut acquired = Acquired::default();

        let result = self
            .transfer(
                source_namespace,
                destination_namespace,
                pvc,
                &operation,
                &mut acquired,
                cancel,
            )
            .await;

        self.release(acquired).await;
        result
    }

    async fn transfer(
        &self,
        source_namespace: &str,
        destination_namespace: &str,
        pvc: &str,
        operation: &str,
        acquired: &mut Acquired,
        cancel: &CancellationToken,
    ) -> Result<PvcSyncReport> {
        let location = self.locator.locate(source_namespace, pvc, cancel).await?;

        let pod_uid = match &location.consumer {
            Some(consumer) => consumer.uid.clone(),
            None => {
                let lease = self
                    .source_pods
                    .ensure_pvc_reachable(source_namespace, pvc, Some(&location.node), cancel)
                    .await?;
                let uid = lease.uid.clone();
                acquired.source_lease = Some(lease);
                uid
            }
        };

        let agent_ip = self.agent_address(&location.node).await?;
        let volume_path = self.volume_path(&pod_uid, &location.volume).await?;

        let pair = self
            .destination_keys
            .ensure_temp_key_pair(destination_namespace, operation)
            .await?;
        acquired.temp_key = Some((destination_namespace.to_string(), operation.to_string()));

        self.source_keys
            .add_authorized_key(&self.settings.agent_namespace, &pair.public_key)
            .await?;
        acquired.authorized_key = Some(pair.public_key.clone());

        debug!(
            "Waiting {:?} for agents to pick up the new key",
            self.settings.key_propagation_delay
        );
        tokio::select! {
            _ = tokio::time::sleep(self.settings.key_propagation_delay) => {}
            _ = cancel.cancelled() => {
                return Err(DrSyncError::Cancelled(format!("PVC sync of {}", pvc)));
            }
        }

        let spec = TempPodSpec::for_pvc(destination_namespace, pvc)
            .with_key_secret(temp_secret_name(operation));
        let lease = self.destination_pods.lease(spec, cancel).await?;
        let pod = lease.name.clone();
        acquired.destination_lease = Some(lease);

        let request = ExecRequest::new(
            destination_namespace,
            pod,
            rsync_command(self.settings.ssh_port, &agent_ip, &volume_path),
        )
        .container(SYNC_CONTAINER)
        .retries(self.settings.exec_max_retries, self.settings.exec_backoff)
        .endpoint(EndpointRole::Destination);

        let observer = TracingObserver {
            label: format!("rsync {}", pvc),
        };
        let result = self
            .executor
            .execute_command(&request, &observer, cancel)
            .await?;

        info!(
            "Copied PVC {} from node {} in {} attempt(s)",
            pvc, location.node, result.attempts
        );
        Ok(PvcSyncReport {
            pvc: pvc.to_string(),
            source_node: location.node,
            strategy: location.strategy,
            attempts: result.attempts,
        })
    }

    /// Undo whatever a transfer acquired. Failures are logged only, so they
    /// never replace the transfer's own error.
    async fn release(&self, acquired: Acquired) {
        if let Some(lease) = acquired.destination_lease {
            if let Err(e) = lease.release().await {
                warn!("Failed to delete destination temp pod: {}", e);
            }
        }
        if let Some(lease) = acquired.source_lease {
            if let Err(e) = lease.release().await {
                warn!("Failed to delete source temp pod: {}", e);
            }
        }
        if let Some(public_key) = acquired.authorized_key {
            if let Err(e) = self
                .source_keys
                .remove_authorized_key(&self.settings.agent_namespace, &public_key)
                .await
            {
                warn!("Failed to remove temporary authorized key: {}", e);
            }
        }
        if let Some((namespace, name)) = acquired.temp_key {
            if let Err(e) = self.destination_keys.delete_temp_key_pair(&namespace, &name).await {
                warn!("Failed to delete temporary key {}/{}: {}", namespace, name, e);
            }
        }
    }

    /// Pod IP of the running agent on `node`
    async fn agent_address(&self, node: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.source.client.clone(), &self.settings.agent_namespace);
        pods.list(&ListParams::default().labels(labels::AGENT_SELECTOR))
            .await?
            .items
            .into_iter()
            .filter(|pod| pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node))
            .filter(|pod| {
                pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            })
            .find_map(|pod| pod.status.and_then(|s| s.pod_ip))
            .ok_or_else(|| {
                DrSyncError::NotFound(format!(
                    "no running agent on node {} in namespace {}",
                    node, self.settings.agent_namespace
                ))
            })
    }

    async fn volume_path(&self, pod_uid: &str, volume: &str) -> Result<String> {
        let volumes: Api<PersistentVolume> = Api::all(self.source.client.clone());
        let pv = volumes
            .get_opt(volume)
            .await?
            .ok_or_else(|| DrSyncError::NotFound(format!("PersistentVolume {}", volume)))?;
        Ok(kubelet_volume_path(pod_uid, &pv))
    }

    /// Remove every temp pod and temporary key still held by this syncer
    pub async fn shutdown_cleanup(&self) {
        let pods = self.source_pods.shutdown_cleanup().await
            + self.destination_pods.shutdown_cleanup().await;
        let keys = self.destination_keys.cleanup_temp_keys().await;
        if pods + keys > 0 {
            info!("Removed {} temp pod(s) and {} temporary key(s)", pods, keys);
        }
    }
}

/// Where the kubelet mounts a volume for a pod
pub fn kubelet_volume_path(pod_uid: &str, pv: &PersistentVolume) -> String {
    let name = pv.name_any();
    let spec = pv.spec.as_ref();
    let base = format!("{}/{}/volumes", defaults::KUBELET_PODS_DIR, pod_uid);

    if spec.is_some_and(|s| s.local.is_some()) {
        format!("{}/kubernetes.io~local-volume/{}", base, name)
    } else if spec.is_some_and(|s| s.nfs.is_some()) {
        format!("{}/kubernetes.io~nfs/{}", base, name)
    } else {
        format!("{}/kubernetes.io~csi/{}/mount", base, name)
    }
}

/// rsync pulling the agent's view of the volume into the temp pod's mount
pub fn rsync_command(port: u16, agent_ip: &str, volume_path: &str) -> Vec<String> {
    let ssh = format!(
        "ssh -p {} -i {}/id_rsa -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
        port,
        defaults::TEMP_KEY_MOUNT_PATH
    );
    vec![
        "rsync".to_string(),
        "-aAXH".to_string(),
        "--delete".to_string(),
        "--numeric-ids".to_string(),
        "-e".to_string(),
        ssh,
        format!("root@{}:{}/", agent_ip, volume_path.trim_end_matches('/')),
        format!("{}/", defaults::TEMP_POD_MOUNT_PATH),
    ]
}
