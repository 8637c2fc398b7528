// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Ephemeral pods that mount a PVC so its data can be reached.

use crate::constants::{annotations, defaults, labels, pod_wait, OPERATOR_NAME};
use crate::error::{is_not_found, DrSyncError, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, SecretVolumeSource, Volume,
    VolumeMount,
};
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const MAX_NAME_LEN: usize = 63;
const DATA_VOLUME: &str = "data";
const KEY_VOLUME: &str = "ssh-key";
/// Name of the single container in every temp pod
pub const SYNC_CONTAINER: &str = "sync";

/// What a temp pod mounts and where it runs
#[derive(Clone, Debug, Default)]
pub struct TempPodSpec {
    pub namespace: String,
    pub pvc: String,
    pub node: Option<String>,
    pub image: Option<String>,
    pub command: Option<Vec<String>>,
    /// Secret projected read-only at the temp key mount path
    pub key_secret: Option<String>,
}

impl TempPodSpec {
    pub fn for_pvc(namespace: impl Into<String>, pvc: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pvc: pvc.into(),
            ..Default::default()
        }
    }

    pub fn on_node(mut self, node: Option<&str>) -> Self {
        self.node = node.map(String::from);
        self
    }

    pub fn with_key_secret(mut self, secret: impl Into<String>) -> Self {
        self.key_secret = Some(secret.into());
        self
    }
}

/// Creates, awaits and deletes temp pods, remembering the live ones so they
/// can all be removed on shutdown
pub struct TempPodManager {
    client: Client,
    image: String,
    ready_timeout: Duration,
    live: Mutex<HashSet<(String, String)>>,
    sequence: AtomicU64,
}

impl TempPodManager {
    pub fn new(client: Client, image: impl Into<String>, ready_timeout: Duration) -> Self {
        Self {
            client,
            image: image.into(),
            ready_timeout,
            live: Mutex::new(HashSet::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Number of temp pods created by this manager and not yet deleted
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Create a pod mounting `pvc`, pinned to `node` when given
    pub async fn create_temp_pod_for_pvc(
        &self,
        namespace: &str,
        pvc: &str,
        node: Option<&str>,
        image: Option<&str>,
        command: Option<Vec<String>>,
    ) -> Result<Pod> {
        let spec = TempPodSpec {
            image: image.map(String::from),
            command,
            ..TempPodSpec::for_pvc(namespace, pvc).on_node(node)
        };
        self.create_temp_pod(&spec).await
    }

    #[instrument(skip(self, spec), fields(namespace = %spec.namespace, pvc = %spec.pvc))]
    pub async fn create_temp_pod(&self, spec: &TempPodSpec) -> Result<Pod> {
        let name = self.unique_name(&spec.pvc);
        let pod = self.build_pod(&name, spec);

        let created = self
            .pods(&spec.namespace)
            .create(&PostParams::default(), &pod)
            .await?;
        if let Ok(mut live) = self.live.lock() {
            live.insert((spec.namespace.clone(), name.clone()));
        }

        info!(
            "Created temp pod {}/{} for PVC {}{}",
            spec.namespace,
            name,
            spec.pvc,
            spec.node
                .as_deref()
                .map(|n| format!(" on node {}", n))
                .unwrap_or_default()
        );
        Ok(created)
    }

    fn unique_name(&self, pvc: &str) -> String {
        let suffix = format!(
            "-{}{:03}",
            Utc::now().format("%Y%m%d%H%M%S"),
            self.sequence.fetch_add(1, Ordering::SeqCst) % 1000
        );
        let mut base = format!("{}-tmp-{}", OPERATOR_NAME, pvc.to_lowercase());
        base.truncate(MAX_NAME_LEN - suffix.len());
        format!("{}{}", base.trim_end_matches(['-', '.']), suffix)
    }

    fn build_pod(&self, name: &str, spec: &TempPodSpec) -> Pod {
        let mut mounts = vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: defaults::TEMP_POD_MOUNT_PATH.to_string(),
            ..Default::default()
        }];
        let mut volumes = vec![Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: spec.pvc.clone(),
                read_only: None,
            }),
            ..Default::default()
        }];

        if let Some(secret) = &spec.key_secret {
            mounts.push(VolumeMount {
                name: KEY_VOLUME.to_string(),
                mount_path: defaults::TEMP_KEY_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
            volumes.push(Volume {
                name: KEY_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    default_mode: Some(0o400),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(spec.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (labels::TEMP_POD.to_string(), "true".to_string()),
                    (labels::TEMP_POD_PVC.to_string(), spec.pvc.clone()),
                    (labels::MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
                ])),
                annotations: Some(BTreeMap::from([(
                    annotations::CREATED_AT.to_string(),
                    Utc::now().to_rfc3339(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: spec.node.clone(),
                restart_policy: Some("Never".to_string()),
                termination_grace_period_seconds: Some(0),
                containers: vec![Container {
                    name: SYNC_CONTAINER.to_string(),
                    image: Some(spec.image.clone().unwrap_or_else(|| self.image.clone())),
                    command: Some(spec.command.clone().unwrap_or_else(|| {
                        vec!["sleep".to_string(), "infinity".to_string()]
                    })),
                    volume_mounts: Some(mounts),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Poll until the pod is Running and Ready. The poll interval starts at
    /// one second and grows by half each time up to thirty seconds, never
    /// sleeping past `timeout`.
    #[instrument(skip(self, cancel))]
    pub async fn wait_for_pod_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Pod> {
        let pods = self.pods(namespace);
        let started = Instant::now();
        let max_interval = Duration::from_millis(pod_wait::MAX_INTERVAL_MS);
        let mut interval = Duration::from_millis(pod_wait::BASE_INTERVAL_MS);

        loop {
            match pods.get_opt(name).await? {
                Some(pod) => {
                    if let Some(reason) = terminal_reason(&pod) {
                        return Err(DrSyncError::PodFailed(format!("{}/{}", namespace, name), reason));
                    }
                    if is_ready(&pod) {
                        debug!("Pod {}/{} is ready", namespace, name);
                        return Ok(pod);
                    }
                }
                None => debug!("Pod {}/{} not visible yet", namespace, name),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(DrSyncError::Timeout {
                    operation: format!("pod {}/{} to become ready", namespace, name),
                    elapsed,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(interval.min(timeout - elapsed)) => {}
                _ = cancel.cancelled() => {
                    return Err(DrSyncError::Cancelled(format!(
                        "waiting for pod {}/{}",
                        namespace, name
                    )));
                }
            }
            interval = interval.mul_f64(pod_wait::FACTOR).min(max_interval);
        }
    }

    /// Delete a pod; absence counts as success
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let result = self
            .pods(namespace)
            .delete(name, &DeleteParams::default().grace_period(0))
            .await;
        if let Ok(mut live) = self.live.lock() {
            live.remove(&(namespace.to_string(), name.to_string()));
        }

        match result {
            Ok(_) => {
                debug!("Deleted temp pod {}/{}", namespace, name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every marker-labelled pod in a namespace, returning how many
    /// were removed
    #[instrument(skip(self))]
    pub async fn cleanup_temp_pods(&self, namespace: &str) -> Result<usize> {
        let pods = self.pods(namespace).list(&marker_selector()).await?;
        self.delete_all(pods.items).await
    }

    /// Delete marker-labelled pods in any namespace that were created more
    /// than `max_age` ago. Recovers pods left behind by a crashed process.
    pub async fn cleanup_stale_temp_pods(&self, max_age: chrono::Duration) -> Result<usize> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let now = Utc::now();
        let stale: Vec<Pod> = pods
            .list(&marker_selector())
            .await?
            .items
            .into_iter()
            .filter(|pod| {
                pod.annotations()
                    .get(annotations::CREATED_AT)
                    .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                    .is_some_and(|created| now.signed_duration_since(created) > max_age)
            })
            .collect();
        self.delete_all(stale).await
    }

    async fn delete_all(&self, pods: Vec<Pod>) -> Result<usize> {
        let mut deleted = 0;
        let mut first_error = None;
        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            match self.delete_pod(&namespace, &pod.name_any()).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!("Failed to delete temp pod {}/{}: {}", namespace, pod.name_any(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if deleted > 0 {
            info!("Cleaned up {} temp pod(s)", deleted);
        }
        match first_error {
            Some(e) if deleted == 0 => Err(e),
            _ => Ok(deleted),
        }
    }

    /// Delete every temp pod this manager still tracks. Failures are logged.
    pub async fn shutdown_cleanup(&self) -> usize {
        let live: Vec<(String, String)> = match self.live.lock() {
            Ok(live) => live.iter().cloned().collect(),
            Err(_) => return 0,
        };

        let mut deleted = 0;
        for (namespace, name) in live {
            match self.delete_pod(&namespace, &name).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete temp pod {}/{} on shutdown: {}", namespace, name, e),
            }
        }
        deleted
    }

    /// Make a PVC reachable: create a temp pod mounting it, wait until it is
    /// ready and hand out a lease on it. The pod is deleted again if it never
    /// becomes ready.
    pub async fn ensure_pvc_reachable(
        self: &Arc<Self>,
        namespace: &str,
        pvc: &str,
        node: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TempPodLease> {
        self.lease(TempPodSpec::for_pvc(namespace, pvc).on_node(node), cancel)
            .await
    }

    pub async fn lease(self: &Arc<Self>, spec: TempPodSpec, cancel: &CancellationToken) -> Result<TempPodLease> {
        let pod = self.create_temp_pod(&spec).await?;
        let name = pod.name_any();

        let ready = match self
            .wait_for_pod_ready(&spec.namespace, &name, self.ready_timeout, cancel)
            .await
        {
            Ok(ready) => ready,
            Err(e) => {
                if let Err(cleanup) = self.delete_pod(&spec.namespace, &name).await {
                    warn!(
                        "Failed to delete temp pod {}/{} after failed wait: {}",
                        spec.namespace, name, cleanup
                    );
                }
                return Err(e);
            }
        };

        Ok(TempPodLease {
            namespace: spec.namespace,
            node: ready
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            uid: ready.uid().unwrap_or_default(),
            pod_ip: ready.status.as_ref().and_then(|s| s.pod_ip.clone()),
            name,
            manager: self.clone(),
            released: false,
        })
    }
}

fn marker_selector() -> ListParams {
    ListParams::default().labels(&format!("{}=true", labels::TEMP_POD))
}

fn is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_ref()
            .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Reason a pod will never become ready, if it reached a terminal phase
fn terminal_reason(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    let phase = status.phase.as_deref()?;
    if phase != "Failed" && phase != "Succeeded" {
        return None;
    }

    let terminated = status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|c| c.state.as_ref()?.terminated.as_ref())
        .find_map(|t| t.reason.clone().or_else(|| t.message.clone()));

    Some(
        status
            .reason
            .clone()
            .or(status.message.clone())
            .or(terminated)
            .unwrap_or_else(|| format!("pod reached phase {}", phase)),
    )
}

/// A ready temp pod that is deleted when released, or in the background if
/// the lease is dropped without being released
pub struct TempPodLease {
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub uid: String,
    pub pod_ip: Option<String>,
    manager: Arc<TempPodManager>,
    released: bool,
}

impl TempPodLease {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.delete_pod(&self.namespace, &self.name).await
    }
}

impl Drop for TempPodLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!("Temp pod lease {}/{} dropped without release", self.namespace, self.name);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.manager.clone();
        let namespace = self.namespace.clone();
        let name = self.name.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.delete_pod(&namespace, &name).await {
                warn!("Failed to delete temp pod {}/{}: {}", namespace, name, e);
            }
        });
    }
}
