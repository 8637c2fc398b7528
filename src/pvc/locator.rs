// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resolves which node currently hosts a PVC's volume.

use crate::error::{DrSyncError, Result};
use crate::pvc::temp_pod::TempPodManager;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocateStrategy {
    ConsumerPod,
    NodeAffinity,
    VolumeAttachment,
    ReadyNode,
}

impl fmt::Display for LocateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LocateStrategy::ConsumerPod => "consumer pod",
            LocateStrategy::NodeAffinity => "node affinity",
            LocateStrategy::VolumeAttachment => "volume attachment",
            LocateStrategy::ReadyNode => "ready node",
        };
        f.write_str(s)
    }
}

/// A pod that currently mounts the PVC
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerPod {
    pub name: String,
    pub uid: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeLocation {
    pub node: String,
    /// Bound volume name
    pub volume: String,
    pub consumer: Option<ConsumerPod>,
    pub strategy: LocateStrategy,
}

pub struct PvcNodeLocator {
    client: Client,
    temp_pods: Arc<TempPodManager>,
}

impl PvcNodeLocator {
    pub fn new(client: Client, temp_pods: Arc<TempPodManager>) -> Self {
        Self { client, temp_pods }
    }

    /// Find the node hosting a PVC. In order: a running or pending pod that
    /// mounts it, the volume's node affinity, attachment records for the
    /// volume, and finally any Ready node, proven by scheduling a temp pod
    /// there.
    #[instrument(skip(self, cancel))]
    pub async fn locate(
        &self,
        namespace: &str,
        pvc: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeLocation> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claim = claims
            .get_opt(pvc)
            .await?
            .ok_or_else(|| DrSyncError::NotFound(format!("PVC {}/{}", namespace, pvc)))?;

        let bound = claim
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p == "Bound");
        let volume = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|v| bound && !v.is_empty())
            .ok_or_else(|| {
                DrSyncError::NotFound(format!("PVC {}/{} is not bound", namespace, pvc))
            })?;

        let location = if let Some((node, consumer)) = self.from_consumer_pod(namespace, pvc).await? {
            NodeLocation {
                node,
                volume,
                consumer: Some(consumer),
                strategy: LocateStrategy::ConsumerPod,
            }
        } else if let Some(node) = self.from_node_affinity(&volume).await? {
            NodeLocation {
                node,
                volume,
                consumer: None,
                strategy: LocateStrategy::NodeAffinity,
            }
        } else if let Some(node) = self.from_volume_attachment(&volume).await? {
            NodeLocation {
                node,
                volume,
                consumer: None,
                strategy: LocateStrategy::VolumeAttachment,
            }
        } else {
            NodeLocation {
                node: self.from_ready_node(namespace, pvc, cancel).await?,
                volume,
                consumer: None,
                strategy: LocateStrategy::ReadyNode,
            }
        };

        info!(
            "PVC {}/{} is on node {} (by {})",
            namespace, pvc, location.node, location.strategy
        );
        Ok(location)
    }

    async fn from_consumer_pod(&self, namespace: &str, pvc: &str) -> Result<Option<(String, ConsumerPod)>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut candidates: Vec<(bool, String, ConsumerPod)> = pods
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter_map(|pod| {
                let phase = pod.status.as_ref()?.phase.clone()?;
                if phase != "Running" && phase != "Pending" {
                    return None;
                }
                let spec = pod.spec.as_ref()?;
                let mounts_claim = spec.volumes.iter().flatten().any(|v| {
                    v.persistent_volume_claim
                        .as_ref()
                        .is_some_and(|c| c.claim_name == pvc)
                });
                if !mounts_claim {
                    return None;
                }
                let node = spec.node_name.clone()?;
                Some((
                    phase == "Running",
                    node,
                    ConsumerPod {
                        name: pod.name_any(),
                        uid: pod.uid().unwrap_or_default(),
                    },
                ))
            })
            .collect();

        // Running consumers first
        candidates.sort_by_key(|(running, _, _)| !*running);
        Ok(candidates
            .into_iter()
            .next()
            .map(|(_, node, consumer)| (node, consumer)))
    }

    async fn from_node_affinity(&self, volume: &str) -> Result<Option<String>> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let Some(pv) = volumes.get_opt(volume).await? else {
            return Ok(None);
        };

        Ok(pv
            .spec
            .and_then(|s| s.node_affinity)
            .and_then(|a| a.required)
            .into_iter()
            .flat_map(|selector| selector.node_selector_terms)
            .flat_map(|term| term.match_expressions.unwrap_or_default())
            .find(|req| req.key == HOSTNAME_LABEL && req.operator == "In")
            .and_then(|req| req.values.unwrap_or_default().into_iter().next()))
    }

    async fn from_volume_attachment(&self, volume: &str) -> Result<Option<String>> {
        let attachments: Api<VolumeAttachment> = Api::all(self.client.clone());
        Ok(attachments
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .find(|va| {
                va.spec.source.persistent_volume_name.as_deref() == Some(volume)
                    && va.status.as_ref().is_some_and(|s| s.attached)
            })
            .map(|va| va.spec.node_name))
    }

    async fn from_ready_node(
        &self,
        namespace: &str,
        pvc: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let ready = nodes
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .find(is_schedulable)
            .ok_or_else(|| {
                DrSyncError::NoAvailableNode(format!("no Ready node for PVC {}/{}", namespace, pvc))
            })?;

        debug!("Falling back to ready node {}", ready.name_any());
        let lease = self
            .temp_pods
            .ensure_pvc_reachable(namespace, pvc, Some(&ready.name_any()), cancel)
            .await?;
        let node = lease.node.clone();
        if let Err(e) = lease.release().await {
            warn!("Failed to release locator temp pod: {}", e);
        }
        Ok(node)
    }
}

fn is_schedulable(node: &Node) -> bool {
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    ready && !cordoned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node_json, pvc_json, FakeApiServer};
    use serde_json::json;
    use std::time::Duration;

    const PVCS: &str = "/api/v1/namespaces/app/persistentvolumeclaims";
    const PODS: &str = "/api/v1/namespaces/app/pods";

    fn locator(server: &FakeApiServer) -> PvcNodeLocator {
        let temp_pods = Arc::new(TempPodManager::new(
            server.client(),
            "rsync:test",
            Duration::from_secs(5),
        ));
        PvcNodeLocator::new(server.client(), temp_pods)
    }

    fn consumer(name: &str, node: &str, phase: &str) -> serde_json::Value {
        json!({
            "metadata": { "name": name, "namespace": "app" },
            "spec": {
                "nodeName": node,
                "containers": [{ "name": "app", "image": "app" }],
                "volumes": [{ "name": "d", "persistentVolumeClaim": { "claimName": "data" } }]
            },
            "status": { "phase": phase }
        })
    }

    #[tokio::test]
    async fn test_missing_and_unbound_pvc_are_not_found() {
        let server = FakeApiServer::new();
        let cancel = CancellationToken::new();
        let err = locator(&server).locate("app", "data", &cancel).await.unwrap_err();
        assert!(err.is_not_found());

        server.insert(PVCS, pvc_json("app", "data", None));
        let err = locator(&server).locate("app", "data", &cancel).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_prefers_running_consumer_pod() {
        let server = FakeApiServer::new();
        server.insert(PVCS, pvc_json("app", "data", Some("pv-1")));
        server.insert(PODS, consumer("pending", "node-a", "Pending"));
        server.insert(PODS, consumer("running", "node-b", "Running"));
        server.insert(PODS, consumer("done", "node-c", "Succeeded"));

        let location = locator(&server)
            .locate("app", "data", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(location.node, "node-b");
        assert_eq!(location.volume, "pv-1");
        assert_eq!(location.strategy, LocateStrategy::ConsumerPod);
        assert_eq!(location.consumer.unwrap().name, "running");
    }

    #[tokio::test]
    async fn test_uses_volume_node_affinity() {
        let server = FakeApiServer::new();
        server.insert(PVCS, pvc_json("app", "data", Some("pv-1")));
        server.insert(
            "/api/v1/persistentvolumes",
            json!({
                "metadata": { "name": "pv-1" },
                "spec": {
                    "nodeAffinity": { "required": { "nodeSelectorTerms": [{
                        "matchExpressions": [{
                            "key": "kubernetes.io/hostname",
                            "operator": "In",
                            "values": ["node-local"]
                        }]
                    }] } }
                }
            }),
        );

        let location = locator(&server)
            .locate("app", "data", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(location.node, "node-local");
        assert_eq!(location.strategy, LocateStrategy::NodeAffinity);
    }

    #[tokio::test]
    async fn test_uses_attached_volume_attachment() {
        let server = FakeApiServer::new();
        server.insert(PVCS, pvc_json("app", "data", Some("pv-1")));
        for (name, node, attached) in [("va-1", "node-x", false), ("va-2", "node-y", true)] {
            server.insert(
                "/apis/storage.k8s.io/v1/volumeattachments",
                json!({
                    "metadata": { "name": name },
                    "spec": {
                        "attacher": "csi.example.com",
                        "nodeName": node,
                        "source": { "persistentVolumeName": "pv-1" }
                    },
                    "status": { "attached": attached }
                }),
            );
        }

        let location = locator(&server)
            .locate("app", "data", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(location.node, "node-y");
        assert_eq!(location.strategy, LocateStrategy::VolumeAttachment);
    }

    #[tokio::test]
    async fn test_falls_back_to_ready_node_and_cleans_up() {
        let server = FakeApiServer::new().with_ready_pods();
        server.insert(PVCS, pvc_json("app", "data", Some("pv-1")));
        server.insert("/api/v1/nodes", node_json("node-down", false));
        server.insert("/api/v1/nodes", node_json("node-up", true));

        let location = locator(&server)
            .locate("app", "data", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(location.node, "node-up");
        assert_eq!(location.strategy, LocateStrategy::ReadyNode);
        assert!(server.list(PODS).is_empty());
        assert_eq!(server.count_requests("POST"), 1);
    }

    #[tokio::test]
    async fn test_no_ready_node() {
        let server = FakeApiServer::new();
        server.insert(PVCS, pvc_json("app", "data", Some("pv-1")));
        server.insert("/api/v1/nodes", node_json("node-down", false));

        let err = locator(&server)
            .locate("app", "data", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DrSyncError::NoAvailableNode(_)));
    }
}
