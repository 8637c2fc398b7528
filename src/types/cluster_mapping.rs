// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::defaults;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Directed source → target cluster pair that NamespaceMappings replicate across.
/// Only a connectivity probe writes its status; the sync engine only reads it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(group = "dr-syncer.io", version = "v1alpha1", kind = "ClusterMapping")]
#[kube(namespaced)]
#[kube(status = "ClusterMappingStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterMappingSpec {
    pub source_cluster: ClusterRef,
    pub target_cluster: ClusterRef,
    #[serde(default)]
    pub connectivity: ConnectivityPolicy,
}

/// A cluster reachable through a kubeconfig stored in a secret
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRef {
    pub name: String,
    /// Absent means the cluster the controller runs in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret_ref: Option<KubeconfigSecretRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSecretRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_kubeconfig_key")]
    pub key: String,
}

fn default_kubeconfig_key() -> String {
    defaults::KUBECONFIG_KEY.to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityPolicy {
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_interval_seconds: Option<u64>,
}

impl Default for ConnectivityPolicy {
    fn default() -> Self {
        Self {
            ssh_port: defaults::SSH_PORT,
            verify_interval_seconds: None,
        }
    }
}

fn default_ssh_port() -> u16 {
    defaults::SSH_PORT
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMappingStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_connections: Vec<NodeConnection>,
}

/// Observed SSH reachability between a source node agent and a target node agent
#[derive(Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnection {
    pub source_node: String,
    pub target_node: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        let spec: ClusterMappingSpec = serde_json::from_value(serde_json::json!({
            "sourceCluster": { "name": "prod" },
            "targetCluster": {
                "name": "dr",
                "kubeconfigSecretRef": { "name": "dr-kubeconfig" }
            }
        }))
        .unwrap();

        assert_eq!(spec.connectivity.ssh_port, 2222);
        assert!(spec.source_cluster.kubeconfig_secret_ref.is_none());
        let secret_ref = spec.target_cluster.kubeconfig_secret_ref.unwrap();
        assert_eq!(secret_ref.key, "kubeconfig");
        assert!(secret_ref.namespace.is_none());
    }
}
