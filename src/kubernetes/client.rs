// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Client construction for the clusters named by a ClusterMapping

use crate::error::{DrSyncError, Result};
use crate::types::cluster_mapping::ClusterRef;
use k8s_openapi::api::core::v1::Secret;
use kube::{config::KubeConfigOptions, Api, Client};
use std::fmt;
use tracing::{info, instrument};

/// A client bound to one cluster, together with the API server host it talks
/// to. The host is what the remote executor matches on when it has to infer
/// which side of a mapping a call is for.
#[derive(Clone)]
pub struct ClusterConnection {
    pub name: String,
    pub host: String,
    pub client: Client,
}

impl ClusterConnection {
    pub fn new(name: impl Into<String>, host: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            client,
        }
    }

    /// Connection to the cluster the process runs in
    pub async fn local(client: Client) -> Result<Self> {
        let config = kube::Config::infer()
            .await
            .map_err(|e| DrSyncError::KubeconfigError(format!("Failed to infer config: {}", e)))?;
        Ok(Self::new("local", host_of(&config.cluster_url), client))
    }
}

impl fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("name", &self.name)
            .field("host", &self.host)
            .finish()
    }
}

/// Connect to a cluster referenced by a ClusterMapping.
///
/// Without a kubeconfig secret reference the local connection is reused.
#[instrument(skip(local, cluster), fields(cluster = %cluster.name))]
pub async fn connect_cluster(
    local: &ClusterConnection,
    cluster: &ClusterRef,
    default_namespace: &str,
) -> Result<ClusterConnection> {
    let Some(secret_ref) = cluster.kubeconfig_secret_ref.as_ref() else {
        return Ok(ClusterConnection {
            name: cluster.name.clone(),
            ..local.clone()
        });
    };

    let namespace = secret_ref.namespace.as_deref().unwrap_or(default_namespace);
    let kubeconfig =
        get_kubeconfig(&local.client, namespace, &secret_ref.name, &secret_ref.key, &cluster.name)
            .await?;
    let config = config_from_kubeconfig(&kubeconfig).await?;
    let host = host_of(&config.cluster_url);

    let client = Client::try_from(config)
        .map_err(|e| DrSyncError::KubeconfigError(format!("Failed to create client: {}", e)))?;

    Ok(ClusterConnection::new(cluster.name.clone(), host, client))
}

/// Read the kubeconfig stored under `key` in a secret
async fn get_kubeconfig(
    client: &Client,
    namespace: &str,
    secret_name: &str,
    key: &str,
    cluster_name: &str,
) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    info!(
        "Getting kubeconfig secret '{}/{}' for cluster '{}'...",
        namespace, secret_name, cluster_name
    );

    let secret = secrets.get(secret_name).await.map_err(|e| {
        DrSyncError::KubeconfigError(format!(
            "Failed to get kubeconfig secret for cluster {}: {}",
            cluster_name, e
        ))
    })?;

    let Some(data) = secret.data.as_ref() else {
        return Err(DrSyncError::KubeconfigError(format!(
            "Kubeconfig secret for cluster {} has no data",
            cluster_name
        )));
    };

    let Some(kubeconfig_data) = data.get(key) else {
        return Err(DrSyncError::KubeconfigError(format!(
            "Kubeconfig secret for cluster {} does not contain '{}' key",
            cluster_name, key
        )));
    };

    String::from_utf8(kubeconfig_data.0.clone()).map_err(|e| {
        DrSyncError::KubeconfigError(format!(
            "Failed to decode kubeconfig for cluster {}: {}",
            cluster_name, e
        ))
    })
}

/// Build a client config from a kubeconfig document
async fn config_from_kubeconfig(kubeconfig: &str) -> Result<kube::Config> {
    use kube::config::Kubeconfig;

    let kubeconfig_parsed: Kubeconfig = serde_yaml::from_str(kubeconfig)
        .map_err(|e| DrSyncError::KubeconfigError(format!("Failed to parse kubeconfig: {}", e)))?;

    kube::Config::from_custom_kubeconfig(kubeconfig_parsed, &KubeConfigOptions::default())
        .await
        .map_err(|e| DrSyncError::KubeconfigError(format!("Failed to create config: {}", e)))
}

/// Host (and port, when explicit) of an API server URL
pub fn host_of(uri: &http::Uri) -> String {
    match (uri.host(), uri.port_u16()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => uri.to_string(),
    }
}
