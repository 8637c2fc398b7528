// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dr_syncer::config::Config;
use dr_syncer::constants::API_GROUP;
use dr_syncer::kubernetes::{wait_for_crd, ClusterConnection};
use dr_syncer::reconcilers::{ClusterMappingReconciler, NamespaceMappingReconciler};
use dr_syncer::shutdown::wait_for_signal;
use dr_syncer::sync::{EngineContext, SyncManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting dr-syncer controller");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: namespace={}, agent_namespace={}",
        config.namespace, config.agent_namespace
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    let local = ClusterConnection::local(client.clone())
        .await
        .context("Failed to describe the local cluster")?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // Wait for the NamespaceMapping CRD before starting reconcilers
    info!("Waiting for NamespaceMapping CRD to become available...");
    if let Err(e) = wait_for_crd(&client, API_GROUP, "v1alpha1", "NamespaceMapping", &shutdown).await {
        if shutdown.is_cancelled() {
            info!("Shutdown before the CRD became available");
            return Ok(());
        }
        return Err(e.into());
    }

    // Create the sync manager and get a handle for reconcilers
    let (sync_manager, sync_handle) =
        SyncManager::new(EngineContext::new(local, config.clone()), shutdown.clone());

    let mapping_reconciler =
        NamespaceMappingReconciler::new(client.clone(), config.namespace.clone(), sync_handle.clone());
    let cluster_reconciler =
        ClusterMappingReconciler::new(client.clone(), config.namespace.clone(), sync_handle);

    info!("Starting reconcilers...");

    // The manager returns once shutdown fired and its runtimes are cleaned up;
    // the reconcilers only stop with the process
    let manager = tokio::spawn(sync_manager.run());
    tokio::select! {
        result = async { tokio::try_join!(mapping_reconciler.run(), cluster_reconciler.run()) } => {
            result?;
            warn!("All reconcilers stopped unexpectedly");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => info!("Shutting down..."),
    }

    manager.await.context("Sync manager task failed")??;
    info!("dr-syncer controller stopped");
    Ok(())
}
