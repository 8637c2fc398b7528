// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! ClusterMapping reconciler - tells the sync manager when a cluster pair changes.

use crate::error::{DrSyncError, Result};
use crate::sync::{SyncEvent, SyncManagerHandle};
use crate::types::ClusterMapping;
use futures::StreamExt;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, Client, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub struct ClusterMappingReconciler {
    client: Client,
    namespace: String,
    sync_handle: SyncManagerHandle,
}

impl ClusterMappingReconciler {
    pub fn new(client: Client, namespace: impl Into<String>, sync_handle: SyncManagerHandle) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            sync_handle,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let cluster_mappings: Api<ClusterMapping> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let context = Arc::new(self);

        Controller::new(cluster_mappings, watcher::Config::default())
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled cluster mapping: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(
    cluster_mapping: Arc<ClusterMapping>,
    ctx: Arc<ClusterMappingReconciler>,
) -> Result<Action> {
    debug!("Reconciling cluster mapping: {}", cluster_mapping.name_any());

    // Runtimes started against this exact version ignore the event
    ctx.sync_handle
        .send(SyncEvent::ClusterMappingChanged {
            namespace: cluster_mapping
                .namespace()
                .unwrap_or_else(|| ctx.namespace.clone()),
            name: cluster_mapping.name_any(),
            resource_version: cluster_mapping.resource_version(),
        })
        .await;

    Ok(Action::await_change())
}

fn error_policy(
    _cluster_mapping: Arc<ClusterMapping>,
    error: &DrSyncError,
    _ctx: Arc<ClusterMappingReconciler>,
) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}
