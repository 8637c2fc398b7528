// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! NamespaceMapping reconciler - watches mappings and hands them to the sync manager.

use crate::constants::FINALIZER;
use crate::error::{DrSyncError, Result};
use crate::sync::{SyncEvent, SyncManagerHandle};
use crate::types::NamespaceMapping;
use futures::StreamExt;
use kube::{
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
        Controller,
    },
    Api, Client, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct NamespaceMappingReconciler {
    client: Client,
    namespace: String,
    sync_handle: SyncManagerHandle,
}

impl NamespaceMappingReconciler {
    pub fn new(client: Client, namespace: impl Into<String>, sync_handle: SyncManagerHandle) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            sync_handle,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mappings: Api<NamespaceMapping> = Api::namespaced(self.client.clone(), &self.namespace);
        let context = Arc::new(self);

        Controller::new(mappings, WatcherConfig::default())
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled namespace mapping: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(
    mapping: Arc<NamespaceMapping>,
    ctx: Arc<NamespaceMappingReconciler>,
) -> Result<Action> {
    let namespace = mapping.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let api: Api<NamespaceMapping> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, mapping, |event| async {
        match event {
            Finalizer::Apply(mapping) => {
                debug!("Reconciling namespace mapping: {}", mapping.key());
                ctx.sync_handle
                    .send(SyncEvent::MappingChanged {
                        mapping: (*mapping).clone(),
                    })
                    .await;
                // The manager owns the runtime from here on; the watcher tells
                // us about the next change
                Ok::<_, DrSyncError>(Action::await_change())
            }
            Finalizer::Cleanup(mapping) => {
                info!("Namespace mapping {} deleted, releasing its runtime", mapping.key());
                ctx.sync_handle
                    .send(SyncEvent::MappingDeleted {
                        mapping: (*mapping).clone(),
                    })
                    .await;
                Ok::<_, DrSyncError>(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| DrSyncError::Finalizer(e.to_string()))
}

fn error_policy(
    _mapping: Arc<NamespaceMapping>,
    error: &DrSyncError,
    _ctx: Arc<NamespaceMappingReconciler>,
) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}
