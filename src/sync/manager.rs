// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Central coordinator for NamespaceMapping runtimes.

use crate::backoff::backoff;
use crate::config::Config;
use crate::kubernetes::ClusterConnection;
use crate::sync::runner::PassScope;
use crate::sync::runtime::MappingRuntime;
use crate::sync::status::StatusWriter;
use crate::types::namespace_mapping::SyncPhase;
use crate::types::NamespaceMapping;
use crate::watch::{InformerFactory, KubeInformerFactory};
use futures::future::join_all;
use kube::{Api, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Events that reconcilers and runtimes send to the SyncManager
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A NamespaceMapping was created or updated
    MappingChanged { mapping: NamespaceMapping },
    /// A NamespaceMapping is being deleted
    MappingDeleted { mapping: NamespaceMapping },
    /// A ClusterMapping was created or updated
    ClusterMappingChanged {
        namespace: String,
        name: String,
        resource_version: Option<String>,
    },
    /// A runtime wants a pass, e.g. because an informer saw a change
    PassRequested { key: String, scope: PassScope },
    /// Try again to start a runtime that failed to start
    RestartRequested { namespace: String, name: String },
}

/// Builds the informer factory for a source cluster
pub type InformerSource = Arc<dyn Fn(&ClusterConnection) -> Arc<dyn InformerFactory> + Send + Sync>;

/// What every runtime needs from the process around it
#[derive(Clone)]
pub struct EngineContext {
    pub local: ClusterConnection,
    pub config: Config,
    pub informers: InformerSource,
}

impl EngineContext {
    pub fn new(local: ClusterConnection, config: Config) -> Self {
        Self {
            local,
            config,
            informers: Arc::new(|conn: &ClusterConnection| -> Arc<dyn InformerFactory> {
                Arc::new(KubeInformerFactory::new(conn.client.clone()))
            }),
        }
    }

    pub fn with_informers(mut self, informers: InformerSource) -> Self {
        self.informers = informers;
        self
    }
}

/// Central coordinator for NamespaceMapping runtimes.
/// Receives events from reconcilers and owns one runtime per active mapping.
pub struct SyncManager {
    ctx: EngineContext,
    event_rx: mpsc::Receiver<SyncEvent>,
    handle: SyncManagerHandle,
    runtimes: HashMap<String, MappingRuntime>,
    start_failures: HashMap<String, u32>,
    shutdown: CancellationToken,
}

/// Handle to send events to the SyncManager
#[derive(Clone)]
pub struct SyncManagerHandle {
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncManagerHandle {
    pub async fn send(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.send(event).await {
            error!("Failed to send event to SyncManager: {}", e);
        }
    }

    /// Non-blocking send for callers that cannot await
    pub fn try_send(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Dropped event for SyncManager: {}", e);
        }
    }
}

impl SyncManager {
    pub fn new(ctx: EngineContext, shutdown: CancellationToken) -> (Self, SyncManagerHandle) {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let handle = SyncManagerHandle { event_tx };

        let manager = Self {
            ctx,
            event_rx,
            handle: handle.clone(),
            runtimes: HashMap::new(),
            start_failures: HashMap::new(),
            shutdown,
        };
        (manager, handle)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("SyncManager started, listening for events...");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        self.shutdown_runtimes().await;
        Ok(())
    }

    async fn handle_event(&mut self, event: SyncEvent) {
        debug!("Handling event: {:?}", event);

        match event {
            SyncEvent::MappingChanged { mapping } => self.handle_mapping_changed(mapping).await,
            SyncEvent::MappingDeleted { mapping } => self.handle_mapping_deleted(&mapping).await,
            SyncEvent::ClusterMappingChanged {
                namespace,
                name,
                resource_version,
            } => {
                self.handle_cluster_mapping_changed(&namespace, &name, resource_version)
                    .await
            }
            SyncEvent::PassRequested { key, scope } => match self.runtimes.get(&key) {
                Some(runtime) => runtime.request_pass(scope).await,
                None => debug!("No runtime for {}, dropping pass request", key),
            },
            SyncEvent::RestartRequested { namespace, name } => {
                self.handle_restart(&namespace, &name).await
            }
        }
    }

    #[instrument(skip(self, mapping), fields(mapping = %mapping.key()))]
    async fn handle_mapping_changed(&mut self, mapping: NamespaceMapping) {
        let key = mapping.key();

        if mapping.spec.paused {
            if let Some(runtime) = self.runtimes.remove(&key) {
                info!("Mapping paused, stopping its runtime");
                runtime.stop().await;
            }
            return;
        }

        if let Some(runtime) = self.runtimes.get_mut(&key) {
            if runtime.generation() == mapping.metadata.generation {
                runtime.update(mapping).await;
                return;
            }
            info!("Mapping spec changed, restarting its runtime");
            if let Some(runtime) = self.runtimes.remove(&key) {
                runtime.stop().await;
            }
        }

        self.start_runtime(mapping).await;
    }

    async fn start_runtime(&mut self, mapping: NamespaceMapping) {
        let key = mapping.key();
        match MappingRuntime::start(mapping.clone(), &self.ctx, self.handle.clone()).await {
            Ok(runtime) => {
                self.start_failures.remove(&key);
                self.runtimes.insert(key, runtime);
            }
            Err(e) => {
                error!("Failed to start runtime for {}: {}", key, e);
                let namespace = mapping.namespace().unwrap_or_default();
                let name = mapping.name_any();
                let status = StatusWriter::new(self.ctx.local.client.clone());
                let message = format!("Failed to start: {}", e);
                if let Err(e) = status
                    .set_phase(&namespace, &name, SyncPhase::Failed, Some(&message))
                    .await
                {
                    warn!("Failed to record start failure of {}: {}", key, e);
                }
                self.schedule_restart(key, namespace, name);
            }
        }
    }

    fn schedule_restart(&mut self, key: String, namespace: String, name: String) {
        let failures = self.start_failures.entry(key).or_insert(0);
        *failures += 1;
        let delay = backoff(i64::from(*failures));
        info!("Retrying start of {}/{} in {:?}", namespace, name, delay);

        let handle = self.handle.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    handle.send(SyncEvent::RestartRequested { namespace, name }).await;
                }
            }
        });
    }

    /// Re-read the mapping so a restart never revives a deleted one
    async fn handle_restart(&mut self, namespace: &str, name: &str) {
        let key = format!("{}/{}", namespace, name);
        if self.runtimes.contains_key(&key) {
            return;
        }

        let api: Api<NamespaceMapping> = Api::namespaced(self.ctx.local.client.clone(), namespace);
        match api.get_opt(name).await {
            Ok(Some(mapping)) if mapping.metadata.deletion_timestamp.is_none() => {
                self.handle_mapping_changed(mapping).await
            }
            Ok(_) => {
                debug!("Mapping {} is gone, not restarting", key);
                self.start_failures.remove(&key);
            }
            Err(e) => {
                warn!("Failed to read mapping {}: {}", key, e);
                self.schedule_restart(key, namespace.to_string(), name.to_string());
            }
        }
    }

    #[instrument(skip(self, mapping), fields(mapping = %mapping.key()))]
    async fn handle_mapping_deleted(&mut self, mapping: &NamespaceMapping) {
        let key = mapping.key();
        self.start_failures.remove(&key);

        let Some(runtime) = self.runtimes.remove(&key) else {
            debug!("Mapping deleted without a running runtime");
            return;
        };

        info!("Mapping deleted, stopping its runtime");
        runtime.stop().await.sweep(&self.ctx.config).await;
    }

    /// Restart runtimes whose ClusterMapping changed since they started
    async fn handle_cluster_mapping_changed(
        &mut self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) {
        let affected: Vec<String> = self
            .runtimes
            .iter()
            .filter(|(_, rt)| {
                rt.references(namespace, name)
                    && rt.cluster_mapping_version() != resource_version.as_deref()
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in affected {
            let Some(runtime) = self.runtimes.remove(&key) else {
                continue;
            };
            info!(
                "ClusterMapping {}/{} changed, restarting runtime for {}",
                namespace, name, key
            );
            let mapping = runtime.mapping().await;
            runtime.stop().await;
            self.start_runtime(mapping).await;
        }
    }

    /// Stop every runtime and remove what its transfers left behind, bounded
    /// by the configured shutdown timeout
    async fn shutdown_runtimes(&mut self) {
        let runtimes: Vec<MappingRuntime> = self.runtimes.drain().map(|(_, rt)| rt).collect();
        if runtimes.is_empty() {
            return;
        }
        info!("Stopping {} runtime(s)", runtimes.len());

        let cleanup = join_all(runtimes.into_iter().map(|runtime| async move {
            runtime.stop().await.shutdown_cleanup().await;
        }));
        if tokio::time::timeout(self.ctx.config.shutdown_timeout, cleanup)
            .await
            .is_err()
        {
            warn!(
                "Runtime cleanup did not finish within {:?}",
                self.ctx.config.shutdown_timeout
            );
        }
    }
}
