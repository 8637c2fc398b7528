// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-mapping runtime: cluster connections, the trigger that fits the
//! mapping's mode, and a pass queue that never runs two passes at once.

use crate::backoff::backoff;
use crate::config::Config;
use crate::error::{DrSyncError, Result};
use crate::kubernetes::connect_cluster;
use crate::pvc::TempPodManager;
use crate::resources::resolve_kinds;
use crate::sync::manager::{EngineContext, SyncEvent, SyncManagerHandle};
use crate::sync::runner::{PassScope, SyncRunner};
use crate::types::{ClusterMapping, NamespaceMapping, SyncMode};
use crate::watch::{WatchCallback, WatchManager};
use chrono::Utc;
use kube::{Api, ResourceExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct PassQueue {
    running: bool,
    pending: Option<PassScope>,
}

struct RuntimeInner {
    key: String,
    mapping: Mutex<NamespaceMapping>,
    runner: SyncRunner,
    cancel: CancellationToken,
    queue: Mutex<PassQueue>,
    retry_pending: AtomicBool,
}

/// Everything that keeps one NamespaceMapping syncing
pub struct MappingRuntime {
    inner: Arc<RuntimeInner>,
    generation: Option<i64>,
    trigger: Option<String>,
    cluster_mapping: (String, String),
    cluster_mapping_version: Option<String>,
    watch: Option<WatchManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl MappingRuntime {
    /// Connect to the mapping's clusters and install its trigger. Continuous
    /// mappings only start once every informer cache has synced.
    pub async fn start(
        mapping: NamespaceMapping,
        ctx: &EngineContext,
        events: SyncManagerHandle,
    ) -> Result<Self> {
        let key = mapping.key();
        let cm_namespace = mapping.cluster_mapping_namespace();
        let cm_name = mapping.spec.cluster_mapping_ref.name.clone();

        let cluster_mappings: Api<ClusterMapping> =
            Api::namespaced(ctx.local.client.clone(), &cm_namespace);
        let cluster_mapping = cluster_mappings.get_opt(&cm_name).await?.ok_or_else(|| {
            DrSyncError::NotFound(format!("ClusterMapping {}/{}", cm_namespace, cm_name))
        })?;

        let source = connect_cluster(&ctx.local, &cluster_mapping.spec.source_cluster, &cm_namespace).await?;
        let destination =
            connect_cluster(&ctx.local, &cluster_mapping.spec.target_cluster, &cm_namespace).await?;

        // Invalid kind lists and schedules fail the start, not every pass
        let kinds = resolve_kinds(mapping.resource_kinds()?, &source.client).await?;
        let schedule = match mapping.spec.mode {
            SyncMode::Scheduled => Some(mapping.cron_schedule()?),
            _ => None,
        };

        let mut runtime = MappingRuntime {
            generation: mapping.metadata.generation,
            trigger: mapping.sync_trigger().map(String::from),
            cluster_mapping: (cm_namespace, cm_name),
            cluster_mapping_version: cluster_mapping.resource_version(),
            watch: None,
            tasks: Vec::new(),
            inner: Arc::new(RuntimeInner {
                key: key.clone(),
                runner: SyncRunner::new(&ctx.local, source.clone(), destination, &ctx.config),
                cancel: CancellationToken::new(),
                queue: Mutex::new(PassQueue::default()),
                retry_pending: AtomicBool::new(false),
                mapping: Mutex::new(mapping.clone()),
            }),
        };

        match mapping.spec.mode {
            SyncMode::Scheduled => {
                if mapping.status.as_ref().and_then(|s| s.last_sync_time.as_ref()).is_none() {
                    runtime.inner.request_pass(PassScope::Full).await;
                }
                if let Some(schedule) = schedule {
                    runtime.tasks.push(tokio::spawn(run_schedule(runtime.inner.clone(), schedule)));
                }
            }
            SyncMode::Continuous => {
                let watch = WatchManager::new((ctx.informers)(&source), ctx.config.cache_sync_timeout);
                watch
                    .start_watching(&mapping.spec.source_namespace, &kinds, watch_callback(key.clone(), events))
                    .await?;

                let interval = mapping
                    .spec
                    .continuous
                    .as_ref()
                    .and_then(|c| c.background_sync_interval_seconds)
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.config.background_sync_interval);
                let inner = runtime.inner.clone();
                runtime.tasks.push(watch.start_background_sync(
                    interval,
                    move || {
                        let inner = inner.clone();
                        async move {
                            inner.request_pass(PassScope::Full).await;
                            Ok(())
                        }
                    },
                    runtime.inner.cancel.child_token(),
                ));
                runtime.watch = Some(watch);
                runtime.inner.request_pass(PassScope::Full).await;
            }
            SyncMode::Manual => {
                debug!("{} syncs only when its sync-now annotation changes", key);
            }
        }

        info!("Started {:?} runtime for {}", mapping.spec.mode, key);
        Ok(runtime)
    }

    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    pub fn references(&self, namespace: &str, name: &str) -> bool {
        self.cluster_mapping.0 == namespace && self.cluster_mapping.1 == name
    }

    pub fn cluster_mapping_version(&self) -> Option<&str> {
        self.cluster_mapping_version.as_deref()
    }

    pub async fn mapping(&self) -> NamespaceMapping {
        self.inner.mapping.lock().await.clone()
    }

    /// Take a newer copy of the mapping whose spec did not change. A changed
    /// sync-now annotation on a Manual mapping requests a pass.
    pub async fn update(&mut self, mapping: NamespaceMapping) {
        let trigger = mapping.sync_trigger().map(String::from);
        let triggered = mapping.spec.mode == SyncMode::Manual && trigger.is_some() && trigger != self.trigger;
        self.trigger = trigger;
        *self.inner.mapping.lock().await = mapping;

        if triggered {
            info!("Sync requested through annotation for {}", self.inner.key);
            self.inner.request_pass(PassScope::Full).await;
        }
    }

    pub async fn request_pass(&self, scope: PassScope) {
        self.inner.request_pass(scope).await;
    }

    /// Whether a pass is running or queued
    pub async fn is_busy(&self) -> bool {
        let queue = self.inner.queue.lock().await;
        queue.running || queue.pending.is_some()
    }

    /// Cancel triggers and in-flight work, then wait for the trigger tasks
    pub async fn stop(self) -> StoppedRuntime {
        self.inner.cancel.cancel();
        if let Some(watch) = &self.watch {
            watch.stop_watching().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Trigger task of {} ended abnormally: {}", self.inner.key, e);
            }
        }
        debug!("Stopped runtime for {}", self.inner.key);
        StoppedRuntime { inner: self.inner }
    }
}

/// What is left of a stopped runtime: enough to clean up after it
pub struct StoppedRuntime {
    inner: Arc<RuntimeInner>,
}

impl StoppedRuntime {
    /// Remove temp pods left in the mapping's namespaces on both clusters,
    /// along with anything the runtime's transfers still track
    pub async fn sweep(&self, config: &Config) {
        let mapping = self.inner.mapping.lock().await.clone();
        let runner = &self.inner.runner;
        runner.shutdown_cleanup().await;

        let targets = [
            (runner.source(), mapping.spec.source_namespace.as_str()),
            (runner.destination(), mapping.spec.destination_namespace.as_str()),
        ];
        for (conn, namespace) in targets {
            let pods = TempPodManager::new(
                conn.client.clone(),
                config.temp_pod_image.clone(),
                config.temp_pod_ready_timeout,
            );
            match pods.cleanup_temp_pods(namespace).await {
                Ok(0) => {}
                Ok(n) => info!("Removed {} temp pod(s) from {} on {}", n, namespace, conn.name),
                Err(e) => warn!("Failed to clean temp pods in {} on {}: {}", namespace, conn.name, e),
            }
        }
    }

    pub async fn shutdown_cleanup(&self) {
        self.inner.runner.shutdown_cleanup().await;
    }
}

impl RuntimeInner {
    /// Run a pass now, or fold the request into the next one if a pass is
    /// already running
    async fn request_pass(self: &Arc<Self>, scope: PassScope) {
        if self.cancel.is_cancelled() {
            return;
        }
        {
            let mut queue = self.queue.lock().await;
            if queue.running {
                debug!("Pass for {} in progress, queueing {:?}", self.key, scope);
                queue.pending = Some(match queue.pending.take() {
                    Some(pending) => pending.merge(scope),
                    None => scope,
                });
                return;
            }
            queue.running = true;
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.drain(scope).await });
    }

    async fn drain(self: Arc<Self>, mut scope: PassScope) {
        loop {
            self.run_once(scope).await;

            let mut queue = self.queue.lock().await;
            match queue.pending.take() {
                Some(next) if !self.cancel.is_cancelled() => scope = next,
                _ => {
                    queue.running = false;
                    break;
                }
            }
        }
    }

    async fn run_once(self: &Arc<Self>, scope: PassScope) {
        let mapping = self.mapping.lock().await.clone();
        match self.runner.run_pass(&mapping, scope, &self.cancel).await {
            Ok(summary) if summary.failed => self.schedule_retry(summary.consecutive_failures),
            Ok(_) => {}
            Err(DrSyncError::Cancelled(_)) => {}
            Err(e) => {
                error!("Sync pass for {} could not be recorded: {}", self.key, e);
                self.schedule_retry(1);
            }
        }
    }

    /// At most one retry is pending at a time
    fn schedule_retry(self: &Arc<Self>, failures: u32) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = backoff(i64::from(failures));
        info!("Retrying {} in {:?}", self.key, delay);

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    inner.retry_pending.store(false, Ordering::SeqCst);
                    inner.request_pass(PassScope::Full).await;
                }
            }
        });
    }
}

/// Every change the informers see becomes a pass over that one kind
fn watch_callback(key: String, events: SyncManagerHandle) -> WatchCallback {
    Arc::new(move |kind, change, object| {
        debug!("{:?} {} {} in {}", change, kind, object.name_any(), key);
        events.try_send(SyncEvent::PassRequested {
            key: key.clone(),
            scope: PassScope::Kinds(vec![kind.clone()]),
        });
    })
}

async fn run_schedule(inner: Arc<RuntimeInner>, schedule: cron::Schedule) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("Schedule of {} has no upcoming run", inner.key);
            break;
        };

        let (namespace, name) = {
            let mapping = inner.mapping.lock().await;
            (mapping.namespace().unwrap_or_default(), mapping.name_any())
        };
        if let Err(e) = inner.runner.status().set_next_sync_time(&namespace, &name, next).await {
            warn!("Failed to record next sync time of {}: {}", inner.key, e);
        }

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        debug!("Next scheduled pass of {} in {:?}", inner.key, wait);
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => inner.request_pass(PassScope::Full).await,
        }
    }
}
