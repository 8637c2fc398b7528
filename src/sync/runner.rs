// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! One sync pass over a NamespaceMapping: every selected kind is replicated
//! through a worker pool, PVC contents follow when enabled, and the outcome
//! is folded into the mapping's status.

use crate::config::Config;
use crate::error::{DrSyncError, Result};
use crate::kubernetes::{ensure_namespace_exists, ClusterConnection};
use crate::pvc::{PvcDataSyncer, PvcSyncSettings};
use crate::resources::{resolve_kinds, ResourceKind, TransformContext};
use crate::sync::replicate::{replicate_kind, STATUS_FAILED, STATUS_PARTIAL, STATUS_SYNCED};
use crate::sync::status::{timestamp, StatusWriter};
use crate::types::namespace_mapping::SyncPhase;
use crate::types::{NamespaceMapping, NamespaceMappingStatus, ResourceOutcome};
use crate::workers::WorkerPool;
use chrono::Utc;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Outcome label for copied volume contents
pub const PVC_DATA: &str = "PersistentVolumeClaimData";

/// Which kinds a pass covers
#[derive(Clone, Debug, PartialEq)]
pub enum PassScope {
    Full,
    Kinds(Vec<ResourceKind>),
}

impl PassScope {
    /// Combine two pending requests into one pass covering both
    pub fn merge(self, other: PassScope) -> PassScope {
        match (self, other) {
            (PassScope::Kinds(mut kinds), PassScope::Kinds(more)) => {
                for kind in more {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                PassScope::Kinds(kinds)
            }
            _ => PassScope::Full,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PassSummary {
    pub outcomes: Vec<ResourceOutcome>,
    pub failed: bool,
    pub consecutive_failures: u32,
}

/// Runs passes for one mapping between a fixed pair of clusters
pub struct SyncRunner {
    source: ClusterConnection,
    destination: ClusterConnection,
    status: StatusWriter,
    resources: WorkerPool,
    pvcs: WorkerPool,
    pvc_syncer: Arc<PvcDataSyncer>,
}

impl SyncRunner {
    pub fn new(
        local: &ClusterConnection,
        source: ClusterConnection,
        destination: ClusterConnection,
        config: &Config,
    ) -> Self {
        let pvc_syncer = Arc::new(PvcDataSyncer::new(
            source.clone(),
            destination.clone(),
            PvcSyncSettings::from_config(config),
        ));
        Self {
            status: StatusWriter::new(local.client.clone()),
            resources: WorkerPool::new("resources", config.resource_sync_concurrency),
            pvcs: WorkerPool::new("pvc-data", config.pvc_sync_concurrency),
            pvc_syncer,
            source,
            destination,
        }
    }

    pub fn source(&self) -> &ClusterConnection {
        &self.source
    }

    pub fn destination(&self) -> &ClusterConnection {
        &self.destination
    }

    pub fn status(&self) -> &StatusWriter {
        &self.status
    }

    /// Run one pass and record it in the mapping's status. Only a failure to
    /// write that status is returned as an error; sync failures end up in
    /// the summary.
    #[instrument(skip_all, fields(mapping = %mapping.key()))]
    pub async fn run_pass(
        &self,
        mapping: &NamespaceMapping,
        scope: PassScope,
        cancel: &CancellationToken,
    ) -> Result<PassSummary> {
        if cancel.is_cancelled() {
            return Err(DrSyncError::Cancelled(format!("pass for {}", mapping.key())));
        }

        let namespace = mapping.namespace().unwrap_or_default();
        let name = mapping.name_any();
        let started = Instant::now();
        info!("Starting sync pass ({:?})", scope);

        self.status
            .set_phase(&namespace, &name, SyncPhase::Running, None)
            .await?;

        let outcomes = self.replicate(mapping, &scope, cancel).await;

        let previous = match self.status.current(&namespace, &name).await? {
            Some(status) => status,
            None => {
                info!("Mapping was deleted during the pass, not recording it");
                let failed = outcomes.iter().any(ResourceOutcome::is_failure);
                return Ok(PassSummary {
                    outcomes,
                    failed,
                    consecutive_failures: 0,
                });
            }
        };

        let status = fold_status(previous, &scope, &outcomes, started.elapsed());
        self.status.write(&namespace, &name, &status).await?;

        let failed = status.phase == SyncPhase::Failed;
        if failed {
            warn!(
                "Sync pass failed ({} consecutive): {}",
                status.sync_stats.consecutive_failures,
                status.message.as_deref().unwrap_or_default()
            );
        } else {
            info!("Sync pass completed in {:?}", started.elapsed());
        }

        Ok(PassSummary {
            outcomes,
            failed,
            consecutive_failures: status.sync_stats.consecutive_failures,
        })
    }

    async fn replicate(
        &self,
        mapping: &NamespaceMapping,
        scope: &PassScope,
        cancel: &CancellationToken,
    ) -> Vec<ResourceOutcome> {
        let enabled = match mapping.resource_kinds() {
            Ok(kinds) => kinds,
            Err(e) => return vec![failure("Configuration", e.to_string())],
        };
        let enabled = match resolve_kinds(enabled, &self.source.client).await {
            Ok(kinds) => kinds,
            Err(e) => return vec![failure("Configuration", e.to_string())],
        };
        let kinds: Vec<ResourceKind> = match scope {
            PassScope::Full => enabled,
            PassScope::Kinds(requested) => enabled
                .into_iter()
                .filter(|k| requested.contains(k))
                .collect(),
        };

        let spec = &mapping.spec;
        if let Err(e) = ensure_namespace_exists(&self.destination.client, &spec.destination_namespace).await {
            return vec![failure("Namespace", e.to_string())];
        }

        let ctx = TransformContext {
            destination_namespace: spec.destination_namespace.clone(),
            scale_to_zero: spec.scale_to_zero,
            pvc_config: spec.pvc_config.clone(),
        };
        let immutable = spec.immutable_resource_config.default_handling;

        let tasks = kinds.iter().cloned().map(|kind| {
            let source = self.source.client.clone();
            let destination = self.destination.client.clone();
            let namespace = spec.source_namespace.clone();
            let ctx = ctx.clone();
            async move { replicate_kind(&kind, &source, &destination, &namespace, &ctx, immutable).await }
        });

        let mut outcomes: Vec<ResourceOutcome> = self
            .resources
            .submit_and_wait(tasks)
            .await
            .into_iter()
            .zip(&kinds)
            .map(|(result, kind)| {
                result.unwrap_or_else(|e| failure(&kind.to_string(), format!("worker failed: {}", e)))
            })
            .collect();

        let pvc_objects_ok = outcomes
            .iter()
            .any(|o| o.kind == ResourceKind::PersistentVolumeClaim.to_string() && !o.is_failure());
        if spec.pvc_config.sync_data && pvc_objects_ok {
            outcomes.push(self.sync_pvc_data(mapping, cancel).await);
        }

        outcomes
    }

    async fn sync_pvc_data(&self, mapping: &NamespaceMapping, cancel: &CancellationToken) -> ResourceOutcome {
        let spec = &mapping.spec;
        let claims = match ResourceKind::PersistentVolumeClaim
            .fetch(&self.source.client, &spec.source_namespace)
            .await
        {
            Ok(claims) => claims,
            Err(e) => return failure(PVC_DATA, e.to_string()),
        };

        let names: Vec<String> = claims
            .iter()
            .filter(|c| c.data.pointer("/status/phase").and_then(|p| p.as_str()) == Some("Bound"))
            .map(|c| c.name_any())
            .collect();

        let tasks = names.iter().cloned().map(|pvc| {
            let syncer = self.pvc_syncer.clone();
            let source_namespace = spec.source_namespace.clone();
            let destination_namespace = spec.destination_namespace.clone();
            let cancel = cancel.clone();
            async move {
                syncer
                    .sync_pvc(&source_namespace, &destination_namespace, &pvc, &cancel)
                    .await
            }
        });

        let mut outcome = ResourceOutcome {
            kind: PVC_DATA.to_string(),
            ..Default::default()
        };
        for (result, pvc) in self.pvcs.submit_and_wait(tasks).await.into_iter().zip(&names) {
            let error = match result {
                Ok(Ok(_)) => {
                    outcome.synced += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("worker failed: {}", e),
            };
            warn!("Data sync of PVC {} failed: {}", pvc, error);
            outcome.failed += 1;
            if outcome.message.is_none() {
                outcome.message = Some(format!("{}: {}", pvc, error));
            }
        }
        outcome.status = if outcome.failed == 0 { STATUS_SYNCED } else { STATUS_PARTIAL }.to_string();
        if outcome.failed > 0 && outcome.synced == 0 {
            outcome.status = STATUS_FAILED.to_string();
        }
        outcome
    }

    /// Remove temp pods and keys this runner's PVC transfers still hold
    pub async fn shutdown_cleanup(&self) {
        self.pvc_syncer.shutdown_cleanup().await;
    }
}

fn failure(kind: &str, message: String) -> ResourceOutcome {
    ResourceOutcome {
        kind: kind.to_string(),
        failed: 1,
        status: STATUS_FAILED.to_string(),
        message: Some(message),
        ..Default::default()
    }
}

/// Fold a finished pass into the previously stored status
fn fold_status(
    mut status: NamespaceMappingStatus,
    scope: &PassScope,
    outcomes: &[ResourceOutcome],
    elapsed: std::time::Duration,
) -> NamespaceMappingStatus {
    match scope {
        PassScope::Full => status.resource_status = outcomes.to_vec(),
        PassScope::Kinds(_) => {
            for outcome in outcomes {
                match status.resource_status.iter_mut().find(|o| o.kind == outcome.kind) {
                    Some(existing) => *existing = outcome.clone(),
                    None => status.resource_status.push(outcome.clone()),
                }
            }
        }
    }

    let failures: Vec<&ResourceOutcome> = outcomes.iter().filter(|o| o.is_failure()).collect();
    let stats = &mut status.sync_stats;
    if failures.is_empty() {
        stats.successful_syncs += 1;
        stats.consecutive_failures = 0;
        status.phase = SyncPhase::Completed;
        status.message = None;
    } else {
        stats.failed_syncs += 1;
        stats.consecutive_failures += 1;
        status.phase = SyncPhase::Failed;
        let first = failures[0];
        status.message = Some(format!(
            "{} of {} resource type(s) failed; {}: {}",
            failures.len(),
            outcomes.len(),
            first.kind,
            first.message.as_deref().unwrap_or("failed")
        ));
    }
    stats.last_sync_duration = Some(format!("{:.2}s", elapsed.as_secs_f64()));
    status.last_sync_time = Some(timestamp(Utc::now()));
    status
}
