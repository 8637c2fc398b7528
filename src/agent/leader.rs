// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lease-based leader election for the agent's singleton duties.

use crate::error::{is_conflict, is_not_found, Result};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Epoch seconds of the holder's last renewal
const ANNOTATION_RENEW_EPOCH: &str = "dr-syncer.io/renew-epoch";

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    /// Unique identity of this agent, normally its pod name
    pub holder_id: String,
    pub lease_duration_secs: i32,
    pub renew_interval: Duration,
}

impl LeaderElectionConfig {
    pub fn new(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            holder_id: holder_id.into(),
            lease_duration_secs: 15,
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Shared leader flag, cheap to clone into tasks
#[derive(Clone, Default)]
pub struct LeaderStatus {
    is_leader: Arc<AtomicBool>,
}

impl LeaderStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Used when leader election is disabled
    pub fn force_leader(&self) {
        self.is_leader.store(true, Ordering::Relaxed);
    }

    fn set_leader(&self, v: bool) {
        self.is_leader.store(v, Ordering::Relaxed);
    }
}

/// Acquire or renew the lease every renew interval until cancelled
pub async fn run(client: Client, config: LeaderElectionConfig, status: LeaderStatus, cancel: CancellationToken) {
    let api: Api<Lease> = Api::namespaced(client, &config.namespace);

    loop {
        match try_acquire_or_renew(&api, &config).await {
            Ok(acquired) => {
                if acquired && !status.is_leader() {
                    info!(holder = %config.holder_id, lease = %config.lease_name, "Acquired leadership");
                } else if !acquired && status.is_leader() {
                    warn!(holder = %config.holder_id, "Lost leadership");
                }
                status.set_leader(acquired);
            }
            Err(e) => {
                error!("Leader election error: {}", e);
                status.set_leader(false);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.renew_interval) => {}
        }
    }
    status.set_leader(false);
}

/// Release the lease if this agent holds it
pub async fn step_down(client: &Client, config: &LeaderElectionConfig) {
    let api: Api<Lease> = Api::namespaced(client.clone(), &config.namespace);

    let existing = match api.get_opt(&config.lease_name).await {
        Ok(Some(lease)) => lease,
        Ok(None) => return,
        Err(e) => {
            debug!("Could not read lease for step-down: {}", e);
            return;
        }
    };

    let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
    if holder != Some(config.holder_id.as_str()) {
        return;
    }

    let mut updated = existing.clone();
    if let Some(spec) = updated.spec.as_mut() {
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
    }
    match api.replace(&config.lease_name, &PostParams::default(), &updated).await {
        Ok(_) => info!("Stepped down from leadership"),
        Err(e) => warn!("Failed to step down: {}", e),
    }
}

fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn try_acquire_or_renew(api: &Api<Lease>, config: &LeaderElectionConfig) -> Result<bool> {
    let now = epoch_secs();

    let Some(existing) = api.get_opt(&config.lease_name).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(config.lease_name.clone()),
                namespace: Some(config.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_RENEW_EPOCH.to_string(),
                    now.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(config.holder_id.clone()),
                lease_duration_seconds: Some(config.lease_duration_secs),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        return match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!("Lease already created by another agent");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        };
    };

    let spec = existing.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    let renewed: Option<i64> = existing
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_RENEW_EPOCH))
        .and_then(|s| s.parse().ok());
    let duration = i64::from(
        spec.and_then(|s| s.lease_duration_seconds)
            .unwrap_or(config.lease_duration_secs),
    );

    let ours = holder == Some(config.holder_id.as_str());
    if !ours {
        let expired = holder.is_none() || renewed.map_or(true, |ts| now > ts + duration);
        if !expired {
            debug!(holder = ?holder, "Lease held by another agent");
            return Ok(false);
        }
    }

    let mut updated = existing.clone();
    if let Some(spec) = updated.spec.as_mut() {
        if !ours {
            spec.holder_identity = Some(config.holder_id.clone());
            spec.lease_duration_seconds = Some(config.lease_duration_secs);
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
    }
    updated
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_RENEW_EPOCH.to_string(), now.to_string());

    match api.replace(&config.lease_name, &PostParams::default(), &updated).await {
        Ok(_) => Ok(true),
        Err(e) if is_conflict(&e) => {
            debug!("Conflict writing lease, will retry");
            Ok(false)
        }
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
