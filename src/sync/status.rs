// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! NamespaceMapping status updates. Only the status subresource is written.

use crate::constants::OPERATOR_NAME;
use crate::error::Result;
use crate::types::namespace_mapping::SyncPhase;
use crate::types::{NamespaceMapping, NamespaceMappingStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

/// RFC 3339 timestamp at second precision, as stored in status fields
pub fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Clone)]
pub struct StatusWriter {
    client: Client,
}

impl StatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<NamespaceMapping> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Status as currently stored; `None` when the mapping is gone
    pub async fn current(&self, namespace: &str, name: &str) -> Result<Option<NamespaceMappingStatus>> {
        Ok(self
            .api(namespace)
            .get_opt(name)
            .await?
            .map(|m| m.status.unwrap_or_default()))
    }

    async fn patch(&self, namespace: &str, name: &str, status: serde_json::Value) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::apply(OPERATOR_NAME), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    pub async fn write(&self, namespace: &str, name: &str, status: &NamespaceMappingStatus) -> Result<()> {
        debug!("Writing status of {}/{}: {:?}", namespace, name, status.phase);
        let mut value = serde_json::to_value(status)?;
        // Absent fields would survive a merge patch; clear them explicitly
        if status.message.is_none() {
            value["message"] = serde_json::Value::Null;
        }
        if status.resource_status.is_empty() {
            value["resourceStatus"] = json!([]);
        }
        self.patch(namespace, name, value).await
    }

    pub async fn set_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: SyncPhase,
        message: Option<&str>,
    ) -> Result<()> {
        self.patch(namespace, name, json!({ "phase": phase, "message": message }))
            .await
    }

    pub async fn set_next_sync_time(&self, namespace: &str, name: &str, next: DateTime<Utc>) -> Result<()> {
        self.patch(namespace, name, json!({ "nextSyncTime": timestamp(next) }))
            .await
    }
}
