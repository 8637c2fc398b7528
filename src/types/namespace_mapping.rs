// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{annotations, defaults};
use crate::error::{DrSyncError, Result};
use crate::resources::ResourceKind;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Replication of one source namespace into one destination namespace across
/// the clusters named by a ClusterMapping. The engine only writes its status.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(group = "dr-syncer.io", version = "v1alpha1", kind = "NamespaceMapping")]
#[kube(namespaced)]
#[kube(status = "NamespaceMappingStatus")]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMappingSpec {
    pub source_namespace: String,
    pub destination_namespace: String,
    pub cluster_mapping_ref: ClusterMappingRef,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default = "default_resource_types")]
    pub resource_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resource_types: Vec<String>,
    #[serde(default = "default_true")]
    pub scale_to_zero: bool,
    #[serde(default)]
    pub immutable_resource_config: ImmutableResourceConfig,
    #[serde(default)]
    pub pvc_config: PvcConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuous: Option<ContinuousConfig>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMappingRef {
    pub name: String,
    /// Defaults to the NamespaceMapping's own namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum SyncMode {
    #[default]
    Scheduled,
    Continuous,
    Manual,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum ImmutableHandling {
    /// Leave a differing immutable destination object untouched
    #[default]
    NoChange,
    /// Delete and re-create the destination object
    Recreate,
    /// Apply with force and let the API server decide
    ForceUpdate,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImmutableResourceConfig {
    #[serde(default)]
    pub default_handling: ImmutableHandling,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcConfig {
    /// Copy volume contents through the agents, not just the claim objects
    #[serde(default)]
    pub sync_data: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage_class_mappings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub access_mode_mappings: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContinuousConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_sync_interval_seconds: Option<u64>,
}

fn default_resource_types() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum SyncPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMappingStatus {
    #[serde(default)]
    pub phase: SyncPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sync_time: Option<String>,
    #[serde(default)]
    pub sync_stats: SyncStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_status: Vec<ResourceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_duration: Option<String>,
}

/// Result of replicating one resource type during a pass
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOutcome {
    pub kind: String,
    pub synced: u32,
    pub skipped: u32,
    pub failed: u32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResourceOutcome {
    pub fn is_failure(&self) -> bool {
        self.failed > 0
    }
}

impl NamespaceMapping {
    /// `namespace/name` key used to track runtimes
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Namespace the referenced ClusterMapping lives in
    pub fn cluster_mapping_namespace(&self) -> String {
        self.spec
            .cluster_mapping_ref
            .namespace
            .clone()
            .or_else(|| self.namespace())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Value of the manual trigger annotation, if set
    pub fn sync_trigger(&self) -> Option<&str> {
        self.annotations()
            .get(annotations::SYNC_NOW)
            .map(|s| s.as_str())
    }

    /// Resource kinds this mapping replicates: the allow list (`*` meaning every
    /// built-in namespaced kind) minus the deny list, in a stable order
    pub fn resource_kinds(&self) -> Result<Vec<ResourceKind>> {
        let mut kinds: Vec<ResourceKind> = Vec::new();
        for name in &self.spec.resource_types {
            if name.trim() == "*" {
                for kind in ResourceKind::defaults() {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                continue;
            }
            let kind = ResourceKind::from_str(name)?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        let excluded = self
            .spec
            .excluded_resource_types
            .iter()
            .map(|name| ResourceKind::from_str(name))
            .collect::<Result<Vec<_>>>()?;

        kinds.retain(|k| !excluded.contains(k));
        Ok(kinds)
    }

    /// Parsed cron schedule. Five-field expressions get a leading seconds field.
    pub fn cron_schedule(&self) -> Result<cron::Schedule> {
        let raw = self.spec.schedule.as_deref().unwrap_or(defaults::SCHEDULE);
        parse_schedule(raw)
    }

    pub fn status_or_default(&self) -> NamespaceMappingStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Parse a cron expression, accepting the five-field Kubernetes form
pub fn parse_schedule(raw: &str) -> Result<cron::Schedule> {
    let invalid =
        |reason: String| DrSyncError::Configuration(format!("Invalid schedule '{}': {}", raw, reason));

    let fields: Vec<&str> = raw.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        let weekdays = weekday_field(fields[4]).map_err(invalid)?;
        format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], weekdays)
    } else {
        raw.trim().to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a Kubernetes day-of-week field (0-7, Sunday is 0 or 7) into day
/// names, which the cron crate numbers differently
fn weekday_field(field: &str) -> std::result::Result<String, String> {
    let mut days = Vec::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step.parse().map_err(|_| format!("bad step in '{}'", item))?;
                if step == 0 {
                    return Err(format!("bad step in '{}'", item));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let number = |s: &str| -> std::result::Result<Option<usize>, String> {
            if !s.starts_with(|c: char| c.is_ascii_digit()) {
                return Ok(None);
            }
            match s.parse::<usize>() {
                Ok(n) if n <= 7 => Ok(Some(n)),
                _ => Err(format!("day of week '{}' out of range", s)),
            }
        };

        let bounds = if range == "*" {
            step.map(|_| (0, 6))
        } else if let Some((from, to)) = range.split_once('-') {
            match (number(from)?, number(to)?) {
                (Some(from), Some(to)) if from <= to => Some((from, to)),
                (Some(_), Some(_)) => return Err(format!("reversed range '{}'", range)),
                _ => None,
            }
        } else {
            number(range)?.map(|n| (n, if step.is_some() { 6 } else { n }))
        };

        match bounds {
            Some((from, to)) => days.extend(
                (from..=to)
                    .step_by(step.unwrap_or(1))
                    .map(|n| WEEKDAYS[n % 7].to_string()),
            ),
            // `*`, `?` and named days mean the same in both dialects
            None => days.push(item.to_string()),
        }
    }

    Ok(days.join(","))
}
