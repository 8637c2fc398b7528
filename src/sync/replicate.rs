// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Replication of one resource kind from a source namespace into its
//! destination namespace.

use crate::error::{is_invalid, DrSyncError, Result};
use crate::resources::{ResourceKind, TransformContext};
use crate::types::namespace_mapping::ImmutableHandling;
use crate::types::ResourceOutcome;
use kube::api::DynamicObject;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

pub const STATUS_SYNCED: &str = "Synced";
pub const STATUS_PARTIAL: &str = "PartiallySynced";
pub const STATUS_FAILED: &str = "Failed";

/// What happened to a single object
#[derive(Debug, PartialEq, Eq)]
enum Applied {
    Written,
    Unchanged,
}

/// Copy every eligible object of `kind` from `source_namespace` on the source
/// cluster into the destination namespace named by `ctx`.
///
/// Failures of individual objects are counted and do not stop the rest of
/// the kind. The first error message is kept on the outcome.
#[instrument(skip(source, destination, ctx), fields(kind = %kind, from = %source_namespace, to = %ctx.destination_namespace))]
pub async fn replicate_kind(
    kind: &ResourceKind,
    source: &Client,
    destination: &Client,
    source_namespace: &str,
    ctx: &TransformContext,
    immutable: ImmutableHandling,
) -> ResourceOutcome {
    let mut outcome = ResourceOutcome {
        kind: kind.to_string(),
        ..Default::default()
    };

    let objects = match kind.fetch(source, source_namespace).await {
        Ok(objects) => objects,
        Err(e) => {
            warn!("Failed to list {} in {}: {}", kind, source_namespace, e);
            outcome.failed = 1;
            outcome.status = STATUS_FAILED.to_string();
            outcome.message = Some(e.to_string());
            return outcome;
        }
    };

    for object in &objects {
        match replicate_object(kind, destination, object, ctx, immutable).await {
            Ok(Applied::Written) => outcome.synced += 1,
            Ok(Applied::Unchanged) => outcome.skipped += 1,
            Err(e) => {
                warn!("Failed to replicate {} {}: {}", kind, object.name_any(), e);
                outcome.failed += 1;
                if outcome.message.is_none() {
                    outcome.message = Some(format!("{}: {}", object.name_any(), e));
                }
            }
        }
    }

    outcome.status = match (outcome.failed, outcome.synced + outcome.skipped) {
        (0, _) => STATUS_SYNCED,
        (_, 0) => STATUS_FAILED,
        _ => STATUS_PARTIAL,
    }
    .to_string();

    info!(
        "{}: {} synced, {} unchanged, {} failed",
        kind, outcome.synced, outcome.skipped, outcome.failed
    );
    outcome
}

async fn replicate_object(
    kind: &ResourceKind,
    destination: &Client,
    source: &DynamicObject,
    ctx: &TransformContext,
    immutable: ImmutableHandling,
) -> Result<Applied> {
    let desired = kind.transform(source, ctx);
    let name = desired.name_any();
    let namespace = ctx.destination_namespace.as_str();

    let Some(existing) = kind.get(destination, namespace, &name).await? else {
        kind.apply(destination, namespace, &desired).await?;
        debug!("Created {} {}/{}", kind, namespace, name);
        return Ok(Applied::Written);
    };

    if !kind.differs(&desired, &existing) {
        return Ok(Applied::Unchanged);
    }

    if kind.is_immutable(&existing) {
        match immutable {
            ImmutableHandling::NoChange => {
                info!(
                    "{} {}/{} is immutable and differs from its source, leaving it unchanged",
                    kind, namespace, name
                );
                return Ok(Applied::Unchanged);
            }
            ImmutableHandling::Recreate => {
                debug!("Recreating immutable {} {}/{}", kind, namespace, name);
                kind.delete(destination, namespace, &name).await?;
            }
            ImmutableHandling::ForceUpdate => {
                // Metadata stays writable on immutable objects; only a
                // rejected write needs the object replaced
                match kind.apply(destination, namespace, &desired).await {
                    Ok(()) => {
                        debug!("Updated immutable {} {}/{} in place", kind, namespace, name);
                        return Ok(Applied::Written);
                    }
                    Err(DrSyncError::KubeError(e)) if is_invalid(&e) => {
                        info!(
                            "{} {}/{} rejected the update as immutable, replacing it",
                            kind, namespace, name
                        );
                        kind.delete(destination, namespace, &name).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    kind.apply(destination, namespace, &desired).await?;
    debug!("Updated {} {}/{}", kind, namespace, name);
    Ok(Applied::Written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeApiServer;
    use serde_json::json;

    const SOURCE: &str = "/api/v1/namespaces/app/configmaps";
    const DESTINATION: &str = "/api/v1/namespaces/app-dr/configmaps";

    fn ctx() -> TransformContext {
        TransformContext {
            destination_namespace: "app-dr".to_string(),
            scale_to_zero: true,
            ..Default::default()
        }
    }

    fn configmap(namespace: &str, name: &str, value: &str, immutable: bool) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": { "value": value },
            "immutable": immutable,
        })
    }

    #[tokio::test]
    async fn test_replicate_creates_missing_objects() {
        let server = FakeApiServer::new();
        server.insert(SOURCE, configmap("app", "settings", "a", false));
        server.insert(SOURCE, configmap("app", "kube-root-ca.crt", "ca", false));
        let client = server.client();

        let outcome = replicate_kind(
            &ResourceKind::ConfigMap,
            &client,
            &client,
            "app",
            &ctx(),
            ImmutableHandling::NoChange,
        )
        .await;

        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.status, STATUS_SYNCED);
        let copied = server.get(DESTINATION, "settings").unwrap();
        assert_eq!(copied["data"]["value"], "a");
        assert!(server.get(DESTINATION, "kube-root-ca.crt").is_none());
    }

    #[tokio::test]
    async fn test_replicate_skips_identical_objects() {
        let server = FakeApiServer::new();
        server.insert(SOURCE, configmap("app", "settings", "a", false));
        let client = server.client();

        let first = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::NoChange).await;
        let patches = server.count_requests("PATCH");
        let second = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::NoChange).await;

        assert_eq!(first.synced, 1);
        assert_eq!(second.synced, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(server.count_requests("PATCH"), patches);
    }

    #[tokio::test]
    async fn test_immutable_no_change_leaves_destination() {
        let server = FakeApiServer::new();
        server.insert(SOURCE, configmap("app", "settings", "new", true));
        server.insert(DESTINATION, configmap("app-dr", "settings", "old", true));
        let client = server.client();

        let outcome = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::NoChange).await;

        assert_eq!(outcome.skipped, 1);
        assert_eq!(server.get(DESTINATION, "settings").unwrap()["data"]["value"], "old");
    }

    #[tokio::test]
    async fn test_immutable_recreate_deletes_then_applies() {
        let server = FakeApiServer::new();
        server.insert(SOURCE, configmap("app", "settings", "new", true));
        server.insert(DESTINATION, configmap("app-dr", "settings", "old", true));
        let client = server.client();

        let outcome = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::Recreate).await;

        assert_eq!(outcome.synced, 1);
        assert_eq!(server.count_requests("DELETE"), 1);
        assert_eq!(server.get(DESTINATION, "settings").unwrap()["data"]["value"], "new");
    }

    #[tokio::test]
    async fn test_immutable_force_update_replaces_rejected_object() {
        let server = FakeApiServer::new();
        server.insert(SOURCE, configmap("app", "settings", "new", true));
        server.insert(DESTINATION, configmap("app-dr", "settings", "old", true));
        let client = server.client();

        let outcome = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::ForceUpdate).await;

        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(server.count_requests("DELETE"), 1);
        assert_eq!(server.get(DESTINATION, "settings").unwrap()["data"]["value"], "new");
    }

    #[tokio::test]
    async fn test_immutable_force_update_keeps_object_for_metadata_changes() {
        let server = FakeApiServer::new();
        let mut source = configmap("app", "settings", "same", true);
        source["metadata"]["labels"] = json!({ "tier": "backend" });
        server.insert(SOURCE, source);
        server.insert(DESTINATION, configmap("app-dr", "settings", "same", true));
        let client = server.client();

        let outcome = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::ForceUpdate).await;

        assert_eq!(outcome.synced, 1);
        assert_eq!(server.count_requests("DELETE"), 0);
        let copied = server.get(DESTINATION, "settings").unwrap();
        assert_eq!(copied["metadata"]["labels"]["tier"], "backend");
    }

    #[tokio::test]
    async fn test_partial_failure_is_counted() {
        let server = FakeApiServer::new();
        server.insert(SOURCE, configmap("app", "first", "a", false));
        server.insert(SOURCE, configmap("app", "second", "b", false));
        server.fail_next("PATCH", "configmaps/first", 500);
        let client = server.client();

        let outcome = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::NoChange).await;

        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.status, STATUS_PARTIAL);
        assert!(outcome.message.unwrap().starts_with("first:"));
        assert!(server.get(DESTINATION, "second").is_some());
    }

    #[tokio::test]
    async fn test_list_failure_fails_the_kind() {
        let server = FakeApiServer::new();
        server.fail_next("GET", "namespaces/app/configmaps", 500);
        let client = server.client();

        let outcome = replicate_kind(&ResourceKind::ConfigMap, &client, &client, "app", &ctx(), ImmutableHandling::NoChange).await;

        assert!(outcome.is_failure());
        assert_eq!(outcome.status, STATUS_FAILED);
    }
}
