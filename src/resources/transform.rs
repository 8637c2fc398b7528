// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Turning a source object into its destination form, and deciding whether
//! the destination already matches.

use crate::constants::{annotations, labels};
use crate::resources::ResourceKind;
use crate::types::namespace_mapping::PvcConfig;
use kube::api::{DynamicObject, ObjectMeta};
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// PVC annotations that describe binding in the source cluster
const PVC_BINDING_ANNOTATIONS: &[&str] = &[
    "pv.kubernetes.io/bind-completed",
    "pv.kubernetes.io/bound-by-controller",
    "volume.beta.kubernetes.io/storage-provisioner",
    "volume.kubernetes.io/storage-provisioner",
    "volume.kubernetes.io/selected-node",
];

/// Mapping-level settings that influence how objects are rewritten
#[derive(Clone, Debug, Default)]
pub struct TransformContext {
    pub destination_namespace: String,
    pub scale_to_zero: bool,
    pub pvc_config: PvcConfig,
}

impl ResourceKind {
    /// Build the destination object for `source`: server-populated metadata and
    /// status are dropped, the namespace is rewritten, dr-syncer annotations
    /// are filtered, and per-kind rules are applied
    pub fn transform(&self, source: &DynamicObject, ctx: &TransformContext) -> DynamicObject {
        let ar = self.api_resource();
        let mut object = DynamicObject::new(&source.name_any(), &ar);

        let mut object_labels = source.metadata.labels.clone().unwrap_or_default();
        object_labels.insert(labels::REPLICATED.to_string(), "true".to_string());

        object.metadata = ObjectMeta {
            name: source.metadata.name.clone(),
            namespace: self
                .is_namespaced()
                .then(|| ctx.destination_namespace.clone()),
            labels: Some(object_labels),
            annotations: None,
            ..Default::default()
        };

        let mut object_annotations = filter_annotations(source.annotations());

        let mut data = source.data.clone();
        if let Some(fields) = data.as_object_mut() {
            fields.remove("status");
        }

        match self {
            ResourceKind::Deployment => {
                scale_deployment(&mut data, source.annotations(), &mut object_annotations, ctx)
            }
            ResourceKind::Service => strip_service_addresses(&mut data),
            ResourceKind::PersistentVolumeClaim => {
                for key in PVC_BINDING_ANNOTATIONS {
                    object_annotations.remove(*key);
                }
                rewrite_pvc(&mut data, &ctx.pvc_config);
            }
            ResourceKind::PersistentVolume => {
                rewrite_pv(&mut data, &ctx.destination_namespace);
            }
            _ => {}
        }

        if !object_annotations.is_empty() {
            object.metadata.annotations = Some(object_annotations);
        }
        object.data = data;
        object
    }

    /// Whether `existing` needs to be updated to match `desired`.
    ///
    /// Fields the API server fills in on the destination (defaults, assigned
    /// IPs) are ignored: only what `desired` specifies is compared.
    pub fn differs(&self, desired: &DynamicObject, existing: &DynamicObject) -> bool {
        if !map_contains(existing.labels(), desired.labels()) {
            return true;
        }
        if !map_contains(existing.annotations(), desired.annotations()) {
            return true;
        }
        !json_contains(&existing.data, &desired.data)
    }

    /// Whether `object` was created with `immutable: true`
    pub fn is_immutable(&self, object: &DynamicObject) -> bool {
        self.supports_immutable()
            && object
                .data
                .get("immutable")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }
}

fn filter_annotations(source: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    source
        .iter()
        .filter(|(k, _)| !k.starts_with(annotations::PREFIX) && k.as_str() != annotations::LAST_APPLIED)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn scale_deployment(
    data: &mut Value,
    source_annotations: &BTreeMap<String, String>,
    object_annotations: &mut BTreeMap<String, String>,
    ctx: &TransformContext,
) {
    let keep_replicas = source_annotations
        .get(annotations::SCALE_OVERRIDE)
        .is_some_and(|v| v == "true");
    if !ctx.scale_to_zero || keep_replicas {
        return;
    }

    let original = data
        .pointer("/spec/replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    object_annotations.insert(
        annotations::ORIGINAL_REPLICAS.to_string(),
        original.to_string(),
    );

    if let Some(spec) = data.get_mut("spec").and_then(|s| s.as_object_mut()) {
        spec.insert("replicas".to_string(), json!(0));
    }
}

fn strip_service_addresses(data: &mut Value) {
    let Some(spec) = data.get_mut("spec").and_then(|s| s.as_object_mut()) else {
        return;
    };

    let headless = spec
        .get("clusterIP")
        .and_then(|v| v.as_str())
        .is_some_and(|ip| ip == "None");
    if !headless {
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
    }
    spec.remove("healthCheckNodePort");

    if let Some(ports) = spec.get_mut("ports").and_then(|p| p.as_array_mut()) {
        for port in ports.iter_mut().filter_map(|p| p.as_object_mut()) {
            port.remove("nodePort");
        }
    }
}

fn rewrite_pvc(data: &mut Value, config: &PvcConfig) {
    let Some(spec) = data.get_mut("spec").and_then(|s| s.as_object_mut()) else {
        return;
    };

    spec.remove("volumeName");

    let mapped_class = spec
        .get("storageClassName")
        .and_then(|v| v.as_str())
        .and_then(|class| config.storage_class_mappings.get(class))
        .cloned();
    if let Some(class) = mapped_class {
        spec.insert("storageClassName".to_string(), json!(class));
    }

    if let Some(modes) = spec.get_mut("accessModes").and_then(|m| m.as_array_mut()) {
        for mode in modes.iter_mut() {
            let mapped = mode
                .as_str()
                .and_then(|m| config.access_mode_mappings.get(m))
                .cloned();
            if let Some(mapped) = mapped {
                *mode = json!(mapped);
            }
        }
    }
}

fn rewrite_pv(data: &mut Value, destination_namespace: &str) {
    let Some(spec) = data.get_mut("spec").and_then(|s| s.as_object_mut()) else {
        return;
    };

    spec.insert("persistentVolumeReclaimPolicy".to_string(), json!("Retain"));

    if let Some(claim_ref) = spec.get_mut("claimRef").and_then(|c| c.as_object_mut()) {
        claim_ref.remove("uid");
        claim_ref.remove("resourceVersion");
        claim_ref.insert("namespace".to_string(), json!(destination_namespace));
    }
}

fn map_contains(existing: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> bool {
    desired.iter().all(|(k, v)| existing.get(k) == Some(v))
}

/// Whether every field present in `desired` has the same value in `existing`
fn json_contains(existing: &Value, desired: &Value) -> bool {
    match (existing, desired) {
        (_, Value::Null) => true,
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(k, v)| match have.get(k) {
            Some(h) => json_contains(h, v),
            None => v.is_null(),
        }),
        (Value::Array(have), Value::Array(want)) => {
            have.len() == want.len() && have.iter().zip(want).all(|(h, w)| json_contains(h, w))
        }
        (have, want) => have == want,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_object(kind: &ResourceKind, name: &str, data: Value) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &kind.api_resource());
        obj.metadata.namespace = Some("app".to_string());
        obj.metadata.uid = Some("uid-1".to_string());
        obj.metadata.resource_version = Some("42".to_string());
        obj.data = data;
        obj
    }

    fn make_ctx(scale_to_zero: bool) -> TransformContext {
        TransformContext {
            destination_namespace: "app-dr".to_string(),
            scale_to_zero,
            pvc_config: PvcConfig::default(),
        }
    }

    #[test]
    fn test_transform_strips_server_metadata_and_status() {
        let kind = ResourceKind::ConfigMap;
        let mut source = make_object(
            &kind,
            "settings",
            json!({ "data": { "a": "1" }, "status": { "x": 1 } }),
        );
        source.metadata.annotations = Some(BTreeMap::from([
            (annotations::SYNC_NOW.to_string(), "1".to_string()),
            (annotations::LAST_APPLIED.to_string(), "{}".to_string()),
            ("keep.this/annotation".to_string(), "value".to_string()),
        ]));

        let out = kind.transform(&source, &make_ctx(true));

        assert_eq!(out.metadata.namespace.as_deref(), Some("app-dr"));
        assert!(out.metadata.uid.is_none());
        assert!(out.metadata.resource_version.is_none());
        assert!(out.data.get("status").is_none());
        assert_eq!(out.data["data"]["a"], "1");
        let annotations = out.metadata.annotations.unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations["keep.this/annotation"], "value");
        assert_eq!(out.metadata.labels.unwrap()[labels::REPLICATED], "true");
        assert_eq!(out.types.unwrap().kind, "ConfigMap");
    }

    #[test]
    fn test_deployment_scaled_to_zero() {
        let kind = ResourceKind::Deployment;
        let source = make_object(&kind, "web", json!({ "spec": { "replicas": 3 } }));

        let out = kind.transform(&source, &make_ctx(true));

        assert_eq!(out.data["spec"]["replicas"], 0);
        assert_eq!(
            out.metadata.annotations.unwrap()[annotations::ORIGINAL_REPLICAS],
            "3"
        );
    }

    #[test]
    fn test_deployment_scale_override_keeps_replicas() {
        let kind = ResourceKind::Deployment;
        let mut source = make_object(&kind, "web", json!({ "spec": { "replicas": 3 } }));
        source.metadata.annotations = Some(BTreeMap::from([(
            annotations::SCALE_OVERRIDE.to_string(),
            "true".to_string(),
        )]));

        let out = kind.transform(&source, &make_ctx(true));
        assert_eq!(out.data["spec"]["replicas"], 3);

        let unscaled = kind.transform(&make_object(&kind, "web", json!({ "spec": { "replicas": 2 } })), &make_ctx(false));
        assert_eq!(unscaled.data["spec"]["replicas"], 2);
    }

    #[test]
    fn test_service_cluster_ip_removed() {
        let kind = ResourceKind::Service;
        let source = make_object(
            &kind,
            "web",
            json!({ "spec": {
                "clusterIP": "10.0.0.1",
                "clusterIPs": ["10.0.0.1"],
                "ports": [{ "port": 80, "nodePort": 30080 }]
            } }),
        );

        let out = kind.transform(&source, &make_ctx(true));

        assert!(out.data["spec"].get("clusterIP").is_none());
        assert!(out.data["spec"].get("clusterIPs").is_none());
        assert!(out.data["spec"]["ports"][0].get("nodePort").is_none());
        assert_eq!(out.data["spec"]["ports"][0]["port"], 80);
    }

    #[test]
    fn test_headless_service_keeps_none() {
        let kind = ResourceKind::Service;
        let source = make_object(&kind, "db", json!({ "spec": { "clusterIP": "None" } }));
        let out = kind.transform(&source, &make_ctx(true));
        assert_eq!(out.data["spec"]["clusterIP"], "None");
    }

    #[test]
    fn test_pvc_binding_removed_and_class_mapped() {
        let kind = ResourceKind::PersistentVolumeClaim;
        let mut source = make_object(
            &kind,
            "data",
            json!({ "spec": {
                "volumeName": "pv-123",
                "storageClassName": "fast",
                "accessModes": ["ReadWriteOnce"]
            } }),
        );
        source.metadata.annotations = Some(BTreeMap::from([(
            "pv.kubernetes.io/bind-completed".to_string(),
            "yes".to_string(),
        )]));
        let mut ctx = make_ctx(true);
        ctx.pvc_config
            .storage_class_mappings
            .insert("fast".to_string(), "standard".to_string());
        ctx.pvc_config
            .access_mode_mappings
            .insert("ReadWriteOnce".to_string(), "ReadWriteMany".to_string());

        let out = kind.transform(&source, &ctx);

        assert!(out.data["spec"].get("volumeName").is_none());
        assert_eq!(out.data["spec"]["storageClassName"], "standard");
        assert_eq!(out.data["spec"]["accessModes"][0], "ReadWriteMany");
        assert!(out.metadata.annotations.is_none());
    }

    #[test]
    fn test_pv_claim_ref_rewritten() {
        let kind = ResourceKind::PersistentVolume;
        let source = make_object(
            &kind,
            "pv-1",
            json!({ "spec": {
                "persistentVolumeReclaimPolicy": "Delete",
                "claimRef": { "namespace": "app", "name": "data", "uid": "u", "resourceVersion": "1" }
            } }),
        );

        let out = kind.transform(&source, &make_ctx(true));

        assert!(out.metadata.namespace.is_none());
        assert_eq!(out.data["spec"]["persistentVolumeReclaimPolicy"], "Retain");
        assert_eq!(out.data["spec"]["claimRef"]["namespace"], "app-dr");
        assert!(out.data["spec"]["claimRef"].get("uid").is_none());
    }

    #[test]
    fn test_differs_ignores_server_defaults() {
        let kind = ResourceKind::Service;
        let desired = make_object(&kind, "web", json!({ "spec": { "ports": [{ "port": 80 }] } }));
        let mut existing = desired.clone();
        existing.data = json!({ "spec": {
            "clusterIP": "10.1.1.1",
            "ports": [{ "port": 80, "protocol": "TCP" }]
        } });

        assert!(!kind.differs(&desired, &existing));

        existing.data["spec"]["ports"][0]["port"] = json!(81);
        assert!(kind.differs(&desired, &existing));
    }

    #[test]
    fn test_differs_on_label_change() {
        let kind = ResourceKind::ConfigMap;
        let mut desired = make_object(&kind, "c", json!({ "data": { "a": "1" } }));
        let existing = desired.clone();
        desired.metadata.labels = Some(BTreeMap::from([("tier".to_string(), "web".to_string())]));
        assert!(kind.differs(&desired, &existing));
    }

    #[test]
    fn test_is_immutable() {
        let kind = ResourceKind::ConfigMap;
        let obj = make_object(&kind, "c", json!({ "immutable": true, "data": {} }));
        assert!(kind.is_immutable(&obj));
        let deploy = make_object(&ResourceKind::Deployment, "d", json!({ "immutable": true }));
        assert!(!ResourceKind::Deployment.is_immutable(&deploy));
    }
}
