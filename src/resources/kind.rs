// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The set of resource kinds a NamespaceMapping can replicate.

use crate::constants::{labels, OPERATOR_NAME};
use crate::error::{is_not_found, DrSyncError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    core::{GroupVersion, GroupVersionKind},
    discovery::{self, ApiResource},
    Api, Client, ResourceExt,
};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use tracing::{debug, instrument};

/// A kind outside the built-in set, identified by group, version and plural.
///
/// `kind` is empty until [`ResourceKind::resolve`] looks it up when the
/// mapping named the resource by its plural.
#[derive(Clone, Debug)]
pub struct CustomKind {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
}

impl CustomKind {
    pub fn is_resolved(&self) -> bool {
        !self.kind.is_empty()
    }
}

impl PartialEq for CustomKind {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.version == other.version && self.plural == other.plural
    }
}

impl Eq for CustomKind {}

impl Hash for CustomKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.version.hash(state);
        self.plural.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConfigMap,
    Secret,
    Deployment,
    Service,
    Ingress,
    PersistentVolumeClaim,
    PersistentVolume,
    Other(CustomKind),
}

impl ResourceKind {
    /// Kinds covered by the `*` wildcard. PersistentVolumes are cluster-scoped
    /// and must be requested explicitly.
    pub fn defaults() -> Vec<ResourceKind> {
        vec![
            ResourceKind::ConfigMap,
            ResourceKind::Secret,
            ResourceKind::Deployment,
            ResourceKind::Service,
            ResourceKind::Ingress,
            ResourceKind::PersistentVolumeClaim,
        ]
    }

    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::Ingress => ApiResource::erase::<Ingress>(&()),
            ResourceKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
            ResourceKind::PersistentVolume => ApiResource::erase::<PersistentVolume>(&()),
            ResourceKind::Other(custom) => ApiResource {
                group: custom.group.clone(),
                version: custom.version.clone(),
                api_version: format!("{}/{}", custom.group, custom.version),
                kind: custom.kind.clone(),
                plural: custom.plural.clone(),
            },
        }
    }

    /// Fill in the Kind of a custom resource named by its plural, using the
    /// API server's discovery document for its group version
    pub async fn resolve(self, client: &Client) -> Result<ResourceKind> {
        let custom = match self {
            ResourceKind::Other(custom) if !custom.is_resolved() => custom,
            resolved => return Ok(resolved),
        };

        let gv = GroupVersion::gv(&custom.group, &custom.version);
        let group = discovery::pinned_group(client, &gv).await?;
        let (ar, _) = group
            .versioned_resources(&custom.version)
            .into_iter()
            .find(|(ar, _)| ar.plural == custom.plural)
            .ok_or_else(|| {
                DrSyncError::Configuration(format!(
                    "Resource type '{}' is not served by the cluster",
                    ResourceKind::Other(custom.clone())
                ))
            })?;

        debug!("Resolved {}.{} to kind {}", custom.plural, gv.api_version(), ar.kind);
        Ok(ResourceKind::Other(CustomKind { kind: ar.kind, ..custom }))
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceKind::PersistentVolume)
    }

    /// Whether objects of this kind may carry `immutable: true`
    pub fn supports_immutable(&self) -> bool {
        matches!(self, ResourceKind::ConfigMap | ResourceKind::Secret)
    }

    fn api(&self, client: Client, namespace: &str) -> Api<DynamicObject> {
        let ar = self.api_resource();
        if self.is_namespaced() {
            Api::namespaced_with(client, namespace, &ar)
        } else {
            Api::all_with(client, &ar)
        }
    }

    /// List the objects of this kind that belong to `namespace` and are
    /// eligible for replication
    #[instrument(skip(self, client), fields(kind = %self))]
    pub async fn fetch(&self, client: &Client, namespace: &str) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(client.clone(), namespace)
            .list(&ListParams::default())
            .await?;

        let objects: Vec<DynamicObject> = list
            .items
            .into_iter()
            .filter(|obj| self.belongs_to(obj, namespace))
            .filter(|obj| self.should_replicate(obj))
            .collect();

        debug!("Fetched {} {} object(s) from {}", objects.len(), self, namespace);
        Ok(objects)
    }

    /// Fetch a single object by name; `None` when absent
    pub async fn get(
        &self,
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(client.clone(), namespace).get_opt(name).await?)
    }

    /// Server-side apply of a transformed object
    #[instrument(skip(self, client, object), fields(kind = %self, name = %object.name_any()))]
    pub async fn apply(&self, client: &Client, namespace: &str, object: &DynamicObject) -> Result<()> {
        let pp = PatchParams::apply(OPERATOR_NAME).force();
        self.api(client.clone(), namespace)
            .patch(&object.name_any(), &pp, &Patch::Apply(object))
            .await?;
        Ok(())
    }

    /// Delete an object; absence counts as success
    pub async fn delete(&self, client: &Client, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// PersistentVolumes are listed cluster-wide; keep those claimed from `namespace`
    pub(crate) fn belongs_to(&self, obj: &DynamicObject, namespace: &str) -> bool {
        match self {
            ResourceKind::PersistentVolume => obj
                .data
                .pointer("/spec/claimRef/namespace")
                .and_then(|v| v.as_str())
                .is_some_and(|ns| ns == namespace),
            _ => true,
        }
    }

    fn should_replicate(&self, obj: &DynamicObject) -> bool {
        let managed_by_us = obj
            .labels()
            .get(labels::MANAGED_BY)
            .is_some_and(|v| v == OPERATOR_NAME);
        if managed_by_us {
            return false;
        }

        match self {
            ResourceKind::ConfigMap => obj.name_any() != "kube-root-ca.crt",
            ResourceKind::Secret => obj
                .data
                .get("type")
                .and_then(|t| t.as_str())
                .map_or(true, |t| t != "kubernetes.io/service-account-token"),
            _ => true,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ConfigMap => write!(f, "ConfigMap"),
            ResourceKind::Secret => write!(f, "Secret"),
            ResourceKind::Deployment => write!(f, "Deployment"),
            ResourceKind::Service => write!(f, "Service"),
            ResourceKind::Ingress => write!(f, "Ingress"),
            ResourceKind::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
            ResourceKind::PersistentVolume => write!(f, "PersistentVolume"),
            ResourceKind::Other(custom) => {
                write!(f, "{}.{}/{}", custom.plural, custom.group, custom.version)
            }
        }
    }
}

impl FromStr for ResourceKind {
    type Err = DrSyncError;

    /// Accepts plural, singular and short names of the built-in kinds, and
    /// `plural.group/version` or `Kind.group/version` for anything else
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        let kind = match name.to_ascii_lowercase().as_str() {
            "configmaps" | "configmap" | "cm" => ResourceKind::ConfigMap,
            "secrets" | "secret" => ResourceKind::Secret,
            "deployments" | "deployment" | "deploy" => ResourceKind::Deployment,
            "services" | "service" | "svc" => ResourceKind::Service,
            "ingresses" | "ingress" | "ing" => ResourceKind::Ingress,
            "persistentvolumeclaims" | "persistentvolumeclaim" | "pvcs" | "pvc" => {
                ResourceKind::PersistentVolumeClaim
            }
            "persistentvolumes" | "persistentvolume" | "pvs" | "pv" => {
                ResourceKind::PersistentVolume
            }
            _ => return parse_custom(name),
        };
        Ok(kind)
    }
}

fn parse_custom(name: &str) -> Result<ResourceKind> {
    let invalid = || {
        DrSyncError::Configuration(format!(
            "Unknown resource type '{}', expected a built-in kind or plural.group/version",
            name
        ))
    };

    let (resource_group, version) = name.split_once('/').ok_or_else(invalid)?;
    let (resource, group) = resource_group.split_once('.').ok_or_else(invalid)?;
    if resource.is_empty() || group.is_empty() || version.is_empty() {
        return Err(invalid());
    }

    // A capitalised first segment is a Kind; anything else is the plural
    let custom = if resource.starts_with(|c: char| c.is_ascii_uppercase()) {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, resource));
        CustomKind {
            group: group.to_string(),
            version: version.to_string(),
            plural: ar.plural,
            kind: resource.to_string(),
        }
    } else {
        CustomKind {
            group: group.to_string(),
            version: version.to_string(),
            plural: resource.to_ascii_lowercase(),
            kind: String::new(),
        }
    };
    Ok(ResourceKind::Other(custom))
}

/// Resolve every custom kind in `kinds` against `client`
pub async fn resolve_kinds(kinds: Vec<ResourceKind>, client: &Client) -> Result<Vec<ResourceKind>> {
    let mut resolved = Vec::with_capacity(kinds.len());
    for kind in kinds {
        resolved.push(kind.resolve(client).await?);
    }
    Ok(resolved)
}
