// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities for running `kube::Client` against an in-memory API server.

use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

/// A stateful fake Kubernetes API server.
///
/// Objects live in collections keyed by their API path (for example
/// `/api/v1/namespaces/app/configmaps`). Supports get, list with label
/// selectors, create, replace, merge and apply patches (including the status
/// subresource) and delete, returning the same Status bodies as a real server.
#[derive(Clone)]
pub struct FakeApiServer {
    collections: Arc<Mutex<Collections>>,
    requests: Arc<Mutex<Vec<(String, String)>>>,
    failures: Arc<Mutex<VecDeque<InjectedFailure>>>,
    discovery: Arc<Mutex<BTreeMap<String, Value>>>,
    resource_version: Arc<AtomicU64>,
    ready_pods: bool,
}

#[derive(Clone)]
struct InjectedFailure {
    method: String,
    path_fragment: String,
    code: u16,
}

/// Parsed request path
struct Target {
    prefix: String,
    plural: String,
    namespace: Option<String>,
    name: Option<String>,
    subresource: Option<String>,
}

impl Target {
    fn parse(path: &str) -> Option<Target> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let prefix_len = match segments.first() {
            Some(&"api") => 2,
            Some(&"apis") => 3,
            _ => return None,
        };
        if segments.len() <= prefix_len {
            return None;
        }

        let prefix = format!("/{}", segments[..prefix_len].join("/"));
        let rest = &segments[prefix_len..];
        let owned = |i: usize| rest.get(i).map(|s| s.to_string());

        if rest.len() >= 3 && rest[0] == "namespaces" {
            Some(Target {
                prefix,
                plural: rest[2].to_string(),
                namespace: owned(1),
                name: owned(3),
                subresource: owned(4),
            })
        } else {
            Some(Target {
                prefix,
                plural: rest[0].to_string(),
                namespace: None,
                name: owned(1),
                subresource: owned(2),
            })
        }
    }

    fn collection(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/namespaces/{}/{}", self.prefix, ns, self.plural),
            None => format!("{}/{}", self.prefix, self.plural),
        }
    }

    fn api_version(&self) -> String {
        self.prefix
            .trim_start_matches("/apis/")
            .trim_start_matches("/api/")
            .to_string()
    }
}

impl FakeApiServer {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(Mutex::new(BTreeMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            discovery: Arc::new(Mutex::new(BTreeMap::new())),
            resource_version: Arc::new(AtomicU64::new(1)),
            ready_pods: false,
        }
    }

    /// Pods become Running and Ready (and get a node) as soon as they are created
    pub fn with_ready_pods(mut self) -> Self {
        self.ready_pods = true;
        self
    }

    /// Serve an APIResourceList for `group_version` (e.g. `cert-manager.io/v1`).
    /// Resources are `(plural, kind, namespaced)`.
    pub fn serve_api_resources(&self, group_version: &str, resources: Vec<(&str, &str, bool)>) {
        let resources: Vec<Value> = resources
            .into_iter()
            .map(|(plural, kind, namespaced)| {
                json!({
                    "name": plural,
                    "singularName": kind.to_ascii_lowercase(),
                    "namespaced": namespaced,
                    "kind": kind,
                    "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"]
                })
            })
            .collect();
        self.discovery.lock().unwrap().insert(
            format!("/apis/{}", group_version),
            json!({
                "kind": "APIResourceList",
                "apiVersion": "v1",
                "groupVersion": group_version,
                "resources": resources
            }),
        );
    }

    /// Build a kube Client backed by this server
    pub fn client(&self) -> Client {
        Client::new(self.clone(), "default")
    }

    /// Store an object directly in a collection
    pub fn insert(&self, collection: &str, mut object: Value) {
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let rv = self.next_resource_version();
        object["metadata"]["resourceVersion"] = json!(rv);
        if object["metadata"]["uid"].is_null() {
            object["metadata"]["uid"] = json!(format!("uid-{}", rv));
        }
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(name, object);
    }

    pub fn get(&self, collection: &str, name: &str) -> Option<Value> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .and_then(|c| c.get(name))
            .cloned()
    }

    pub fn list(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Mutate a stored object in place, bumping its resource version
    pub fn update(&self, collection: &str, name: &str, f: impl FnOnce(&mut Value)) {
        let rv = self.next_resource_version();
        let mut collections = self.collections.lock().unwrap();
        if let Some(object) = collections.get_mut(collection).and_then(|c| c.get_mut(name)) {
            f(object);
            object["metadata"]["resourceVersion"] = json!(rv);
        }
    }

    /// Fail the next request whose method matches and whose path contains `path_fragment`
    pub fn fail_next(&self, method: &str, path_fragment: &str, code: u16) {
        self.failures.lock().unwrap().push_back(InjectedFailure {
            method: method.to_string(),
            path_fragment: path_fragment.to_string(),
            code,
        });
    }

    pub fn count_requests(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }

    fn next_resource_version(&self) -> String {
        self.resource_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn take_failure(&self, method: &str, path: &str) -> Option<u16> {
        let mut failures = self.failures.lock().unwrap();
        let index = failures
            .iter()
            .position(|f| f.method == method && path.contains(&f.path_fragment))?;
        failures.remove(index).map(|f| f.code)
    }

    fn handle(&self, method: &Method, path: &str, query: &str, body: &[u8]) -> (u16, Value) {
        let params: BTreeMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        if let Some(code) = self.take_failure(method.as_str(), path) {
            return (code, status_json(code, "injected failure"));
        }

        if *method == Method::GET {
            if let Some(list) = self.discovery.lock().unwrap().get(path.trim_end_matches('/')) {
                return (200, list.clone());
            }
        }

        let Some(target) = Target::parse(path) else {
            return (404, status_json(404, &format!("unknown path {}", path)));
        };

        match (method.as_str(), target.name.as_deref()) {
            ("GET", None) => (200, self.list_response(&target, params.get("labelSelector"))),
            ("GET", Some(name)) => match self.get(&target.collection(), name) {
                Some(obj) => (200, obj),
                None => (404, not_found_status(&target.plural, name)),
            },
            ("POST", None) => self.create(&target, body),
            ("PUT", Some(name)) => self.replace(&target, name, body),
            ("PATCH", Some(name)) => self.patch(&target, name, body),
            ("DELETE", Some(name)) => {
                let removed = self
                    .collections
                    .lock()
                    .unwrap()
                    .get_mut(&target.collection())
                    .and_then(|c| c.remove(name));
                match removed {
                    Some(obj) => (200, obj),
                    None => (404, not_found_status(&target.plural, name)),
                }
            }
            _ => (405, status_json(405, "method not supported by fake server")),
        }
    }

    fn list_response(&self, target: &Target, selector: Option<&String>) -> Value {
        let collections = self.collections.lock().unwrap();
        let exact = target.collection();
        let namespaced_suffix = format!("/{}", target.plural);
        let namespaced_prefix = format!("{}/namespaces/", target.prefix);

        let items: Vec<Value> = collections
            .iter()
            .filter(|(key, _)| {
                **key == exact
                    || (target.namespace.is_none()
                        && key.starts_with(&namespaced_prefix)
                        && key.ends_with(&namespaced_suffix))
            })
            .flat_map(|(_, objects)| objects.values().cloned())
            .filter(|obj| selector.map_or(true, |s| matches_selector(obj, s)))
            .collect();

        json!({
            "apiVersion": target.api_version(),
            "kind": "List",
            "metadata": { "resourceVersion": self.resource_version.load(Ordering::SeqCst).to_string() },
            "items": items
        })
    }

    fn create(&self, target: &Target, body: &[u8]) -> (u16, Value) {
        let mut object: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return (400, status_json(400, &e.to_string())),
        };

        let rv = self.next_resource_version();
        let name = match object["metadata"]["name"].as_str() {
            Some(name) => name.to_string(),
            None => format!(
                "{}{}",
                object["metadata"]["generateName"].as_str().unwrap_or("obj-"),
                rv
            ),
        };

        let collection = target.collection();
        if self.get(&collection, &name).is_some() {
            return (409, already_exists_status(&target.plural, &name));
        }

        object["metadata"]["name"] = json!(name);
        if let Some(ns) = &target.namespace {
            object["metadata"]["namespace"] = json!(ns);
        }
        object["metadata"]["uid"] = json!(format!("uid-{}", rv));
        object["metadata"]["resourceVersion"] = json!(rv);
        object["metadata"]["creationTimestamp"] = json!(chrono::Utc::now()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

        if self.ready_pods && target.plural == "pods" {
            make_pod_ready(&mut object, &rv);
        }

        self.collections
            .lock()
            .unwrap()
            .entry(collection)
            .or_default()
            .insert(name, object.clone());
        (201, object)
    }

    fn replace(&self, target: &Target, name: &str, body: &[u8]) -> (u16, Value) {
        let mut object: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return (400, status_json(400, &e.to_string())),
        };
        let collection = target.collection();
        let Some(existing) = self.get(&collection, name) else {
            return (404, not_found_status(&target.plural, name));
        };

        if let Some(rejected) = immutable_violation(&target.plural, name, &existing, &object) {
            return rejected;
        }

        let sent_rv = object["metadata"]["resourceVersion"].as_str().map(String::from);
        if sent_rv.is_some() && sent_rv.as_deref() != existing["metadata"]["resourceVersion"].as_str() {
            return (409, status_json(409, "the object has been modified"));
        }

        object["metadata"]["uid"] = existing["metadata"]["uid"].clone();
        object["metadata"]["resourceVersion"] = json!(self.next_resource_version());
        self.collections
            .lock()
            .unwrap()
            .entry(collection)
            .or_default()
            .insert(name.to_string(), object.clone());
        (200, object)
    }

    fn patch(&self, target: &Target, name: &str, body: &[u8]) -> (u16, Value) {
        let patch: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return (400, status_json(400, &e.to_string())),
        };
        let collection = target.collection();
        let existing = self.get(&collection, name);

        let mut object = match (existing, target.subresource.as_deref()) {
            (Some(existing), _) => existing,
            // Apply patches create missing objects; merge patches do not
            (None, None) if patch.get("apiVersion").is_some() => {
                let mut created = json!({ "metadata": {
                    "name": name,
                    "uid": format!("uid-{}", self.next_resource_version())
                } });
                if let Some(ns) = &target.namespace {
                    created["metadata"]["namespace"] = json!(ns);
                }
                created
            }
            (None, _) => return (404, not_found_status(&target.plural, name)),
        };

        if target.subresource.is_none() {
            if let Some(rejected) = immutable_violation(&target.plural, name, &object, &patch) {
                return rejected;
            }
        }

        merge_json(&mut object, &patch);
        object["metadata"]["resourceVersion"] = json!(self.next_resource_version());
        self.collections
            .lock()
            .unwrap()
            .entry(collection)
            .or_default()
            .insert(name.to_string(), object.clone());
        (200, object)
    }
}

impl Default for FakeApiServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for FakeApiServer {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let server = self.clone();
        let (parts, body) = req.into_parts();

        Box::pin(async move {
            let bytes: Bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return Err(e.into()),
            };

            let path = parts.uri.path().to_string();
            let query = parts.uri.query().unwrap_or_default().to_string();
            server
                .requests
                .lock()
                .unwrap()
                .push((parts.method.to_string(), format!("{}?{}", path, query)));

            let is_watch = query.contains("watch=true") || query.contains("watch=1");
            let (status, body) = if is_watch {
                (200, Vec::new())
            } else {
                let (status, value) = server.handle(&parts.method, &path, &query, &bytes);
                (status, serde_json::to_vec(&value).unwrap())
            };

            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap())
        })
    }
}

/// ConfigMaps and Secrets marked immutable reject changes to their payload
fn immutable_violation(plural: &str, name: &str, existing: &Value, update: &Value) -> Option<(u16, Value)> {
    if existing["immutable"] != json!(true) {
        return None;
    }
    let changed = ["data", "binaryData", "stringData"]
        .iter()
        .any(|field| !update[*field].is_null() && update[*field] != existing[*field]);
    changed.then(|| {
        (
            422,
            status_json(
                422,
                &format!("{} \"{}\" is invalid: data: Forbidden: field is immutable when `immutable` is set", plural, name),
            ),
        )
    })
}

fn make_pod_ready(pod: &mut Value, rv: &str) {
    if pod["spec"]["nodeName"].is_null() {
        pod["spec"]["nodeName"] = json!("node-1");
    }
    let node = pod["spec"]["nodeName"].clone();
    pod["status"] = json!({
        "phase": "Running",
        "hostIP": "192.168.0.10",
        "podIP": format!("10.244.0.{}", rv.parse::<u64>().unwrap_or(0) % 250 + 1),
        "conditions": [{ "type": "Ready", "status": "True" }],
        "nominatedNodeName": node
    });
}

/// RFC 7386 JSON merge
fn merge_json(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = json!({});
            }
            if let Some(map) = target.as_object_mut() {
                for (key, value) in fields {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_json(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn matches_selector(object: &Value, selector: &str) -> bool {
    let labels = &object["metadata"]["labels"];
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|requirement| {
            if let Some((key, value)) = requirement.split_once("!=") {
                labels[key.trim()].as_str() != Some(value.trim())
            } else if let Some((key, value)) = requirement.split_once('=') {
                let value = value.trim_start_matches('=');
                labels[key.trim()].as_str() == Some(value.trim())
            } else {
                !labels[requirement].is_null()
            }
        })
}

/// Create a Status body with the given code
pub fn status_json(code: u16, message: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": match code {
            404 => "NotFound",
            409 => "Conflict",
            422 => "Invalid",
            _ => "InternalError",
        },
        "code": code
    })
}

/// Create a 404 not found response
pub fn not_found_status(resource: &str, name: &str) -> Value {
    status_json(404, &format!("{} \"{}\" not found", resource, name))
}

fn already_exists_status(resource: &str, name: &str) -> Value {
    let mut status = status_json(409, &format!("{} \"{}\" already exists", resource, name));
    status["reason"] = json!("AlreadyExists");
    status
}

/// Minimal Node object
pub fn node_json(name: &str, ready: bool) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": name },
        "spec": {},
        "status": {
            "conditions": [{ "type": "Ready", "status": if ready { "True" } else { "False" } }]
        }
    })
}

/// Minimal bound PersistentVolumeClaim object
pub fn pvc_json(namespace: &str, name: &str, volume: Option<&str>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": "1Gi" } },
            "volumeName": volume
        },
        "status": { "phase": if volume.is_some() { "Bound" } else { "Pending" } }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{ListParams, PostParams};
    use kube::Api;

    #[test]
    fn test_parse_paths() {
        let t = Target::parse("/api/v1/namespaces/app/pods/web/status").unwrap();
        assert_eq!(t.collection(), "/api/v1/namespaces/app/pods");
        assert_eq!(t.name.as_deref(), Some("web"));
        assert_eq!(t.subresource.as_deref(), Some("status"));

        let t = Target::parse("/api/v1/namespaces/app").unwrap();
        assert_eq!(t.collection(), "/api/v1/namespaces");
        assert_eq!(t.name.as_deref(), Some("app"));

        let t = Target::parse("/apis/storage.k8s.io/v1/volumeattachments").unwrap();
        assert_eq!(t.collection(), "/apis/storage.k8s.io/v1/volumeattachments");
        assert_eq!(t.api_version(), "storage.k8s.io/v1");
    }

    #[test]
    fn test_merge_json_removes_nulls() {
        let mut target = json!({ "a": 1, "b": { "c": 2, "d": 3 } });
        merge_json(&mut target, &json!({ "a": null, "b": { "c": 5 } }));
        assert_eq!(target, json!({ "b": { "c": 5, "d": 3 } }));
    }

    #[test]
    fn test_label_selector() {
        let obj = json!({ "metadata": { "labels": { "app": "web", "tier": "front" } } });
        assert!(matches_selector(&obj, "app=web"));
        assert!(matches_selector(&obj, "app==web,tier"));
        assert!(!matches_selector(&obj, "app!=web"));
        assert!(!matches_selector(&obj, "missing"));
    }

    #[tokio::test]
    async fn test_immutable_configmap_rejects_data_patch() {
        let server = FakeApiServer::new();
        server.insert(
            "/api/v1/namespaces/app/configmaps",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "settings", "namespace": "app" },
                "data": { "a": "1" },
                "immutable": true
            }),
        );
        let api: Api<ConfigMap> = Api::namespaced(server.client(), "app");
        let pp = kube::api::PatchParams::default();

        let err = api
            .patch("settings", &pp, &kube::api::Patch::Merge(json!({ "data": { "a": "2" } })))
            .await
            .unwrap_err();
        assert!(crate::error::is_invalid(&err));

        api.patch(
            "settings",
            &pp,
            &kube::api::Patch::Merge(json!({ "metadata": { "labels": { "tier": "x" } } })),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_get_list_roundtrip_through_kube_client() {
        let server = FakeApiServer::new();
        let api: Api<ConfigMap> = Api::namespaced(server.client(), "app");
        let cm: ConfigMap = serde_json::from_value(json!({
            "metadata": { "name": "settings", "labels": { "app": "web" } },
            "data": { "a": "1" }
        }))
        .unwrap();

        api.create(&PostParams::default(), &cm).await.unwrap();
        let err = api.create(&PostParams::default(), &cm).await.unwrap_err();
        assert!(crate::error::is_conflict(&err));

        let fetched = api.get("settings").await.unwrap();
        assert!(fetched.metadata.resource_version.is_some());

        let listed = api.list(&ListParams::default().labels("app=web")).await.unwrap();
        assert_eq!(listed.items.len(), 1);
        let none = api.list(&ListParams::default().labels("app=db")).await.unwrap();
        assert!(none.items.is_empty());

        assert!(crate::error::is_not_found(&api.get("missing").await.unwrap_err()));
    }
}
