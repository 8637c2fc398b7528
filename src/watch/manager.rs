// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Informer-backed watches over the replicated kinds of one namespace.

use crate::error::{DrSyncError, Result};
use crate::resources::ResourceKind;
use futures::stream::BoxStream;
use futures::{Future, StreamExt};
use kube::api::DynamicObject;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type WatchStream = BoxStream<'static, std::result::Result<watcher::Event<DynamicObject>, watcher::Error>>;

/// Invoked for every observed change. Runs on the informer task and must not
/// block; long work is handed off.
pub type WatchCallback = Arc<dyn Fn(&ResourceKind, WatchEventKind, &DynamicObject) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Updated,
    Deleted,
}

/// Opens the watch stream backing one informer
pub trait InformerFactory: Send + Sync {
    fn informer(&self, namespace: &str, kind: &ResourceKind) -> WatchStream;
}

/// Informers over the Kubernetes watch API, with the runtime's default
/// reconnect backoff
pub struct KubeInformerFactory {
    client: Client,
}

impl KubeInformerFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl InformerFactory for KubeInformerFactory {
    fn informer(&self, namespace: &str, kind: &ResourceKind) -> WatchStream {
        let ar = kind.api_resource();
        let api: Api<DynamicObject> = if kind.is_namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed()
    }
}

struct Informer {
    kind: ResourceKind,
    synced: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WatchState {
    namespace: Option<String>,
    informers: Vec<Informer>,
    cancel: CancellationToken,
}

/// Maintains one informer per resource kind for a namespace.
///
/// Start and stop take the write lock and so exclude each other;
/// `is_watching` reads an atomic flag and never waits on them.
pub struct WatchManager {
    factory: Arc<dyn InformerFactory>,
    cache_sync_timeout: Duration,
    state: RwLock<WatchState>,
    watching: AtomicBool,
}

impl WatchManager {
    pub fn new(factory: Arc<dyn InformerFactory>, cache_sync_timeout: Duration) -> Self {
        Self {
            factory,
            cache_sync_timeout,
            state: RwLock::new(WatchState::default()),
            watching: AtomicBool::new(false),
        }
    }

    /// Start one informer per kind and wait until every cache has completed
    /// its initial list. If any cache fails to sync, all informers started by
    /// this call are torn down and an error is returned. Calling this while
    /// already watching does nothing.
    pub async fn start_watching(
        &self,
        namespace: &str,
        kinds: &[ResourceKind],
        callback: WatchCallback,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if self.watching.load(Ordering::SeqCst) {
            debug!(
                "Already watching {}, ignoring start request",
                state.namespace.as_deref().unwrap_or_default()
            );
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let mut informers = Vec::with_capacity(kinds.len());
        let mut pending = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let synced = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = oneshot::channel();
            let stream = self.factory.informer(namespace, kind);
            let task = tokio::spawn(run_informer(
                kind.clone(),
                namespace.to_string(),
                stream,
                callback.clone(),
                synced.clone(),
                ready_tx,
                cancel.child_token(),
            ));
            informers.push(Informer {
                kind: kind.clone(),
                synced,
                task,
            });
            pending.push((kind.clone(), ready_rx));
        }

        let all_synced = async {
            for (kind, ready) in pending {
                ready.await.map_err(|_| kind)?;
            }
            Ok::<(), ResourceKind>(())
        };

        let failure = match tokio::time::timeout(self.cache_sync_timeout, all_synced).await {
            Ok(Ok(())) => None,
            Ok(Err(kind)) => Some(format!(
                "informer for {} in {} stopped before its cache synced",
                kind, namespace
            )),
            Err(_) => Some(format!(
                "caches for {} not synced within {:?}",
                namespace, self.cache_sync_timeout
            )),
        };

        if let Some(message) = failure {
            teardown(&cancel, informers).await;
            return Err(DrSyncError::CacheSync(message));
        }

        info!(
            "Watching {} kind(s) in namespace {}",
            informers.len(),
            namespace
        );
        *state = WatchState {
            namespace: Some(namespace.to_string()),
            informers,
            cancel,
        };
        self.watching.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop every informer and release their state. Does nothing when idle.
    pub async fn stop_watching(&self) {
        let mut state = self.state.write().await;
        if !self.watching.swap(false, Ordering::SeqCst) {
            return;
        }

        let old = std::mem::take(&mut *state);
        teardown(&old.cancel, old.informers).await;
        info!(
            "Stopped watching namespace {}",
            old.namespace.unwrap_or_default()
        );
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Whether the informer for `kind` has a synced cache
    pub async fn informer_synced(&self, kind: &ResourceKind) -> bool {
        self.state
            .read()
            .await
            .informers
            .iter()
            .any(|i| &i.kind == kind && i.synced.load(Ordering::SeqCst))
    }

    /// Call `sync` every `interval` until cancelled. Failures are logged and
    /// the next tick runs regardless.
    pub fn start_background_sync<F, Fut>(
        &self,
        interval: Duration,
        sync: F,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("Running background sync");
                        if let Err(e) = sync().await {
                            warn!("Background sync failed: {}", e);
                        }
                    }
                }
            }
            debug!("Background sync stopped");
        })
    }
}

async fn teardown(cancel: &CancellationToken, informers: Vec<Informer>) {
    cancel.cancel();
    for informer in informers {
        informer.synced.store(false, Ordering::SeqCst);
        let _ = informer.task.await;
    }
}

/// Drive one informer stream, tracking resource versions so unchanged
/// objects do not fire the callback
async fn run_informer(
    kind: ResourceKind,
    namespace: String,
    mut stream: WatchStream,
    callback: WatchCallback,
    synced: Arc<AtomicBool>,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let mut ready = Some(ready);
    let mut cache: HashMap<String, String> = HashMap::new();
    let mut relisted: Option<Vec<String>> = None;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let event = match next {
            None => {
                warn!("Watch stream for {} in {} ended", kind, namespace);
                break;
            }
            Some(Err(e)) => {
                warn!("Watch error for {} in {}: {}", kind, namespace, e);
                continue;
            }
            Some(Ok(event)) => event,
        };

        match event {
            watcher::Event::Init => relisted = Some(Vec::new()),
            watcher::Event::InitApply(obj) => {
                if !kind.belongs_to(&obj, &namespace) {
                    continue;
                }
                if let Some(seen) = relisted.as_mut() {
                    seen.push(obj.name_any());
                }
                if let Some(change) = observe(&mut cache, &obj) {
                    callback(&kind, change, &obj);
                }
            }
            watcher::Event::InitDone => {
                if let Some(seen) = relisted.take() {
                    let gone: Vec<String> = cache
                        .keys()
                        .filter(|name| !seen.contains(name))
                        .cloned()
                        .collect();
                    for name in gone {
                        cache.remove(&name);
                        let mut obj = DynamicObject::new(&name, &kind.api_resource());
                        obj.metadata.namespace = Some(namespace.clone());
                        callback(&kind, WatchEventKind::Deleted, &obj);
                    }
                }
                synced.store(true, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    debug!("Cache for {} in {} synced", kind, namespace);
                    let _ = tx.send(());
                }
            }
            watcher::Event::Apply(obj) => {
                if !kind.belongs_to(&obj, &namespace) {
                    continue;
                }
                if let Some(change) = observe(&mut cache, &obj) {
                    callback(&kind, change, &obj);
                }
            }
            watcher::Event::Delete(obj) => {
                if cache.remove(&obj.name_any()).is_some() {
                    callback(&kind, WatchEventKind::Deleted, &obj);
                }
            }
        }
    }

    synced.store(false, Ordering::SeqCst);
}

/// Record an object's resource version; None when it is unchanged
fn observe(cache: &mut HashMap<String, String>, obj: &DynamicObject) -> Option<WatchEventKind> {
    let version = obj.resource_version().unwrap_or_default();
    match cache.insert(obj.name_any(), version.clone()) {
        None => Some(WatchEventKind::Added),
        Some(previous) if previous == version => None,
        Some(_) => Some(WatchEventKind::Updated),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    type Sender = mpsc::UnboundedSender<
        std::result::Result<watcher::Event<DynamicObject>, watcher::Error>,
    >;

    /// Informer factory backed by channels. Each new informer replays an
    /// initial list of the seeded objects, unless its kind is marked as
    /// never syncing.
    #[derive(Default)]
    pub(crate) struct ChannelFactory {
        pub seeds: Mutex<Vec<DynamicObject>>,
        pub never_sync: Mutex<Vec<ResourceKind>>,
        pub senders: Mutex<Vec<(ResourceKind, Sender)>>,
        pub created: AtomicUsize,
    }

    impl ChannelFactory {
        pub fn send(&self, kind: &ResourceKind, event: watcher::Event<DynamicObject>) {
            for (k, tx) in self.senders.lock().unwrap().iter() {
                if k == kind && !tx.is_closed() {
                    let _ = tx.unbounded_send(Ok(event.clone()));
                }
            }
        }
    }

    impl InformerFactory for ChannelFactory {
        fn informer(&self, _namespace: &str, kind: &ResourceKind) -> WatchStream {
            self.created.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded();
            if !self.never_sync.lock().unwrap().contains(kind) {
                let _ = tx.unbounded_send(Ok(watcher::Event::Init));
                for obj in self.seeds.lock().unwrap().iter() {
                    let _ = tx.unbounded_send(Ok(watcher::Event::InitApply(obj.clone())));
                }
                let _ = tx.unbounded_send(Ok(watcher::Event::InitDone));
            }
            self.senders.lock().unwrap().push((kind.clone(), tx));
            rx.boxed()
        }
    }

    pub(crate) fn configmap(name: &str, version: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ResourceKind::ConfigMap.api_resource()).within("app");
        obj.metadata.resource_version = Some(version.to_string());
        obj
    }

    type Seen = Arc<Mutex<Vec<(WatchEventKind, String)>>>;

    fn recorder() -> (Seen, WatchCallback) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: WatchCallback = Arc::new(move |_kind, change, obj| {
            sink.lock().unwrap().push((change, obj.name_any()));
        });
        (seen, callback)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_start_waits_for_sync_and_fires_added() {
        let factory = Arc::new(ChannelFactory::default());
        factory.seeds.lock().unwrap().push(configmap("settings", "1"));
        let manager = WatchManager::new(factory.clone(), Duration::from_secs(1));
        let (seen, callback) = recorder();

        manager
            .start_watching("app", &[ResourceKind::ConfigMap], callback)
            .await
            .unwrap();

        assert!(manager.is_watching());
        assert!(manager.informer_synced(&ResourceKind::ConfigMap).await);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(WatchEventKind::Added, "settings".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unchanged_resource_version_is_suppressed() {
        let factory = Arc::new(ChannelFactory::default());
        factory.seeds.lock().unwrap().push(configmap("settings", "1"));
        let manager = WatchManager::new(factory.clone(), Duration::from_secs(1));
        let (seen, callback) = recorder();
        manager
            .start_watching("app", &[ResourceKind::ConfigMap], callback)
            .await
            .unwrap();

        factory.send(&ResourceKind::ConfigMap, watcher::Event::Apply(configmap("settings", "1")));
        factory.send(&ResourceKind::ConfigMap, watcher::Event::Apply(configmap("settings", "2")));
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (WatchEventKind::Added, "settings".to_string()),
                (WatchEventKind::Updated, "settings".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_relist_reports_missing_objects_as_deleted() {
        let factory = Arc::new(ChannelFactory::default());
        factory.seeds.lock().unwrap().push(configmap("old", "1"));
        let manager = WatchManager::new(factory.clone(), Duration::from_secs(1));
        let (seen, callback) = recorder();
        manager
            .start_watching("app", &[ResourceKind::ConfigMap], callback)
            .await
            .unwrap();

        factory.send(&ResourceKind::ConfigMap, watcher::Event::Init);
        factory.send(&ResourceKind::ConfigMap, watcher::Event::InitApply(configmap("new", "5")));
        factory.send(&ResourceKind::ConfigMap, watcher::Event::InitDone);
        settle().await;

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(WatchEventKind::Added, "new".to_string())));
        assert!(seen.contains(&(WatchEventKind::Deleted, "old".to_string())));
    }

    #[tokio::test]
    async fn test_second_start_is_noop_and_stop_is_idempotent() {
        let factory = Arc::new(ChannelFactory::default());
        let manager = WatchManager::new(factory.clone(), Duration::from_secs(1));
        let (_, callback) = recorder();

        manager.stop_watching().await;
        assert!(!manager.is_watching());

        let kinds = [ResourceKind::ConfigMap, ResourceKind::Secret];
        manager.start_watching("app", &kinds, callback.clone()).await.unwrap();
        manager.start_watching("app", &kinds, callback.clone()).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        manager.stop_watching().await;
        manager.stop_watching().await;
        assert!(!manager.is_watching());
        assert!(!manager.informer_synced(&ResourceKind::ConfigMap).await);

        manager.start_watching("app", &kinds, callback).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cache_sync_failure_tears_everything_down() {
        let factory = Arc::new(ChannelFactory::default());
        factory.never_sync.lock().unwrap().push(ResourceKind::Secret);
        let manager = WatchManager::new(factory.clone(), Duration::from_millis(100));
        let (_, callback) = recorder();

        let err = manager
            .start_watching("app", &[ResourceKind::ConfigMap, ResourceKind::Secret], callback)
            .await
            .unwrap_err();

        assert!(matches!(err, DrSyncError::CacheSync(_)));
        assert!(!manager.is_watching());
        assert!(factory
            .senders
            .lock()
            .unwrap()
            .iter()
            .all(|(_, tx)| tx.is_closed()));
    }

    #[tokio::test]
    async fn test_background_sync_logs_failures_and_stops_on_cancel() {
        let manager = WatchManager::new(Arc::new(ChannelFactory::default()), Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let handle = manager.start_background_sync(
            Duration::from_millis(10),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DrSyncError::SyncError("boom".to_string()))
                }
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
