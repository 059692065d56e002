use crate::{Artifact, Error, Event, StoreMetrics};
use cloudflared_tunnel_controller_core::{
    annotations::{self, TunnelState},
    config::IngressRule,
    fragment_key,
    labels::{self, Selector},
    ResourceName, TunnelParams, Uuid,
};
use cloudflared_tunnel_controller_k8s_api::{
    ConfigMap, ConfigMapApi, ListOptions, Namespace, ObjectMeta, ResourceExt,
};
use cloudflared_tunnel_controller_k8s_watcher::{self as watcher, Registration, Watcher};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::{
    collections::{btree_map::Entry, BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, error, info, info_span, trace, Instrument};

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Selects the artifacts owned by this controller. Also applied as a
    /// label to every artifact the store creates.
    pub selector: Selector,

    /// The controller version recorded on created artifacts.
    pub version: String,

    /// When non-empty, only these namespaces are watched.
    pub namespaces: Vec<String>,

    pub restart_delay: time::Duration,

    pub metrics: StoreMetrics,
}

/// A handle to the aggregated configuration store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

type Subscriber = Arc<dyn Fn(&[Artifact], &Event<Artifact>) + Send + Sync>;

type Locks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

struct Inner {
    api: Arc<dyn ConfigMapApi>,
    config: StoreConfig,

    artifacts: RwLock<BTreeMap<ResourceName, Artifact>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    delivery: ReentrantMutex<()>,

    /// Serializes read-modify-write cycles per (producer kind, artifact).
    /// Entries only live while held or awaited.
    locks: Locks,

    watches: tokio::sync::Mutex<HashMap<String, NamespaceWatch>>,
}

struct NamespaceWatch {
    watcher: Watcher<ConfigMap>,
    registration: Registration,
}

/// Exclusive access to one (producer kind, artifact) pair.
struct WriteLock<'a> {
    locks: &'a Locks,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

#[derive(Debug)]
enum NamespaceUpdate {
    Watch(String),
    Unwatch(String),
}

// === impl StoreConfig ===

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            selector: Selector::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            namespaces: Vec::new(),
            restart_delay: time::Duration::from_secs(5),
            metrics: StoreMetrics::default(),
        }
    }
}

// === impl Store ===

impl Store {
    pub fn new(api: Arc<dyn ConfigMapApi>, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                artifacts: RwLock::new(BTreeMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                delivery: ReentrantMutex::new(()),
                locks: Mutex::new(HashMap::new()),
                watches: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Merges a producer's rules into the tunnel's artifact, creating the
    /// artifact if needed.
    ///
    /// The artifact is always marked `preparing`; it is promoted to `ready`
    /// outside of this store. Errors are logged and returned without retry.
    pub async fn upsert(
        &self,
        tunnel: &TunnelParams,
        kind: &str,
        producer: &ObjectMeta,
        rules: &[IngressRule],
    ) -> Result<(), Error> {
        let key = producer_key(kind, producer);
        let fragment = IngressRule::to_fragment(rules).map_err(|error| {
            error!(%key, %error, "Failed to serialize rules");
            error
        })?;

        let mut annos = producer.annotations.clone().unwrap_or_default();
        annos.insert(annotations::TUNNEL_NAME.to_string(), tunnel.name.clone());
        annos.insert(
            annotations::TUNNEL_K8S_SECRET.to_string(),
            tunnel.secret_name().to_string(),
        );
        annos.insert(
            annotations::TUNNEL_STATE.to_string(),
            TunnelState::Preparing.to_string(),
        );
        annos.remove(annotations::TUNNEL_EXTERNAL_NAME);
        annos.remove(annotations::TUNNEL_K8S_CONFIGMAP);

        let name = tunnel.config_map_name();
        let _lock = self.inner.acquire(kind, &name).await;

        let res = match self.inner.api.get(&name).await {
            Err(error) => Err(error),
            Ok(None) => {
                let artifact = Artifact {
                    namespace: name.namespace.clone(),
                    name: name.name.clone(),
                    annotations: annos,
                    labels: labels::controller_labels(
                        &producer.labels.clone().unwrap_or_default(),
                        &self.inner.config.version,
                        &self.inner.config.selector,
                    ),
                    fragments: BTreeMap::from([(key.clone(), fragment)]),
                    resource_version: None,
                };
                self.inner
                    .api
                    .create(&ConfigMap::from(&artifact))
                    .await
                    .map(|_| ())
            }
            Ok(Some(mut cm)) => {
                cm.annotations_mut().extend(annos);
                cm.data
                    .get_or_insert_with(Default::default)
                    .insert(key.clone(), fragment);
                self.inner.api.replace(&cm).await.map(|_| ())
            }
        };

        match res {
            Ok(()) => {
                debug!(artifact = %name, %key, "Upserted fragment");
                Ok(())
            }
            Err(error) => {
                error!(artifact = %name, %key, %error, "Failed to upsert fragment");
                Err(error.into())
            }
        }
    }

    /// Removes a producer's fragment from every artifact that holds it.
    ///
    /// Artifacts are marked `preparing` when a fragment is removed. Nothing is
    /// written if no artifact holds the fragment.
    pub async fn remove(&self, kind: &str, producer: &ObjectMeta) {
        let key = producer_key(kind, producer);
        let holders = self
            .get()
            .into_iter()
            .filter(|a| a.fragments.contains_key(&key))
            .map(|a| a.id())
            .collect::<Vec<_>>();

        for name in holders {
            let _lock = self.inner.acquire(kind, &name).await;

            let mut cm = match self.inner.api.get(&name).await {
                Ok(Some(cm)) => cm,
                Ok(None) => continue,
                Err(error) => {
                    error!(artifact = %name, %key, %error, "Failed to fetch artifact");
                    continue;
                }
            };
            let removed = cm.data.as_mut().and_then(|d| d.remove(&key)).is_some();
            if !removed {
                continue;
            }
            cm.annotations_mut().insert(
                annotations::TUNNEL_STATE.to_string(),
                TunnelState::Preparing.to_string(),
            );
            match self.inner.api.replace(&cm).await {
                Ok(_) => debug!(artifact = %name, %key, "Removed fragment"),
                Err(error) => error!(artifact = %name, %key, %error, "Failed to remove fragment"),
            }
        }
    }

    /// Marks a prepared artifact `ready` and records the tunnel it runs.
    ///
    /// Nothing is written if the artifact is gone or its fragments no longer
    /// match `prepared`, since a newer revision is then pending preparation.
    /// Returns whether the artifact was promoted. Concurrent writers surface
    /// as a conflict error.
    pub async fn promote(
        &self,
        prepared: &Artifact,
        tunnel_id: Uuid,
        cfd_name: &str,
    ) -> Result<bool, Error> {
        let name = prepared.id();
        let Some(mut cm) = self.inner.api.get(&name).await? else {
            debug!(artifact = %name, "Artifact deleted before promotion");
            return Ok(false);
        };
        if Artifact::from(&cm).fragments != prepared.fragments {
            debug!(artifact = %name, "Artifact changed before promotion");
            return Ok(false);
        }

        let annos = cm.annotations_mut();
        annos.insert(annotations::TUNNEL_ID.to_string(), tunnel_id.to_string());
        annos.insert(annotations::TUNNEL_CFD_NAME.to_string(), cfd_name.to_string());
        annos.insert(
            annotations::TUNNEL_STATE.to_string(),
            TunnelState::Ready.to_string(),
        );
        if let Err(error) = self.inner.api.replace(&cm).await {
            error!(artifact = %name, %error, "Failed to promote artifact");
            return Err(error.into());
        }
        info!(artifact = %name, tunnel = %tunnel_id, "Tunnel ready");
        Ok(true)
    }

    /// Adds a consumer.
    ///
    /// Before this returns, the consumer is called once with an
    /// [`Event::Added`] for every known artifact.
    ///
    /// Consumers are called with the store's delivery lock held, which
    /// orders every consumer's view of the artifacts. They must not block or
    /// wait on other tasks; hand events off to a channel instead. Consumers
    /// may register or unregister from within a callback.
    pub fn register<F>(&self, f: F) -> Registration
    where
        F: Fn(&[Artifact], &Event<Artifact>) + Send + Sync + 'static,
    {
        let f: Subscriber = Arc::new(f);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let _delivery = self.inner.delivery.lock();
        let snapshot = self.get();
        self.inner.subscribers.lock().insert(id, f.clone());
        for artifact in &snapshot {
            f(&snapshot, &Event::Added(artifact.clone()));
        }

        let inner = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = inner.upgrade() {
                let _delivery = inner.delivery.lock();
                inner.subscribers.lock().remove(&id);
            }
        })
    }

    /// Returns a snapshot of all known artifacts.
    pub fn get(&self) -> Vec<Artifact> {
        self.inner.artifacts.read().values().cloned().collect()
    }

    /// Starts watching the artifacts in `namespace`. Namespaces excluded by
    /// the configuration and namespaces already watched are ignored.
    pub async fn watch_namespace(&self, namespace: &str) -> Result<(), Error> {
        if self.skips(namespace) {
            debug!(%namespace, "Skipping namespace");
            return Ok(());
        }

        let mut watches = self.inner.watches.lock().await;
        if watches.contains_key(namespace) {
            return Ok(());
        }

        let watcher = Watcher::new(
            self.inner.api.namespaced(namespace),
            watcher::Params {
                opts: ListOptions::labels(self.inner.config.selector.to_string()),
                restart_delay: self.inner.config.restart_delay,
            },
        );
        let inner = Arc::downgrade(&self.inner);
        let registration = watcher.register_event(move |_, event| {
            if let Some(inner) = inner.upgrade() {
                inner.observe(event);
            }
        });
        watcher.start().await?;

        info!(%namespace, "Watching tunnel configurations");
        watches.insert(
            namespace.to_string(),
            NamespaceWatch {
                watcher,
                registration,
            },
        );
        Ok(())
    }

    /// Stops watching `namespace` and drops its artifacts, notifying
    /// consumers of each removal.
    pub async fn unwatch_namespace(&self, namespace: &str) {
        let watch = self.inner.watches.lock().await.remove(namespace);
        let Some(NamespaceWatch {
            watcher,
            registration,
        }) = watch
        else {
            return;
        };
        registration.unregister();
        watcher.stop().await;
        self.inner.purge(namespace);
        info!(%namespace, "Stopped watching tunnel configurations");
    }

    /// Follows namespace lifecycle events, watching each namespace's
    /// artifacts while it exists.
    ///
    /// Unregistering closes the update queue. The returned task completes
    /// once every queued update has been applied.
    pub fn follow_namespaces(
        &self,
        namespaces: &Watcher<Namespace>,
    ) -> (Registration, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let events = namespaces.register_event({
            let tx = tx.clone();
            move |_, event| {
                let update = match event {
                    watcher::Event::Added(ns) | watcher::Event::Modified(ns) => {
                        NamespaceUpdate::Watch(ns.name_any())
                    }
                    watcher::Event::Deleted(ns) => NamespaceUpdate::Unwatch(ns.name_any()),
                };
                if let Some(tx) = &*tx.lock() {
                    let _ = tx.send(update);
                }
            }
        });
        let task = tokio::spawn(
            self.clone()
                .process_namespaces(rx)
                .instrument(info_span!("namespaces")),
        );
        let registration = Registration::new(move || {
            events.unregister();
            tx.lock().take();
        });
        (registration, task)
    }

    /// Stops every namespace watch.
    pub async fn shutdown(&self) {
        let watches = std::mem::take(&mut *self.inner.watches.lock().await);
        for (namespace, watch) in watches {
            watch.registration.unregister();
            watch.watcher.stop().await;
            debug!(%namespace, "Stopped watch");
        }
    }

    pub async fn watched_namespaces(&self) -> Vec<String> {
        let mut namespaces = self
            .inner
            .watches
            .lock()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces
    }

    #[cfg(test)]
    pub(crate) fn held_locks(&self) -> usize {
        self.inner.locks.lock().len()
    }

    fn skips(&self, namespace: &str) -> bool {
        let presets = &self.inner.config.namespaces;
        !presets.is_empty() && !presets.iter().any(|ns| ns == namespace)
    }

    async fn process_namespaces(self, mut rx: mpsc::UnboundedReceiver<NamespaceUpdate>) {
        while let Some(update) = rx.recv().await {
            trace!(?update);
            match update {
                NamespaceUpdate::Watch(namespace) => {
                    if let Err(error) = self.watch_namespace(&namespace).await {
                        error!(%namespace, %error, "Failed to watch namespace");
                    }
                }
                NamespaceUpdate::Unwatch(namespace) => self.unwatch_namespace(&namespace).await,
            }
        }
        debug!("Namespace updates closed");
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .field("artifacts", &self.inner.artifacts.read().len())
            .finish_non_exhaustive()
    }
}

fn producer_key(kind: &str, producer: &ObjectMeta) -> String {
    fragment_key(
        kind,
        producer.namespace.as_deref().unwrap_or_default(),
        producer.name.as_deref().unwrap_or_default(),
    )
}

// === impl Inner ===

impl Inner {
    async fn acquire(&self, kind: &str, artifact: &ResourceName) -> WriteLock<'_> {
        let key = fragment_key(kind, &artifact.namespace, &artifact.name);
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        WriteLock {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    /// Records a change observed on the cluster, notifying consumers unless
    /// the artifact's content is unchanged.
    fn observe(&self, event: &watcher::Event<ConfigMap>) {
        let _delivery = self.delivery.lock();
        let event = match event {
            watcher::Event::Added(cm) | watcher::Event::Modified(cm) => {
                let artifact = Artifact::from(cm);
                let mut artifacts = self.artifacts.write();
                match artifacts.entry(artifact.id()) {
                    Entry::Vacant(entry) => {
                        entry.insert(artifact.clone());
                        Event::Added(artifact)
                    }
                    Entry::Occupied(mut entry) => {
                        if entry.get().same_content(&artifact) {
                            trace!(artifact = %entry.key(), "Unchanged");
                            entry.get_mut().resource_version = artifact.resource_version;
                            return;
                        }
                        entry.insert(artifact.clone());
                        Event::Modified(artifact)
                    }
                }
            }
            watcher::Event::Deleted(cm) => {
                let id = Artifact::from(cm).id();
                match self.artifacts.write().remove(&id) {
                    Some(artifact) => Event::Deleted(artifact),
                    None => return,
                }
            }
        };
        if let Event::Added(artifact) | Event::Deleted(artifact) = &event {
            self.record(&artifact.namespace);
        }
        self.dispatch(event);
    }

    fn purge(&self, namespace: &str) {
        let _delivery = self.delivery.lock();
        let removed = {
            let mut artifacts = self.artifacts.write();
            let ids = artifacts
                .keys()
                .filter(|id| id.namespace == namespace)
                .cloned()
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| artifacts.remove(&id))
                .collect::<Vec<_>>()
        };
        self.config.metrics.set_artifacts(namespace, 0);
        for artifact in removed {
            self.dispatch(Event::Deleted(artifact));
        }
    }

    fn record(&self, namespace: &str) {
        let count = self
            .artifacts
            .read()
            .keys()
            .filter(|id| id.namespace == namespace)
            .count();
        self.config.metrics.set_artifacts(namespace, count);
    }

    // Callers must hold the delivery lock.
    fn dispatch(&self, event: Event<Artifact>) {
        let snapshot = self.artifacts.read().values().cloned().collect::<Vec<_>>();
        let subscribers = self.subscribers.lock().values().cloned().collect::<Vec<_>>();
        for subscriber in subscribers {
            subscriber(&snapshot, &event);
        }
    }
}


// === impl WriteLock ===

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        drop(self.guard.take());
        // New waiters clone the entry under the table lock, so a lone
        // reference means no one else holds or awaits it.
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}
