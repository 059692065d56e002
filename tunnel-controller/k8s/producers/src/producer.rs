use crate::{ingress, service, Contribution, Error, ProducerConfig};
use cloudflared_tunnel_controller_core::fragment_key;
use cloudflared_tunnel_controller_k8s_api::{
    Ingress, ListOptions, Namespace, ObjectMeta, Resource, ResourceExt, Service, SourceApi,
};
use cloudflared_tunnel_controller_k8s_store::Store;
use cloudflared_tunnel_controller_k8s_watcher::{self as watcher, Registration, Watcher};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, info_span, trace, Instrument};

/// Watches Ingresses and Services in every followed namespace and applies
/// the rules they contribute to the store.
///
/// Derived rules are applied in order on a single task. A resource's rules
/// are only written when they differ from what was last applied for it, and
/// a resource that moves to another tunnel has its old fragment removed
/// first.
#[derive(Clone)]
pub struct Producers {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn SourceApi>,
    config: ProducerConfig,
    changes: Mutex<Option<mpsc::UnboundedSender<Change>>>,
    watches: tokio::sync::Mutex<HashMap<String, NamespaceWatch>>,
}

struct NamespaceWatch {
    ingresses: Watcher<Ingress>,
    services: Watcher<Service>,
    registrations: [Registration; 2],
}

#[derive(Debug)]
struct Change {
    kind: &'static str,
    producer: ObjectMeta,
    contribution: Option<Contribution>,
    deleted: bool,
}

#[derive(Debug)]
enum NamespaceUpdate {
    Watch(String),
    Unwatch(String),
}

// === impl Producers ===

impl Producers {
    /// Spawns the task applying derived rules to `store`. The task completes
    /// after [`Producers::shutdown`] once every queued change is applied.
    pub fn spawn(
        store: Store,
        api: Arc<dyn SourceApi>,
        config: ProducerConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(apply_changes(store, rx).instrument(info_span!("producers")));
        let producers = Self {
            inner: Arc::new(Inner {
                api,
                config,
                changes: Mutex::new(Some(tx)),
                watches: tokio::sync::Mutex::new(HashMap::new()),
            }),
        };
        (producers, task)
    }

    /// Starts watching the Ingresses and Services in `namespace`.
    pub async fn watch_namespace(&self, namespace: &str) -> Result<(), Error> {
        if self.skips(namespace) {
            debug!(%namespace, "Skipping namespace");
            return Ok(());
        }

        let mut watches = self.inner.watches.lock().await;
        if watches.contains_key(namespace) {
            return Ok(());
        }
        let Some(tx) = self.inner.changes.lock().clone() else {
            debug!(%namespace, "Producers are shut down");
            return Ok(());
        };

        let params = watcher::Params {
            opts: ListOptions::default(),
            restart_delay: self.inner.config.restart_delay,
        };
        let ingresses = Watcher::new(self.inner.api.ingresses(namespace), params.clone());
        let services = Watcher::new(self.inner.api.services(namespace), params);

        let registrations = [
            ingresses.register_event({
                let tx = tx.clone();
                let config = self.inner.config.clone();
                move |_, event| {
                    let _ = tx.send(Change::new(ingress::KIND, event, |ing| {
                        ingress::ingress_rules(ing, &config)
                    }));
                }
            }),
            services.register_event({
                let config = self.inner.config.clone();
                move |_, event| {
                    let _ = tx.send(Change::new(service::KIND, event, |svc| {
                        service::service_rules(svc, &config)
                    }));
                }
            }),
        ];

        ingresses.start().await?;
        if let Err(error) = services.start().await {
            ingresses.stop().await;
            return Err(error.into());
        }

        info!(%namespace, "Watching tunnel producers");
        watches.insert(
            namespace.to_string(),
            NamespaceWatch {
                ingresses,
                services,
                registrations,
            },
        );
        Ok(())
    }

    /// Stops watching `namespace` and withdraws the rules its resources
    /// contributed.
    pub async fn unwatch_namespace(&self, namespace: &str) {
        let Some(watch) = self.inner.watches.lock().await.remove(namespace) else {
            return;
        };
        if let Some(tx) = &*self.inner.changes.lock() {
            for ing in watch.ingresses.get_state() {
                let _ = tx.send(Change::deleted(ingress::KIND, ing.metadata));
            }
            for svc in watch.services.get_state() {
                let _ = tx.send(Change::deleted(service::KIND, svc.metadata));
            }
        }
        watch.stop().await;
        info!(%namespace, "Stopped watching tunnel producers");
    }

    /// Follows namespace lifecycle events, watching each namespace's
    /// producers while it exists.
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
                .instrument(info_span!("producer_namespaces")),
        );
        let registration = Registration::new(move || {
            events.unregister();
            tx.lock().take();
        });
        (registration, task)
    }

    /// Stops every watch and closes the change queue. Rules already applied
    /// stay in the store.
    pub async fn shutdown(&self) {
        self.inner.changes.lock().take();
        let watches = std::mem::take(&mut *self.inner.watches.lock().await);
        for (namespace, watch) in watches {
            watch.stop().await;
            debug!(%namespace, "Stopped producer watches");
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
                        error!(%namespace, %error, "Failed to watch producers");
                    }
                }
                NamespaceUpdate::Unwatch(namespace) => self.unwatch_namespace(&namespace).await,
            }
        }
        debug!("Namespace updates closed");
    }
}

impl std::fmt::Debug for Producers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producers")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// === impl NamespaceWatch ===

impl NamespaceWatch {
    async fn stop(self) {
        for registration in &self.registrations {
            registration.unregister();
        }
        self.ingresses.stop().await;
        self.services.stop().await;
    }
}

// === impl Change ===

impl Change {
    fn new<T: Resource>(
        kind: &'static str,
        event: &watcher::Event<T>,
        rules: impl FnOnce(&T) -> Option<Contribution>,
    ) -> Self {
        match event {
            watcher::Event::Added(obj) | watcher::Event::Modified(obj) => Self {
                kind,
                producer: obj.meta().clone(),
                contribution: rules(obj),
                deleted: false,
            },
            watcher::Event::Deleted(obj) => Self::deleted(kind, obj.meta().clone()),
        }
    }

    fn deleted(kind: &'static str, producer: ObjectMeta) -> Self {
        Self {
            kind,
            producer,
            contribution: None,
            deleted: true,
        }
    }

    fn key(&self) -> String {
        fragment_key(
            self.kind,
            self.producer.namespace.as_deref().unwrap_or_default(),
            self.producer.name.as_deref().unwrap_or_default(),
        )
    }
}

/// What was last applied per fragment key. `None` records a resource that
/// contributes nothing.
type Applied = HashMap<String, Option<Contribution>>;

async fn apply_changes(store: Store, mut rx: mpsc::UnboundedReceiver<Change>) {
    let mut applied = Applied::new();
    while let Some(change) = rx.recv().await {
        apply(&store, &mut applied, change).await;
    }
    debug!("Producer changes closed");
}

async fn apply(store: &Store, applied: &mut Applied, change: Change) {
    let key = change.key();
    let Change {
        kind,
        producer,
        contribution,
        deleted,
    } = change;

    if deleted {
        applied.remove(&key);
        store.remove(kind, &producer).await;
        return;
    }

    let contribution = contribution.filter(|c| !c.rules.is_empty());
    let previous = applied.get(&key);
    if previous == Some(&contribution) {
        trace!(%key, "Unchanged");
        return;
    }

    let Some(next) = contribution else {
        applied.insert(key, None);
        store.remove(kind, &producer).await;
        return;
    };

    let moved = previous
        .and_then(Option::as_ref)
        .map_or(false, |prev| prev.tunnel != next.tunnel);
    if moved {
        debug!(%key, tunnel = %next.tunnel.name, "Producer moved to another tunnel");
        store.remove(kind, &producer).await;
    }

    match store.upsert(&next.tunnel, kind, &producer, &next.rules).await {
        Ok(()) => {
            applied.insert(key, Some(next));
        }
        // Forgotten so the next event for this resource retries.
        Err(_) => {
            applied.remove(&key);
        }
    }
}

