//! An in-memory stand-in for the cluster's ConfigMap and Namespace APIs.

use cloudflared_tunnel_controller_core::ResourceName;
use cloudflared_tunnel_controller_k8s_api::{
    ConfigMap, ConfigMapApi, EventStream, ListOptions, Namespace, ObjectMeta, ResourceClient,
    WatchEvent,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Sender<T> = mpsc::UnboundedSender<WatchEvent<T>>;

#[derive(Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    fail_reads: Arc<AtomicBool>,
    writes: AtomicUsize,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceName, ConfigMap>,
    watches: HashMap<String, Vec<(ListOptions, Sender<ConfigMap>)>>,
    version: u64,
}

struct Namespaced {
    state: Arc<Mutex<State>>,
    fail_reads: Arc<AtomicBool>,
    namespace: String,
}

#[derive(Default)]
pub struct FakeNamespaces {
    state: Mutex<(BTreeMap<String, Namespace>, Vec<Sender<Namespace>>)>,
}

// === impl FakeCluster ===

impl FakeCluster {
    pub fn new(objects: Vec<ConfigMap>) -> Arc<Self> {
        let cluster = Arc::new(Self::default());
        {
            let mut state = cluster.state.lock();
            for mut cm in objects {
                state.stamp(&mut cm);
                state.objects.insert(id(&cm), cm);
            }
        }
        cluster
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn get_object(&self, name: &ResourceName) -> Option<ConfigMap> {
        self.state.lock().objects.get(name).cloned()
    }

    /// Sets an annotation out of band, as another controller would.
    pub fn annotate(&self, name: &ResourceName, key: &str, value: &str) {
        let mut state = self.state.lock();
        let mut cm = state.objects.get(name).cloned().expect("object must exist");
        cm.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        state.stamp(&mut cm);
        state.store(cm, WatchEvent::Modified);
    }

    /// Bumps the resource version without changing the object.
    pub fn touch(&self, name: &ResourceName) {
        let mut state = self.state.lock();
        let mut cm = state.objects.get(name).cloned().expect("object must exist");
        state.stamp(&mut cm);
        state.store(cm, WatchEvent::Modified);
    }

    pub fn delete(&self, name: &ResourceName) {
        let mut state = self.state.lock();
        if let Some(cm) = state.objects.remove(name) {
            state.notify(&cm, WatchEvent::Deleted(cm.clone()));
        }
    }
}

#[async_trait::async_trait]
impl ConfigMapApi for FakeCluster {
    async fn get(&self, name: &ResourceName) -> anyhow::Result<Option<ConfigMap>> {
        tokio::task::yield_now().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(self.state.lock().objects.get(name).cloned())
    }

    async fn create(&self, cm: &ConfigMap) -> anyhow::Result<ConfigMap> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        let name = id(cm);
        if state.objects.contains_key(&name) {
            anyhow::bail!("configmaps {name} already exists");
        }
        let mut cm = cm.clone();
        state.stamp(&mut cm);
        self.writes.fetch_add(1, Ordering::SeqCst);
        state.store(cm.clone(), WatchEvent::Added);
        Ok(cm)
    }

    async fn replace(&self, cm: &ConfigMap) -> anyhow::Result<ConfigMap> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        let name = id(cm);
        let current = match state.objects.get(&name) {
            Some(current) => current,
            None => anyhow::bail!("configmaps {name} not found"),
        };
        if current.metadata.resource_version != cm.metadata.resource_version {
            anyhow::bail!("conflict: configmaps {name} has been modified");
        }
        let mut cm = cm.clone();
        state.stamp(&mut cm);
        self.writes.fetch_add(1, Ordering::SeqCst);
        state.store(cm.clone(), WatchEvent::Modified);
        Ok(cm)
    }

    fn namespaced(&self, namespace: &str) -> Arc<dyn ResourceClient<ConfigMap>> {
        Arc::new(Namespaced {
            state: self.state.clone(),
            fail_reads: self.fail_reads.clone(),
            namespace: namespace.to_string(),
        })
    }
}

// === impl State ===

impl State {
    fn stamp(&mut self, cm: &mut ConfigMap) {
        self.version += 1;
        cm.metadata.resource_version = Some(self.version.to_string());
        if cm.metadata.uid.is_none() {
            cm.metadata.uid = Some(format!("uid-{}", id(cm)));
        }
    }

    fn store(&mut self, cm: ConfigMap, event: fn(ConfigMap) -> WatchEvent<ConfigMap>) {
        self.objects.insert(id(&cm), cm.clone());
        self.notify(&cm, event(cm.clone()));
    }

    fn notify(&mut self, cm: &ConfigMap, event: WatchEvent<ConfigMap>) {
        let ns = cm.metadata.namespace.clone().unwrap_or_default();
        if let Some(watches) = self.watches.get_mut(&ns) {
            watches.retain(|(opts, tx)| !matches(opts, cm) || tx.send(event.clone()).is_ok());
        }
    }
}

fn id(cm: &ConfigMap) -> ResourceName {
    ResourceName::new(
        cm.metadata.namespace.clone().unwrap_or_default(),
        cm.metadata.name.clone().unwrap_or_default(),
    )
}

fn matches(opts: &ListOptions, cm: &ConfigMap) -> bool {
    let Some((key, value)) = opts
        .label_selector
        .as_deref()
        .and_then(|s| s.split_once('='))
    else {
        return true;
    };
    cm.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map_or(false, |v| v == value)
}

// === impl Namespaced ===

#[async_trait::async_trait]
impl ResourceClient<ConfigMap> for Namespaced {
    async fn list(&self, opts: &ListOptions) -> anyhow::Result<Vec<ConfigMap>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(self
            .state
            .lock()
            .objects
            .values()
            .filter(|cm| cm.metadata.namespace.as_deref() == Some(&self.namespace))
            .filter(|cm| matches(opts, cm))
            .cloned()
            .collect())
    }

    async fn watch(&self, opts: &ListOptions) -> anyhow::Result<EventStream<ConfigMap>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .watches
            .entry(self.namespace.clone())
            .or_default()
            .push((opts.clone(), tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

// === impl FakeNamespaces ===

impl FakeNamespaces {
    pub fn new(names: Vec<&str>) -> Arc<Self> {
        let this = Arc::new(Self::default());
        for name in names {
            this.add(name);
        }
        this
    }

    pub fn add(&self, name: &str) {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = self.state.lock();
        state.0.insert(name.to_string(), ns.clone());
        state.1.retain(|tx| tx.send(WatchEvent::Added(ns.clone())).is_ok());
    }

    pub fn remove(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(ns) = state.0.remove(name) {
            state.1.retain(|tx| tx.send(WatchEvent::Deleted(ns.clone())).is_ok());
        }
    }
}

#[async_trait::async_trait]
impl ResourceClient<Namespace> for FakeNamespaces {
    async fn list(&self, _: &ListOptions) -> anyhow::Result<Vec<Namespace>> {
        Ok(self.state.lock().0.values().cloned().collect())
    }

    async fn watch(&self, _: &ListOptions) -> anyhow::Result<EventStream<Namespace>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().1.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
