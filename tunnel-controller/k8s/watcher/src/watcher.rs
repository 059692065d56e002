use crate::Error;
use cloudflared_tunnel_controller_k8s_api::{
    EventStream, ListOptions, Resource, ResourceClient, WatchEvent,
};
use futures::prelude::*;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// A change delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum Event<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Started,
    Stopping,
}

#[derive(Clone, Debug)]
pub struct Params {
    pub opts: ListOptions,

    /// How long to wait before reopening a closed watch.
    pub restart_delay: time::Duration,
}

/// A live, uid-keyed snapshot of one resource collection.
pub struct Watcher<T> {
    inner: Arc<Inner<T>>,
}

/// Removes a subscription. Unregistering is idempotent.
#[derive(Clone)]
pub struct Registration {
    unregister: Arc<dyn Fn() + Send + Sync>,
}

type Subscriber<T> = Arc<dyn Fn(&[T], &Event<T>) + Send + Sync>;

struct Inner<T> {
    client: Arc<dyn ResourceClient<T>>,
    params: Params,
    span: tracing::Span,

    lifecycle: tokio::sync::Mutex<Lifecycle>,
    phase: Mutex<Phase>,

    state: RwLock<HashMap<String, T>>,
    subscribers: Mutex<HashMap<u64, Subscriber<T>>>,
    next_id: AtomicU64,

    // Held while a change is applied and delivered, and while a new
    // subscriber is replayed the current state, so that every subscriber
    // observes a consistent baseline before live events. Reentrant so that
    // subscribers may register or unregister from within a callback.
    delivery: ReentrantMutex<()>,

    restarts: AtomicUsize,
}

enum Lifecycle {
    Stopped,
    Started {
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    },
}

// === impl Params ===

impl Default for Params {
    fn default() -> Self {
        Self {
            opts: ListOptions::default(),
            restart_delay: time::Duration::from_secs(5),
        }
    }
}

// === impl Watcher ===

impl<T> Clone for Watcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Watcher<T>
where
    T: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(client: Arc<dyn ResourceClient<T>>, params: Params) -> Self {
        let span = match params.opts.label_selector.as_deref() {
            Some(labels) => info_span!("watch", kind = %T::kind(&()), %labels),
            None => info_span!("watch", kind = %T::kind(&())),
        };
        Self {
            inner: Arc::new(Inner {
                client,
                params,
                span,
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Stopped),
                phase: Mutex::new(Phase::Stopped),
                state: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                delivery: ReentrantMutex::new(()),
                restarts: AtomicUsize::new(0),
            }),
        }
    }

    /// Opens the watch, seeds the state from a full list, and spawns the
    /// event loop.
    ///
    /// The watch is opened before listing so that no change between the list
    /// and the watch is missed. Nothing is spawned if either call fails.
    pub async fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Stopped) {
            return Err(Error::AlreadyStarted);
        }

        let opts = &self.inner.params.opts;
        let events = self
            .inner
            .client
            .watch(opts)
            .instrument(self.inner.span.clone())
            .await
            .map_err(Error::Watch)?;
        let items = self
            .inner
            .client
            .list(opts)
            .instrument(self.inner.span.clone())
            .await
            .map_err(Error::List)?;

        debug!(parent: &self.inner.span, items = items.len(), "Seeding state");
        for item in items {
            self.inner.apply(Event::Added(item));
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            self.inner
                .clone()
                .run(events, shutdown.clone())
                .instrument(self.inner.span.clone()),
        );
        *lifecycle = Lifecycle::Started { shutdown, task };
        *self.inner.phase.lock() = Phase::Started;
        info!(parent: &self.inner.span, "Started");
        Ok(())
    }

    /// Stops the event loop, waits for it to exit, and clears all state and
    /// subscriptions. The watcher may be started again afterwards.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let (shutdown, task) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Started { shutdown, task } => (shutdown, task),
            Lifecycle::Stopped => {
                warn!(parent: &self.inner.span, "Watcher is not started");
                return;
            }
        };
        *self.inner.phase.lock() = Phase::Stopping;

        shutdown.cancel();
        if let Err(error) = task.await {
            warn!(parent: &self.inner.span, %error, "Event loop failed");
        }

        {
            let _delivery = self.inner.delivery.lock();
            self.inner.state.write().clear();
            self.inner.subscribers.lock().clear();
        }
        *self.inner.phase.lock() = Phase::Stopped;
        info!(parent: &self.inner.span, "Stopped");
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    /// Returns a point-in-time copy of the current state.
    pub fn get_state(&self) -> Vec<T> {
        self.inner.state.read().values().cloned().collect()
    }

    /// The number of times the watch has been reopened after a disconnect.
    pub fn restart_count(&self) -> usize {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// Adds a subscriber.
    ///
    /// Before this returns, the subscriber is called once with an
    /// [`Event::Added`] for every item in the current state. Live events are
    /// delivered only after that replay.
    ///
    /// Subscribers run on the event loop with the delivery lock held, so a
    /// slow subscriber stalls every other subscriber and the watch itself.
    /// They must not block or wait on other tasks; forward events to a
    /// channel instead.
    pub fn register_event<F>(&self, f: F) -> Registration
    where
        F: Fn(&[T], &Event<T>) + Send + Sync + 'static,
    {
        let f: Subscriber<T> = Arc::new(f);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let _delivery = self.inner.delivery.lock();
        let snapshot = self.get_state();
        self.inner.subscribers.lock().insert(id, f.clone());
        for item in &snapshot {
            f(&snapshot, &Event::Added(item.clone()));
        }

        let inner = Arc::downgrade(&self.inner);
        Registration::new(move || unregister(&inner, id))
    }
}

fn unregister<T>(inner: &Weak<Inner<T>>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        let _delivery = inner.delivery.lock();
        inner.subscribers.lock().remove(&id);
    }
}

// === impl Registration ===

impl Registration {
    pub fn new(unregister: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            unregister: Arc::new(unregister),
        }
    }

    pub fn unregister(&self) {
        (self.unregister)()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").finish_non_exhaustive()
    }
}

// === impl Inner ===

impl<T> Inner<T>
where
    T: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn run(self: Arc<Self>, mut events: EventStream<T>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                event = events.next() => event,
            };

            match event {
                Some(WatchEvent::Added(obj)) => self.apply(Event::Added(obj)),
                Some(WatchEvent::Modified(obj)) => self.apply(Event::Modified(obj)),
                Some(WatchEvent::Deleted(obj)) => self.apply(Event::Deleted(obj)),
                Some(WatchEvent::Bookmark) => {}
                Some(WatchEvent::Error(error)) => {
                    warn!(%error, "Dropping malformed watch event");
                }
                None => match self.reconnect(&shutdown).await {
                    Some(reopened) => events = reopened,
                    None => return,
                },
            }
        }
    }

    /// Reopens the watch after a disconnect, retrying until it succeeds or
    /// the watcher is stopped. State is kept as-is.
    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<EventStream<T>> {
        loop {
            let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
            info!(restarts, "Watch closed, restarting");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = time::sleep(self.params.restart_delay) => {}
            }

            match self.client.watch(&self.params.opts).await {
                Ok(events) => return Some(events),
                Err(error) => warn!(%error, "Failed to reopen watch"),
            }
        }
    }

    fn apply(&self, event: Event<T>) {
        let obj = match &event {
            Event::Added(obj) | Event::Modified(obj) | Event::Deleted(obj) => obj,
        };
        let uid = match obj.meta().uid.as_deref() {
            Some(uid) => uid.to_string(),
            None => {
                warn!(name = ?obj.meta().name, "Dropping event for object without uid");
                return;
            }
        };

        let _delivery = self.delivery.lock();
        let snapshot = {
            let mut state = self.state.write();
            match &event {
                Event::Added(obj) | Event::Modified(obj) => {
                    state.insert(uid, obj.clone());
                }
                Event::Deleted(_) => {
                    state.remove(&uid);
                }
            }
            state.values().cloned().collect::<Vec<_>>()
        };
        let subscribers = self.subscribers.lock().values().cloned().collect::<Vec<_>>();
        for subscriber in subscribers {
            subscriber(&snapshot, &event);
        }
    }
}
