use crate::{
    instance::{RunningInstance, Source},
    Error, SupervisorMetrics,
};
use cloudflared_tunnel_controller_core::{
    annotations::TunnelState, config::IngressRule, credentials::CredentialStore,
    provider::TunnelProvider, InstanceId, ResourceName,
};
use cloudflared_tunnel_controller_k8s_store::{Artifact, Event, Registration, Store};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Instance directories are created under `<root>/<namespace>/<name>/`.
    pub root: PathBuf,

    /// The tunnel agent executable.
    pub cloudflared: PathBuf,

    /// Namespace for secret references that don't name one.
    pub default_namespace: String,

    /// Keep instance directories after their process stops.
    pub preserve: bool,
}

/// Runs at most one tunnel agent per artifact.
pub struct TunnelRunner {
    ctx: Arc<Context>,
    tunnels: Mutex<HashMap<ResourceName, Arc<Tunnel>>>,
}

/// A snapshot of a tunnel's current instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub dir: PathBuf,
    pub pid: Option<u32>,
    pub running: bool,
}

pub(crate) struct Context {
    pub(crate) config: SupervisorConfig,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) provider: Arc<dyn TunnelProvider>,
    pub(crate) metrics: SupervisorMetrics,
    pub(crate) shutdown: CancellationToken,
}

/// A tunnel's instance slot. Once retired, it is no longer tracked by the
/// runner and refuses new instances.
#[derive(Default)]
struct Tunnel {
    current: tokio::sync::Mutex<Option<RunningInstance>>,
    retired: AtomicBool,
}

// === impl TunnelRunner ===

impl TunnelRunner {
    pub fn new(
        config: SupervisorConfig,
        credentials: Arc<dyn CredentialStore>,
        provider: Arc<dyn TunnelProvider>,
        metrics: SupervisorMetrics,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                config,
                credentials,
                provider,
                metrics,
                shutdown: CancellationToken::new(),
            }),
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the artifact's rules, replacing the tunnel's current instance
    /// when the rules changed.
    pub async fn start(&self, artifact: &Artifact) -> Result<(), Error> {
        loop {
            if self.ctx.shutdown.is_cancelled() {
                debug!(tunnel = %artifact.id(), "Ignoring start after shutdown");
                return Ok(());
            }
            let tunnel = self.tunnels.lock().entry(artifact.id()).or_default().clone();
            if tunnel.start(&self.ctx, artifact).await? {
                return Ok(());
            }
            // Stopped concurrently; retry against a fresh slot.
        }
    }

    /// Stops the tunnel's instance and forgets the tunnel.
    pub async fn stop(&self, name: &ResourceName) {
        let tunnel = self.tunnels.lock().remove(name);
        if let Some(tunnel) = tunnel {
            tunnel.retire(&self.ctx).await;
        }
    }

    /// Stops every instance. Later starts are ignored.
    pub async fn shutdown(&self) {
        let tunnels = std::mem::take(&mut *self.tunnels.lock());
        for tunnel in tunnels.into_values() {
            tunnel.retire(&self.ctx).await;
        }
        // Kills anything started while the tunnels above were stopping.
        self.ctx.shutdown.cancel();
        info!("Stopped all tunnel agents");
    }

    pub async fn instance(&self, name: &ResourceName) -> Option<InstanceInfo> {
        let tunnel = self.tunnels.lock().get(name).cloned()?;
        let current = tunnel.current.lock().await;
        current.as_ref().map(|instance| InstanceInfo {
            id: instance.id.clone(),
            dir: instance.dir.clone(),
            pid: instance.pid,
            running: instance.is_alive(),
        })
    }

    /// Reacts to a store event. Only artifacts marked ready are run; a
    /// deleted artifact always stops its tunnel.
    pub async fn handle(&self, event: Event<Artifact>) {
        let artifact = match event {
            Event::Deleted(artifact) => {
                self.stop(&artifact.id()).await;
                return;
            }
            Event::Added(artifact) | Event::Modified(artifact) => artifact,
        };

        match artifact.state() {
            Some(Ok(TunnelState::Ready)) => {
                if let Err(error) = self.start(&artifact).await {
                    error!(tunnel = %artifact.id(), %error, "Failed to start tunnel");
                }
            }
            Some(Ok(TunnelState::Preparing)) => {
                debug!(tunnel = %artifact.id(), "Tunnel is not ready");
            }
            Some(Err(error)) => error!(tunnel = %artifact.id(), %error, "Invalid tunnel state"),
            None => error!(tunnel = %artifact.id(), "Tunnel has no state"),
        }
    }

    /// Subscribes to the store, handling its events one at a time on a
    /// background task.
    pub fn spawn_handler(self: &Arc<Self>, store: &Store) -> (Registration, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registration = store.register(move |_, event| {
            let _ = tx.send(event.clone());
        });
        let runner = self.clone();
        let task = tokio::spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    runner.handle(event).await;
                }
                debug!("Store subscription closed");
            }
            .instrument(info_span!("supervisor")),
        );
        (registration, task)
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &SupervisorMetrics {
        &self.ctx.metrics
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.tunnels.lock().len()
    }
}

impl std::fmt::Debug for TunnelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRunner")
            .field("config", &self.ctx.config)
            .field("tunnels", &self.tunnels.lock().len())
            .finish()
    }
}

// === impl Tunnel ===

impl Tunnel {
    /// Returns false if the tunnel was retired before the instance started.
    async fn start(&self, ctx: &Context, artifact: &Artifact) -> Result<bool, Error> {
        let mut current = self.current.lock().await;
        if self.retired.load(Ordering::Acquire) {
            return Ok(false);
        }
        let source = decode(artifact);

        if let Some(instance) = current.as_mut() {
            if instance.is_alive() {
                if instance.source == source {
                    debug!(tunnel = %artifact.id(), instance = %instance.id, "Rules unchanged");
                    return Ok(true);
                }
            } else {
                // The process is gone; finish its cleanup before replacing it.
                instance.stop(&ctx.metrics).await;
                *current = None;
            }
        }

        let id = InstanceId::from_fragments(&artifact.fragments);
        let instance = RunningInstance::start(ctx, artifact, id, source).await?;
        if let Some(mut old) = current.replace(instance) {
            old.stop(&ctx.metrics).await;
        }
        Ok(true)
    }

    async fn retire(&self, ctx: &Context) {
        let mut current = self.current.lock().await;
        self.retired.store(true, Ordering::Release);
        if let Some(mut instance) = current.take() {
            instance.stop(&ctx.metrics).await;
        }
    }
}

fn decode(artifact: &Artifact) -> Source {
    artifact
        .fragments
        .iter()
        .filter_map(|(key, fragment)| match IngressRule::from_fragment(fragment) {
            Ok(rules) => Some((key.clone(), rules)),
            Err(error) => {
                warn!(tunnel = %artifact.id(), %key, %error, "Skipping malformed fragment");
                None
            }
        })
        .collect()
}
