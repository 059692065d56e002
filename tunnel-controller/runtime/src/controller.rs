use crate::{
    k8s::{Namespace, SourceApi},
    lease::{self, Claims},
    producers::{ProducerConfig, Producers},
    store::Store,
    supervisor::{TunnelPreparer, TunnelRunner},
};
use anyhow::{bail, Result};
use cloudflared_tunnel_controller_k8s_watcher::Watcher;
use std::sync::Arc;
use tokio::time;
use tracing::{info, warn};

/// Everything that must only run on the lease holder.
pub(crate) struct Controller {
    pub namespaces: Watcher<Namespace>,
    pub store: Store,
    pub sources: Arc<dyn SourceApi>,
    pub producers: ProducerConfig,
    pub preparer: Arc<TunnelPreparer>,
    pub runner: Option<Arc<TunnelRunner>>,
    pub identity: String,
    pub restart_delay: time::Duration,
}

impl Controller {
    /// Runs until shutdown is signaled. Returns an error when leadership is
    /// lost so the process exits and restarts as a follower.
    pub(crate) async fn run(self, mut claims: Claims, drain: drain::Watch) -> Result<()> {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        tokio::select! {
            acquired = lease::acquired(&mut claims, &self.identity) => acquired?,
            _release = &mut shutdown => return Ok(()),
        }
        info!(identity = %self.identity, "Acquired leadership");

        let (producers, producer_task) = Producers::spawn(
            self.store.clone(),
            self.sources.clone(),
            self.producers.clone(),
        );
        let follows = [
            self.store.follow_namespaces(&self.namespaces),
            producers.follow_namespaces(&self.namespaces),
        ];
        let (prepare, prepare_task) = self.preparer.spawn_handler();
        let handler = self
            .runner
            .as_ref()
            .map(|runner| runner.spawn_handler(&self.store));

        let lost = lease::lost(&mut claims, &self.identity);
        tokio::pin!(lost);
        let mut watching = false;
        let release = loop {
            tokio::select! {
                release = &mut shutdown => break Some(release),
                () = &mut lost => break None,
                () = self.start_namespaces(), if !watching => watching = true,
            }
        };

        // Queued namespace updates land before any watch is torn down.
        for (follow, task) in follows {
            follow.unregister();
            if let Err(error) = task.await {
                warn!(%error, "Namespace task failed");
            }
        }
        self.namespaces.stop().await;
        producers.shutdown().await;
        if let Err(error) = producer_task.await {
            warn!(%error, "Producer task failed");
        }
        self.store.shutdown().await;
        prepare.unregister();
        if let Err(error) = prepare_task.await {
            warn!(%error, "Prepare task failed");
        }
        if let Some((registration, task)) = handler {
            registration.unregister();
            if let Err(error) = task.await {
                warn!(%error, "Supervisor task failed");
            }
        }
        if let Some(runner) = &self.runner {
            runner.shutdown().await;
        }

        match release {
            Some(release) => {
                info!("Controller stopped");
                drop(release);
                Ok(())
            }
            None => bail!("lost leadership to another replica"),
        }
    }

    /// Starts the namespace watch, retrying until it succeeds.
    async fn start_namespaces(&self) {
        loop {
            match self.namespaces.start().await {
                Ok(()) => return,
                Err(error) => {
                    warn!(%error, "Failed to watch namespaces");
                    time::sleep(self.restart_delay).await;
                }
            }
        }
    }
}
