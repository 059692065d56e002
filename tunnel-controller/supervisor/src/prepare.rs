use crate::{instance, Error};
use cloudflared_tunnel_controller_core::{
    annotations::{self, TunnelState},
    config::IngressRule,
    credentials::{CredentialError, CredentialStore, Credentials},
    provider::{ProviderError, TunnelFilter, TunnelInfo, TunnelProvider},
    ResourceName, TunnelParams, Uuid,
};
use cloudflared_tunnel_controller_k8s_store::{Artifact, Event, Registration, Store};
use std::{collections::BTreeSet, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

const SECRET_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct PrepareConfig {
    /// The account tag recorded in newly created credentials.
    pub account: String,

    /// Prefixes registered tunnel names.
    pub cluster: String,
}

/// Binds `preparing` artifacts to a registered tunnel and marks them ready.
///
/// An artifact is prepared by finding its tunnel with the provider, creating
/// the tunnel and its credentials if none exists, and routing its hostnames.
/// Deleted artifacts have their tunnel and credentials removed.
pub struct TunnelPreparer {
    store: Store,
    credentials: Arc<dyn CredentialStore>,
    provider: Arc<dyn TunnelProvider>,
    config: PrepareConfig,
}

// === impl TunnelPreparer ===

impl TunnelPreparer {
    pub fn new(
        store: Store,
        credentials: Arc<dyn CredentialStore>,
        provider: Arc<dyn TunnelProvider>,
        config: PrepareConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            provider,
            config,
        }
    }

    pub async fn handle(&self, event: Event<Artifact>) {
        match event {
            Event::Added(artifact) | Event::Modified(artifact) => match artifact.state() {
                Some(Ok(TunnelState::Preparing)) => {
                    if let Err(error) = self.prepare(&artifact).await {
                        error!(tunnel = %artifact.id(), %error, "Failed to prepare tunnel");
                    }
                }
                Some(Ok(TunnelState::Ready)) => {}
                Some(Err(error)) => error!(tunnel = %artifact.id(), %error, "Invalid tunnel state"),
                None => error!(tunnel = %artifact.id(), "Tunnel has no state"),
            },
            Event::Deleted(artifact) => {
                if let Err(error) = self.teardown(&artifact).await {
                    error!(tunnel = %artifact.id(), %error, "Failed to delete tunnel");
                }
            }
        }
    }

    /// Subscribes to the store, preparing artifacts one at a time on a
    /// background task.
    pub fn spawn_handler(self: &Arc<Self>) -> (Registration, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registration = self.store.register(move |_, event| {
            let _ = tx.send(event.clone());
        });
        let preparer = self.clone();
        let task = tokio::spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    preparer.handle(event).await;
                }
                debug!("Store subscription closed");
            }
            .instrument(info_span!("prepare")),
        );
        (registration, task)
    }

    async fn prepare(&self, artifact: &Artifact) -> Result<(), Error> {
        let tunnel = tunnel_params(artifact)?;
        let cfd_name = tunnel.display_name(&self.config.cluster);

        let id = match self.find(&cfd_name).await? {
            Some(found) => {
                let secret = instance::secret_name(artifact, &artifact.namespace)?;
                self.credentials.fetch(&secret, found.id).await?;
                debug!(tunnel = %cfd_name, id = %found.id, "Found tunnel");
                found.id
            }
            None => self.create(&tunnel, &cfd_name).await?,
        };

        let hostnames = artifact
            .fragments
            .values()
            .filter_map(|fragment| IngressRule::from_fragment(fragment).ok())
            .flatten()
            .filter_map(|rule| rule.routed_hostname().map(str::to_string))
            .collect::<BTreeSet<_>>();
        for hostname in hostnames {
            match self.provider.route_tunnel(id, &hostname).await {
                Ok(()) | Err(ProviderError::AlreadyRouted { .. }) => {}
                Err(error) => warn!(%hostname, %error, "Failed to route hostname"),
            }
        }

        if !self.store.promote(artifact, id, &cfd_name).await? {
            debug!(tunnel = %artifact.id(), "Artifact changed while preparing");
        }
        Ok(())
    }

    /// Registers a new tunnel and stores its credentials. The tunnel is
    /// deleted again if its credentials cannot be stored.
    async fn create(&self, tunnel: &TunnelParams, cfd_name: &str) -> Result<Uuid, Error> {
        let secret = rand::random::<[u8; SECRET_LEN]>();
        let created = self.provider.create_tunnel(cfd_name, &secret).await?;
        let credentials = Credentials::new(self.config.account.clone(), created.id, &secret);
        if let Err(error) = self.credentials.create(tunnel, credentials).await {
            if let Err(error) = self.provider.delete_tunnel(created.id).await {
                warn!(tunnel = %cfd_name, id = %created.id, %error, "Failed to delete tunnel");
            }
            return Err(error.into());
        }
        info!(tunnel = %cfd_name, id = %created.id, "Created tunnel");
        Ok(created.id)
    }

    async fn teardown(&self, artifact: &Artifact) -> Result<(), Error> {
        let tunnel = tunnel_params(artifact)?;
        let cfd_name = tunnel.display_name(&self.config.cluster);
        if let Some(found) = self.find(&cfd_name).await? {
            self.provider.delete_tunnel(found.id).await?;
            info!(tunnel = %cfd_name, id = %found.id, "Deleted tunnel");
        }
        match self.credentials.delete(&tunnel).await {
            Ok(()) | Err(CredentialError::NotFound(_)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn find(&self, cfd_name: &str) -> Result<Option<TunnelInfo>, Error> {
        let filter = TunnelFilter::named(cfd_name);
        let tunnels = self.provider.list_tunnels(&filter).await?;
        Ok(tunnels.into_iter().find(|t| filter.matches(t)))
    }
}

impl std::fmt::Debug for TunnelPreparer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelPreparer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn tunnel_params(artifact: &Artifact) -> Result<TunnelParams, Error> {
    let name = artifact
        .annotation(annotations::TUNNEL_NAME)
        .ok_or(Error::MissingAnnotation(annotations::TUNNEL_NAME))?;
    let ResourceName { namespace, name } = ResourceName::from_fqdn(name, &artifact.namespace);
    Ok(TunnelParams::new(namespace, name))
}
