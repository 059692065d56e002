//! Prepares tunnel configurations and runs one tunnel agent process per ready
//! configuration.
//!
//! Each tunnel's instance is identified by a hash of its rule content, so
//! edits that leave the rules untouched never restart the agent. A changed
//! configuration starts a new instance before the previous one is killed.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod instance;
pub mod metrics;
mod prepare;
mod runner;


pub use self::{
    metrics::SupervisorMetrics,
    prepare::{PrepareConfig, TunnelPreparer},
    runner::{InstanceInfo, SupervisorConfig, TunnelRunner},
};

use cloudflared_tunnel_controller_core::{credentials::CredentialError, provider::ProviderError};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("instance directory {0} already exists; instance is already running")]
    AlreadyRunning(PathBuf),

    #[error("missing annotation {0}")]
    MissingAnnotation(&'static str),

    #[error("invalid tunnel id {0:?}")]
    InvalidTunnelId(String),

    #[error("failed to resolve credentials: {0}")]
    Credentials(#[from] CredentialError),

    #[error("tunnel provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] cloudflared_tunnel_controller_k8s_store::Error),

    #[error("failed to route {hostname}: {source}")]
    Route {
        hostname: String,
        #[source]
        source: ProviderError,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to encode credentials: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
