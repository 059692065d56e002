//! Merges ingress rule fragments from many producers into one persisted
//! configuration artifact per tunnel.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod artifact;
pub mod metrics;
mod store;


pub use self::{
    artifact::Artifact,
    metrics::StoreMetrics,
    store::{Store, StoreConfig},
};
pub use cloudflared_tunnel_controller_k8s_watcher::{Event, Registration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to serialize rules: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error(transparent)]
    Api(#[from] anyhow::Error),

    #[error("failed to watch artifacts: {0}")]
    Watch(#[from] cloudflared_tunnel_controller_k8s_watcher::Error),
}
