//! Derives ingress rule fragments from annotated Ingresses and Services and
//! feeds them to the configuration store.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod ingress;
mod producer;
mod service;

#[cfg(test)]
mod tests;

pub use self::{
    ingress::ingress_rules,
    producer::Producers,
    service::service_rules,
};
use cloudflared_tunnel_controller_core::{config::IngressRule, ResourceName, TunnelParams};
use tokio::time;

#[derive(Clone, Debug)]
pub struct ProducerConfig {
    /// Ingresses of this class are served from their own rules. Ingresses of
    /// any other class must carry an explicit mapping.
    pub ingress_class: String,

    /// Namespace for tunnel names that don't name one.
    pub tunnel_namespace: String,

    /// When non-empty, only these namespaces are watched.
    pub namespaces: Vec<String>,

    pub restart_delay: time::Duration,
}

/// The rules one resource contributes to one tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contribution {
    pub tunnel: TunnelParams,
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to watch producers: {0}")]
    Watch(#[from] cloudflared_tunnel_controller_k8s_watcher::Error),
}

// === impl ProducerConfig ===

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            ingress_class: "cloudflared".to_string(),
            tunnel_namespace: "default".to_string(),
            namespaces: Vec::new(),
            restart_delay: time::Duration::from_secs(5),
        }
    }
}

fn tunnel_params(fqdn: &str, default_ns: &str) -> TunnelParams {
    let ResourceName { namespace, name } = ResourceName::from_fqdn(fqdn, default_ns);
    TunnelParams::new(namespace, name)
}
