//! The tunnel provider's management API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunnelFilter {
    pub name: Option<String>,
    pub include_deleted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The hostname already routes to a tunnel. Routing is idempotent, so
    /// callers treat this as success.
    #[error("{hostname} is already routed")]
    AlreadyRouted { hostname: String },

    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn list_tunnels(&self, filter: &TunnelFilter) -> Result<Vec<TunnelInfo>, ProviderError>;

    async fn create_tunnel(&self, name: &str, secret: &[u8]) -> Result<TunnelInfo, ProviderError>;

    async fn delete_tunnel(&self, id: Uuid) -> Result<(), ProviderError>;

    /// Routes `hostname` to the tunnel through a DNS record.
    async fn route_tunnel(&self, id: Uuid, hostname: &str) -> Result<(), ProviderError>;
}

// === impl TunnelFilter ===

impl TunnelFilter {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            include_deleted: false,
        }
    }

    pub fn matches(&self, tunnel: &TunnelInfo) -> bool {
        if !self.include_deleted && tunnel.deleted_at.is_some() {
            return false;
        }
        self.name.as_ref().map_or(true, |n| *n == tunnel.name)
    }
}
