//! The tunnel agent's `credentials.json` and the store it is kept in.

use crate::{ResourceName, TunnelParams};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "AccountTag")]
    pub account_tag: String,

    /// The base64-encoded tunnel secret.
    #[serde(rename = "TunnelSecret")]
    pub tunnel_secret: String,

    #[serde(rename = "TunnelID")]
    pub tunnel_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("secret {0} not found")]
    NotFound(ResourceName),

    #[error("secret {secret} does not match tunnel {expected}: {reason}")]
    Mismatch {
        secret: ResourceName,
        expected: Uuid,
        reason: String,
    },

    #[error("secret {secret} is malformed: {reason}")]
    Malformed {
        secret: ResourceName,
        reason: String,
    },

    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// Looks up, stores and deletes tunnel credentials.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetches the credentials stored in `secret`, verifying they belong to
    /// `tunnel_id`.
    async fn fetch(
        &self,
        secret: &ResourceName,
        tunnel_id: Uuid,
    ) -> Result<Credentials, CredentialError>;

    /// Stores credentials for a newly created tunnel.
    async fn create(
        &self,
        tunnel: &TunnelParams,
        credentials: Credentials,
    ) -> Result<Credentials, CredentialError>;

    async fn delete(&self, tunnel: &TunnelParams) -> Result<(), CredentialError>;
}

// === impl Credentials ===

impl Credentials {
    pub fn new(account_tag: impl Into<String>, tunnel_id: Uuid, secret: &[u8]) -> Self {
        Self {
            account_tag: account_tag.into(),
            tunnel_secret: STANDARD.encode(secret),
            tunnel_id,
        }
    }

    pub fn secret_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.tunnel_secret)
    }
}
