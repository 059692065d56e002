//! A [`TunnelProvider`] backed by the tunnel agent's own management commands.

use anyhow::anyhow;
use base64::{engine::general_purpose::STANDARD, Engine};
use cloudflared_tunnel_controller_core::{
    provider::{ProviderError, TunnelFilter, TunnelInfo, TunnelProvider},
    Uuid,
};
use serde::Deserialize;
use std::{path::PathBuf, process::Stdio};
use tokio::process::Command;
use tracing::debug;

/// The provider's error code for a hostname that already has a record.
const ALREADY_ROUTED: &str = "code: 1003";

/// Deletion time reported for tunnels that were never deleted.
const NEVER: &str = "0001-01-01T00:00:00Z";

#[derive(Clone, Debug)]
pub struct CloudflaredCli {
    binary: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Listed {
    id: Uuid,
    name: String,
    #[serde(default)]
    deleted_at: Option<String>,
}

// === impl CloudflaredCli ===

impl CloudflaredCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs `cloudflared tunnel <args>`, returning its stdout. Failures carry
    /// the command's combined output.
    async fn tunnel(&self, args: &[&str]) -> Result<Vec<u8>, Failed> {
        debug!(?args, "Running cloudflared");
        let output = Command::new(&self.binary)
            .arg("tunnel")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|error| Failed::Spawn(anyhow!("{}: {error}", self.binary.display())))?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            message.push('\n');
            message.push_str(stdout.trim());
        }
        Err(Failed::Exit {
            status: output.status,
            message,
        })
    }
}

#[async_trait::async_trait]
impl TunnelProvider for CloudflaredCli {
    async fn list_tunnels(&self, filter: &TunnelFilter) -> Result<Vec<TunnelInfo>, ProviderError> {
        let mut args = vec!["list", "--output", "json"];
        if let Some(name) = filter.name.as_deref() {
            args.extend(["--name", name]);
        }
        if filter.include_deleted {
            args.push("--show-deleted");
        }
        let stdout = self.tunnel(&args).await?;
        let listed: Vec<Listed> = serde_json::from_slice(&stdout).map_err(anyhow::Error::from)?;
        Ok(listed
            .into_iter()
            .map(TunnelInfo::from)
            .filter(|t| filter.matches(t))
            .collect())
    }

    async fn create_tunnel(&self, name: &str, secret: &[u8]) -> Result<TunnelInfo, ProviderError> {
        let secret = STANDARD.encode(secret);
        let stdout = self
            .tunnel(&["create", "--output", "json", "--secret", &secret, name])
            .await?;
        let created: Listed = serde_json::from_slice(&stdout).map_err(anyhow::Error::from)?;
        Ok(created.into())
    }

    async fn delete_tunnel(&self, id: Uuid) -> Result<(), ProviderError> {
        self.tunnel(&["delete", "--force", &id.to_string()]).await?;
        Ok(())
    }

    async fn route_tunnel(&self, id: Uuid, hostname: &str) -> Result<(), ProviderError> {
        match self
            .tunnel(&["route", "dns", &id.to_string(), hostname])
            .await
        {
            Ok(_) => Ok(()),
            Err(Failed::Exit { message, .. }) if message.contains(ALREADY_ROUTED) => {
                Err(ProviderError::AlreadyRouted {
                    hostname: hostname.to_string(),
                })
            }
            Err(failed) => Err(failed.into()),
        }
    }
}

impl From<Listed> for TunnelInfo {
    fn from(Listed { id, name, deleted_at }: Listed) -> Self {
        Self {
            id,
            name,
            deleted_at: deleted_at.filter(|at| !at.is_empty() && at != NEVER),
        }
    }
}

enum Failed {
    Spawn(anyhow::Error),
    Exit {
        status: std::process::ExitStatus,
        message: String,
    },
}

impl From<Failed> for ProviderError {
    fn from(failed: Failed) -> Self {
        match failed {
            Failed::Spawn(error) => ProviderError::Api(error),
            Failed::Exit { status, message } => {
                ProviderError::Api(anyhow!("cloudflared {status}: {message}"))
            }
        }
    }
}
