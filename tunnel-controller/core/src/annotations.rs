//! Annotation keys read and written on tunnel configuration artifacts.

pub const PREFIX: &str = "cloudflare.com";

pub const TUNNEL_NAME: &str = "cloudflare.com/tunnel-name";
pub const TUNNEL_ID: &str = "cloudflare.com/tunnel-id";
pub const TUNNEL_CFD_NAME: &str = "cloudflare.com/tunnel-cfd-name";
pub const TUNNEL_EXTERNAL_NAME: &str = "cloudflare.com/tunnel-external-name";
pub const TUNNEL_MAPPING: &str = "cloudflare.com/tunnel-mapping";
pub const TUNNEL_K8S_SECRET: &str = "cloudflare.com/tunnel-k8s-secret";
pub const TUNNEL_K8S_CONFIGMAP: &str = "cloudflare.com/tunnel-k8s-configmap";
pub const TUNNEL_STATE: &str = "cloudflare.com/tunnel-state";

/// The lifecycle state recorded in the [`TUNNEL_STATE`] annotation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// Written by every fragment change; awaits external promotion.
    Preparing,
    /// Validated and safe to run.
    Ready,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tunnel state: {0:?}")]
pub struct InvalidTunnelState(String);

// === impl TunnelState ===

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Ready => "ready",
        }
    }
}

impl std::str::FromStr for TunnelState {
    type Err = InvalidTunnelState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preparing" => Ok(Self::Preparing),
            "ready" => Ok(Self::Ready),
            s => Err(InvalidTunnelState(s.to_string())),
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_prefix() {
        for key in [
            TUNNEL_NAME,
            TUNNEL_ID,
            TUNNEL_CFD_NAME,
            TUNNEL_EXTERNAL_NAME,
            TUNNEL_MAPPING,
            TUNNEL_K8S_SECRET,
            TUNNEL_K8S_CONFIGMAP,
            TUNNEL_STATE,
        ] {
            assert!(key.starts_with(PREFIX), "{key}");
        }
    }

    #[test]
    fn parses_states() {
        assert_eq!("ready".parse::<TunnelState>().unwrap(), TunnelState::Ready);
        assert_eq!(
            "preparing".parse::<TunnelState>().unwrap(),
            TunnelState::Preparing
        );
        assert!("Ready".parse::<TunnelState>().is_err());
        assert!("".parse::<TunnelState>().is_err());
    }
}
