use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^a-zA-Z0-9]+").expect("regex must compile"));

const CONFIG_MAP_PREFIX: &str = "cfd-tunnel-cfg";
const SECRET_PREFIX: &str = "cfd-tunnel-key";

/// A namespaced Kubernetes object reference, formatted as `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    pub namespace: String,
    pub name: String,
}

/// Identifies one logical tunnel: the external tunnel name and the namespace
/// its artifacts and credentials live in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TunnelParams {
    pub namespace: String,
    pub name: String,
}

// === impl ResourceName ===

impl ResourceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `namespace/name`, falling back to `default_ns` when the value
    /// carries no namespace.
    pub fn from_fqdn(fqdn: &str, default_ns: &str) -> Self {
        match fqdn.split_once('/') {
            Some((ns, name)) => Self::new(ns, name.split('/').next().unwrap_or(name)),
            None => Self::new(default_ns, fqdn),
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl TunnelParams ===

impl TunnelParams {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The ConfigMap holding the merged configuration for this tunnel.
    pub fn config_map_name(&self) -> ResourceName {
        self.resource_name(CONFIG_MAP_PREFIX)
    }

    /// The Secret holding this tunnel's `credentials.json`.
    pub fn secret_name(&self) -> ResourceName {
        self.resource_name(SECRET_PREFIX)
    }

    /// The tunnel name registered with the provider: `cluster/namespace/name`.
    pub fn display_name(&self, cluster: &str) -> String {
        format!("{}/{}/{}", cluster, self.namespace, self.name)
    }

    fn resource_name(&self, prefix: &str) -> ResourceName {
        let name = NON_ALPHANUMERIC.replace_all(&self.name, "-");
        ResourceName::new(self.namespace.clone(), format!("{prefix}.{name}"))
    }
}
