use cloudflared_tunnel_controller_core::{
    annotations::{self, TunnelState},
    Fragments, ResourceName,
};
use cloudflared_tunnel_controller_k8s_api::{ConfigMap, ObjectMeta};
use std::collections::BTreeMap;

/// An immutable snapshot of one tunnel's merged configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Artifact {
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub fragments: Fragments,
    pub resource_version: Option<String>,
}

// === impl Artifact ===

impl Artifact {
    pub fn id(&self) -> ResourceName {
        ResourceName::new(self.namespace.clone(), self.name.clone())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// The lifecycle state annotation, if present. `Some(Err(_))` carries an
    /// unrecognized value.
    pub fn state(&self) -> Option<Result<TunnelState, annotations::InvalidTunnelState>> {
        self.annotation(annotations::TUNNEL_STATE).map(str::parse)
    }

    /// Structural equality on everything a consumer acts upon.
    pub fn same_content(&self, other: &Self) -> bool {
        self.fragments == other.fragments
            && self.labels == other.labels
            && self.annotations == other.annotations
    }
}

impl From<&ConfigMap> for Artifact {
    fn from(cm: &ConfigMap) -> Self {
        let meta = &cm.metadata;
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            fragments: cm.data.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone(),
        }
    }
}

impl From<&Artifact> for ConfigMap {
    fn from(artifact: &Artifact) -> Self {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(artifact.namespace.clone()),
                name: Some(artifact.name.clone()),
                annotations: Some(artifact.annotations.clone()),
                labels: Some(artifact.labels.clone()),
                resource_version: artifact.resource_version.clone(),
                ..Default::default()
            },
            data: Some(artifact.fragments.clone()),
            ..Default::default()
        }
    }
}
