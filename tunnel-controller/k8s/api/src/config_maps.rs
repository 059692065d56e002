use crate::{client::ResourceClient, ConfigMap};
use cloudflared_tunnel_controller_core::ResourceName;
use kube::{
    api::{Api, PostParams},
    Client,
};
use std::sync::Arc;

/// Reads and writes configuration artifacts and opens per-namespace watches
/// over them.
#[async_trait::async_trait]
pub trait ConfigMapApi: Send + Sync + 'static {
    async fn get(&self, name: &ResourceName) -> anyhow::Result<Option<ConfigMap>>;

    async fn create(&self, cm: &ConfigMap) -> anyhow::Result<ConfigMap>;

    /// Replaces an existing object. The object's `resourceVersion` is sent
    /// along, so a concurrent write fails with a conflict.
    async fn replace(&self, cm: &ConfigMap) -> anyhow::Result<ConfigMap>;

    fn namespaced(&self, namespace: &str) -> Arc<dyn ResourceClient<ConfigMap>>;
}

#[derive(Clone)]
pub struct KubeConfigMaps {
    client: Client,
}

// === impl KubeConfigMaps ===

impl KubeConfigMaps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ConfigMapApi for KubeConfigMaps {
    async fn get(&self, name: &ResourceName) -> anyhow::Result<Option<ConfigMap>> {
        let cm = self.api(&name.namespace).get_opt(&name.name).await?;
        Ok(cm)
    }

    async fn create(&self, cm: &ConfigMap) -> anyhow::Result<ConfigMap> {
        let ns = cm.metadata.namespace.as_deref().unwrap_or("default");
        let created = self.api(ns).create(&PostParams::default(), cm).await?;
        Ok(created)
    }

    async fn replace(&self, cm: &ConfigMap) -> anyhow::Result<ConfigMap> {
        let ns = cm.metadata.namespace.as_deref().unwrap_or("default");
        let name = cm
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("ConfigMap must have a name"))?;
        let replaced = self
            .api(ns)
            .replace(name, &PostParams::default(), cm)
            .await?;
        Ok(replaced)
    }

    fn namespaced(&self, namespace: &str) -> Arc<dyn ResourceClient<ConfigMap>> {
        Arc::new(self.api(namespace))
    }
}
