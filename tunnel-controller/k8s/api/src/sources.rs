use crate::client::ResourceClient;
use k8s_openapi::api::{core::v1::Service, networking::v1::Ingress};
use kube::{api::Api, Client};
use std::sync::Arc;

/// Opens per-namespace watches over the resources that contribute ingress
/// rules.
pub trait SourceApi: Send + Sync + 'static {
    fn ingresses(&self, namespace: &str) -> Arc<dyn ResourceClient<Ingress>>;

    fn services(&self, namespace: &str) -> Arc<dyn ResourceClient<Service>>;
}

#[derive(Clone)]
pub struct KubeSources {
    client: Client,
}

// === impl KubeSources ===

impl KubeSources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl SourceApi for KubeSources {
    fn ingresses(&self, namespace: &str) -> Arc<dyn ResourceClient<Ingress>> {
        Arc::new(Api::<Ingress>::namespaced(self.client.clone(), namespace))
    }

    fn services(&self, namespace: &str) -> Arc<dyn ResourceClient<Service>> {
        Arc::new(Api::<Service>::namespaced(self.client.clone(), namespace))
    }
}
