#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod config_maps;
mod secrets;
mod sources;

pub use self::{
    client::{EventStream, ListOptions, ResourceClient, WatchEvent},
    config_maps::{ConfigMapApi, KubeConfigMaps},
    secrets::{credentials_from_secret, SecretCredentials, CREDENTIALS_KEY},
    sources::{KubeSources, SourceApi},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{ConfigMap, Namespace, Secret, Service},
        networking::v1::Ingress,
    },
    apimachinery::{self, pkg::apis::meta::v1::ObjectMeta},
    ByteString,
};
pub use kube::{
    api::{Api, ListParams, PostParams},
    Client, Error, Resource, ResourceExt,
};
