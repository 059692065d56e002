#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod config;
pub mod credentials;
mod identity;
pub mod labels;
pub mod mapping;
mod name;
pub mod provider;

pub use self::{
    identity::{fragment_key, InstanceId},
    name::{ResourceName, TunnelParams},
};
pub use uuid::Uuid;

pub const CONTROLLER_NAME: &str = "cloudflared-controller";

/// The producer-key to serialized rule fragment mapping carried by every
/// configuration artifact.
pub type Fragments = std::collections::BTreeMap<String, String>;
