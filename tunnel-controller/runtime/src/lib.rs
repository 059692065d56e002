#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
pub mod cloudflared;
mod controller;
mod lease;

pub use self::{args::Args, cloudflared::CloudflaredCli};
pub use cloudflared_tunnel_controller_core as core;
pub use cloudflared_tunnel_controller_k8s_api as k8s;
pub use cloudflared_tunnel_controller_k8s_producers as producers;
pub use cloudflared_tunnel_controller_k8s_store as store;
pub use cloudflared_tunnel_controller_supervisor as supervisor;
