//! A typed, restart-safe cache over a list/watch API.
//!
//! A [`Watcher`] seeds its state with a full list, then applies watch events
//! as they arrive. Every change is delivered to all registered subscribers,
//! along with a snapshot of the full state. Watch disconnects are retried
//! until the watcher is stopped.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod watcher;


pub use self::watcher::{Event, Params, Phase, Registration, Watcher};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("watcher already started")]
    AlreadyStarted,

    #[error("failed to open watch: {0}")]
    Watch(#[source] anyhow::Error),

    #[error("failed to list resources: {0}")]
    List(#[source] anyhow::Error),
}
