use futures::prelude::*;
use kube::{
    api::{Api, ListParams, WatchParams},
    Resource,
};
use serde::de::DeserializeOwned;
use std::{fmt, pin::Pin};

/// Options passed through, unmodified, to list and watch calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
}

/// One notification from a watch stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    Bookmark,
    /// The server sent an error status or a payload that could not be
    /// decoded.
    Error(String),
}

pub type EventStream<T> = Pin<Box<dyn Stream<Item = WatchEvent<T>> + Send + 'static>>;

/// Lists and watches one resource kind.
#[async_trait::async_trait]
pub trait ResourceClient<T>: Send + Sync + 'static {
    async fn list(&self, opts: &ListOptions) -> anyhow::Result<Vec<T>>;

    /// Opens a watch. The stream ends when the server closes the connection.
    async fn watch(&self, opts: &ListOptions) -> anyhow::Result<EventStream<T>>;
}

// === impl ListOptions ===

impl ListOptions {
    pub fn labels(selector: impl Into<String>) -> Self {
        Self {
            label_selector: Some(selector.into()),
        }
    }
}

// === impl ResourceClient for kube::Api ===

#[async_trait::async_trait]
impl<T> ResourceClient<T> for Api<T>
where
    T: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    async fn list(&self, opts: &ListOptions) -> anyhow::Result<Vec<T>> {
        let mut params = ListParams::default();
        if let Some(selector) = opts.label_selector.as_deref() {
            params = params.labels(selector);
        }
        let list = Api::<T>::list(self, &params).await?;
        Ok(list.items)
    }

    async fn watch(&self, opts: &ListOptions) -> anyhow::Result<EventStream<T>> {
        let mut params = WatchParams::default();
        if let Some(selector) = opts.label_selector.as_deref() {
            params = params.labels(selector);
        }
        let events = Api::<T>::watch(self, &params, "").await?;
        Ok(Box::pin(events.map(|ev| match ev {
            Ok(kube::core::WatchEvent::Added(obj)) => WatchEvent::Added(obj),
            Ok(kube::core::WatchEvent::Modified(obj)) => WatchEvent::Modified(obj),
            Ok(kube::core::WatchEvent::Deleted(obj)) => WatchEvent::Deleted(obj),
            Ok(kube::core::WatchEvent::Bookmark(_)) => WatchEvent::Bookmark,
            Ok(kube::core::WatchEvent::Error(status)) => WatchEvent::Error(format!("{status:?}")),
            Err(error) => WatchEvent::Error(error.to_string()),
        })))
    }
}
