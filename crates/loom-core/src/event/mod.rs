//! # Loom Event Bus
//!
//! In-process, best-effort publish/subscribe between modules.
//!
//! Event names are dot-namespaced strings (`"user.created"`,
//! `"exts.<module>.ready"`); the bus does not enforce a catalogue. Delivery is
//! at-most-once and non-durable: a subscriber registered after a publish never
//! sees that event.
//!
//! Handlers for one event run sequentially in subscription order. A handler
//! that panics is logged and skipped; the rest still run and the publisher
//! never observes the panic.
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

pub mod bus;

pub use bus::{EventBus, SubscriptionId};

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    /// Module that published the event, if known
    pub source: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            source: None,
            payload,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Category part of a `"<category>.<type>"` name.
    pub fn category(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} (from {})", self.name, source),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Asynchronous event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Adapts a synchronous closure to [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) + Send + Sync,
{
    async fn handle(&self, event: &Event) {
        (self.0)(event)
    }
}

/// Catches panics of a module's handler where the handler was subscribed.
pub(crate) struct ContainedHandler {
    pub(crate) owner: String,
    pub(crate) inner: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for ContainedHandler {
    async fn handle(&self, event: &Event) {
        if let Err(panic) = AssertUnwindSafe(self.inner.handle(event))
            .catch_unwind()
            .await
        {
            log::error!(
                "Handler of '{}' for event '{}' panicked: {}",
                self.owner,
                event.name,
                bus::panic_message(panic.as_ref())
            );
        }
    }
}

#[cfg(test)]
mod tests;
