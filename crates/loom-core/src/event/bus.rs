use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;

use crate::event::{Event, EventHandler, FnHandler};

pub type SubscriptionId = u64;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Subscription {
    id: SubscriptionId,
    owner: Option<String>,
    handler: Arc<dyn EventHandler>,
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for AsyncFnHandler<F>
where
    F: Fn(Event) -> BoxFuture + Send + Sync,
{
    async fn handle(&self, event: &Event) {
        (self.0)(event.clone()).await
    }
}

/// Shared, cloneable event bus.
///
/// The subscription table sits behind one reader/writer lock. `publish` copies
/// the handler list out and releases the lock before calling any handler, so
/// handlers may subscribe, unsubscribe or publish themselves.
#[derive(Clone, Default)]
pub struct EventBus {
    table: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the subscribers of `event`.
    pub async fn subscribe(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.insert(event.into(), None, handler).await
    }

    /// Like [`subscribe`](Self::subscribe), tagging the subscription with its owning module.
    pub async fn subscribe_as(
        &self,
        owner: impl Into<String>,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.insert(event.into(), Some(owner.into()), handler).await
    }

    pub async fn subscribe_fn<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(event, Arc::new(FnHandler(handler))).await
    }

    /// Subscribe an async closure. The closure receives an owned copy of the event.
    pub async fn subscribe_async<F, Fut>(
        &self,
        event: impl Into<String>,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed = move |e: Event| -> BoxFuture { Box::pin(handler(e)) };
        self.subscribe(event, Arc::new(AsyncFnHandler(boxed))).await
    }

    async fn insert(
        &self,
        event: String,
        owner: Option<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("Subscription {} on '{}' (owner: {:?})", id, event, owner);
        self.table
            .write()
            .await
            .entry(event)
            .or_default()
            .push(Subscription { id, owner, handler });
        id
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.table.write().await;
        let mut found = false;
        for subs in table.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            found |= subs.len() < before;
        }
        table.retain(|_, subs| !subs.is_empty());
        found
    }

    /// Remove every subscription owned by `owner`. Returns how many were removed.
    pub async fn unsubscribe_owner(&self, owner: &str) -> usize {
        self.detach_owner(owner).await.len()
    }

    /// Remove every subscription owned by `owner` and hand back its handlers.
    pub(crate) async fn detach_owner(&self, owner: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut table = self.table.write().await;
        let mut detached = Vec::new();
        for subs in table.values_mut() {
            let (gone, kept): (Vec<Subscription>, Vec<Subscription>) = std::mem::take(subs)
                .into_iter()
                .partition(|s| s.owner.as_deref() == Some(owner));
            *subs = kept;
            detached.extend(gone.into_iter().map(|s| s.handler));
        }
        table.retain(|_, subs| !subs.is_empty());
        if !detached.is_empty() {
            log::debug!(
                "Removed {} subscription(s) owned by '{}'",
                detached.len(),
                owner
            );
        }
        detached
    }

    pub async fn subscriber_count(&self, event: &str) -> usize {
        self.table.read().await.get(event).map_or(0, Vec::len)
    }

    /// Deliver `event` to its current subscribers, in subscription order.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub async fn publish(&self, event: Event) -> usize {
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = {
            let table = self.table.read().await;
            match table.get(&event.name) {
                Some(subs) => subs.iter().map(|s| (s.id, s.handler.clone())).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            let handled = AssertUnwindSafe(handler.handle(&event)).catch_unwind();
            match handled.await {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    log::error!(
                        "Handler {} for event '{}' panicked: {}",
                        id,
                        event.name,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        delivered
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
