use std::any::TypeId;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture, Either};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ModuleConfig;
use crate::event::bus::panic_message;
use crate::event::{ContainedHandler, Event, EventBus, EventHandler, FnHandler, SubscriptionId};
use crate::kernel::bootstrap::{Kernel, KernelInner};
use crate::kernel::error::{Error, Result};
use crate::service::{self, AnyService, ServiceRef};

/// Non-owning handle to a kernel.
///
/// Modules keep this instead of a [`Kernel`] so that a module instance never
/// keeps the kernel (and with it, itself) alive.
#[derive(Clone)]
pub struct KernelHandle {
    inner: Weak<KernelInner>,
}

impl KernelHandle {
    pub(crate) fn new(inner: Weak<KernelInner>) -> Self {
        Self { inner }
    }

    pub fn upgrade(&self) -> Result<Kernel> {
        self.inner
            .upgrade()
            .map(Kernel::from_inner)
            .ok_or(Error::KernelUnavailable)
    }
}

/// Services the kernel performs for a module.
///
/// The context reaches the kernel only through this object, so timers, task
/// spawning and kernel lookups run on the kernel's side even when the module's
/// code lives in a plugin library with its own copy of the runtime.
#[async_trait]
trait Host: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);

    fn sleep(&self, period: Duration) -> BoxFuture<'static, ()>;

    async fn publish(&self, event: Event) -> usize;

    async fn subscribe(&self, event: String, handler: Arc<dyn EventHandler>) -> SubscriptionId;

    async fn service(&self, module: &str) -> Result<ServiceRef>;

    async fn capability(&self, module: &str, id: TypeId, name: &'static str) -> Result<AnyService>;
}

struct KernelHost {
    module: String,
    kernel: KernelHandle,
    bus: EventBus,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

#[async_trait]
impl Host for KernelHost {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        let cancel = self.cancel.clone();
        let module = self.module.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("Background task of '{}' cancelled", module);
                }
                _ = task => {}
            }
        });
    }

    fn sleep(&self, period: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(period))
    }

    async fn publish(&self, event: Event) -> usize {
        self.bus.publish(event).await
    }

    async fn subscribe(&self, event: String, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let owner = self.module.clone();
        self.bus.subscribe_as(owner, event, handler).await
    }

    async fn service(&self, module: &str) -> Result<ServiceRef> {
        self.kernel.upgrade()?.get_service(module).await
    }

    async fn capability(
        &self,
        module: &str,
        id: TypeId,
        name: &'static str,
    ) -> Result<AnyService> {
        let kernel = self.kernel.upgrade()?;
        kernel.capability_erased(module, id, name).await
    }
}

/// What a module receives at `init` and `post_init`: its configuration
/// subsection, a handle back to the kernel, the event bus and a cancellation
/// token for its background work.
///
/// The token is cancelled when the module enters pre-cleanup. Tasks started
/// with [`spawn`](Self::spawn) stop at that point and cleanup waits for them.
///
/// Modules loaded from plugin libraries should use the methods here rather
/// than the [`EventBus`] or the [`Kernel`] directly.
#[derive(Clone)]
pub struct ModuleContext {
    module: String,
    config: Arc<ModuleConfig>,
    kernel: KernelHandle,
    bus: EventBus,
    cancel: CancellationToken,
    tasks: TaskTracker,
    host: Arc<dyn Host>,
}

impl ModuleContext {
    pub(crate) fn new(
        module: &str,
        config: ModuleConfig,
        kernel: KernelHandle,
        bus: EventBus,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let host = Arc::new(KernelHost {
            module: module.to_string(),
            kernel: kernel.clone(),
            bus: bus.clone(),
            cancel: cancel.clone(),
            tasks: tasks.clone(),
        });
        Self {
            module: module.to_string(),
            config: Arc::new(config),
            kernel,
            bus,
            cancel,
            tasks,
            host,
        }
    }

    /// Name of the module this context belongs to
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn kernel(&self) -> KernelHandle {
        self.kernel.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Subscribe on behalf of this module. The subscription is removed when the
    /// module is unloaded.
    pub async fn subscribe(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let contained = Arc::new(ContainedHandler {
            owner: self.module.clone(),
            inner: handler,
        });
        self.host.subscribe(event.into(), contained).await
    }

    pub async fn subscribe_fn<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(event, Arc::new(FnHandler(handler))).await
    }

    /// Publish an event with this module as its source.
    pub async fn publish(&self, event: impl Into<String>, payload: serde_json::Value) -> usize {
        let event = Event::new(event, payload).with_source(self.module.clone());
        self.host.publish(event).await
    }

    /// Run `task` in the background until it finishes or the module is shut down.
    ///
    /// A panic in `task` is logged and ends the task.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let module = self.module.clone();
        let task = async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                log::error!(
                    "Background task of '{}' panicked: {}",
                    module,
                    panic_message(panic.as_ref())
                );
            }
        };
        self.host.spawn(Box::pin(task));
    }

    /// Wait for `period` on the kernel's timer.
    pub async fn sleep(&self, period: Duration) {
        self.host.sleep(period).await
    }

    /// Run `fut` for at most `limit` on the kernel's timer. `None` when the
    /// limit passed first.
    pub async fn timeout<F: Future>(&self, limit: Duration, fut: F) -> Option<F::Output> {
        let fut = pin!(fut);
        let expiry = self.host.sleep(limit);
        match future::select(fut, expiry).await {
            Either::Left((output, _)) => Some(output),
            Either::Right(_) => None,
        }
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Resolve another module's primary service.
    pub async fn get_service(&self, module: &str) -> Result<ServiceRef> {
        self.host.service(module).await
    }

    /// Resolve capability `C` of another module.
    pub async fn get_cross_service<C>(&self, module: &str) -> Result<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let id = TypeId::of::<C>();
        let name = std::any::type_name::<C>();
        let erased = self.host.capability(module, id, name).await?;
        Ok(service::downcast_capability::<C>(module, &erased)?)
    }

    /// Cancel the token and wait (bounded) for spawned tasks to finish.
    pub(crate) async fn stop_tasks(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.tasks.close();
        let finished = tokio::time::timeout(timeout, self.tasks.wait()).await;
        if finished.is_err() {
            log::warn!(
                "{} background task(s) of '{}' still running after {:?}",
                self.tasks.len(),
                self.module,
                timeout
            );
            return false;
        }
        true
    }
}
