use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::config::{KernelConfig, ReloadPolicy};
use crate::discovery::{DiscoveryPublisher, ServiceRegistry};
use crate::event::bus::panic_message;
use crate::event::{Event, EventBus};
use crate::kernel::constants::{self, KERNEL_EVENT_SOURCE};
use crate::kernel::context::{KernelHandle, ModuleContext};
use crate::kernel::error::{Error, Result};
use crate::kernel::lifecycle::{LifecyclePhase, ModuleState, StateMachine};
use crate::management;
use crate::module_system::dependency::{DependencyError, DependencyResolver};
use crate::module_system::descriptor::ModuleDescriptor;
use crate::module_system::loader::PluginLoader;
use crate::module_system::registry::ModuleRegistry;
use crate::module_system::traits::{Module, ModuleKind, ModuleMetadata};
use crate::router::{RouteGroup, RouteRequest, RouteResponse, Router};
use crate::service::{self, AnyService, ServiceCatalog, ServiceError, ServiceRef, ServiceSet};

/// A live module as the kernel tracks it.
pub(crate) struct ModuleSlot {
    pub(crate) instance: Arc<dyn Module>,
    pub(crate) state: StateMachine,
    pub(crate) exports: Option<ServiceSet>,
    pub(crate) ctx: ModuleContext,
}

pub struct KernelInner {
    pub(crate) config: KernelConfig,
    pub(crate) registry: RwLock<ModuleRegistry>,
    pub(crate) catalog: RwLock<ServiceCatalog>,
    pub(crate) slots: Mutex<HashMap<String, ModuleSlot>>,
    /// Reason a registered module is not running, for modules that never got a slot
    pub(crate) failures: Mutex<HashMap<String, String>>,
    /// Running modules, in the order they reached `Running`
    pub(crate) order: Mutex<Vec<String>>,
    pub(crate) bus: EventBus,
    pub(crate) router: Router,
    pub(crate) discovery: DiscoveryPublisher,
    pub(crate) loader: Mutex<PluginLoader>,
    pub(crate) started: AtomicBool,
    /// Serializes start, activation, unload, reload and shutdown
    pub(crate) ops: Mutex<()>,
}

/// Outcome of starting (or activating) a batch of modules.
#[derive(Debug, Default)]
pub struct StartReport {
    /// Modules that reached `Running`, in initialization order
    pub running: Vec<String>,
    /// Modules that did not, with the reason
    pub failed: Vec<(String, Error)>,
}

impl StartReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure(&self, module: &str) -> Option<&Error> {
        self.failed
            .iter()
            .find(|(n, _)| n == module)
            .map(|(_, e)| e)
    }
}

/// Snapshot of one registered module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub kind: ModuleKind,
    pub group: Option<String>,
    pub strong: Vec<String>,
    pub weak: Vec<String>,
    /// `None` until the kernel has tried to start the module
    pub state: Option<ModuleState>,
    pub metadata: ModuleMetadata,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The lifecycle manager.
///
/// Owns the registry, the service catalog, the event bus and the router, and
/// drives every module through
/// `Created → PreInit → Init → PostInit → Running → PreCleanup → Cleanup`.
/// Cloning a `Kernel` is cheap and yields another handle to the same kernel.
/// Independent kernels never share state, so tests can build as many as they like.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        Self::build(config, None)
    }

    /// Kernel that publishes opted-in modules to `client`.
    pub fn with_service_registry(config: KernelConfig, client: Arc<dyn ServiceRegistry>) -> Self {
        Self::build(config, Some(client))
    }

    fn build(config: KernelConfig, client: Option<Arc<dyn ServiceRegistry>>) -> Self {
        log::info!(
            "Initializing {} kernel v{}",
            constants::APP_NAME,
            constants::APP_VERSION
        );
        let loader = PluginLoader::new(config.plugins.clone());
        Self {
            inner: Arc::new(KernelInner {
                config,
                registry: RwLock::new(ModuleRegistry::new()),
                catalog: RwLock::new(ServiceCatalog::new()),
                slots: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                order: Mutex::new(Vec::new()),
                bus: EventBus::new(),
                router: Router::new(),
                discovery: DiscoveryPublisher::new(client),
                loader: Mutex::new(loader),
                started: AtomicBool::new(false),
                ops: Mutex::new(()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<KernelInner>) -> Self {
        Self { inner }
    }

    pub fn handle(&self) -> KernelHandle {
        KernelHandle::new(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn discovery(&self) -> &DiscoveryPublisher {
        &self.inner.discovery
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    // ---- registration -------------------------------------------------

    pub async fn register(&self, descriptor: ModuleDescriptor) -> Result<()> {
        self.inner.registry.write().await.register(descriptor)?;
        Ok(())
    }

    pub async fn register_to_group_with_weak_deps<I, S>(
        &self,
        descriptor: ModuleDescriptor,
        group: impl Into<String>,
        weak: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .registry
            .write()
            .await
            .register_to_group_with_weak_deps(descriptor, group, weak)?;
        Ok(())
    }

    /// Initialization order of every registered module that can start.
    pub async fn build_order(&self) -> Result<Vec<String>> {
        let registry = self.inner.registry.read().await;
        Ok(DependencyResolver::new(&registry).build_order()?)
    }

    // ---- start-up -----------------------------------------------------

    /// Start every registered module.
    ///
    /// Individual module failures do not fail the call; they are reported in
    /// the returned [`StartReport`].
    pub async fn start(&self) -> Result<StartReport> {
        let _ops = self.inner.ops.lock().await;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        log::info!("Starting kernel");

        if self.inner.config.plugins.hot_reload {
            management::mount(self).await?;
        }

        let resolution = {
            let registry = self.inner.registry.read().await;
            DependencyResolver::new(&registry).resolve()
        };

        let mut report = StartReport::default();
        for (name, cause) in resolution.excluded {
            let err = self.exclusion_error(&name, cause).await;
            report.failed.push((name, err));
        }

        let batch = self.run_lifecycle(&resolution.order).await;
        report.running = batch.running;
        report.failed.extend(batch.failed);

        log::info!(
            "Kernel started: {} module(s) running, {} failed",
            report.running.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn exclusion_error(&self, name: &str, cause: DependencyError) -> Error {
        let err = if cause.is_cycle() {
            Error::Dependency(cause)
        } else {
            Error::init_caused_by(name, LifecyclePhase::Resolve, Error::Dependency(cause))
        };
        log::error!("Module '{}' will not start: {}", name, err);
        self.record_failure(name, &err).await;
        self.emit(constants::EVENT_MODULE_FAILED, name).await;
        err
    }

    /// Drive `names` (already in dependency order) from `Created` to `Running`.
    ///
    /// Every surviving module completes `init` before any module runs `post_init`.
    pub(crate) async fn run_lifecycle(&self, names: &[String]) -> StartReport {
        let mut report = StartReport::default();
        let timeout = self.inner.config.init_timeout();

        // Instantiate + PreInit
        for name in names {
            if let Err(e) = self.instantiate(name).await {
                report.failed.push((name.clone(), e));
                continue;
            }
            let (instance, _) = match self.live(name).await {
                Some(live) => live,
                None => continue,
            };
            let outcome = guarded(name, LifecyclePhase::PreInit, None, instance.pre_init()).await;
            match outcome {
                Ok(()) => self.advance(name, ModuleState::PreInitialized).await,
                Err(e) => report.failed.push((name.clone(), self.fail(name, e).await)),
            }
        }

        // Init
        for name in names {
            if self.state_of(name).await != Some(ModuleState::PreInitialized) {
                continue;
            }
            let deps = self
                .check_strong_deps(name, LifecyclePhase::Init, ModuleState::has_initialized)
                .await;
            if let Err(e) = deps {
                report.failed.push((name.clone(), self.fail(name, e).await));
                continue;
            }
            let Some((instance, ctx)) = self.live(name).await else {
                continue;
            };
            log::info!("Initializing module '{}'", name);
            let init = instance.init(&ctx);
            match guarded(name, LifecyclePhase::Init, Some(timeout), init).await {
                Ok(()) => self.advance(name, ModuleState::Initialized).await,
                Err(e) => {
                    let err = self.fail(name, e).await;
                    self.release_failed(name, &instance, &ctx).await;
                    report.failed.push((name.clone(), err));
                }
            }
        }

        // PostInit
        for name in names {
            if self.state_of(name).await != Some(ModuleState::Initialized) {
                continue;
            }
            let Some((instance, ctx)) = self.live(name).await else {
                continue;
            };
            let deps = self
                .check_strong_deps(name, LifecyclePhase::PostInit, ModuleState::is_ready)
                .await;
            let result = match deps {
                Ok(()) => {
                    let post_init = instance.post_init(&ctx);
                    guarded(name, LifecyclePhase::PostInit, Some(timeout), post_init).await
                }
                Err(e) => Err(e),
            };
            let result = result.and_then(|()| collect_services(name, &instance));
            match result {
                Ok(exports) => {
                    self.inner
                        .catalog
                        .write()
                        .await
                        .index(name, &instance, &exports);
                    if let Some(slot) = self.inner.slots.lock().await.get_mut(name) {
                        slot.exports = Some(exports);
                    }
                    self.advance(name, ModuleState::PostInitialized).await;
                }
                Err(e) => {
                    let err = self.fail(name, e).await;
                    self.release_failed(name, &instance, &ctx).await;
                    report.failed.push((name.clone(), err));
                }
            }
        }

        // Running
        for name in names {
            if self.state_of(name).await != Some(ModuleState::PostInitialized) {
                continue;
            }
            let Some((instance, ctx)) = self.live(name).await else {
                continue;
            };
            if let Err(e) = self.enter_running(name, &instance).await {
                let err = self.fail(name, e).await;
                self.release_failed(name, &instance, &ctx).await;
                report.failed.push((name.clone(), err));
                continue;
            }
            report.running.push(name.clone());
        }

        report
    }

    async fn instantiate(&self, name: &str) -> Result<()> {
        let descriptor = self
            .inner
            .registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::init(name, LifecyclePhase::Instantiate, "not registered"))?;

        let instance = match panic::catch_unwind(AssertUnwindSafe(|| descriptor.instantiate())) {
            Ok(instance) => instance,
            Err(panic) => {
                let reason = format!("factory panicked: {}", panic_message(panic.as_ref()));
                let err = Error::init(name, LifecyclePhase::Instantiate, reason);
                return Err(self.fail(name, err).await);
            }
        };
        if instance.name() != name {
            let err = Error::init(
                name,
                LifecyclePhase::Instantiate,
                format!("factory produced module '{}'", instance.name()),
            );
            return Err(self.fail(name, err).await);
        }

        let ctx = ModuleContext::new(
            name,
            self.inner.config.module(name),
            self.handle(),
            self.inner.bus.clone(),
        );
        self.inner.failures.lock().await.remove(name);
        self.inner.slots.lock().await.insert(
            name.to_string(),
            ModuleSlot {
                instance,
                state: StateMachine::new(name),
                exports: None,
                ctx,
            },
        );
        log::debug!("Instantiated module '{}'", name);
        Ok(())
    }

    async fn enter_running(&self, name: &str, instance: &Arc<dyn Module>) -> Result<()> {
        let mut group = RouteGroup::new(name);
        let register = || instance.register_routes(&mut group);
        let registered = panic::catch_unwind(AssertUnwindSafe(register));
        if let Err(panic) = registered {
            group.fault(format!(
                "register_routes panicked: {}",
                panic_message(panic.as_ref())
            ));
        }
        if let Some(fault) = group.take_fault() {
            return Err(Error::init(name, LifecyclePhase::Running, fault));
        }
        if let Err(e) = self.inner.router.mount(group).await {
            return Err(Error::init_caused_by(name, LifecyclePhase::Running, e));
        }

        if instance.needs_service_discovery() {
            match instance.service_info() {
                Some(info) => {
                    self.inner.discovery.publish(name, info).await;
                }
                None => log::warn!(
                    "Module '{}' opted into service discovery without service info",
                    name
                ),
            }
        }

        self.advance(name, ModuleState::Running).await;
        self.inner.order.lock().await.push(name.to_string());
        log::info!("Module '{}' is running", name);
        self.emit(constants::EVENT_MODULE_RUNNING, name).await;
        Ok(())
    }

    /// Every strong dependency of `name` must be in a state accepted by `ok`.
    async fn check_strong_deps(
        &self,
        name: &str,
        phase: LifecyclePhase,
        ok: fn(ModuleState) -> bool,
    ) -> Result<()> {
        let strong = self
            .inner
            .registry
            .read()
            .await
            .get(name)
            .map(|d| d.strong.clone())
            .unwrap_or_default();
        for dep in strong {
            let state = self.state_of(&dep).await;
            if !state.is_some_and(ok) {
                let cause = DependencyError::DependencyFailed {
                    module: name.to_string(),
                    dependency: dep.clone(),
                };
                return Err(Error::init_caused_by(name, phase, Error::Dependency(cause)));
            }
        }
        Ok(())
    }

    // ---- state helpers ------------------------------------------------

    pub(crate) async fn live(&self, name: &str) -> Option<(Arc<dyn Module>, ModuleContext)> {
        self.inner
            .slots
            .lock()
            .await
            .get(name)
            .map(|slot| (slot.instance.clone(), slot.ctx.clone()))
    }

    pub(crate) async fn state_of(&self, name: &str) -> Option<ModuleState> {
        let slots = self.inner.slots.lock().await;
        slots.get(name).map(|s| s.state.state())
    }

    pub(crate) async fn advance(&self, name: &str, to: ModuleState) {
        if let Some(slot) = self.inner.slots.lock().await.get_mut(name) {
            if let Err(e) = slot.state.advance(to) {
                log::error!("{}", e);
            }
        }
    }

    /// Mark `name` failed, record the reason and announce it. Returns the error for reporting.
    async fn fail(&self, name: &str, err: Error) -> Error {
        log::error!("Module '{}' failed: {}", name, err);
        if let Some(slot) = self.inner.slots.lock().await.get_mut(name) {
            slot.state.fail();
        }
        self.record_failure(name, &err).await;
        self.emit(constants::EVENT_MODULE_FAILED, name).await;
        err
    }

    pub(crate) async fn record_failure(&self, name: &str, err: &Error) {
        let mut failures = self.inner.failures.lock().await;
        failures.insert(name.to_string(), err.to_string());
    }

    /// Best-effort release of a module that failed after `init` started.
    async fn release_failed(&self, name: &str, instance: &Arc<dyn Module>, ctx: &ModuleContext) {
        let limit = self.inner.config.task_shutdown_timeout();
        ctx.stop_tasks(limit).await;
        let cleanup = instance.cleanup();
        if let Err(e) = guarded(name, LifecyclePhase::Cleanup, None, cleanup).await {
            log_cleanup_error(name, e);
        }
        self.inner.router.unmount(name).await;
        self.inner.bus.unsubscribe_owner(name).await;
        self.inner.catalog.write().await.remove(name);
        self.inner.discovery.withdraw(name).await;
    }

    pub(crate) async fn emit(&self, event: &str, module: &str) {
        let payload = json!({ "module": module });
        let event = Event::new(event, payload).with_source(KERNEL_EVENT_SOURCE);
        self.inner.bus.publish(event).await;
    }

    // ---- service lookup -----------------------------------------------

    /// Resolve a module's primary service.
    ///
    /// Fails with `NotFound` if the module is not registered and `NotReady`
    /// until it has completed `post_init`.
    pub async fn get_service(&self, name: &str) -> Result<ServiceRef> {
        match self.state_of(name).await {
            Some(state) if state.is_ready() => {}
            Some(state) => return Err(not_ready(name, &state.to_string())),
            None => {
                if !self.inner.registry.read().await.contains(name) {
                    return Err(ServiceError::NotFound(name.to_string()).into());
                }
                let failed = self.inner.failures.lock().await.contains_key(name);
                let state = if failed { "failed" } else { "registered" };
                return Err(not_ready(name, state));
            }
        }
        Ok(self.inner.catalog.read().await.lookup(name)?)
    }

    /// Resolve capability `C` (usually a trait object type) of `module`.
    ///
    /// Fails with `CapabilityNotSupported` if the module is absent or does not
    /// export `C`, and with `NotReady` if it exists but has not completed `post_init`.
    pub async fn get_cross_service<C>(&self, module: &str) -> Result<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let erased = self
            .capability_erased(module, TypeId::of::<C>(), type_name::<C>())
            .await?;
        Ok(service::downcast_capability::<C>(module, &erased)?)
    }

    pub(crate) async fn capability_erased(
        &self,
        module: &str,
        id: TypeId,
        capability: &'static str,
    ) -> Result<AnyService> {
        if let Some(state) = self.state_of(module).await {
            if !state.is_ready() {
                return Err(not_ready(module, &state.to_string()));
            }
        }
        let catalog = self.inner.catalog.read().await;
        Ok(catalog.capability_erased(module, id, capability)?)
    }

    /// Every ready module exporting capability `C`, sorted by name.
    pub async fn providers<C>(&self) -> Vec<(String, Arc<C>)>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.inner.catalog.read().await.providers::<C>()
    }

    pub async fn dispatch(&self, req: RouteRequest) -> RouteResponse {
        self.inner.router.dispatch(req).await
    }

    // ---- introspection ------------------------------------------------

    /// Current state of `name`; `Failed` for registered modules that could not be started.
    pub async fn module_state(&self, name: &str) -> Option<ModuleState> {
        if let Some(state) = self.state_of(name).await {
            return Some(state);
        }
        if self.inner.failures.lock().await.contains_key(name) {
            return Some(ModuleState::Failed);
        }
        None
    }

    pub async fn module_info(&self, name: &str) -> Option<ModuleInfo> {
        let descriptor = self.inner.registry.read().await.get(name).cloned()?;
        let (state, metadata) = match self.live(name).await {
            Some((instance, _)) => {
                let metadata = panic::catch_unwind(AssertUnwindSafe(|| instance.metadata()));
                (self.state_of(name).await, metadata.unwrap_or_default())
            }
            None => (self.module_state(name).await, ModuleMetadata::default()),
        };
        let capabilities = self
            .inner
            .catalog
            .read()
            .await
            .capability_names(name)
            .into_iter()
            .map(str::to_string)
            .collect();
        let error = self.inner.failures.lock().await.get(name).cloned();
        Some(ModuleInfo {
            name: descriptor.name,
            version: descriptor.version,
            description: descriptor.description.or(metadata.description.clone()),
            kind: descriptor.kind,
            group: descriptor.group,
            strong: descriptor.strong,
            weak: descriptor.weak,
            state,
            metadata,
            capabilities,
            error,
        })
    }

    /// Every registered module, in registration order.
    pub async fn modules(&self) -> Vec<ModuleInfo> {
        let names = self.inner.registry.read().await.names();
        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            if let Some(info) = self.module_info(&name).await {
                infos.push(info);
            }
        }
        infos
    }

    /// Running modules, in the order they started.
    pub async fn running(&self) -> Vec<String> {
        self.inner.order.lock().await.clone()
    }

    // ---- shutdown -----------------------------------------------------

    /// Tear every running module down in reverse start order.
    ///
    /// Cleanup errors are logged, never returned. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        let _ops = self.inner.ops.lock().await;
        log::info!("Shutting down kernel");
        let order: Vec<String> = self.inner.order.lock().await.clone();
        for name in order.iter().rev() {
            self.teardown(name).await;
        }
        self.inner.order.lock().await.clear();
        self.inner.router.unmount(constants::MANAGEMENT_OWNER).await;
        log::info!("Kernel shut down");
    }

    /// PreCleanup and Cleanup for one running module. Returns `None` for
    /// modules that are not running.
    pub(crate) async fn teardown(&self, name: &str) -> Option<TeardownOutcome> {
        if self.state_of(name).await != Some(ModuleState::Running) {
            return None;
        }
        let (instance, ctx) = self.live(name).await?;

        // PreCleanup
        self.advance(name, ModuleState::Draining).await;
        log::info!("Draining module '{}'", name);
        match self.inner.config.reload_policy() {
            ReloadPolicy::Drain { timeout } => {
                self.inner.router.drain(name, timeout).await;
            }
            ReloadPolicy::Immediate => self.inner.router.close(name).await,
        }
        self.inner.discovery.withdraw(name).await;
        ctx.cancellation().cancel();
        let pre_cleanup = instance.pre_cleanup();
        if let Err(e) = guarded(name, LifecyclePhase::PreCleanup, None, pre_cleanup).await {
            log::error!("Pre-cleanup of module '{}' failed: {}", name, e);
        }
        let limit = self.inner.config.task_shutdown_timeout();
        let tasks_stopped = ctx.stop_tasks(limit).await;

        // Cleanup
        let cleanup = instance.cleanup();
        if let Err(e) = guarded(name, LifecyclePhase::Cleanup, None, cleanup).await {
            log_cleanup_error(name, e);
        }
        let requests_finished = self.inner.router.in_flight(name).await == 0;
        self.inner.router.unmount(name).await;
        let handlers = self.inner.bus.detach_owner(name).await;
        let handlers_released = handlers.into_iter().all(|h| Arc::strong_count(&h) == 1);
        self.inner.catalog.write().await.remove(name);
        self.inner.order.lock().await.retain(|n| n != name);
        self.advance(name, ModuleState::Cleaned).await;
        log::info!("Module '{}' cleaned up", name);
        Some(TeardownOutcome {
            tasks_stopped,
            requests_finished,
            handlers_released,
        })
    }
}

/// Whether anything a module started could still be running after teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TeardownOutcome {
    /// Every background task finished within the shutdown timeout
    pub(crate) tasks_stopped: bool,
    /// No request was executing one of the module's handlers
    pub(crate) requests_finished: bool,
    /// No publish still held one of the module's event handlers
    pub(crate) handlers_released: bool,
}

/// Take a module's exports, turning a panic into a `PostInit` failure.
fn collect_services(name: &str, instance: &Arc<dyn Module>) -> Result<ServiceSet> {
    match panic::catch_unwind(AssertUnwindSafe(|| instance.services())) {
        Ok(exports) => Ok(exports),
        Err(panic) => Err(Error::init(
            name,
            LifecyclePhase::PostInit,
            format!("services() panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn not_ready(module: &str, state: &str) -> Error {
    let err = ServiceError::NotReady {
        module: module.to_string(),
        state: state.to_string(),
    };
    err.into()
}

fn log_cleanup_error(name: &str, e: Error) {
    let err = Error::Cleanup {
        module: name.to_string(),
        message: e.to_string(),
    };
    log::error!("{}", err);
}

/// Run a module hook, turning panics, errors and (optionally) a timeout into
/// an error tagged with `phase`.
pub(crate) async fn guarded<F>(
    module: &str,
    phase: LifecyclePhase,
    timeout: Option<Duration>,
    hook: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let hook = AssertUnwindSafe(hook).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, hook).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(Error::init(module, phase, format!("timed out after {:?}", limit)));
            }
        },
        None => hook.await,
    };
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_init_error() => Err(e),
        Ok(Err(e)) => Err(Error::init_caused_by(module, phase, e)),
        Err(panic) => {
            let reason = format!("panicked: {}", panic_message(panic.as_ref()));
            Err(Error::init(module, phase, reason))
        }
    }
}
