//! Configurable mock module shared by the kernel tests.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;

use crate::config::KernelConfig;
use crate::discovery::ServiceInfo;
use crate::kernel::bootstrap::Kernel;
use crate::kernel::context::ModuleContext;
use crate::kernel::error::{Error, Result};
use crate::kernel::lifecycle::LifecyclePhase;
use crate::module_system::dependency::ModuleDependency;
use crate::module_system::descriptor::ModuleDescriptor;
use crate::module_system::traits::Module;
use crate::router::{RouteGroup, RouteRequest, RouteResponse};
use crate::service::ServiceSet;

pub type CallLog = Arc<StdMutex<Vec<String>>>;

pub fn new_log() -> CallLog {
    Arc::new(StdMutex::new(Vec::new()))
}

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Narrow capability used to exercise cross-service lookups.
pub trait Greeting: Send + Sync {
    fn greet(&self, who: &str) -> String;
}

pub struct Polite(pub String);

impl Greeting for Polite {
    fn greet(&self, who: &str) -> String {
        format!("{}, {}", self.0, who)
    }
}

type ExportFn = Arc<dyn Fn() -> ServiceSet + Send + Sync>;
pub type HookFuture = BoxFuture<'static, Result<()>>;
type PostInitHook = Arc<dyn Fn(ModuleContext, CallLog) -> HookFuture + Send + Sync>;

#[derive(Clone)]
pub struct TestModule {
    pub name: String,
    deps: Vec<ModuleDependency>,
    log: CallLog,
    fail_at: Option<LifecyclePhase>,
    panic_at: Option<LifecyclePhase>,
    init_delay: Option<Duration>,
    exports: Option<ExportFn>,
    post_init_hook: Option<PostInitHook>,
    subscribe_to: Option<String>,
    with_route: bool,
    discovery: Option<ServiceInfo>,
    spawn_ticker: Option<Arc<AtomicUsize>>,
    blocking_task: Option<Duration>,
    slow_route: Option<Duration>,
    pub instances: Arc<AtomicUsize>,
}

impl TestModule {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            deps: Vec::new(),
            log: log.clone(),
            fail_at: None,
            panic_at: None,
            init_delay: None,
            exports: None,
            post_init_hook: None,
            subscribe_to: None,
            with_route: false,
            discovery: None,
            spawn_ticker: None,
            blocking_task: None,
            slow_route: None,
            instances: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn strong(mut self, dep: &str) -> Self {
        self.deps.push(ModuleDependency::strong(dep));
        self
    }

    pub fn weak(mut self, dep: &str) -> Self {
        self.deps.push(ModuleDependency::weak(dep));
        self
    }

    pub fn fail_at(mut self, phase: LifecyclePhase) -> Self {
        self.fail_at = Some(phase);
        self
    }

    pub fn panic_at(mut self, phase: LifecyclePhase) -> Self {
        self.panic_at = Some(phase);
        self
    }

    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn greeting(mut self, greeting: &str) -> Self {
        let greeting = greeting.to_string();
        self.exports = Some(Arc::new(move || {
            let polite: Arc<dyn Greeting> = Arc::new(Polite(greeting.clone()));
            ServiceSet::new()
                .with_service(Arc::new(greeting.clone()))
                .provide::<dyn Greeting>(polite)
        }));
        self
    }

    pub fn on_post_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(ModuleContext, CallLog) -> HookFuture + Send + Sync + 'static,
    {
        self.post_init_hook = Some(Arc::new(hook));
        self
    }

    /// Subscribe to `event` during `init`, logging `"<name>:got:<payload>"`.
    pub fn subscribe_to(mut self, event: &str) -> Self {
        self.subscribe_to = Some(event.to_string());
        self
    }

    /// Mount `GET /<name>/ping`.
    pub fn with_route(mut self) -> Self {
        self.with_route = true;
        self
    }

    pub fn discoverable(mut self, info: ServiceInfo) -> Self {
        self.discovery = Some(info);
        self
    }

    pub fn ticker(mut self, ticks: Arc<AtomicUsize>) -> Self {
        self.spawn_ticker = Some(ticks);
        self
    }

    /// Spawn a task that blocks its worker thread for `period`, ignoring cancellation.
    pub fn blocking_task(mut self, period: Duration) -> Self {
        self.blocking_task = Some(period);
        self
    }

    /// Mount `GET /<name>/slow`, answering after `delay`.
    pub fn slow_route(mut self, delay: Duration) -> Self {
        self.slow_route = Some(delay);
        self
    }

    fn record(&self, what: &str) {
        let line = format!("{}:{}", self.name, what);
        self.log.lock().unwrap().push(line);
    }

    fn hook(&self, phase: LifecyclePhase, what: &str) -> Result<()> {
        self.record(what);
        if self.panic_at == Some(phase) {
            panic!("{} panicked in {}", self.name, what);
        }
        if self.fail_at == Some(phase) {
            return Err(Error::from(format!("{} refused {}", self.name, what)));
        }
        Ok(())
    }

    pub fn descriptor(self) -> ModuleDescriptor {
        let template = self.clone();
        let factory = move || {
            template.instances.fetch_add(1, Ordering::SeqCst);
            Arc::new(template.clone()) as Arc<dyn Module>
        };
        let mut desc = ModuleDescriptor::new(self.name.clone(), "1.0.0", factory);
        for dep in &self.deps {
            desc = if dep.is_strong() {
                desc.depends_on(dep.module.clone())
            } else {
                desc.weak_dependency(dep.module.clone())
            };
        }
        desc
    }
}

#[async_trait]
impl Module for TestModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn dependencies(&self) -> Vec<ModuleDependency> {
        self.deps.clone()
    }

    async fn pre_init(&self) -> Result<()> {
        self.hook(LifecyclePhase::PreInit, "pre_init")
    }

    async fn init(&self, ctx: &ModuleContext) -> Result<()> {
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(event) = &self.subscribe_to {
            let log = self.log.clone();
            let name = self.name.clone();
            ctx.subscribe_fn(event.clone(), move |e| {
                let line = format!("{}:got:{}", name, e.payload);
                log.lock().unwrap().push(line);
            })
            .await;
        }
        if let Some(ticks) = &self.spawn_ticker {
            let ticks = ticks.clone();
            ctx.spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
        }
        if let Some(period) = self.blocking_task {
            ctx.spawn(async move { std::thread::sleep(period) });
        }
        self.hook(LifecyclePhase::Init, "init")
    }

    async fn post_init(&self, ctx: &ModuleContext) -> Result<()> {
        self.hook(LifecyclePhase::PostInit, "post_init")?;
        if let Some(hook) = &self.post_init_hook {
            hook(ctx.clone(), self.log.clone()).await?;
        }
        Ok(())
    }

    fn register_routes(&self, routes: &mut RouteGroup) {
        if self.with_route {
            let name = self.name.clone();
            routes.get("/ping", move |_req: RouteRequest| {
                let name = name.clone();
                async move { RouteResponse::ok(json!({ "pong": name })) }
            });
        }
        if let Some(delay) = self.slow_route {
            routes.get("/slow", move |_req: RouteRequest| async move {
                tokio::time::sleep(delay).await;
                RouteResponse::ok(json!("done"))
            });
        }
    }

    fn services(&self) -> ServiceSet {
        match &self.exports {
            Some(exports) => exports(),
            None => ServiceSet::new().with_service(Arc::new(self.name.clone())),
        }
    }

    async fn pre_cleanup(&self) -> Result<()> {
        self.hook(LifecyclePhase::PreCleanup, "pre_cleanup")
    }

    async fn cleanup(&self) -> Result<()> {
        self.hook(LifecyclePhase::Cleanup, "cleanup")
    }

    fn needs_service_discovery(&self) -> bool {
        self.discovery.is_some()
    }

    fn service_info(&self) -> Option<ServiceInfo> {
        self.discovery.clone()
    }
}

pub fn create_test_kernel() -> Kernel {
    Kernel::new(KernelConfig::default())
}

pub fn kernel_with(configure: impl FnOnce(&mut KernelConfig)) -> Kernel {
    let mut config = KernelConfig::default();
    configure(&mut config);
    Kernel::new(config)
}

pub async fn register_all(kernel: &Kernel, modules: Vec<TestModule>) {
    for module in modules {
        kernel.register(module.descriptor()).await.unwrap();
    }
}

/// Calls of one hook, in order, as `"<module>"`.
pub fn calls(log: &CallLog, hook: &str) -> Vec<String> {
    let suffix = format!(":{}", hook);
    entries(log)
        .into_iter()
        .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
        .collect()
}
