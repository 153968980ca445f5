use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::StatusCode;
use serde_json::json;

use crate::config::{KernelConfig, ReloadPolicyKind};
use crate::discovery::{InMemoryServiceRegistry, ServiceInfo};
use crate::event::{Event, EventHandler};
use crate::kernel::bootstrap::Kernel;
use crate::kernel::context::ModuleContext;
use crate::kernel::error::{Error, Result};
use crate::kernel::lifecycle::{LifecyclePhase, ModuleState};
use crate::kernel::tests::support::*;
use crate::module_system::boundary::{self, HostLink};
use crate::module_system::descriptor::ModuleDescriptor;
use crate::module_system::error::{PluginLoadError, RegistrationError};
use crate::module_system::loader::{ModuleEntryFn, PluginLibrary, PluginStatus};
use crate::router::{RouteGroup, RouteRequest, RouteResponse};
use crate::service::ServiceError;

#[tokio::test]
async fn test_unload_removes_module_and_services() {
    let log = new_log();
    let kernel = create_test_kernel();
    register_all(
        &kernel,
        vec![
            TestModule::new("a", &log).greeting("hi"),
            TestModule::new("b", &log),
        ],
    )
    .await;
    kernel.start().await.unwrap();

    kernel.unload("a").await.unwrap();
    assert_eq!(calls(&log, "cleanup"), vec!["a"]);
    assert!(matches!(
        kernel.get_service("a").await,
        Err(Error::Service(ServiceError::NotFound(_)))
    ));
    assert!(kernel.providers::<dyn Greeting>().await.is_empty());
    assert_eq!(kernel.module_state("a").await, None);
    assert_eq!(kernel.running().await, vec!["b"]);
    assert!(kernel.get_service("b").await.is_ok());
}

#[tokio::test]
async fn test_unload_unknown_module() {
    let kernel = create_test_kernel();
    kernel.start().await.unwrap();
    assert!(matches!(
        kernel.unload("ghost").await,
        Err(Error::PluginLoad(PluginLoadError::NotLoaded(_)))
    ));
}

#[tokio::test]
async fn test_unload_removes_routes_and_subscriptions() {
    let log = new_log();
    let kernel = create_test_kernel();
    let echo = TestModule::new("echo", &log)
        .with_route()
        .subscribe_to("exts.ping");
    register_all(&kernel, vec![echo]).await;
    kernel.start().await.unwrap();

    let resp = kernel.dispatch(RouteRequest::get("/echo/ping")).await;
    assert_eq!(resp, RouteResponse::ok(json!({ "pong": "echo" })));
    assert_eq!(kernel.events().subscriber_count("exts.ping").await, 1);

    kernel.unload("echo").await.unwrap();
    let resp = kernel.dispatch(RouteRequest::get("/echo/ping")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(kernel.events().subscriber_count("exts.ping").await, 0);
    assert!(kernel.router().routes().await.is_empty());
}

#[tokio::test]
async fn test_unload_refused_while_dependents_run() {
    let log = new_log();
    let kernel = create_test_kernel();
    register_all(
        &kernel,
        vec![
            TestModule::new("db", &log),
            TestModule::new("repo", &log).strong("db"),
            TestModule::new("cache", &log).weak("db"),
        ],
    )
    .await;
    kernel.start().await.unwrap();

    match kernel.unload("db").await {
        Err(Error::PluginLoad(PluginLoadError::InUse { name, dependents })) => {
            assert_eq!(name, "db");
            assert_eq!(dependents, vec!["repo"]);
        }
        other => panic!("expected InUse, got {:?}", other),
    }
    assert_eq!(kernel.module_state("db").await, Some(ModuleState::Running));

    kernel.unload("repo").await.unwrap();
    kernel.unload("db").await.unwrap();
    let state = kernel.module_state("cache").await;
    assert_eq!(state, Some(ModuleState::Running));
}

#[tokio::test]
async fn test_reload_builtin_runs_fresh_instance() {
    let log = new_log();
    let kernel = create_test_kernel();
    let module = TestModule::new("svc", &log).with_route();
    let instances = module.instances.clone();
    register_all(&kernel, vec![module]).await;
    kernel.start().await.unwrap();
    assert_eq!(instances.load(Ordering::SeqCst), 1);

    kernel.reload("svc").await.unwrap();
    assert_eq!(instances.load(Ordering::SeqCst), 2);
    assert_eq!(kernel.module_state("svc").await, Some(ModuleState::Running));
    assert_eq!(calls(&log, "init"), vec!["svc", "svc"]);
    assert_eq!(calls(&log, "cleanup"), vec!["svc"]);
    let resp = kernel.dispatch(RouteRequest::get("/svc/ping")).await;
    assert!(resp.is_success());
}

#[tokio::test]
async fn test_reload_unknown_module() {
    let kernel = create_test_kernel();
    kernel.start().await.unwrap();
    assert!(kernel.reload("ghost").await.is_err());
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_requests() {
    let log = new_log();
    let kernel = kernel_with(|c| {
        c.kernel.reload_policy = ReloadPolicyKind::Drain;
        c.kernel.drain_timeout_ms = 2_000;
    });
    register_all(&kernel, vec![TestModule::new("slow", &log)]).await;
    kernel.start().await.unwrap();

    // Routes mounted under the module's own name are drained with it.
    let mut owned = RouteGroup::with_prefix("slow", "/slow-extra");
    owned.get("/wait", |_req: RouteRequest| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        RouteResponse::ok(json!("done"))
    });
    kernel.router().mount(owned).await.unwrap();

    let k = kernel.clone();
    let wait = RouteRequest::get("/slow-extra/wait");
    let request = tokio::spawn(async move { k.dispatch(wait).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    kernel.unload("slow").await.unwrap();

    let resp = request.await.unwrap();
    assert!(resp.is_success(), "request cut off: {:?}", resp);
    let resp = kernel.dispatch(RouteRequest::get("/slow-extra/wait")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let log = new_log();
    let kernel = create_test_kernel();
    register_all(&kernel, vec![TestModule::new("a", &log)]).await;
    let again = TestModule::new("a", &log).descriptor();
    match kernel.register(again).await {
        Err(Error::Registration(RegistrationError::DuplicateName(name))) => assert_eq!(name, "a"),
        other => panic!("expected DuplicateName, got {:?}", other),
    }
}

#[tokio::test]
async fn test_load_plugin_rejects_non_library() {
    let dir = tempfile::tempdir().unwrap();
    let file = format!("libbogus.{}", std::env::consts::DLL_EXTENSION);
    let path = dir.path().join(file);
    std::fs::write(&path, b"definitely not a shared object").unwrap();

    let kernel = create_test_kernel();
    match kernel.load_plugin(&path).await {
        Err(Error::PluginLoad(PluginLoadError::Library { path: p, .. })) => assert_eq!(p, path),
        other => panic!("expected a Library error, got {:?}", other),
    }
    assert!(kernel.modules().await.is_empty());
}

#[tokio::test]
async fn test_load_plugins_from_dir_collects_failures() {
    let dir = tempfile::tempdir().unwrap();
    let ext = std::env::consts::DLL_EXTENSION;
    std::fs::write(dir.path().join(format!("libone.{}", ext)), b"junk").unwrap();
    std::fs::write(dir.path().join(format!("libtwo.{}", ext)), b"junk").unwrap();
    std::fs::write(dir.path().join("README.txt"), b"not a plugin").unwrap();

    let mut config = KernelConfig::default();
    config.plugins.dir = dir.path().to_path_buf();
    let kernel = Kernel::new(config);

    let report = kernel.load_plugins_from_dir().await.unwrap();
    assert!(report.loaded.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert!(kernel.modules().await.is_empty());
}

#[tokio::test]
async fn test_discovery_publish_and_withdraw() {
    let log = new_log();
    let registry = Arc::new(InMemoryServiceRegistry::new());
    let kernel = Kernel::with_service_registry(KernelConfig::default(), registry.clone());
    let info = ServiceInfo::new("127.0.0.1:8080").tag("http");
    register_all(
        &kernel,
        vec![
            TestModule::new("api", &log).discoverable(info),
            TestModule::new("internal", &log),
        ],
    )
    .await;
    kernel.start().await.unwrap();

    assert_eq!(registry.services().await, vec!["api"]);
    assert_eq!(registry.get("api").await.unwrap().tags, vec!["http"]);

    kernel.shutdown().await;
    assert!(registry.services().await.is_empty());
}

#[tokio::test]
async fn test_unreachable_registry_does_not_fail_module() {
    let log = new_log();
    let registry = Arc::new(InMemoryServiceRegistry::new());
    registry.set_reachable(false);
    let kernel = Kernel::with_service_registry(KernelConfig::default(), registry.clone());
    let info = ServiceInfo::new("127.0.0.1:8080");
    let api = TestModule::new("api", &log).discoverable(info);
    register_all(&kernel, vec![api]).await;

    let report = kernel.start().await.unwrap();
    assert_eq!(report.running, vec!["api"]);
    assert!(kernel.discovery().published().await.is_empty());

    registry.set_reachable(true);
    kernel.shutdown().await;
    assert!(registry.services().await.is_empty());
}

#[tokio::test]
async fn test_activate_pending_starts_late_modules_in_order() {
    let log = new_log();
    let kernel = create_test_kernel();
    register_all(&kernel, vec![TestModule::new("base", &log)]).await;
    kernel.start().await.unwrap();

    register_all(
        &kernel,
        vec![
            TestModule::new("top", &log).strong("mid"),
            TestModule::new("mid", &log).strong("base"),
            TestModule::new("broken", &log).fail_at(LifecyclePhase::Init),
        ],
    )
    .await;
    let report = kernel.activate_pending().await.unwrap();
    assert_eq!(report.running, vec!["mid", "top"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");
    assert!(report.failed[0].1.is_init_error());

    assert_eq!(kernel.module_state("top").await, Some(ModuleState::Running));
    let state = kernel.module_state("broken").await;
    assert_eq!(state, Some(ModuleState::Failed));
    let inits = calls(&log, "init");
    assert_eq!(inits.iter().filter(|n| *n == "base").count(), 1);

    let again = kernel.activate_pending().await.unwrap();
    assert!(again.running.is_empty());
    assert!(again.failed.is_empty());
}

/// Loads `entry` as if it were the library at `file`.
async fn load_entry(kernel: &Kernel, file: &str, entry: ModuleEntryFn) -> String {
    let plugin = unsafe { PluginLibrary::in_process(file, entry) };
    kernel.load_library(plugin).await.unwrap()
}

async fn plugin_status(kernel: &Kernel, name: &str) -> Option<PluginStatus> {
    kernel
        .plugins()
        .await
        .into_iter()
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.status)
}

fn boxed(module: TestModule) -> *mut ModuleDescriptor {
    Box::into_raw(Box::new(module.descriptor()))
}

fn tidy() -> ModuleDescriptor {
    let ticks = Arc::new(AtomicUsize::new(0));
    TestModule::new("tidy", &new_log())
        .with_route()
        .subscribe_to("exts.tidy")
        .ticker(ticks)
        .descriptor()
}

extern "C-unwind" fn tidy_entry(host: *const HostLink) -> *mut ModuleDescriptor {
    unsafe { boundary::export(host, tidy) }
}

extern "C-unwind" fn stubborn_entry(_host: *const HostLink) -> *mut ModuleDescriptor {
    let module = TestModule::new("stubborn", &new_log());
    boxed(module.blocking_task(Duration::from_millis(300)))
}

extern "C-unwind" fn slow_entry(_host: *const HostLink) -> *mut ModuleDescriptor {
    let module = TestModule::new("slow", &new_log());
    boxed(module.slow_route(Duration::from_millis(200)))
}

struct Sluggish;

#[async_trait]
impl EventHandler for Sluggish {
    async fn handle(&self, _event: &Event) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn subscribe_sluggish(ctx: ModuleContext, _log: CallLog) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        ctx.subscribe("exts.sluggish", Arc::new(Sluggish)).await;
        Ok(())
    })
}

extern "C-unwind" fn sluggish_entry(_host: *const HostLink) -> *mut ModuleDescriptor {
    let module = TestModule::new("sluggish", &new_log());
    boxed(module.on_post_init(subscribe_sluggish))
}

#[tokio::test]
async fn test_unload_closes_idle_library() {
    let kernel = create_test_kernel();
    let name = load_entry(&kernel, "/virtual/libtidy.so", tidy_entry).await;
    let status = plugin_status(&kernel, &name).await;
    assert_eq!(status, Some(PluginStatus::Loaded));
    kernel.start().await.unwrap();

    let resp = kernel.dispatch(RouteRequest::get("/tidy/ping")).await;
    assert!(resp.is_success());
    let tick = Event::new("exts.tidy", json!(1));
    let delivered = kernel.events().publish(tick).await;
    assert_eq!(delivered, 1);

    kernel.unload(&name).await.unwrap();
    let status = plugin_status(&kernel, &name).await;
    assert_eq!(status, Some(PluginStatus::Unloaded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unload_retains_library_while_task_runs() {
    let kernel = kernel_with(|c| c.kernel.task_shutdown_timeout_ms = 20);
    let name = load_entry(&kernel, "/virtual/libstubborn.so", stubborn_entry).await;
    kernel.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    kernel.unload(&name).await.unwrap();
    assert_eq!(kernel.module_state(&name).await, None);
    let status = plugin_status(&kernel, &name).await;
    assert_eq!(status, Some(PluginStatus::Retained));
}

#[tokio::test]
async fn test_unload_retains_library_after_drain_timeout() {
    let kernel = kernel_with(|c| {
        c.kernel.reload_policy = ReloadPolicyKind::Drain;
        c.kernel.drain_timeout_ms = 20;
    });
    let name = load_entry(&kernel, "/virtual/libslow.so", slow_entry).await;
    kernel.start().await.unwrap();

    let k = kernel.clone();
    let slow = RouteRequest::get("/slow/slow");
    let request = tokio::spawn(async move { k.dispatch(slow).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    kernel.unload(&name).await.unwrap();

    let status = plugin_status(&kernel, &name).await;
    assert_eq!(status, Some(PluginStatus::Retained));
    assert!(request.await.unwrap().is_success());
}

#[tokio::test]
async fn test_unload_retains_library_under_immediate_policy() {
    let kernel = kernel_with(|c| c.kernel.reload_policy = ReloadPolicyKind::Immediate);
    let name = load_entry(&kernel, "/virtual/libslow.so", slow_entry).await;
    kernel.start().await.unwrap();

    let k = kernel.clone();
    let slow = RouteRequest::get("/slow/slow");
    let request = tokio::spawn(async move { k.dispatch(slow).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    kernel.unload(&name).await.unwrap();

    let status = plugin_status(&kernel, &name).await;
    assert_eq!(status, Some(PluginStatus::Retained));
    assert!(request.await.unwrap().is_success());
}

#[tokio::test]
async fn test_unload_retains_library_while_handler_runs() {
    let kernel = create_test_kernel();
    let name = load_entry(&kernel, "/virtual/libsluggish.so", sluggish_entry).await;
    kernel.start().await.unwrap();

    let k = kernel.clone();
    let event = Event::new("exts.sluggish", json!(null));
    let publish = tokio::spawn(async move { k.events().publish(event).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    kernel.unload(&name).await.unwrap();

    let status = plugin_status(&kernel, &name).await;
    assert_eq!(status, Some(PluginStatus::Retained));
    assert_eq!(publish.await.unwrap(), 1);
}

static OBSERVED: StdMutex<Option<Kernel>> = StdMutex::new(None);
static LOCKS_FREE: AtomicBool = AtomicBool::new(false);

extern "C-unwind" fn observing_entry(_host: *const HostLink) -> *mut ModuleDescriptor {
    if let Some(kernel) = OBSERVED.lock().unwrap().as_ref() {
        let inner = &kernel.inner;
        let free = inner.loader.try_lock().is_ok() && inner.registry.try_write().is_ok();
        LOCKS_FREE.store(free, Ordering::SeqCst);
    }
    boxed(TestModule::new("observer", &new_log()))
}

#[tokio::test]
async fn test_entry_point_runs_without_kernel_locks() {
    let kernel = create_test_kernel();
    *OBSERVED.lock().unwrap() = Some(kernel.clone());

    let name = load_entry(&kernel, "/virtual/libobserver.so", observing_entry).await;
    OBSERVED.lock().unwrap().take();
    assert_eq!(name, "observer");
    assert!(LOCKS_FREE.load(Ordering::SeqCst));
    let modules = kernel.modules().await;
    assert!(modules.iter().any(|m| m.name == name));
}
