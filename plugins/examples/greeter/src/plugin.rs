//! Example plugin. Built as a `cdylib`, dropped into the plugins directory and
//! picked up by the kernel through the exported module entry.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use loom_core::http::StatusCode;
use loom_core::kernel::error::{Error as KernelError, Result as KernelResult};
use loom_core::{
    HealthCheck, HealthStatus, Module, ModuleContext, ModuleDependency, ModuleDescriptor,
    ModuleMetadata, RouteGroup, RouteRequest, RouteResponse, ServiceInfo, ServiceSet,
};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;

loom_core::declare_module!(|| ModuleDescriptor::of::<GreeterModule>());

pub const MODULE_NAME: &str = "greeter";
pub const READY_EVENT: &str = "exts.greeter.ready";
const HEALTH_MODULE: &str = "core-health";
const HELLO_ROUTE: &str = "/greeter/hello/{name}";

/// Capability other modules call through `get_cross_service::<dyn Greeter>`.
pub trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    greeting: String,
    address: String,
    heartbeat_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            greeting: "Hello".to_string(),
            address: "local://greeter".to_string(),
            heartbeat_ms: 1_000,
        }
    }
}

pub struct GreeterService {
    greeting: String,
    greeted: AtomicU64,
    heartbeats: Arc<AtomicU64>,
}

impl GreeterService {
    pub fn greeted(&self) -> u64 {
        self.greeted.load(Ordering::Relaxed)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }
}

impl Greeter for GreeterService {
    fn greet(&self, name: &str) -> String {
        self.greeted.fetch_add(1, Ordering::Relaxed);
        format!("{}, {}!", self.greeting, name)
    }
}

#[async_trait]
impl HealthCheck for GreeterService {
    async fn check(&self) -> HealthStatus {
        if self.heartbeats() > 0 {
            HealthStatus::healthy()
        } else {
            HealthStatus::unhealthy("no heartbeat yet")
        }
    }
}

#[derive(Default)]
pub struct GreeterModule {
    service: OnceLock<Arc<GreeterService>>,
    address: OnceLock<String>,
}

#[async_trait]
impl Module for GreeterModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn dependencies(&self) -> Vec<ModuleDependency> {
        vec![ModuleDependency::weak(HEALTH_MODULE)]
    }

    async fn init(&self, ctx: &ModuleContext) -> KernelResult<()> {
        let settings: Settings = ctx.config().deserialize()?;
        if settings.greeting.trim().is_empty() {
            return Err(KernelError::from("greeting must not be empty"));
        }
        if settings.heartbeat_ms == 0 {
            return Err(KernelError::from("heartbeat_ms must be positive"));
        }

        let heartbeats = Arc::new(AtomicU64::new(0));
        let service = Arc::new(GreeterService {
            greeting: settings.greeting.clone(),
            greeted: AtomicU64::new(0),
            heartbeats: heartbeats.clone(),
        });
        if self.service.set(service).is_err() || self.address.set(settings.address).is_err() {
            return Err(KernelError::from("greeter initialized twice"));
        }

        let period = Duration::from_millis(settings.heartbeat_ms);
        let timer = ctx.clone();
        ctx.spawn(async move {
            loop {
                heartbeats.fetch_add(1, Ordering::Relaxed);
                timer.sleep(period).await;
            }
        });
        info!("Greeter initialized with greeting '{}'", settings.greeting);
        Ok(())
    }

    async fn post_init(&self, ctx: &ModuleContext) -> KernelResult<()> {
        match ctx.get_service(HEALTH_MODULE).await {
            Ok(_) => debug!("Greeter will be reported by {}", HEALTH_MODULE),
            Err(e) => debug!("Greeter running without {}: {}", HEALTH_MODULE, e),
        }
        let ready = json!({ "module": MODULE_NAME, "route": HELLO_ROUTE });
        ctx.publish(READY_EVENT, ready).await;
        Ok(())
    }

    fn register_routes(&self, routes: &mut RouteGroup) {
        let Some(service) = self.service.get().cloned() else {
            return;
        };
        routes.get("/hello/{name}", move |req: RouteRequest| {
            let service = service.clone();
            async move {
                match req.param("name") {
                    Some(name) => RouteResponse::ok(json!({ "message": service.greet(name) })),
                    None => RouteResponse::error(StatusCode::BAD_REQUEST, "missing name"),
                }
            }
        });
    }

    fn services(&self) -> ServiceSet {
        let Some(service) = self.service.get() else {
            return ServiceSet::new();
        };
        ServiceSet::new()
            .with_service(service.clone())
            .provide::<dyn Greeter>(service.clone() as Arc<dyn Greeter>)
            .provide::<dyn HealthCheck>(service.clone() as Arc<dyn HealthCheck>)
    }

    fn metadata(&self) -> ModuleMetadata {
        let mut metadata = ModuleMetadata {
            description: Some("Says hello".to_string()),
            tags: vec!["example".to_string()],
            ..ModuleMetadata::default()
        };
        let attributes = &mut metadata.attributes;
        attributes.insert("route".to_string(), HELLO_ROUTE.to_string());
        metadata
    }

    fn needs_service_discovery(&self) -> bool {
        true
    }

    fn service_info(&self) -> Option<ServiceInfo> {
        let address = self.address.get()?;
        Some(
            ServiceInfo::new(address.as_str())
                .tag("example")
                .tag("greeter")
                .meta("version", env!("CARGO_PKG_VERSION")),
        )
    }
}

#[cfg(test)]
mod tests;
