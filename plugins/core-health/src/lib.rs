//! Built-in module aggregating the [`HealthCheck`] capability of every running
//! module into one report.
//!
//! Exposes `GET /core-health/health` (`200` when every check passes, `503`
//! otherwise) and exports a [`HealthReporter`] capability for other modules.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use loom_core::http::StatusCode;
use loom_core::kernel::constants::{EVENT_MODULE_RUNNING, EVENT_MODULE_UNLOADED};
use loom_core::kernel::error::{Error as KernelError, Result as KernelResult};
use loom_core::{
    HealthCheck, HealthStatus, Module, ModuleContext, ModuleMetadata, RouteGroup, RouteRequest,
    RouteResponse, ServiceSet,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const MODULE_NAME: &str = "core-health";

/// Published once the reporter is ready to answer.
pub const READY_EVENT: &str = "exts.core-health.ready";

const DEFAULT_CHECK_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// One entry per module exporting a health check
    pub checks: BTreeMap<String, HealthStatus>,
    /// Modules announced as running since this reporter started
    pub running: Vec<String>,
}

/// Capability exported by this module.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn report(&self) -> HealthReport;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    check_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
        }
    }
}

pub struct Reporter {
    ctx: ModuleContext,
    check_timeout: Duration,
    running: Mutex<Vec<String>>,
}

impl Reporter {
    fn track(&self, event: &str, module: &str) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        match event {
            EVENT_MODULE_RUNNING => {
                if !running.iter().any(|m| m == module) {
                    running.push(module.to_string());
                }
            }
            _ => running.retain(|m| m != module),
        }
    }
}

#[async_trait]
impl HealthReporter for Reporter {
    async fn report(&self) -> HealthReport {
        let running = self.running.lock().map(|r| r.clone()).unwrap_or_default();
        let kernel = match self.ctx.kernel().upgrade() {
            Ok(kernel) => kernel,
            Err(e) => {
                let status = HealthStatus::unhealthy(e.to_string());
                let checks = BTreeMap::from([(MODULE_NAME.to_string(), status)]);
                return HealthReport {
                    healthy: false,
                    checks,
                    running,
                };
            }
        };

        let limit = self.check_timeout;
        let mut checks = BTreeMap::new();
        for (module, check) in kernel.providers::<dyn HealthCheck>().await {
            let status = match self.ctx.timeout(limit, check.check()).await {
                Some(status) => status,
                None => HealthStatus::unhealthy(format!("check timed out after {:?}", limit)),
            };
            if !status.healthy {
                warn!("Module '{}' reports unhealthy: {:?}", module, status.detail);
            }
            checks.insert(module, status);
        }
        HealthReport {
            healthy: checks.values().all(|s| s.healthy),
            checks,
            running,
        }
    }
}

#[derive(Default)]
pub struct HealthModule {
    reporter: OnceLock<Arc<Reporter>>,
}

#[async_trait]
impl Module for HealthModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn init(&self, ctx: &ModuleContext) -> KernelResult<()> {
        let settings: Settings = ctx.config().deserialize()?;
        let reporter = Arc::new(Reporter {
            ctx: ctx.clone(),
            check_timeout: Duration::from_millis(settings.check_timeout_ms),
            running: Mutex::new(Vec::new()),
        });
        if self.reporter.set(reporter.clone()).is_err() {
            return Err(KernelError::from("core-health initialized twice"));
        }

        for event in [EVENT_MODULE_RUNNING, EVENT_MODULE_UNLOADED] {
            let tracker = reporter.clone();
            ctx.subscribe_fn(event, move |e| {
                if let Some(module) = e.payload["module"].as_str() {
                    tracker.track(&e.name, module);
                }
            })
            .await;
        }
        info!(
            "Initialized {} (check timeout {}ms)",
            MODULE_NAME, settings.check_timeout_ms
        );
        Ok(())
    }

    async fn post_init(&self, ctx: &ModuleContext) -> KernelResult<()> {
        let ready = json!({ "module": MODULE_NAME, "route": "/core-health/health" });
        ctx.publish(READY_EVENT, ready).await;
        Ok(())
    }

    fn register_routes(&self, routes: &mut RouteGroup) {
        let Some(reporter) = self.reporter.get().cloned() else {
            warn!("{} has no reporter; health route not mounted", MODULE_NAME);
            return;
        };
        routes.get("/health", move |_req: RouteRequest| {
            let reporter = reporter.clone();
            async move {
                let report = reporter.report().await;
                let status = if report.healthy {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                match serde_json::to_value(&report) {
                    Ok(body) => RouteResponse::new(status, body),
                    Err(e) => RouteResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e),
                }
            }
        });
    }

    fn services(&self) -> ServiceSet {
        match self.reporter.get() {
            Some(reporter) => {
                let capability: Arc<dyn HealthReporter> = reporter.clone();
                ServiceSet::new()
                    .with_service(reporter.clone())
                    .provide::<dyn HealthReporter>(capability)
            }
            None => ServiceSet::new(),
        }
    }

    async fn cleanup(&self) -> KernelResult<()> {
        debug!("{} cleaned up", MODULE_NAME);
        Ok(())
    }

    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            description: Some("Aggregated health of every running module".to_string()),
            tags: vec!["core".to_string(), "health".to_string()],
            ..ModuleMetadata::default()
        }
    }
}
