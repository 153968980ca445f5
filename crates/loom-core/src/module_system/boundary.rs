//! Unwind boundary between the host and modules loaded from shared libraries.
//!
//! A plugin library links its own copy of the standard library, and a panic
//! raised by one copy cannot be caught by another one: the process aborts.
//! Every call the host makes into plugin code therefore has to catch panics on
//! the plugin's side. [`declare_module!`](crate::declare_module) builds the
//! [`UnwindBoundary`] inside the plugin, so its hooks, its route handlers and
//! the event handlers it subscribes through its
//! [`ModuleContext`](crate::ModuleContext) all catch with the plugin's copy.
//!
//! Capability objects a plugin exports are called without a boundary and must
//! not panic.
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;

use crate::discovery::ServiceInfo;
use crate::event::bus::panic_message;
use crate::kernel::context::ModuleContext;
use crate::kernel::error::{Error, Result};
use crate::kernel::lifecycle::LifecyclePhase;
use crate::module_system::dependency::ModuleDependency;
use crate::module_system::descriptor::{ModuleDescriptor, ModuleFactory};
use crate::module_system::traits::{Module, ModuleMetadata};
use crate::router::RouteGroup;
use crate::service::ServiceSet;

/// What the host hands to a plugin's entry point.
pub struct HostLink {
    logger: &'static dyn log::Log,
    max_level: log::LevelFilter,
}

impl HostLink {
    /// Link to the logger of the calling binary.
    pub fn current() -> Self {
        Self {
            logger: log::logger(),
            max_level: log::max_level(),
        }
    }

    /// Send this binary's `log` records to the host logger.
    ///
    /// Does nothing when host and module share one copy of `log`.
    pub fn install(&self) {
        if ptr::addr_eq(self.logger, log::logger()) {
            return;
        }
        if log::set_logger(self.logger).is_ok() {
            log::set_max_level(self.max_level);
        }
    }
}

/// Body of the entry point [`declare_module!`](crate::declare_module) generates.
///
/// # Safety
/// `host` must be null or point to a [`HostLink`] that stays valid for the call.
#[doc(hidden)]
pub unsafe fn export(
    host: *const HostLink,
    ctor: fn() -> ModuleDescriptor,
) -> *mut ModuleDescriptor {
    if let Some(link) = unsafe { host.as_ref() } {
        link.install();
    }
    match panic::catch_unwind(ctor) {
        Ok(descriptor) => Box::into_raw(Box::new(descriptor.isolated())),
        Err(panic) => {
            log::error!(
                "Module constructor panicked: {}",
                panic_message(panic.as_ref())
            );
            ptr::null_mut()
        }
    }
}

/// A module instance whose every hook catches panics.
///
/// Panics in lifecycle hooks become [`Error::Init`] for the failing phase.
/// Route handlers added in `register_routes` are wrapped the same way, and a
/// panic in `register_routes` itself faults the route group so the kernel
/// fails the module instead of mounting it. `services()` is collected during
/// `post_init`, so a panic there fails `post_init`.
pub struct UnwindBoundary {
    name: String,
    version: String,
    /// The wrapped instance, or why the factory produced none
    inner: std::result::Result<Arc<dyn Module>, String>,
    exports: Mutex<Option<ServiceSet>>,
}

impl UnwindBoundary {
    /// Run `factory` and wrap what it builds. A panicking factory yields an
    /// instance called `name` that fails `pre_init`.
    pub fn instantiate(name: &str, factory: &ModuleFactory) -> Arc<dyn Module> {
        let built = panic::catch_unwind(AssertUnwindSafe(|| {
            let inner = factory();
            let name = inner.name().to_string();
            let version = inner.version().to_string();
            (inner, name, version)
        }));
        let boundary = match built {
            Ok((inner, name, version)) => Self {
                name,
                version,
                inner: Ok(inner),
                exports: Mutex::default(),
            },
            Err(panic) => Self {
                name: name.to_string(),
                version: "0.0.0".to_string(),
                inner: Err(format!("factory panicked: {}", panic_message(panic.as_ref()))),
                exports: Mutex::default(),
            },
        };
        Arc::new(boundary)
    }

    fn live(&self, phase: LifecyclePhase) -> Result<&Arc<dyn Module>> {
        self.inner
            .as_ref()
            .map_err(|fault| Error::init(self.name.as_str(), phase, fault.as_str()))
    }

    async fn contain<F>(&self, phase: LifecyclePhase, hook: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        match AssertUnwindSafe(hook).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::init(
                self.name.as_str(),
                phase,
                format!("panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    fn contain_sync<T>(&self, what: &str, call: impl FnOnce(&dyn Module) -> T) -> Option<T> {
        let inner = self.inner.as_ref().ok()?;
        match panic::catch_unwind(AssertUnwindSafe(|| call(inner.as_ref()))) {
            Ok(value) => Some(value),
            Err(panic) => {
                log::error!(
                    "{}() of module '{}' panicked: {}",
                    what,
                    self.name,
                    panic_message(panic.as_ref())
                );
                None
            }
        }
    }
}

#[async_trait]
impl Module for UnwindBoundary {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn dependencies(&self) -> Vec<ModuleDependency> {
        self.contain_sync("dependencies", |m| m.dependencies())
            .unwrap_or_default()
    }

    async fn pre_init(&self) -> Result<()> {
        let inner = self.live(LifecyclePhase::PreInit)?;
        self.contain(LifecyclePhase::PreInit, inner.pre_init())
            .await
    }

    async fn init(&self, ctx: &ModuleContext) -> Result<()> {
        let inner = self.live(LifecyclePhase::Init)?;
        self.contain(LifecyclePhase::Init, inner.init(ctx)).await
    }

    async fn post_init(&self, ctx: &ModuleContext) -> Result<()> {
        let inner = self.live(LifecyclePhase::PostInit)?;
        self.contain(LifecyclePhase::PostInit, inner.post_init(ctx))
            .await?;
        let exports = match panic::catch_unwind(AssertUnwindSafe(|| inner.services())) {
            Ok(exports) => exports,
            Err(panic) => {
                return Err(Error::init(
                    self.name.as_str(),
                    LifecyclePhase::PostInit,
                    format!("services() panicked: {}", panic_message(panic.as_ref())),
                ));
            }
        };
        *self.exports.lock().unwrap_or_else(PoisonError::into_inner) = Some(exports);
        Ok(())
    }

    fn register_routes(&self, routes: &mut RouteGroup) {
        let Ok(inner) = &self.inner else {
            return;
        };
        let first = routes.len();
        let registered = panic::catch_unwind(AssertUnwindSafe(|| inner.register_routes(routes)));
        match registered {
            Ok(()) => routes.contain_from(first),
            Err(panic) => routes.fault(format!(
                "register_routes panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }

    fn services(&self) -> ServiceSet {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }

    async fn pre_cleanup(&self) -> Result<()> {
        let Ok(inner) = &self.inner else {
            return Ok(());
        };
        self.contain(LifecyclePhase::PreCleanup, inner.pre_cleanup())
            .await
    }

    async fn cleanup(&self) -> Result<()> {
        let Ok(inner) = &self.inner else {
            return Ok(());
        };
        self.contain(LifecyclePhase::Cleanup, inner.cleanup()).await
    }

    fn metadata(&self) -> ModuleMetadata {
        self.contain_sync("metadata", |m| m.metadata())
            .unwrap_or_default()
    }

    fn needs_service_discovery(&self) -> bool {
        self.contain_sync("needs_service_discovery", |m| m.needs_service_discovery())
            .unwrap_or(false)
    }

    fn service_info(&self) -> Option<ServiceInfo> {
        self.contain_sync("service_info", |m| m.service_info())
            .flatten()
    }
}
