//! Runtime module management: loading plugin libraries, late activation,
//! unloading and hot reload.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::kernel::bootstrap::{Kernel, StartReport};
use crate::kernel::constants;
use crate::kernel::error::{Error, Result};
use crate::kernel::lifecycle::{LifecyclePhase, ModuleState};
use crate::module_system::dependency::{DependencyError, DependencyResolver};
use crate::module_system::error::PluginLoadError;
use crate::module_system::loader::{PluginLibrary, PluginSummary};
use crate::service::ServiceSet;

/// Outcome of loading every plugin in the configured directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(PathBuf, Error)>,
}

impl Kernel {
    /// Open the plugin library at `path` and register its descriptor.
    ///
    /// The module is registered but not started; call [`activate`](Self::activate)
    /// (or [`start`](Self::start) if the kernel has not started yet).
    pub async fn load_plugin(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        self.inner.loader.lock().await.ensure_unloaded(path)?;
        let plugin = PluginLibrary::open(path)?;
        self.load_library(plugin).await
    }

    /// Run the entry point of `plugin` and register the module it describes.
    ///
    /// The entry point runs with no kernel lock held.
    pub(crate) async fn load_library(&self, plugin: PluginLibrary) -> Result<String> {
        let path = plugin.path().to_path_buf();
        let constructed = plugin.construct();
        let descriptor = self.inner.loader.lock().await.adopt(plugin, constructed)?;
        let name = descriptor.name.clone();

        let registered = self.inner.registry.write().await.register(descriptor);
        if let Err(e) = registered {
            let reason = e.to_string();
            self.inner.loader.lock().await.discard(&path, &reason);
            log::error!("Plugin at {} rejected: {}", path.display(), e);
            return Err(PluginLoadError::Registration(e).into());
        }
        Ok(name)
    }

    /// Load every plugin found in the configured plugin directory.
    ///
    /// Failures are collected per file; one bad plugin never stops the others.
    pub async fn load_plugins_from_dir(&self) -> Result<LoadReport> {
        let paths = self.inner.loader.lock().await.scan().await?;
        let mut report = LoadReport::default();
        for path in paths {
            match self.load_plugin(&path).await {
                Ok(name) => report.loaded.push(name),
                Err(e) => {
                    log::warn!("Skipping plugin {}: {}", path.display(), e);
                    report.failed.push((path, e));
                }
            }
        }
        log::info!(
            "Loaded {} plugin(s) from {} ({} failed)",
            report.loaded.len(),
            self.inner.config.plugins.dir.display(),
            report.failed.len()
        );
        Ok(report)
    }

    pub async fn plugins(&self) -> Vec<PluginSummary> {
        self.inner.loader.lock().await.records()
    }

    /// Run the full lifecycle for a module registered after [`start`](Self::start).
    ///
    /// Every strong dependency must already be running.
    pub async fn activate(&self, name: &str) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.activate_locked(name).await
    }

    async fn activate_locked(&self, name: &str) -> Result<()> {
        if !self.is_started() {
            let reason = "kernel has not been started";
            return Err(Error::init(name, LifecyclePhase::Resolve, reason));
        }
        let strong = {
            let registry = self.inner.registry.read().await;
            let descriptor = registry
                .get(name)
                .ok_or_else(|| PluginLoadError::NotLoaded(name.to_string()))?;
            descriptor.strong.clone()
        };
        if let Some(state) = self.state_of(name).await {
            if !state.is_terminal() {
                log::debug!("Module '{}' is already live ({})", name, state);
                return Ok(());
            }
            self.inner.slots.lock().await.remove(name);
        }

        for dep in strong {
            if self.state_of(&dep).await == Some(ModuleState::Running) {
                continue;
            }
            let known = self.inner.registry.read().await.contains(&dep);
            let module = name.to_string();
            let cause = if known {
                DependencyError::DependencyFailed {
                    module,
                    dependency: dep,
                }
            } else {
                DependencyError::MissingDependency {
                    module,
                    dependency: dep,
                }
            };
            let cause = Error::Dependency(cause);
            let err = Error::init_caused_by(name, LifecyclePhase::Resolve, cause);
            log::error!("Cannot activate '{}': {}", name, err);
            self.record_failure(name, &err).await;
            return Err(err);
        }

        let mut report = self.run_lifecycle(&[name.to_string()]).await;
        match report.failed.pop() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    /// Activate every registered module that has not been started yet, in
    /// dependency order.
    pub async fn activate_pending(&self) -> Result<StartReport> {
        let _ops = self.inner.ops.lock().await;
        let resolution = {
            let registry = self.inner.registry.read().await;
            DependencyResolver::new(&registry).resolve()
        };
        let slots: Vec<String> = self.inner.slots.lock().await.keys().cloned().collect();
        let mut report = StartReport::default();
        for name in resolution.order.into_iter().filter(|n| !slots.contains(n)) {
            match self.activate_locked(&name).await {
                Ok(()) => report.running.push(name),
                Err(e) => report.failed.push((name, e)),
            }
        }
        Ok(report)
    }

    /// Tear a module down and remove it from the registry.
    ///
    /// Refused with `InUse` while a running module holds a strong dependency on
    /// it. The library of a dynamic plugin is closed only when none of its code
    /// can run any more: its background tasks stopped, no request is inside one
    /// of its handlers, no publish holds one of its event handlers and nothing
    /// outside the kernel references the module or its services. Otherwise the
    /// library stays mapped for the rest of the process and the plugin is
    /// reported as [`Retained`](crate::module_system::PluginStatus::Retained).
    pub async fn unload(&self, name: &str) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.unload_locked(name).await
    }

    async fn unload_locked(&self, name: &str) -> Result<()> {
        let dependents = self.inner.registry.read().await.dependents_of(name);
        if !self.inner.registry.read().await.contains(name) {
            return Err(PluginLoadError::NotLoaded(name.to_string()).into());
        }
        let mut blocking = Vec::new();
        for dependent in dependents {
            if matches!(self.state_of(&dependent).await, Some(s) if !s.is_terminal()) {
                blocking.push(dependent);
            }
        }
        if !blocking.is_empty() {
            let err = PluginLoadError::InUse {
                name: name.to_string(),
                dependents: blocking,
            };
            return Err(err.into());
        }

        log::info!("Unloading module '{}'", name);
        let outcome = self.teardown(name).await;

        let slot = self.inner.slots.lock().await.remove(name);
        self.inner.order.lock().await.retain(|n| n != name);
        self.inner.failures.lock().await.remove(name);
        self.inner.catalog.write().await.remove(name);
        let descriptor = self.inner.registry.write().await.deregister(name);
        self.emit(constants::EVENT_MODULE_UNLOADED, name).await;

        let mut loader = self.inner.loader.lock().await;
        if !loader.is_loaded(name) {
            return Ok(());
        }
        let mut pinned = Vec::new();
        if let Some(outcome) = outcome {
            if !outcome.requests_finished {
                pinned.push("requests still in flight");
            }
            if !outcome.handlers_released {
                pinned.push("event handlers still executing");
            }
        }
        let tasks_running = outcome.is_some_and(|o| !o.tasks_stopped)
            || slot.as_ref().is_some_and(|s| s.ctx.running_tasks() > 0);
        if tasks_running {
            pinned.push("background tasks still running");
        }
        let still_referenced = slot.as_ref().is_some_and(|slot| {
            let exported = slot.exports.as_ref().map_or(0, ServiceSet::external_refs);
            Arc::strong_count(&slot.instance) > 1 || exported > 0
        });
        if still_referenced {
            pinned.push("referenced outside the kernel");
        }
        drop(slot);
        drop(descriptor);

        if pinned.is_empty() {
            let path = loader.release(name)?;
            log::info!("Closed plugin library {}", path.display());
        } else {
            let path = loader.leak(name)?;
            log::warn!(
                "Library {} of module '{}' stays mapped: {}",
                path.display(),
                name,
                pinned.join(", ")
            );
        }
        Ok(())
    }

    /// Replace a module with a fresh instance and run its full lifecycle.
    ///
    /// Dynamic plugins are reopened from the path they were loaded from;
    /// compiled-in modules re-run their factory.
    pub async fn reload(&self, name: &str) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        let plugin_path = self.inner.loader.lock().await.locate(name);
        let descriptor = self
            .inner
            .registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PluginLoadError::NotLoaded(name.to_string()))?;

        log::info!("Reloading module '{}'", name);
        match plugin_path {
            Some(path) => {
                drop(descriptor);
                self.unload_locked(name).await?;
                let reloaded = self.load_plugin(&path).await?;
                if reloaded != name {
                    log::warn!(
                        "Plugin at {} now provides '{}' instead of '{}'",
                        path.display(),
                        reloaded,
                        name
                    );
                }
                self.activate_locked(&reloaded).await
            }
            None => {
                self.unload_locked(name).await?;
                self.inner.registry.write().await.register(descriptor)?;
                self.activate_locked(name).await
            }
        }
    }
}
