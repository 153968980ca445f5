//! Dynamic plugin loading.
//!
//! A plugin is a shared library exporting one constructor symbol,
//! [`MODULE_ENTRY_SYMBOL`], which returns a heap-allocated [`ModuleDescriptor`].
//! The [`declare_module!`](crate::declare_module) macro generates that symbol.
//!
//! Plugins are built in the same workspace build as the host, against the same
//! `loom-core` and the same compiler; the descriptor crosses the boundary as a
//! plain Rust value. Loading happens in two steps so that plugin code never
//! runs while the loader is locked: [`PluginLibrary::construct`] calls the
//! entry point, then [`PluginLoader::adopt`] records the outcome.
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use libloading::Library;
use tokio::fs;

use crate::config::PluginSettings;
use crate::kernel::constants::MODULE_ENTRY_SYMBOL;
use crate::module_system::boundary::HostLink;
use crate::module_system::descriptor::ModuleDescriptor;
use crate::module_system::error::PluginLoadError;
use crate::module_system::traits::ModuleKind;

/// Signature of the exported constructor.
pub type ModuleEntryFn = unsafe extern "C-unwind" fn(*const HostLink) -> *mut ModuleDescriptor;

/// Export the constructor symbol for a dynamic plugin.
///
/// The generated entry point routes the plugin's logging to the host, catches
/// panics of the constructor and wraps every instance in an
/// [`UnwindBoundary`](crate::module_system::UnwindBoundary).
///
/// ```ignore
/// loom_core::declare_module!(|| ModuleDescriptor::of::<Greeter>());
/// ```
#[macro_export]
macro_rules! declare_module {
    ($ctor:expr) => {
        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C-unwind" fn _loom_module_entry(
            host: *const $crate::module_system::HostLink,
        ) -> *mut $crate::module_system::ModuleDescriptor {
            let ctor: fn() -> $crate::module_system::ModuleDescriptor = $ctor;
            // SAFETY: the loader passes a link that outlives this call.
            unsafe { $crate::module_system::boundary::export(host, ctor) }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Loaded,
    Unloaded,
    /// Unloaded, but the library stays mapped because its code may still run
    Retained,
    Failed(String),
}

/// A plugin library whose entry point is resolved but not called yet.
pub struct PluginLibrary {
    path: PathBuf,
    library: Option<Library>,
    entry: ModuleEntryFn,
}

impl PluginLibrary {
    /// Open the library at `path` and resolve its entry point.
    pub fn open(path: &Path) -> Result<Self, PluginLoadError> {
        log::info!("Opening plugin library {}", path.display());
        // SAFETY: loading a library runs its initializers; plugins are trusted code
        // built against this crate.
        let library = match unsafe { Library::new(path) } {
            Ok(library) => library,
            Err(e) => {
                return Err(PluginLoadError::Library {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };

        let symbol_name = format!("{}\0", MODULE_ENTRY_SYMBOL);
        // SAFETY: the symbol's type is fixed by `declare_module!`.
        let entry = match unsafe { library.get::<ModuleEntryFn>(symbol_name.as_bytes()) } {
            Ok(symbol) => *symbol,
            Err(e) => {
                return Err(PluginLoadError::SymbolNotFound {
                    path: path.to_path_buf(),
                    symbol: MODULE_ENTRY_SYMBOL.to_string(),
                    message: e.to_string(),
                });
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            library: Some(library),
            entry,
        })
    }

    /// An entry point compiled into the running binary, recorded under `path`.
    ///
    /// # Safety
    /// `entry` must return either null or a pointer obtained from `Box::into_raw`.
    pub unsafe fn in_process(path: impl Into<PathBuf>, entry: ModuleEntryFn) -> Self {
        Self {
            path: path.into(),
            library: None,
            entry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call the entry point. This runs plugin code; callers must not hold
    /// kernel locks.
    pub fn construct(&self) -> Result<ModuleDescriptor, PluginLoadError> {
        let link = HostLink::current();
        let entry = self.entry;
        // SAFETY: `entry` was resolved from `library`, which lives as long as `self`.
        let raw = match panic::catch_unwind(AssertUnwindSafe(|| unsafe { entry(&link) })) {
            Ok(raw) => raw,
            Err(_) => {
                log::error!("Entry point of plugin {} panicked", self.path.display());
                return Err(PluginLoadError::EntryPanicked(self.path.clone()));
            }
        };
        if raw.is_null() {
            return Err(PluginLoadError::NullDescriptor(self.path.clone()));
        }

        // SAFETY: non-null pointers come from `Box::into_raw` in `declare_module!`.
        let mut descriptor = *unsafe { Box::from_raw(raw) };
        descriptor.kind = ModuleKind::Plugin;
        Ok(descriptor)
    }
}

/// One plugin file the loader has touched.
#[derive(Debug)]
pub struct PluginRecord {
    /// Module name reported by the descriptor, once known
    pub name: Option<String>,
    pub path: PathBuf,
    library: Option<Library>,
    pub status: PluginStatus,
}

impl PluginRecord {
    pub fn is_loaded(&self) -> bool {
        self.status == PluginStatus::Loaded
    }
}

/// Summary of a record, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSummary {
    pub name: Option<String>,
    pub path: PathBuf,
    pub status: PluginStatus,
}

pub struct PluginLoader {
    settings: PluginSettings,
    records: Vec<PluginRecord>,
}

impl PluginLoader {
    pub fn new(settings: PluginSettings) -> Self {
        Self {
            settings,
            records: Vec::new(),
        }
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    /// Plugin files under the configured directory that pass the include and
    /// exclude lists, sorted by path. A missing directory yields no plugins.
    pub async fn scan(&self) -> Result<Vec<PathBuf>, PluginLoadError> {
        let dir = &self.settings.dir;
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Plugin directory {} does not exist", dir.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(PluginLoadError::Io {
                    path: dir.clone(),
                    source,
                });
            }
        };

        let mut found = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(PluginLoadError::Io {
                        path: dir.clone(),
                        source,
                    });
                }
            };
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file || !self.has_plugin_extension(&path) {
                continue;
            }
            let Some(name) = plugin_name(&path) else {
                continue;
            };
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if self.settings.allows_any(&[name.as_str(), stem]) {
                found.push(path);
            } else {
                log::debug!(
                    "Skipping plugin {} (filtered by includes/excludes)",
                    path.display()
                );
            }
        }
        found.sort();
        Ok(found)
    }

    fn has_plugin_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.settings.extension))
    }

    /// Fails with `AlreadyLoaded` if a live plugin was opened from `path`.
    pub fn ensure_unloaded(&self, path: &Path) -> Result<(), PluginLoadError> {
        if self.is_path_loaded(path) {
            return Err(PluginLoadError::AlreadyLoaded(path.to_path_buf()));
        }
        Ok(())
    }

    /// Record the outcome of [`PluginLibrary::construct`].
    ///
    /// On success the library is kept open under the descriptor's name. A
    /// failed construction is recorded as `Failed`.
    pub fn adopt(
        &mut self,
        plugin: PluginLibrary,
        constructed: Result<ModuleDescriptor, PluginLoadError>,
    ) -> Result<ModuleDescriptor, PluginLoadError> {
        let PluginLibrary { path, library, .. } = plugin;
        let descriptor = match constructed {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.record_failure(&path, library, &e.to_string());
                return Err(e);
            }
        };
        if self.is_path_loaded(&path) {
            drop(descriptor);
            close(library, &path);
            return Err(PluginLoadError::AlreadyLoaded(path));
        }

        self.records.retain(|r| r.path != path || r.is_loaded());
        log::info!(
            "Loaded plugin '{}' from {}",
            descriptor.name,
            path.display()
        );
        self.records.push(PluginRecord {
            name: Some(descriptor.name.clone()),
            path,
            library,
            status: PluginStatus::Loaded,
        });
        Ok(descriptor)
    }

    fn record_failure(&mut self, path: &Path, library: Option<Library>, reason: &str) {
        self.records.retain(|r| r.path != path || r.is_loaded());
        self.records.push(PluginRecord {
            name: None,
            path: path.to_path_buf(),
            library,
            status: PluginStatus::Failed(reason.to_string()),
        });
    }

    fn is_path_loaded(&self, path: &Path) -> bool {
        self.records
            .iter()
            .any(|r| r.is_loaded() && r.path == path)
    }

    fn loaded_at_mut(&mut self, path: &Path) -> Option<&mut PluginRecord> {
        self.records
            .iter_mut()
            .find(|r| r.is_loaded() && r.path == path)
    }

    fn record_mut(&mut self, name: &str) -> Option<&mut PluginRecord> {
        self.records
            .iter_mut()
            .find(|r| r.is_loaded() && r.name.as_deref() == Some(name))
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    /// Path a loaded plugin was opened from.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.records
            .iter()
            .find(|r| r.is_loaded() && r.name.as_deref() == Some(name))
            .map(|r| r.path.clone())
    }

    /// Mark a plugin unloaded and close its library.
    ///
    /// Every value created from the library must have been dropped beforehand.
    pub fn release(&mut self, name: &str) -> Result<PathBuf, PluginLoadError> {
        let record = self
            .record_mut(name)
            .ok_or_else(|| PluginLoadError::NotLoaded(name.to_string()))?;
        record.status = PluginStatus::Unloaded;
        close(record.library.take(), &record.path);
        Ok(record.path.clone())
    }

    /// Mark a plugin unloaded but keep its code mapped for the rest of the process.
    pub fn leak(&mut self, name: &str) -> Result<PathBuf, PluginLoadError> {
        let record = self
            .record_mut(name)
            .ok_or_else(|| PluginLoadError::NotLoaded(name.to_string()))?;
        record.status = PluginStatus::Retained;
        if let Some(library) = record.library.take() {
            std::mem::forget(library);
        }
        Ok(record.path.clone())
    }

    /// Forget a plugin whose descriptor was rejected after `adopt`.
    pub fn discard(&mut self, path: &Path, reason: &str) {
        let Some(record) = self.loaded_at_mut(path) else {
            return;
        };
        record.status = PluginStatus::Failed(reason.to_string());
        record.name = None;
        close(record.library.take(), path);
    }

    pub fn records(&self) -> Vec<PluginSummary> {
        self.records
            .iter()
            .map(|r| PluginSummary {
                name: r.name.clone(),
                path: r.path.clone(),
                status: r.status.clone(),
            })
            .collect()
    }
}

fn close(library: Option<Library>, path: &Path) {
    let Some(library) = library else {
        return;
    };
    if let Err(e) = library.close() {
        log::warn!("Closing plugin library {} failed: {}", path.display(), e);
    }
}

/// Plugin name derived from a library file name: the stem without a `lib` prefix.
pub fn plugin_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem
        .strip_prefix("lib")
        .filter(|s| !s.is_empty())
        .unwrap_or(stem);
    Some(name.replace('_', "-"))
}
