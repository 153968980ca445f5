//! # Loom Configuration
//!
//! [`KernelConfig`] is the configuration object handed to the kernel. It carries
//! kernel tunables (`[kernel]`), plugin loader settings (`[plugins]`) and one
//! free-form subsection per module (`[modules.<name>]`), which modules receive
//! as a [`ModuleConfig`] during `init`.
//!
//! Files are read as JSON, TOML (`toml-config` feature) or YAML (`yaml-config`
//! feature); the format is picked from the file extension.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::kernel::constants::{
    DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_INIT_TIMEOUT_MS, DEFAULT_PLUGINS_DIR,
    TASK_SHUTDOWN_TIMEOUT_MS,
};
use crate::kernel::error::{Error, Result};

/// Supported configuration formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON format (.json)
    Json,
    /// YAML format (.yaml, .yml) - requires "yaml-config" feature
    #[cfg(feature = "yaml-config")]
    Yaml,
    /// TOML format (.toml) - requires "toml-config" feature
    #[cfg(feature = "toml-config")]
    Toml,
}

impl ConfigFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "json",
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => "yaml",
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => "toml",
        }
    }

    /// Determine format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "json" => Some(ConfigFormat::Json),
                #[cfg(feature = "yaml-config")]
                "yaml" | "yml" => Some(ConfigFormat::Yaml),
                #[cfg(feature = "toml-config")]
                "toml" => Some(ConfigFormat::Toml),
                _ => None,
            })
    }
}

/// What happens to in-flight requests when a module is unloaded or reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// Refuse new requests, wait for in-flight ones (up to `timeout`), then clean up.
    Drain { timeout: Duration },
    /// Clean up straight away; in-flight calls race against cleanup.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPolicyKind {
    #[default]
    Drain,
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Per-module bound on `init` and `post_init`
    pub init_timeout_ms: u64,
    pub reload_policy: ReloadPolicyKind,
    pub drain_timeout_ms: u64,
    /// How long cleanup waits for a module's background tasks to stop
    pub task_shutdown_timeout_ms: u64,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            reload_policy: ReloadPolicyKind::Drain,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            task_shutdown_timeout_ms: TASK_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Directory scanned for dynamic plugins
    pub dir: PathBuf,
    /// File extension of plugin libraries, without the dot
    pub extension: String,
    /// Allow-list of plugin names. Takes precedence over `excludes` when non-empty.
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Mount the management routes
    pub hot_reload: bool,
    /// Bearer token the management routes require
    pub admin_token: Option<String>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            extension: std::env::consts::DLL_EXTENSION.to_string(),
            includes: Vec::new(),
            excludes: Vec::new(),
            hot_reload: false,
            admin_token: None,
        }
    }
}

impl PluginSettings {
    /// Whether a plugin known under any of `names` (file stem, module name)
    /// passes the include/exclude lists.
    pub fn allows_any(&self, names: &[&str]) -> bool {
        let listed = |list: &[String]| list.iter().any(|n| names.contains(&n.as_str()));
        if !self.includes.is_empty() {
            return listed(&self.includes);
        }
        !listed(&self.excludes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub kernel: KernelSettings,
    pub plugins: PluginSettings,
    pub modules: HashMap<String, serde_json::Value>,
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a configuration file, picking the format from its extension.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let Some(format) = ConfigFormat::from_path(path) else {
            return Err(Error::config(Some(path.into()), "unsupported configuration format"));
        };
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(Some(path.to_path_buf()), e.to_string()))?;
        let config = match Self::parse(&data, format) {
            Ok(config) => config,
            Err(Error::Config { message, .. }) => {
                return Err(Error::config(Some(path.to_path_buf()), message));
            }
            Err(other) => return Err(other),
        };
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse configuration text in the given format.
    pub fn parse(data: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Json => serde_json::from_str(data)
                .map_err(|e| Error::config(None, format!("invalid JSON: {}", e))),
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => serde_yaml::from_str(data)
                .map_err(|e| Error::config(None, format!("invalid YAML: {}", e))),
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => toml::from_str(data)
                .map_err(|e| Error::config(None, format!("invalid TOML: {}", e))),
        }
    }

    /// Subsection for `name`. Missing subsections yield an empty config.
    pub fn module(&self, name: &str) -> ModuleConfig {
        ModuleConfig {
            values: self
                .modules
                .get(name)
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        }
    }

    pub fn set_module(&mut self, name: impl Into<String>, values: serde_json::Value) {
        self.modules.insert(name.into(), values);
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.kernel.init_timeout_ms)
    }

    pub fn task_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.kernel.task_shutdown_timeout_ms)
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        match self.kernel.reload_policy {
            ReloadPolicyKind::Drain => ReloadPolicy::Drain {
                timeout: Duration::from_millis(self.kernel.drain_timeout_ms),
            },
            ReloadPolicyKind::Immediate => ReloadPolicy::Immediate,
        }
    }
}

/// One module's configuration subsection.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    values: serde_json::Value,
}

impl ModuleConfig {
    pub fn empty() -> Self {
        Self {
            values: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Deserialize the whole subsection into a typed settings struct.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.values.clone())
            .map_err(|e| Error::config(None, format!("invalid module settings: {}", e)))
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.values
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests;
