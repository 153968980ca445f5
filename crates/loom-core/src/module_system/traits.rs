use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::discovery::ServiceInfo;
use crate::kernel::context::ModuleContext;
use crate::kernel::error::Result;
use crate::module_system::dependency::ModuleDependency;
use crate::router::RouteGroup;
use crate::service::ServiceSet;

/// What kind of unit a module is. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    #[default]
    Module,
    Plugin,
    Business,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Module => write!(f, "module"),
            ModuleKind::Plugin => write!(f, "plugin"),
            ModuleKind::Business => write!(f, "business"),
        }
    }
}

/// Free-form descriptive data a module reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Core trait every module and plugin implements.
///
/// The kernel calls the hooks in a fixed order:
/// `pre_init → init → post_init → register_routes → (running) → pre_cleanup → cleanup`.
/// No hook is ever called while the kernel holds one of its internal locks, so
/// a hook may freely call back into the kernel through its [`ModuleContext`].
#[async_trait]
pub trait Module: Send + Sync {
    /// Globally unique name of the module
    fn name(&self) -> &str;

    /// Semantic version of the module
    fn version(&self) -> &str;

    /// Strong and weak dependencies
    fn dependencies(&self) -> Vec<ModuleDependency> {
        Vec::new()
    }

    /// Cheap validation before any module is initialized. Failure excludes only this module.
    async fn pre_init(&self) -> Result<()> {
        Ok(())
    }

    /// Acquire resources. Strong dependencies have completed `init` already.
    async fn init(&self, ctx: &ModuleContext) -> Result<()>;

    /// Runs once every surviving module has completed `init`.
    async fn post_init(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    fn register_routes(&self, _routes: &mut RouteGroup) {}

    /// Services exported to other modules. Called once, after a successful `post_init`.
    fn services(&self) -> ServiceSet {
        ServiceSet::new()
    }

    /// Stop accepting new work. Background tasks should be stopping by the time this returns.
    async fn pre_cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources. Must tolerate being called more than once.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata::default()
    }

    fn needs_service_discovery(&self) -> bool {
        false
    }

    fn service_info(&self) -> Option<ServiceInfo> {
        None
    }
}
