//! # Loom Core
//!
//! Module runtime: independently compiled modules declare dependencies on one
//! another, are initialized in a safe order, expose services and routes, talk
//! over an in-process event bus, and can be loaded, unloaded or hot-reloaded
//! without restarting the host process.
pub mod config;
pub mod discovery;
pub mod event;
pub mod kernel;
pub mod management;
pub mod module_system;
pub mod router;
pub mod service;

pub use config::{KernelConfig, ModuleConfig, ReloadPolicy};
pub use discovery::{DiscoveryPublisher, InMemoryServiceRegistry, ServiceInfo, ServiceRegistry};
pub use event::{Event, EventBus, EventHandler};
pub use kernel::error::Error as KernelError;
pub use kernel::{Kernel, KernelHandle, ModuleContext, ModuleInfo, ModuleState, StartReport};
pub use module_system::{Module, ModuleDependency, ModuleDescriptor, ModuleKind, ModuleMetadata};
pub use router::{RouteGroup, RouteRequest, RouteResponse, Router};
pub use service::{HealthCheck, HealthStatus, ServiceError, ServiceRef, ServiceSet};

// Plugin crates use these through `declare_module!` and `#[async_trait]`.
pub use async_trait::async_trait;
pub use http;
pub use serde_json;
