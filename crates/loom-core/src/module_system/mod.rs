//! # Loom Module System
//!
//! Everything that describes modules before they are alive:
//!
//! - **[`traits`]**: the [`Module`] contract every module and plugin implements.
//! - **[`descriptor`]**: [`ModuleDescriptor`], the registration record holding a
//!   module's identity, dependency edges and factory.
//! - **[`registry`]**: [`ModuleRegistry`], the name-unique table of descriptors.
//! - **[`dependency`]**: dependency edges and the [`DependencyResolver`] that turns
//!   the registry into a deterministic initialization order.
//! - **[`loader`]**: [`PluginLoader`], which discovers plugin libraries and turns
//!   their exported constructor into a descriptor.
//! - **[`boundary`]**: [`UnwindBoundary`], which keeps panics raised in plugin
//!   code on the plugin's side.
//! - **[`error`]**: registration and plugin loading errors.
pub mod boundary;
pub mod dependency;
pub mod descriptor;
pub mod error;
pub mod loader;
pub mod registry;
pub mod traits;

pub use boundary::{HostLink, UnwindBoundary};
pub use dependency::{
    DependencyError, DependencyKind, DependencyResolver, ModuleDependency, Resolution,
};
pub use descriptor::{ModuleDescriptor, ModuleFactory};
pub use error::{PluginLoadError, RegistrationError};
pub use loader::{PluginLibrary, PluginLoader, PluginStatus, PluginSummary};
pub use registry::ModuleRegistry;
pub use traits::{Module, ModuleKind, ModuleMetadata};

#[cfg(test)]
mod tests;
