//! # Loom Services
//!
//! Modules export services through a [`ServiceSet`]: an optional primary
//! service object plus any number of *capabilities*, each registered under the
//! narrow trait object type it satisfies (`Arc<dyn Greeter>`, `Arc<dyn HealthCheck>`).
//! Callers look capabilities up by that trait type only, so they never need
//! the exporting module's concrete type.
//!
//! The kernel owns each module's `ServiceSet` for as long as the module is
//! alive. The [`ServiceCatalog`] indexes those sets through weak references
//! and never keeps a service alive by itself.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::module_system::traits::Module;

pub mod catalog;
pub mod health;

pub use catalog::ServiceCatalog;
pub use health::{HealthCheck, HealthStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Service '{0}' not found")]
    NotFound(String),

    #[error("Service '{module}' is not ready (state: {state})")]
    NotReady { module: String, state: String },

    #[error("Module '{module}' does not provide capability '{capability}'")]
    CapabilityNotSupported { module: String, capability: String },
}

pub(crate) type AnyService = Arc<dyn Any + Send + Sync>;

/// Recover capability `C` from its type-erased export.
pub(crate) fn downcast_capability<C>(
    module: &str,
    erased: &AnyService,
) -> Result<Arc<C>, ServiceError>
where
    C: ?Sized + Send + Sync + 'static,
{
    erased
        .downcast_ref::<Arc<C>>()
        .cloned()
        .ok_or_else(|| ServiceError::CapabilityNotSupported {
            module: module.to_string(),
            capability: std::any::type_name::<C>().to_string(),
        })
}

pub(crate) struct Export {
    pub(crate) type_name: &'static str,
    pub(crate) value: AnyService,
    /// Strong count of the exported `Arc`, read through a weak reference
    refs: Box<dyn Fn() -> usize + Send + Sync>,
}

/// Services a module exports. Owned by the kernel for the module's lifetime.
#[derive(Default)]
pub struct ServiceSet {
    pub(crate) primary: Option<Export>,
    pub(crate) capabilities: HashMap<TypeId, Export>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary service object, reachable through `get_service`.
    pub fn with_service<T>(mut self, service: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        let weak = Arc::downgrade(&service);
        self.primary = Some(Export {
            type_name: std::any::type_name::<T>(),
            value: service,
            refs: Box::new(move || weak.strong_count()),
        });
        self
    }

    /// Register `service` as satisfying capability `C`, usually a trait object type.
    pub fn provide<C>(mut self, service: Arc<C>) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&service);
        self.capabilities.insert(
            TypeId::of::<C>(),
            Export {
                type_name: std::any::type_name::<C>(),
                value: Arc::new(service),
                refs: Box::new(move || weak.strong_count()),
            },
        );
        self
    }

    pub fn primary<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.primary.as_ref()?.value.clone().downcast::<T>().ok()
    }

    pub fn capability<C: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        self.capabilities
            .get(&TypeId::of::<C>())?
            .value
            .downcast_ref::<Arc<C>>()
            .cloned()
    }

    pub fn capability_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.capabilities.values().map(|e| e.type_name).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.capabilities.is_empty()
    }

    /// References to exported services held outside this set.
    pub fn external_refs(&self) -> usize {
        self.primary
            .iter()
            .chain(self.capabilities.values())
            .map(|e| (e.refs)().saturating_sub(1))
            .sum()
    }
}

impl fmt::Debug for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSet")
            .field("primary", &self.primary.as_ref().map(|e| e.type_name))
            .field("capabilities", &self.capability_names())
            .finish()
    }
}

/// A resolved service: the live module instance plus its primary service, if any.
#[derive(Clone)]
pub struct ServiceRef {
    pub module: String,
    pub instance: Arc<dyn Module>,
    pub service: Option<AnyService>,
}

impl ServiceRef {
    /// The primary service as its concrete type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.service.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRef")
            .field("module", &self.module)
            .field("has_service", &self.service.is_some())
            .finish()
    }
}
