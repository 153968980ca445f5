use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::module_system::traits::Module;
use crate::service::{AnyService, ServiceError, ServiceRef, ServiceSet, downcast_capability};

type WeakService = Weak<dyn Any + Send + Sync>;

struct Entry {
    instance: Weak<dyn Module>,
    primary: Option<WeakService>,
    capabilities: HashMap<TypeId, (&'static str, WeakService)>,
}

/// Index of `(module, capability) → service`.
///
/// Entries are weak: once the kernel drops a module's instance and
/// [`ServiceSet`], lookups through the catalog fail even if the entry has not
/// been removed yet.
#[derive(Default)]
pub struct ServiceCatalog {
    entries: HashMap<String, Entry>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&mut self, module: &str, instance: &Arc<dyn Module>, services: &ServiceSet) {
        let entry = Entry {
            instance: Arc::downgrade(instance),
            primary: services.primary.as_ref().map(|e| Arc::downgrade(&e.value)),
            capabilities: services
                .capabilities
                .iter()
                .map(|(id, e)| (*id, (e.type_name, Arc::downgrade(&e.value))))
                .collect(),
        };
        log::debug!(
            "Indexed services of '{}' (capabilities: {:?})",
            module,
            services.capability_names()
        );
        self.entries.insert(module.to_string(), entry);
    }

    pub fn remove(&mut self, module: &str) -> bool {
        self.entries.remove(module).is_some()
    }

    pub fn contains(&self, module: &str) -> bool {
        self.entries.contains_key(module)
    }

    pub fn lookup(&self, module: &str) -> Result<ServiceRef, ServiceError> {
        let entry = self
            .entries
            .get(module)
            .ok_or_else(|| ServiceError::NotFound(module.to_string()))?;
        let instance = entry
            .instance
            .upgrade()
            .ok_or_else(|| ServiceError::NotFound(module.to_string()))?;
        Ok(ServiceRef {
            module: module.to_string(),
            instance,
            service: entry.primary.as_ref().and_then(Weak::upgrade),
        })
    }

    /// Resolve capability `C` of `module`.
    pub fn capability<C>(&self, module: &str) -> Result<Arc<C>, ServiceError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let id = TypeId::of::<C>();
        let erased = self.capability_erased(module, id, type_name::<C>())?;
        downcast_capability::<C>(module, &erased)
    }

    pub(crate) fn capability_erased(
        &self,
        module: &str,
        id: TypeId,
        capability: &'static str,
    ) -> Result<AnyService, ServiceError> {
        let unsupported = || ServiceError::CapabilityNotSupported {
            module: module.to_string(),
            capability: capability.to_string(),
        };
        let (_, weak) = self
            .entries
            .get(module)
            .and_then(|e| e.capabilities.get(&id))
            .ok_or_else(unsupported)?;
        weak.upgrade().ok_or_else(unsupported)
    }

    /// Every indexed module providing capability `C`, sorted by module name.
    pub fn providers<C: ?Sized + Send + Sync + 'static>(&self) -> Vec<(String, Arc<C>)> {
        let mut found: Vec<(String, Arc<C>)> = self
            .entries
            .keys()
            .filter_map(|name| self.capability::<C>(name).ok().map(|c| (name.clone(), c)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub fn capability_names(&self, module: &str) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .entries
            .get(module)
            .map(|e| e.capabilities.values().map(|(n, _)| *n).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}
