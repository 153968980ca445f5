use std::collections::HashMap;

use crate::module_system::descriptor::ModuleDescriptor;
use crate::module_system::error::RegistrationError;

/// Process-wide table of module descriptors, in registration order.
///
/// Names are unique across the whole registry regardless of group.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    order: Vec<String>,
    descriptors: HashMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Registering a name twice is always an error.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), RegistrationError> {
        if descriptor.name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if let Err(source) = semver::Version::parse(&descriptor.version) {
            return Err(RegistrationError::InvalidVersion {
                name: descriptor.name.clone(),
                version: descriptor.version.clone(),
                source,
            });
        }
        if self.descriptors.contains_key(&descriptor.name) {
            return Err(RegistrationError::DuplicateName(descriptor.name.clone()));
        }

        log::debug!(
            "Registered module '{}' v{} (strong: {:?}, weak: {:?})",
            descriptor.name,
            descriptor.version,
            descriptor.strong,
            descriptor.weak
        );
        self.order.push(descriptor.name.clone());
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Register a descriptor under `group`, adding extra weak edges.
    pub fn register_to_group_with_weak_deps<I, S>(
        &mut self,
        descriptor: ModuleDescriptor,
        group: impl Into<String>,
        weak: I,
    ) -> Result<(), RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut descriptor = descriptor.group(group);
        for dep in weak {
            let dep = dep.into();
            if !descriptor.weak.contains(&dep) {
                descriptor.weak.push(dep);
            }
        }
        self.register(descriptor)
    }

    pub fn deregister(&mut self, name: &str) -> Option<ModuleDescriptor> {
        let removed = self.descriptors.remove(name)?;
        self.order.retain(|n| n != name);
        Some(removed)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.descriptors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Descriptors, in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.descriptors.get(name))
    }

    /// Names of modules with a strong dependency on `name`, in registration order.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.descriptors()
            .filter(|d| d.strong.iter().any(|dep| dep == name))
            .map(|d| d.name.clone())
            .collect()
    }
}
