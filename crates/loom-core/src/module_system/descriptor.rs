use std::fmt;
use std::sync::Arc;

use crate::module_system::boundary::UnwindBoundary;
use crate::module_system::traits::{Module, ModuleKind};

/// Builds a fresh module instance. Called once per start and once per reload.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

/// Registration record for a module: identity, dependency edges and factory.
///
/// Descriptors are what the registry stores; instances only exist once the
/// kernel runs the factory.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub kind: ModuleKind,
    pub group: Option<String>,
    pub strong: Vec<String>,
    pub weak: Vec<String>,
    pub factory: ModuleFactory,
}

impl ModuleDescriptor {
    pub fn new<F>(name: impl Into<String>, version: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            kind: ModuleKind::Module,
            group: None,
            strong: Vec::new(),
            weak: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Descriptor for a `Default`-constructible module. Identity and dependency
    /// edges are read from a sample instance, which is then dropped.
    pub fn of<M>() -> Self
    where
        M: Module + Default + 'static,
    {
        let sample = M::default();
        let mut desc = Self::new(sample.name(), sample.version(), || {
            Arc::new(M::default()) as Arc<dyn Module>
        });
        desc.description = sample.metadata().description;
        for dep in sample.dependencies() {
            if dep.is_strong() {
                desc.strong.push(dep.module);
            } else {
                desc.weak.push(dep.module);
            }
        }
        desc
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn kind(mut self, kind: ModuleKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn depends_on(mut self, module: impl Into<String>) -> Self {
        self.strong.push(module.into());
        self
    }

    pub fn weak_dependency(mut self, module: impl Into<String>) -> Self {
        self.weak.push(module.into());
        self
    }

    /// Run every instance behind an [`UnwindBoundary`]. Descriptors exported
    /// with [`declare_module!`](crate::declare_module) are isolated already.
    pub fn isolated(mut self) -> Self {
        let name = self.name.clone();
        let factory = self.factory.clone();
        self.factory = Arc::new(move || UnwindBoundary::instantiate(&name, &factory));
        self
    }

    pub fn instantiate(&self) -> Arc<dyn Module> {
        (self.factory)()
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("kind", &self.kind)
            .field("group", &self.group)
            .field("strong", &self.strong)
            .field("weak", &self.weak)
            .finish_non_exhaustive()
    }
}
