use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::module_system::descriptor::ModuleDescriptor;
use crate::module_system::registry::ModuleRegistry;

/// Whether a dependency is mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Absence or failure of the target is fatal to the dependent.
    Strong,
    /// The target is scheduled first when present; absence only degrades the dependent.
    Weak,
}

/// A dependency edge declared by a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModuleDependency {
    /// Name of the module depended upon
    pub module: String,
    pub kind: DependencyKind,
}

impl ModuleDependency {
    pub fn strong(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            kind: DependencyKind::Strong,
        }
    }

    pub fn weak(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            kind: DependencyKind::Weak,
        }
    }

    pub fn is_strong(&self) -> bool {
        self.kind == DependencyKind::Strong
    }
}

impl fmt::Display for ModuleDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DependencyKind::Strong => write!(f, "requires {}", self.module),
            DependencyKind::Weak => write!(f, "optionally uses {}", self.module),
        }
    }
}

/// Error that can occur when resolving dependencies
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// Every module on a strong cycle, in registration order
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// A strong dependency is not registered
    #[error("Module '{module}' requires '{dependency}', which is not registered")]
    MissingDependency { module: String, dependency: String },

    /// A strong dependency is registered but cannot be initialized
    #[error("Module '{module}' requires '{dependency}', which cannot be initialized")]
    DependencyFailed { module: String, dependency: String },
}

impl DependencyError {
    pub fn is_cycle(&self) -> bool {
        matches!(self, DependencyError::CyclicDependency(_))
    }
}

/// Outcome of a full resolution pass.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Initialization order of every module that can start
    pub order: Vec<String>,
    /// Modules that cannot start, in registration order, with the reason
    pub excluded: Vec<(String, DependencyError)>,
}

impl Resolution {
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|(n, _)| n == name)
    }

    /// First cycle found, if any.
    pub fn cycle(&self) -> Option<&DependencyError> {
        self.excluded.iter().map(|(_, e)| e).find(|e| e.is_cycle())
    }
}

/// Computes a deterministic initialization order from a registry snapshot.
///
/// Ordering is a Kahn topological sort over strong edges. Ties between ready
/// modules are broken by registration order, except that a ready module whose
/// present weak dependencies are already scheduled is preferred over one whose
/// weak dependencies are not.
pub struct DependencyResolver<'a> {
    nodes: Vec<&'a ModuleDescriptor>,
    index: HashMap<&'a str, usize>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(registry: &'a ModuleRegistry) -> Self {
        let nodes: Vec<&ModuleDescriptor> = registry.descriptors().collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.as_str(), i))
            .collect();
        Self { nodes, index }
    }

    /// Topological order over strong edges.
    ///
    /// Modules with missing strong dependencies are left out of the order but
    /// do not fail it. A strong cycle does.
    pub fn build_order(&self) -> Result<Vec<String>, DependencyError> {
        let resolution = self.resolve();
        if let Some(cycle) = resolution.cycle() {
            return Err(cycle.clone());
        }
        Ok(resolution.order)
    }

    pub fn resolve(&self) -> Resolution {
        let n = self.nodes.len();
        let strong: Vec<Vec<usize>> = (0..n).map(|i| self.edges(i, true)).collect();
        let weak: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                let s: HashSet<usize> = strong[i].iter().copied().collect();
                self.edges(i, false)
                    .into_iter()
                    .filter(|w| !s.contains(w))
                    .collect()
            })
            .collect();

        let mut excluded: HashMap<usize, DependencyError> = HashMap::new();

        for (i, desc) in self.nodes.iter().enumerate() {
            if let Some(missing) = desc
                .strong
                .iter()
                .find(|dep| !self.index.contains_key(dep.as_str()))
            {
                excluded.insert(
                    i,
                    DependencyError::MissingDependency {
                        module: desc.name.clone(),
                        dependency: missing.clone(),
                    },
                );
            }
        }
        self.propagate_failures(&strong, &mut excluded);

        // Kahn over the surviving nodes.
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in (0..n).filter(|i| !excluded.contains_key(i)) {
            for &dep in &strong[i] {
                in_degree[i] += 1;
                dependents[dep].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n)
            .filter(|i| !excluded.contains_key(i) && in_degree[*i] == 0)
            .collect();
        let mut scheduled = vec![false; n];
        let mut order = Vec::with_capacity(n);

        while !ready.is_empty() {
            let pick = ready
                .iter()
                .copied()
                .find(|&i| {
                    weak[i]
                        .iter()
                        .all(|&w| scheduled[w] || excluded.contains_key(&w))
                })
                .or_else(|| ready.iter().next().copied());
            let Some(i) = pick else {
                break;
            };
            ready.remove(&i);
            scheduled[i] = true;
            order.push(self.nodes[i].name.clone());
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 && !excluded.contains_key(&d) {
                    ready.insert(d);
                }
            }
        }

        let leftovers: Vec<usize> = (0..n)
            .filter(|i| !scheduled[*i] && !excluded.contains_key(i))
            .collect();
        if !leftovers.is_empty() {
            self.classify_leftovers(&leftovers, &strong, &mut excluded);
        }

        let mut excluded: Vec<(usize, DependencyError)> = excluded.into_iter().collect();
        excluded.sort_by_key(|(i, _)| *i);
        let excluded = excluded
            .into_iter()
            .map(|(i, e)| (self.nodes[i].name.clone(), e))
            .collect::<Vec<_>>();

        for (name, err) in &excluded {
            log::warn!("Module '{}' excluded from start-up: {}", name, err);
        }

        Resolution { order, excluded }
    }

    /// Indices of registered targets of `node`'s strong or weak edges, deduplicated,
    /// in declaration order.
    fn edges(&self, node: usize, strong: bool) -> Vec<usize> {
        let desc = self.nodes[node];
        let names = if strong { &desc.strong } else { &desc.weak };
        let mut seen = HashSet::new();
        names
            .iter()
            .filter_map(|name| self.index.get(name.as_str()).copied())
            .filter(|&t| (strong || t != node) && seen.insert(t))
            .collect()
    }

    fn propagate_failures(
        &self,
        strong: &[Vec<usize>],
        excluded: &mut HashMap<usize, DependencyError>,
    ) {
        loop {
            let mut changed = false;
            for i in 0..self.nodes.len() {
                if excluded.contains_key(&i) {
                    continue;
                }
                if let Some(&dep) = strong[i].iter().find(|d| excluded.contains_key(d)) {
                    excluded.insert(
                        i,
                        DependencyError::DependencyFailed {
                            module: self.nodes[i].name.clone(),
                            dependency: self.nodes[dep].name.clone(),
                        },
                    );
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Nodes Kahn could not schedule are either on a strong cycle or depend on one.
    fn classify_leftovers(
        &self,
        leftovers: &[usize],
        strong: &[Vec<usize>],
        excluded: &mut HashMap<usize, DependencyError>,
    ) {
        let members: HashSet<usize> = leftovers.iter().copied().collect();
        let mut tarjan = Tarjan::new(self.nodes.len());
        for &v in leftovers {
            if tarjan.index[v].is_none() {
                tarjan.connect(v, strong, &members);
            }
        }

        for mut scc in tarjan.components {
            let self_loop = scc.len() == 1 && strong[scc[0]].contains(&scc[0]);
            if scc.len() > 1 || self_loop {
                scc.sort_unstable();
                let names: Vec<String> = scc.iter().map(|&i| self.nodes[i].name.clone()).collect();
                for &i in &scc {
                    excluded.insert(i, DependencyError::CyclicDependency(names.clone()));
                }
            }
        }

        for &i in leftovers {
            if excluded.contains_key(&i) {
                continue;
            }
            let blocker = strong[i]
                .iter()
                .copied()
                .find(|d| members.contains(d))
                .unwrap_or(i);
            excluded.insert(
                i,
                DependencyError::DependencyFailed {
                    module: self.nodes[i].name.clone(),
                    dependency: self.nodes[blocker].name.clone(),
                },
            );
        }
    }
}

struct Tarjan {
    next: usize,
    index: Vec<Option<usize>>,
    low: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl Tarjan {
    fn new(n: usize) -> Self {
        Self {
            next: 0,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn connect(&mut self, v: usize, edges: &[Vec<usize>], members: &HashSet<usize>) {
        self.index[v] = Some(self.next);
        self.low[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &w in edges[v].iter().filter(|w| members.contains(w)) {
            match self.index[w] {
                None => {
                    self.connect(w, edges, members);
                    self.low[v] = self.low[v].min(self.low[w]);
                }
                Some(idx) if self.on_stack[w] => {
                    self.low[v] = self.low[v].min(idx);
                }
                Some(_) => {}
            }
        }

        if Some(self.low[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
