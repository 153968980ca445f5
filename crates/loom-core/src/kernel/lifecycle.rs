use std::fmt;

use serde::Serialize;

use crate::kernel::error::{Error, Result};

/// Lifecycle state of a live module instance.
///
/// States only ever move forward along
/// `Created → PreInitialized → Initialized → PostInitialized → Running → Draining → Cleaned`.
/// `Failed` is terminal and can be entered from any state before `Cleaned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Created,
    PreInitialized,
    Initialized,
    PostInitialized,
    Running,
    Draining,
    Cleaned,
    Failed,
}

impl ModuleState {
    /// The state that directly follows this one, if any.
    pub fn next(self) -> Option<ModuleState> {
        match self {
            ModuleState::Created => Some(ModuleState::PreInitialized),
            ModuleState::PreInitialized => Some(ModuleState::Initialized),
            ModuleState::Initialized => Some(ModuleState::PostInitialized),
            ModuleState::PostInitialized => Some(ModuleState::Running),
            ModuleState::Running => Some(ModuleState::Draining),
            ModuleState::Draining => Some(ModuleState::Cleaned),
            ModuleState::Cleaned | ModuleState::Failed => None,
        }
    }

    pub fn can_transition_to(self, to: ModuleState) -> bool {
        if to == ModuleState::Failed {
            return !matches!(self, ModuleState::Cleaned | ModuleState::Failed);
        }
        self.next() == Some(to)
    }

    /// Services of a module are resolvable once it has completed PostInit and
    /// until it starts draining.
    pub fn is_ready(self) -> bool {
        matches!(self, ModuleState::PostInitialized | ModuleState::Running)
    }

    /// Whether `init` has run on the instance, so cleanup has something to release.
    pub fn has_initialized(self) -> bool {
        matches!(
            self,
            ModuleState::Initialized
                | ModuleState::PostInitialized
                | ModuleState::Running
                | ModuleState::Draining
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleState::Cleaned | ModuleState::Failed)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Created => "created",
            ModuleState::PreInitialized => "pre_initialized",
            ModuleState::Initialized => "initialized",
            ModuleState::PostInitialized => "post_initialized",
            ModuleState::Running => "running",
            ModuleState::Draining => "draining",
            ModuleState::Cleaned => "cleaned",
            ModuleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks the state of one module and rejects out-of-order transitions.
#[derive(Debug, Clone)]
pub struct StateMachine {
    module: String,
    state: ModuleState,
}

impl StateMachine {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            state: ModuleState::Created,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn advance(&mut self, to: ModuleState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                module: self.module.clone(),
                from: self.state,
                to,
            });
        }
        log::debug!("Module '{}': {} -> {}", self.module, self.state, to);
        self.state = to;
        Ok(())
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            log::debug!("Module '{}': {} -> failed", self.module, self.state);
            self.state = ModuleState::Failed;
        }
    }
}

/// The phase a lifecycle error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Resolve,
    Instantiate,
    PreInit,
    Init,
    PostInit,
    Running,
    PreCleanup,
    Cleanup,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Resolve => "Resolve",
            LifecyclePhase::Instantiate => "Instantiate",
            LifecyclePhase::PreInit => "PreInit",
            LifecyclePhase::Init => "Init",
            LifecyclePhase::PostInit => "PostInit",
            LifecyclePhase::Running => "Running",
            LifecyclePhase::PreCleanup => "PreCleanup",
            LifecyclePhase::Cleanup => "Cleanup",
        };
        f.write_str(s)
    }
}
