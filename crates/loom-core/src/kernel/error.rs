//! # Loom Kernel Errors
//!
//! Defines the top-level [`Error`] type of the runtime.
//!
//! Each subsystem owns a typed error enum (registration, dependency resolution,
//! plugin loading, service lookup, discovery). The kernel aggregates them here
//! through `#[from]` conversions so module hooks and kernel operations share a
//! single `Result` alias.
use std::path::PathBuf;
use std::result::Result as StdResult;

use thiserror::Error as ThisError;

use crate::discovery::DiscoveryError;
use crate::kernel::lifecycle::{LifecyclePhase, ModuleState};
use crate::module_system::dependency::DependencyError;
use crate::module_system::error::{PluginLoadError, RegistrationError};
use crate::service::ServiceError;

/// Runtime error type shared by the kernel and every module hook.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A descriptor could not be registered.
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Dependency resolution failed (cycles, missing strong dependencies).
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// A module failed one of its start-up phases. Fatal to the module and
    /// to every module with a strong dependency on it.
    #[error("Initialization of module '{module}' failed during {phase}: {message}")]
    Init {
        module: String,
        phase: LifecyclePhase,
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Service or capability lookup failed.
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Dynamic plugin loading, unloading or reloading failed.
    #[error("Plugin error: {0}")]
    PluginLoad(#[from] PluginLoadError),

    /// A module reported an error while cleaning up. Only ever logged.
    #[error("Cleanup of module '{module}' failed: {message}")]
    Cleanup { module: String, message: String },

    /// The external service registry rejected or could not be reached.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Configuration could not be read or parsed.
    #[error("Configuration error for '{}': {message}", source_name(path))]
    Config {
        path: Option<PathBuf>,
        message: String,
    },

    /// A module was asked to move to a state that is not the next one.
    #[error("Module '{module}' cannot move from {from} to {to}")]
    InvalidTransition {
        module: String,
        from: ModuleState,
        to: ModuleState,
    },

    /// Two modules tried to mount the same route.
    #[error("Route {method} {path} is already mounted by '{owner}'")]
    RouteConflict {
        method: String,
        path: String,
        owner: String,
    },

    /// `Kernel::start` was called twice.
    #[error("Kernel already started")]
    AlreadyStarted,

    /// A module handle outlived the kernel that issued it.
    #[error("Kernel is no longer available")]
    KernelUnavailable,

    /// Generic error with message
    #[error("Error: {0}")]
    Other(String),
}

/// Shorthand for Result with our Error type
pub type Result<T> = StdResult<T, Error>;

impl Error {
    /// Builds an [`Error::Init`] for `module` in `phase`.
    pub fn init(
        module: impl Into<String>,
        phase: LifecyclePhase,
        message: impl Into<String>,
    ) -> Self {
        Error::Init {
            module: module.into(),
            phase,
            message: message.into(),
            source: None,
        }
    }

    /// Builds an [`Error::Init`] wrapping the error that caused it.
    pub fn init_caused_by(module: impl Into<String>, phase: LifecyclePhase, source: Error) -> Self {
        Error::Init {
            module: module.into(),
            phase,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Error::Config {
            path,
            message: message.into(),
        }
    }

    /// Whether this is an [`Error::Init`].
    pub fn is_init_error(&self) -> bool {
        matches!(self, Error::Init { .. })
    }
}

fn source_name(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<inline>".to_string(),
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}
