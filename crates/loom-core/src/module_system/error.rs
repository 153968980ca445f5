//! # Loom Module System Errors
//!
//! Error types raised while registering descriptors ([`RegistrationError`]) and
//! while loading, unloading or reloading dynamic plugins ([`PluginLoadError`]).
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Module '{0}' is already registered")]
    DuplicateName(String),

    #[error("Module name must not be empty")]
    EmptyName,

    #[error("Module '{name}' has an invalid version '{version}': {source}")]
    InvalidVersion {
        name: String,
        version: String,
        #[source]
        source: semver::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    #[error("Symbol '{symbol}' not found in '{path}': {message}")]
    SymbolNotFound {
        path: PathBuf,
        symbol: String,
        message: String,
    },

    #[error("Plugin at '{0}' is already loaded")]
    AlreadyLoaded(PathBuf),

    #[error("Failed to open library '{path}': {message}")]
    Library { path: PathBuf, message: String },

    #[error("Entry point of '{0}' panicked")]
    EntryPanicked(PathBuf),

    #[error("Entry point of '{0}' returned a null descriptor")]
    NullDescriptor(PathBuf),

    #[error("Plugin '{0}' is not loaded")]
    NotLoaded(String),

    #[error("Plugin '{name}' is still required by: {}", .dependents.join(", "))]
    InUse {
        name: String,
        dependents: Vec<String>,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin descriptor rejected: {0}")]
    Registration(#[from] RegistrationError),
}
