//! # Loom Kernel
//!
//! The `kernel` module is the lifecycle manager of the runtime. It owns the
//! module registry, the service catalog, the event bus and the router, and is
//! the single object modules interact with.
//!
//! ## Key Components:
//!
//! - **[`Kernel`](bootstrap::Kernel)**: start-up, service lookup and shutdown
//!   (`bootstrap`), plus plugin loading, activation, unload and reload (`plugins`).
//! - **[`ModuleContext`](context::ModuleContext)** and
//!   **[`KernelHandle`](context::KernelHandle)**: what a module receives at `init`.
//! - **[`ModuleState`](lifecycle::ModuleState)**: the per-module state machine.
//! - **Error Handling**: the aggregate [`Error`](error::Error) type and `Result` alias.
pub mod bootstrap;
pub mod constants;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod plugins;

pub use bootstrap::{Kernel, ModuleInfo, StartReport};
pub use context::{KernelHandle, ModuleContext};
pub use error::{Error, Result};
pub use lifecycle::{LifecyclePhase, ModuleState};
pub use plugins::LoadReport;

#[cfg(test)]
mod tests;
