/// Application name
pub const APP_NAME: &str = "Loom";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Symbol every dynamic plugin exports; see [`declare_module!`](crate::declare_module)
pub const MODULE_ENTRY_SYMBOL: &str = "_loom_module_entry";

/// Default plugins directory
pub const DEFAULT_PLUGINS_DIR: &str = "plugins";

/// Default bound on a single module's `init`/`post_init`
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;

/// Default time an unloading module gets to finish in-flight requests
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// How long cleanup waits for a module's background tasks to stop
pub const TASK_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

/// Owner of the management routes
pub const MANAGEMENT_OWNER: &str = "kernel.management";

/// Source of kernel-published events
pub const KERNEL_EVENT_SOURCE: &str = "kernel";

pub const EVENT_MODULE_RUNNING: &str = "kernel.module.running";
pub const EVENT_MODULE_FAILED: &str = "kernel.module.failed";
pub const EVENT_MODULE_UNLOADED: &str = "kernel.module.unloaded";
