//! Command implementations behind `main`.
use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;

use core_health::HealthModule;
use loom_core::http::Method;
use loom_core::kernel::error::Result;
use loom_core::module_system::PluginLoader;
use loom_core::{Kernel, KernelConfig, ModuleDescriptor, RouteRequest, StartReport};
use log::{info, warn};

/// Read the configuration file, or fall back to defaults.
pub async fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            KernelConfig::load(path).await
        }
        None => Ok(KernelConfig::default()),
    }
}

/// Build a kernel with the built-in modules registered and every plugin in
/// the plugins directory loaded. Nothing is started yet.
pub async fn assemble(config: KernelConfig) -> Result<Kernel> {
    let kernel = Kernel::new(config);

    // Built-ins, in registration order
    let health = ModuleDescriptor::of::<HealthModule>();
    kernel.register(health).await?;
    println!("  - Registered: core-health");

    let report = kernel.load_plugins_from_dir().await?;
    for name in &report.loaded {
        println!("  - Loaded plugin: {}", name);
    }
    for (path, err) in &report.failed {
        eprintln!("  - Failed plugin {}: {}", path.display(), err);
    }
    Ok(kernel)
}

pub async fn start(kernel: &Kernel) -> Result<StartReport> {
    let report = kernel.start().await?;
    println!("Running modules: {}", report.running.join(", "));
    for (name, err) in &report.failed {
        eprintln!("Module '{}' did not start: {}", name, err);
    }
    Ok(report)
}

pub async fn run(kernel: &Kernel, once: bool) -> Result<ExitCode> {
    let report = start(kernel).await?;
    if !once {
        println!("Press Ctrl-C to stop.");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
        }
    }
    Ok(if report.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

pub async fn order(kernel: &Kernel) -> Result<ExitCode> {
    let order = kernel.build_order().await?;
    for (i, name) in order.iter().enumerate() {
        println!("{:>3}. {}", i + 1, name);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn modules(kernel: &Kernel) -> Result<ExitCode> {
    for info in kernel.modules().await {
        let mut line = format!("{} {} ({})", info.name, info.version, info.kind);
        if !info.strong.is_empty() {
            line.push_str(&format!(" requires [{}]", info.strong.join(", ")));
        }
        if !info.weak.is_empty() {
            line.push_str(&format!(" uses [{}]", info.weak.join(", ")));
        }
        println!("{}", line);
    }
    Ok(ExitCode::SUCCESS)
}

/// List plugin files without loading them.
pub async fn scan(config: &KernelConfig) -> Result<ExitCode> {
    let loader = PluginLoader::new(config.plugins.clone());
    let found = loader.scan().await?;
    if found.is_empty() {
        println!("No plugins found in {}", config.plugins.dir.display());
    }
    for path in found {
        println!("{}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

/// Start the kernel, dispatch one request and print the response.
pub async fn call(
    kernel: &Kernel,
    method: &str,
    path: &str,
    body: Option<&str>,
    token: Option<&str>,
) -> Result<ExitCode> {
    let method = Method::from_str(&method.to_uppercase())
        .map_err(|e| loom_core::KernelError::from(format!("invalid method '{}': {}", method, e)))?;
    let mut req = RouteRequest::new(method, path);
    if let Some(body) = body {
        let body = serde_json::from_str(body)
            .map_err(|e| loom_core::KernelError::from(format!("request body is not JSON: {}", e)))?;
        req = req.with_body(body);
    }
    if let Some(token) = token {
        req = req.with_bearer(token);
    }

    start(kernel).await?;
    let resp = kernel.dispatch(req).await;
    println!("{}", resp.status);
    match serde_json::to_string_pretty(&resp.body) {
        Ok(text) => println!("{}", text),
        Err(e) => warn!("Could not render response body: {}", e),
    }
    Ok(if resp.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
