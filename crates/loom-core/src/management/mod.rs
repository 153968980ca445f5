//! # Management Surface
//!
//! Authenticated routes for hot reload, mounted under `/admin` when
//! `plugins.hot_reload` is enabled and an `admin_token` is configured:
//!
//! | Method | Path | Action |
//! |---|---|---|
//! | `GET` | `/admin/plugins` | list modules and plugin libraries |
//! | `POST` | `/admin/plugins/load` | load and activate a plugin, body `{"path": ...}` or `{"name": ...}` |
//! | `POST` | `/admin/plugins/{name}/unload` | unload a module |
//! | `POST` | `/admin/plugins/{name}/reload` | reload a module |
//!
//! Callers authenticate with `Authorization: Bearer <admin_token>`. Every
//! operation is synchronous and answers with a [`ManagementResponse`] naming
//! the module and, on failure, the cause.
use std::path::{Path, PathBuf};

use http::StatusCode;
use serde::Serialize;

use crate::kernel::bootstrap::{Kernel, ModuleInfo};
use crate::kernel::constants::MANAGEMENT_OWNER;
use crate::kernel::context::KernelHandle;
use crate::kernel::error::{Error, Result};
use crate::module_system::error::PluginLoadError;
use crate::module_system::loader::{PluginStatus, plugin_name};
use crate::router::{RouteGroup, RouteRequest, RouteResponse};
use crate::service::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginView {
    pub name: Option<String>,
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagementResponse {
    pub ok: bool,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<ModuleInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<PluginView>>,
}

impl ManagementResponse {
    fn success(action: &str, module: Option<String>) -> Self {
        Self {
            ok: true,
            action: action.to_string(),
            module,
            ..Self::default()
        }
    }

    fn failure(action: &str, module: Option<String>, error: impl ToString) -> Self {
        Self {
            ok: false,
            action: action.to_string(),
            module,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    fn into_response(self, status: StatusCode) -> RouteResponse {
        match serde_json::to_value(&self) {
            Ok(body) => RouteResponse::new(status, body),
            Err(e) => RouteResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    }
}

/// Mount the management routes on `kernel`'s router, if configured.
pub async fn mount(kernel: &Kernel) -> Result<()> {
    let token = match kernel.config().plugins.admin_token.as_deref() {
        Some(token) if !token.trim().is_empty() => token.to_string(),
        _ => {
            log::warn!("No admin_token is set; management routes not mounted");
            return Ok(());
        }
    };
    let count = kernel.router().mount(routes(kernel.handle(), token)).await?;
    log::info!("Mounted {} management route(s) under /admin", count);
    Ok(())
}

/// The management route group, bound to `kernel` and guarded by `token`.
pub fn routes(kernel: KernelHandle, token: String) -> RouteGroup {
    let mut group = RouteGroup::with_prefix(MANAGEMENT_OWNER, "/admin");

    let (k, t) = (kernel.clone(), token.clone());
    group.get("/plugins", move |req: RouteRequest| {
        let (k, t) = (k.clone(), t.clone());
        async move {
            if let Some(denied) = authorize(&req, &t, "list") {
                return denied;
            }
            match k.upgrade() {
                Ok(kernel) => list(&kernel).await,
                Err(e) => reject("list", None, e, StatusCode::SERVICE_UNAVAILABLE),
            }
        }
    });

    let (k, t) = (kernel.clone(), token.clone());
    group.post("/plugins/load", move |req: RouteRequest| {
        let (k, t) = (k.clone(), t.clone());
        async move {
            if let Some(denied) = authorize(&req, &t, "load") {
                return denied;
            }
            let kernel = match k.upgrade() {
                Ok(kernel) => kernel,
                Err(e) => return reject("load", None, e, StatusCode::SERVICE_UNAVAILABLE),
            };
            load(&kernel, &req).await
        }
    });

    let (k, t) = (kernel.clone(), token.clone());
    group.post("/plugins/{name}/unload", move |req: RouteRequest| {
        let (k, t) = (k.clone(), t.clone());
        async move {
            if let Some(denied) = authorize(&req, &t, "unload") {
                return denied;
            }
            let name = req.param("name").unwrap_or_default().to_string();
            let outcome = match k.upgrade() {
                Ok(kernel) => kernel.unload(&name).await,
                Err(e) => Err(e),
            };
            respond("unload", name, outcome)
        }
    });

    let (k, t) = (kernel, token);
    group.post("/plugins/{name}/reload", move |req: RouteRequest| {
        let (k, t) = (k.clone(), t.clone());
        async move {
            if let Some(denied) = authorize(&req, &t, "reload") {
                return denied;
            }
            let name = req.param("name").unwrap_or_default().to_string();
            let outcome = match k.upgrade() {
                Ok(kernel) => kernel.reload(&name).await,
                Err(e) => Err(e),
            };
            respond("reload", name, outcome)
        }
    });

    group
}

fn authorize(req: &RouteRequest, token: &str, action: &str) -> Option<RouteResponse> {
    if req.bearer_token() == Some(token) {
        return None;
    }
    log::warn!(
        "Rejected unauthenticated management request: {} {}",
        req.method,
        req.path
    );
    Some(reject(action, None, "unauthorized", StatusCode::UNAUTHORIZED))
}

fn reject(
    action: &str,
    module: Option<String>,
    error: impl ToString,
    status: StatusCode,
) -> RouteResponse {
    ManagementResponse::failure(action, module, error).into_response(status)
}

fn body_str<'a>(req: &'a RouteRequest, key: &str) -> Option<&'a str> {
    req.body.get(key).and_then(|v| v.as_str())
}

async fn list(kernel: &Kernel) -> RouteResponse {
    let plugins = kernel
        .plugins()
        .await
        .into_iter()
        .map(|p| PluginView {
            name: p.name,
            path: p.path.display().to_string(),
            status: match p.status {
                PluginStatus::Loaded => "loaded".to_string(),
                PluginStatus::Unloaded => "unloaded".to_string(),
                PluginStatus::Retained => "retained".to_string(),
                PluginStatus::Failed(reason) => format!("failed: {}", reason),
            },
        })
        .collect();
    let mut response = ManagementResponse::success("list", None);
    response.modules = Some(kernel.modules().await);
    response.plugins = Some(plugins);
    response.into_response(StatusCode::OK)
}

async fn load(kernel: &Kernel, req: &RouteRequest) -> RouteResponse {
    let requested_name = body_str(req, "name").map(str::to_string);
    let path = match body_str(req, "path") {
        Some(path) => Some(PathBuf::from(path)),
        None => match &requested_name {
            Some(name) => find_plugin(kernel, name).await,
            None => {
                let err = "body must contain \"path\" or \"name\"";
                return reject("load", None, err, StatusCode::BAD_REQUEST);
            }
        },
    };
    let Some(path) = path else {
        let name = requested_name.unwrap_or_default();
        let dir = kernel.config().plugins.dir.display();
        let err = format!("no plugin named '{}' in {}", name, dir);
        return reject("load", Some(name), err, StatusCode::NOT_FOUND);
    };

    match kernel.load_plugin(&path).await {
        Ok(name) => {
            let outcome = kernel.activate(&name).await;
            respond("load", name, outcome)
        }
        Err(e) => {
            let shown = requested_name.unwrap_or_else(|| path.display().to_string());
            respond("load", shown, Err(e))
        }
    }
}

async fn find_plugin(kernel: &Kernel, name: &str) -> Option<PathBuf> {
    let loader = kernel.inner.loader.lock().await;
    match loader.scan().await {
        Ok(paths) => paths.into_iter().find(|p| provides(p, name)),
        Err(e) => {
            log::warn!("Plugin directory scan failed: {}", e);
            None
        }
    }
}

fn provides(path: &Path, name: &str) -> bool {
    plugin_name(path).as_deref() == Some(name)
}

fn respond(action: &str, module: String, outcome: Result<()>) -> RouteResponse {
    match outcome {
        Ok(()) => {
            log::info!("Management {} of '{}' succeeded", action, module);
            ManagementResponse::success(action, Some(module)).into_response(StatusCode::OK)
        }
        Err(e) => {
            log::error!("Management {} of '{}' failed: {}", action, module, e);
            let status = status_for(&e);
            ManagementResponse::failure(action, Some(module), e).into_response(status)
        }
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::PluginLoad(PluginLoadError::NotLoaded(_))
        | Error::Service(ServiceError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::PluginLoad(PluginLoadError::InUse { .. }) => StatusCode::CONFLICT,
        Error::PluginLoad(PluginLoadError::AlreadyLoaded(_)) => StatusCode::CONFLICT,
        Error::KernelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}
