//! # Loom Router
//!
//! A small HTTP router abstraction, dispatched in-process. Modules add routes to
//! a [`RouteGroup`] in `register_routes`; the kernel mounts the group once the
//! module is running and unmounts it during cleanup.
//!
//! Every mounted route is owned by one module. The router counts in-flight
//! requests per owner so an unloading module can be drained: while draining,
//! its routes answer `503 Service Unavailable` and [`Router::drain`] waits for
//! the requests already running to finish.
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Notify, RwLock};

use crate::event::bus::panic_message;
use crate::kernel::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Values of `{param}` segments, filled in by the router
    pub params: HashMap<String, String>,
    pub body: Value,
}

impl RouteRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            params: HashMap::new(),
            body: Value::Null,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Add an `Authorization: Bearer <token>` header. Tokens that are not valid
    /// header values are ignored.
    pub fn with_bearer(mut self, token: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            self.headers.insert(AUTHORIZATION, value);
        }
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResponse {
    #[serde(with = "status_code")]
    pub status: StatusCode,
    pub body: Value,
}

mod status_code {
    use http::StatusCode;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(status: &StatusCode, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(status.as_u16())
    }
}

impl RouteResponse {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn error(status: StatusCode, message: impl fmt::Display) -> Self {
        Self::new(status, json!({ "error": message.to_string() }))
    }

    pub fn not_found() -> Self {
        Self::error(StatusCode::NOT_FOUND, "no route")
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn call(&self, req: RouteRequest) -> RouteResponse;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RouteResponse> + Send + 'static,
{
    async fn call(&self, req: RouteRequest) -> RouteResponse {
        (self)(req).await
    }
}

struct RouteSpec {
    method: Method,
    path: String,
    handler: Arc<dyn RouteHandler>,
}

/// Answers with `500` when the wrapped handler panics.
struct ContainedRoute {
    owner: String,
    inner: Arc<dyn RouteHandler>,
}

#[async_trait]
impl RouteHandler for ContainedRoute {
    async fn call(&self, req: RouteRequest) -> RouteResponse {
        match AssertUnwindSafe(self.inner.call(req)).catch_unwind().await {
            Ok(resp) => resp,
            Err(panic) => handler_panicked(&self.owner, panic.as_ref()),
        }
    }
}

fn handler_panicked(owner: &str, panic: &(dyn Any + Send)) -> RouteResponse {
    log::error!(
        "Route handler of '{}' panicked: {}",
        owner,
        panic_message(panic)
    );
    RouteResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "handler panicked")
}

/// Routes one module contributes, rooted at a prefix (`/<module>` by default).
pub struct RouteGroup {
    owner: String,
    prefix: String,
    routes: Vec<RouteSpec>,
    /// Set when registration failed part-way; the group must not be mounted
    fault: Option<String>,
}

impl RouteGroup {
    pub fn new(owner: impl Into<String>) -> Self {
        let owner = owner.into();
        let prefix = format!("/{}", owner);
        Self::with_prefix(owner, prefix)
    }

    pub fn with_prefix(owner: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            prefix: normalize(&prefix.into()),
            routes: Vec::new(),
            fault: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn route(
        &mut self,
        method: Method,
        path: &str,
        handler: impl RouteHandler + 'static,
    ) -> &mut Self {
        let full = if path.trim_matches('/').is_empty() {
            self.prefix.clone()
        } else {
            normalize(&format!("{}/{}", self.prefix, path.trim_start_matches('/')))
        };
        self.routes.push(RouteSpec {
            method,
            path: full,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn get(&mut self, path: &str, handler: impl RouteHandler + 'static) -> &mut Self {
        self.route(Method::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl RouteHandler + 'static) -> &mut Self {
        self.route(Method::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl RouteHandler + 'static) -> &mut Self {
        self.route(Method::PUT, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl RouteHandler + 'static) -> &mut Self {
        self.route(Method::DELETE, path, handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Wrap every handler from index `first` on so that its panics become `500`.
    pub(crate) fn contain_from(&mut self, first: usize) {
        for spec in self.routes.iter_mut().skip(first) {
            spec.handler = Arc::new(ContainedRoute {
                owner: self.owner.clone(),
                inner: spec.handler.clone(),
            });
        }
    }

    pub(crate) fn fault(&mut self, reason: String) {
        self.fault = Some(reason);
    }

    pub(crate) fn take_fault(&mut self) -> Option<String> {
        self.fault.take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

impl Segment {
    fn overlaps(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Literal(a), Segment::Literal(b)) => a == b,
            _ => true,
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    let joined: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", joined.join("/"))
}

fn parse_pattern(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

struct Mounted {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    owner: String,
    handler: Arc<dyn RouteHandler>,
    state: Arc<OwnerState>,
}

impl Mounted {
    fn matches(&self, segments: &[&str]) -> Option<HashMap<String, String>> {
        if self.segments.len() != segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (pattern, actual) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Literal(lit) if lit == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*actual).to_string());
                }
            }
        }
        Some(params)
    }
}

#[derive(Default)]
struct OwnerState {
    in_flight: AtomicUsize,
    draining: AtomicBool,
    idle: Notify,
}

struct InFlight(Arc<OwnerState>);

impl InFlight {
    fn enter(state: &Arc<OwnerState>) -> Self {
        state.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(state.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// A mounted route, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub method: String,
    pub path: String,
    pub owner: String,
}

/// Shared, cloneable route table.
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<RwLock<Vec<Mounted>>>,
    owners: Arc<RwLock<HashMap<String, Arc<OwnerState>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount every route of `group`. Nothing is mounted if any route clashes
    /// with one already mounted (or with another route of the group).
    pub async fn mount(&self, group: RouteGroup) -> Result<usize> {
        let mut routes = self.routes.write().await;
        let mut owners = self.owners.write().await;
        let state = owners.get(&group.owner).cloned().unwrap_or_default();
        let mut pending: Vec<Mounted> = Vec::with_capacity(group.routes.len());
        for spec in group.routes {
            let segments = parse_pattern(&spec.path);
            let clash = routes
                .iter()
                .chain(pending.iter())
                .find(|m| m.method == spec.method && overlaps(&m.segments, &segments));
            if let Some(existing) = clash {
                return Err(Error::RouteConflict {
                    method: spec.method.to_string(),
                    path: spec.path,
                    owner: existing.owner.clone(),
                });
            }
            pending.push(Mounted {
                method: spec.method,
                pattern: spec.path,
                segments,
                owner: group.owner.clone(),
                handler: spec.handler,
                state: state.clone(),
            });
        }

        let count = pending.len();
        for m in &pending {
            log::debug!("Mounted {} {} for '{}'", m.method, m.pattern, m.owner);
        }
        routes.extend(pending);
        owners.insert(group.owner, state);
        Ok(count)
    }

    /// Remove every route owned by `owner`.
    pub async fn unmount(&self, owner: &str) -> usize {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|m| m.owner != owner);
        let removed = before - routes.len();
        drop(routes);
        self.owners.write().await.remove(owner);
        if removed > 0 {
            log::debug!("Unmounted {} route(s) of '{}'", removed, owner);
        }
        removed
    }

    /// Route `req` to its handler.
    ///
    /// The request is counted against its owner before the route table is
    /// released, so [`drain`](Self::drain) never misses it.
    pub async fn dispatch(&self, mut req: RouteRequest) -> RouteResponse {
        let path = normalize(&req.path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let (guard, handler, owner, params) = {
            let routes = self.routes.read().await;
            let mut path_matched = false;
            let mut found = None;
            for m in routes.iter() {
                if let Some(params) = m.matches(&segments) {
                    if m.method == req.method {
                        found = Some((m, params));
                        break;
                    }
                    path_matched = true;
                }
            }
            let (m, params) = match found {
                Some(found) => found,
                None if path_matched => {
                    return RouteResponse::error(
                        StatusCode::METHOD_NOT_ALLOWED,
                        "method not allowed",
                    );
                }
                None => return RouteResponse::not_found(),
            };
            let guard = InFlight::enter(&m.state);
            if m.state.draining.load(Ordering::SeqCst) {
                return RouteResponse::error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("module '{}' is draining", m.owner),
                );
            }
            (guard, m.handler.clone(), m.owner.clone(), params)
        };

        req.params = params;
        let resp = match AssertUnwindSafe(handler.call(req)).catch_unwind().await {
            Ok(resp) => resp,
            Err(panic) => handler_panicked(&owner, panic.as_ref()),
        };
        // The handler may be the last reference into a module's code; release it
        // while the request still counts as in flight.
        drop(handler);
        drop(guard);
        resp
    }

    /// Refuse new requests for `owner` and wait for in-flight ones to finish.
    ///
    /// Returns `false` if `timeout` expired first.
    pub async fn drain(&self, owner: &str, timeout: Duration) -> bool {
        let Some(state) = self.owners.read().await.get(owner).cloned() else {
            return true;
        };
        state.draining.store(true, Ordering::SeqCst);
        let wait = async {
            loop {
                let idle = state.idle.notified();
                if state.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                log::warn!(
                    "Drain of '{}' timed out after {:?} with {} request(s) in flight",
                    owner,
                    timeout,
                    state.in_flight.load(Ordering::SeqCst)
                );
                false
            }
        }
    }

    /// Mark `owner`'s routes as draining without waiting.
    pub async fn close(&self, owner: &str) {
        if let Some(state) = self.owners.read().await.get(owner) {
            state.draining.store(true, Ordering::SeqCst);
        }
    }

    pub async fn in_flight(&self, owner: &str) -> usize {
        self.owners
            .read()
            .await
            .get(owner)
            .map_or(0, |s| s.in_flight.load(Ordering::SeqCst))
    }

    pub async fn routes(&self) -> Vec<RouteInfo> {
        let mut list: Vec<RouteInfo> = self
            .routes
            .read()
            .await
            .iter()
            .map(|m| RouteInfo {
                method: m.method.to_string(),
                path: m.pattern.clone(),
                owner: m.owner.clone(),
            })
            .collect();
        list.sort_by(|a, b| (&a.path, &a.method).cmp(&(&b.path, &b.method)));
        list
    }
}

fn overlaps(a: &[Segment], b: &[Segment]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.overlaps(y))
}
