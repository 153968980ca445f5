//! # Service Discovery
//!
//! Best-effort registration of running modules with an external service
//! registry. A module opts in through [`Module::needs_service_discovery`] and
//! describes itself with a [`ServiceInfo`]. The kernel publishes it once the
//! module is running and withdraws it at pre-cleanup.
//!
//! The registry being unreachable is logged and tolerated; it never fails a
//! module.
//!
//! [`Module::needs_service_discovery`]: crate::module_system::Module::needs_service_discovery
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl ServiceInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("Service registry '{registry}' is unreachable: {message}")]
    Unreachable { registry: String, message: String },

    #[error("Service registry rejected '{service}': {message}")]
    Rejected { service: String, message: String },
}

/// Client of an external service registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    fn name(&self) -> &str;

    async fn register(&self, service: &str, info: &ServiceInfo) -> Result<(), DiscoveryError>;

    async fn deregister(&self, service: &str) -> Result<(), DiscoveryError>;
}

/// Registry kept in process memory. Used by tests and single-host setups.
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    services: Mutex<HashMap<String, ServiceInfo>>,
    unreachable: AtomicBool,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the registry going down (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub async fn get(&self, service: &str) -> Option<ServiceInfo> {
        self.services.lock().await.get(service).cloned()
    }

    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn check(&self) -> Result<(), DiscoveryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Unreachable {
                registry: self.name().to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn register(&self, service: &str, info: &ServiceInfo) -> Result<(), DiscoveryError> {
        self.check()?;
        if info.address.is_empty() {
            return Err(DiscoveryError::Rejected {
                service: service.to_string(),
                message: "empty address".to_string(),
            });
        }
        let mut services = self.services.lock().await;
        services.insert(service.to_string(), info.clone());
        Ok(())
    }

    async fn deregister(&self, service: &str) -> Result<(), DiscoveryError> {
        self.check()?;
        self.services.lock().await.remove(service);
        Ok(())
    }
}

/// Aggregates opted-in modules and forwards them to the registry client.
#[derive(Clone, Default)]
pub struct DiscoveryPublisher {
    client: Option<Arc<dyn ServiceRegistry>>,
    published: Arc<Mutex<BTreeMap<String, ServiceInfo>>>,
}

impl DiscoveryPublisher {
    pub fn new(client: Option<Arc<dyn ServiceRegistry>>) -> Self {
        Self {
            client,
            published: Arc::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Register `service`. Returns whether the registry accepted it.
    pub async fn publish(&self, service: &str, info: ServiceInfo) -> bool {
        let Some(client) = &self.client else {
            log::debug!(
                "No service registry configured; '{}' not published",
                service
            );
            return false;
        };
        match client.register(service, &info).await {
            Ok(()) => {
                log::info!(
                    "Registered '{}' at {} with '{}'",
                    service,
                    info.address,
                    client.name()
                );
                let mut published = self.published.lock().await;
                published.insert(service.to_string(), info);
                true
            }
            Err(e) => {
                log::warn!(
                    "Service discovery registration of '{}' failed: {}",
                    service,
                    e
                );
                false
            }
        }
    }

    /// Deregister `service` if it was published.
    pub async fn withdraw(&self, service: &str) {
        let Some(client) = &self.client else {
            return;
        };
        if self.published.lock().await.remove(service).is_none() {
            return;
        }
        match client.deregister(service).await {
            Ok(()) => log::info!("Deregistered '{}' from '{}'", service, client.name()),
            Err(e) => log::warn!(
                "Service discovery deregistration of '{}' failed: {}",
                service,
                e
            ),
        }
    }

    pub async fn published(&self) -> BTreeMap<String, ServiceInfo> {
        self.published.lock().await.clone()
    }
}

#[cfg(test)]
mod tests;
