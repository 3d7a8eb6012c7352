//! Service registry collaborator
//!
//! The registry knows which remote services can produce facts for a given
//! predicate. The production registry is an external system; this module
//! defines the consumed contract plus an in-memory implementation for tests
//! and embedded deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use crate::error::Result;

/// How a registered service is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    /// An invocable semantic web service: POST an input graph describing the
    /// input node, receive an output graph of new facts about it.
    WebService,
    /// An indexed SPARQL endpoint queried with batched SELECTs.
    SparqlEndpoint,
}

/// A reference to one registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Stable identifier of the service (its URI).
    pub uri: String,
    /// Human-readable name.
    pub name: String,
    /// Invocation endpoint.
    pub endpoint: String,
    pub kind: ServiceKind,
}

impl ServiceRef {
    pub fn web_service(
        uri: impl Into<String>,
        name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        ServiceRef {
            uri: uri.into(),
            name: name.into(),
            endpoint: endpoint.into(),
            kind: ServiceKind::WebService,
        }
    }

    pub fn sparql_endpoint(
        uri: impl Into<String>,
        name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        ServiceRef {
            uri: uri.into(),
            name: name.into(),
            endpoint: endpoint.into(),
            kind: ServiceKind::SparqlEndpoint,
        }
    }
}

/// Contract consumed from the service registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + fmt::Debug {
    /// All services able to resolve the given predicate.
    async fn find_services_by_predicate(&self, predicate: &str) -> Result<Vec<ServiceRef>>;

    /// Every registered service.
    async fn all_services(&self) -> Result<Vec<ServiceRef>>;
}

/// Registry held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    by_predicate: RwLock<HashMap<String, Vec<ServiceRef>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        InMemoryRegistry::default()
    }

    /// Register a service as a resolver for a predicate.
    pub async fn register(&self, predicate: impl Into<String>, service: ServiceRef) {
        let mut map = self.by_predicate.write().await;
        map.entry(predicate.into()).or_default().push(service);
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn find_services_by_predicate(&self, predicate: &str) -> Result<Vec<ServiceRef>> {
        let map = self.by_predicate.read().await;
        Ok(map.get(predicate).cloned().unwrap_or_default())
    }

    async fn all_services(&self) -> Result<Vec<ServiceRef>> {
        let map = self.by_predicate.read().await;
        let mut services: Vec<ServiceRef> = map.values().flatten().cloned().collect();
        services.dedup_by(|a, b| a.uri == b.uri);
        Ok(services)
    }
}
