//! Fixed service table.

use std::collections::BTreeMap;
use std::sync::Arc;

use mqgate_rpc::ServiceEndpoint;
use parking_lot::RwLock;
use tracing::debug;

use crate::hooks::ServiceResolver;

/// Resolves service references against a registered table.
///
/// Lookup order: exact `type@id`, then a bare `type` entry, then the first
/// registered `type@…` instance in id order.
#[derive(Default)]
pub struct StaticResolver {
    endpoints: RwLock<BTreeMap<String, Arc<dyn ServiceEndpoint>>>,
}

impl StaticResolver {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under `service_ref`, replacing any previous entry.
    pub fn register(&self, service_ref: impl Into<String>, endpoint: Arc<dyn ServiceEndpoint>) {
        let service_ref = service_ref.into();
        debug!(service_ref = %service_ref, addr = endpoint.addr(), "service registered");
        let _ = self.endpoints.write().insert(service_ref, endpoint);
    }

    /// Drop an entry. Returns whether it existed.
    pub fn deregister(&self, service_ref: &str) -> bool {
        self.endpoints.write().remove(service_ref).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

impl ServiceResolver for StaticResolver {
    fn resolve(&self, service_ref: &str) -> Option<Arc<dyn ServiceEndpoint>> {
        let endpoints = self.endpoints.read();
        if let Some(endpoint) = endpoints.get(service_ref) {
            return Some(Arc::clone(endpoint));
        }
        let service_type = service_ref.split_once('@').map_or(service_ref, |(t, _)| t);
        if let Some(endpoint) = endpoints.get(service_type) {
            return Some(Arc::clone(endpoint));
        }
        let prefix = format!("{service_type}@");
        endpoints
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, endpoint)| Arc::clone(endpoint))
            .next()
    }
}
