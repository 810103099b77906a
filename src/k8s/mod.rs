//! Service discovery for the SLI exporter.

mod provider_file;
mod provider_k8s;
mod service;

use std::sync::Arc;

pub use provider_file::{FileProviderError, FileServicesProvider};
pub use provider_k8s::{K8sProviderError, K8sServicesProvider};
pub use service::{PathSet, Service, ServiceError};

/// Annotation keys a service is described by.
#[derive(Debug, Clone)]
pub struct SliAnnotations {
    /// Marks the service for SLI exporting; accepted values are `true` and
    /// `enabled`.
    pub enable: String,
    /// JSON list of `{label: [regex, ...]}` path groups.
    pub paths: String,
    /// Comma-separated domains the service answers on.
    pub domains: String,
}

impl Default for SliAnnotations {
    fn default() -> Self {
        Self {
            enable: "logship.io/sla-enabled".to_string(),
            paths: "logship.io/sla-paths".to_string(),
            domains: "logship.io/sla-domains".to_string(),
        }
    }
}

/// Read access to the current host→service map.
pub trait ServicesProvider: Send + Sync {
    fn service_by_host(&self, host: &str) -> Option<Arc<Service>>;
}

/// Empty provider for dry-run launches and tests.
pub struct ServicesProviderStub;

impl ServicesProvider for ServicesProviderStub {
    fn service_by_host(&self, _host: &str) -> Option<Arc<Service>> {
        None
    }
}

/// Registers `service` in `map` under all of its domains; a bare domain
/// without a dot is additionally qualified with the default domain.
pub(crate) fn register_domains(
    map: &mut std::collections::HashMap<String, Arc<Service>>,
    service: Arc<Service>,
    default_domain: &str,
) {
    for domain in &service.domains {
        if !domain.contains('.') {
            map.insert(format!("{domain}.{default_domain}"), Arc::clone(&service));
        }

        map.insert(domain.clone(), Arc::clone(&service));
    }
}
