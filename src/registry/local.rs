//! In-memory registry for single-process deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{build_service_uri, ServiceMeta, ServiceRegistry};
use crate::error::Result;

/// Endpoints keyed by `uri#group`, one entry per host:port.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    services: DashMap<String, Vec<ServiceMeta>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered endpoints across all services.
    pub fn len(&self) -> usize {
        self.services.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ServiceRegistry for LocalRegistry {
    async fn register(
        &self,
        service_uri: &str,
        host_port: &str,
        protocol_version: &str,
        group_id: &str,
        mut meta: ServiceMeta,
    ) -> Result<bool> {
        meta.service_uri = service_uri.to_string();
        meta.host_port = host_port.to_string();
        meta.proto_version = protocol_version.to_string();
        meta.group_id = group_id.to_string();

        let key = build_service_uri(service_uri, group_id);
        let mut endpoints = self.services.entry(key.clone()).or_default();
        endpoints.retain(|m| !(m.host_port == host_port && m.proto_version == protocol_version));
        endpoints.push(meta);
        endpoints.sort_by(|a, b| a.host_port.cmp(&b.host_port));
        info!(service = %key, endpoint = %host_port, "service registered");
        Ok(true)
    }

    async fn unregister(
        &self,
        service_uri: &str,
        host_port: &str,
        protocol_version: &str,
        group_id: &str,
    ) -> Result<bool> {
        let key = build_service_uri(service_uri, group_id);
        let removed = match self.services.get_mut(&key) {
            Some(mut endpoints) => {
                let before = endpoints.len();
                endpoints.retain(|m| {
                    !(m.host_port == host_port && m.proto_version == protocol_version)
                });
                before != endpoints.len()
            }
            None => false,
        };
        self.services.remove_if(&key, |_, endpoints| endpoints.is_empty());

        if removed {
            info!(service = %key, endpoint = %host_port, "service unregistered");
        } else {
            debug!(service = %key, endpoint = %host_port, "nothing to unregister");
        }
        Ok(true)
    }

    async fn resolve(
        &self,
        service_uri: &str,
        protocol_version: &str,
        group_id: &str,
    ) -> Result<Vec<ServiceMeta>> {
        let key = build_service_uri(service_uri, group_id);
        Ok(self
            .services
            .get(&key)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter(|m| m.proto_version == protocol_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
