//! Service registry collaborator.
//!
//! The server publishes each of its services at startup and withdraws them on
//! shutdown; clients resolve a service uri to endpoints. Discovery itself
//! lives outside this crate; [`LocalRegistry`] is an in-process stand-in.

mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::LocalRegistry;

use crate::error::Result;
use crate::service::DEFAULT_GROUP;

/// Protocol version advertised for every registration.
pub const PROTOCOL_VERSION: &str = "v1";

/// What gets published for one service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub service_uri: String,
    pub group_id: String,
    pub host_port: String,
    pub proto_version: String,
    #[serde(default)]
    pub is_pre: bool,
}

impl ServiceMeta {
    pub fn new(
        service_uri: impl Into<String>,
        group_id: impl Into<String>,
        host_port: impl Into<String>,
    ) -> Self {
        Self {
            service_uri: service_uri.into(),
            group_id: group_id.into(),
            host_port: host_port.into(),
            proto_version: PROTOCOL_VERSION.to_string(),
            is_pre: false,
        }
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Publish `host_port` as an endpoint of `service_uri` in `group_id`.
    ///
    /// Returns `false` when the registry declined the registration.
    async fn register(
        &self,
        service_uri: &str,
        host_port: &str,
        protocol_version: &str,
        group_id: &str,
        meta: ServiceMeta,
    ) -> Result<bool>;

    /// Withdraw a previous registration. Unknown endpoints are not an error.
    async fn unregister(
        &self,
        service_uri: &str,
        host_port: &str,
        protocol_version: &str,
        group_id: &str,
    ) -> Result<bool>;

    /// Endpoints of a service, in a stable order.
    async fn resolve(
        &self,
        service_uri: &str,
        protocol_version: &str,
        group_id: &str,
    ) -> Result<Vec<ServiceMeta>>;
}

/// Registry key of a service in a group: `uri#group`, or just `uri` for the
/// default group.
pub fn build_service_uri(service_uri: &str, group_id: &str) -> String {
    if group_id.is_empty() || group_id == DEFAULT_GROUP {
        service_uri.to_string()
    } else {
        format!("{}#{}", service_uri, group_id)
    }
}

/// Split a registry key back into uri and group.
pub fn split_service_uri(key: &str) -> (&str, &str) {
    key.split_once('#').unwrap_or((key, DEFAULT_GROUP))
}
