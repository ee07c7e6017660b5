use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{OperationSchema, RawEndpoint, ServiceKey, ServiceSchema};

use crate::endpoint::Endpoint;
use crate::service::invocation::{Invocation, InvocationError, Response};

/// Source of operation metadata for one service.
/// Implementations: [`ServiceSchema`] (JSON files), generated stubs.
pub trait SchemaProvider: Send + Sync {
    /// Identifier used in logs.
    fn schema_id(&self) -> &str;

    /// Path prefix shared by every operation.
    fn base_path(&self) -> &str;

    /// Encodings applied to operations that declare none of their own.
    fn produces(&self) -> &[String];

    fn operations(&self) -> &[OperationSchema];
}

impl SchemaProvider for ServiceSchema {
    fn schema_id(&self) -> &str {
        &self.schema_id
    }

    fn base_path(&self) -> &str {
        &self.base_path
    }

    fn produces(&self) -> &[String] {
        &self.produces
    }

    fn operations(&self) -> &[OperationSchema] {
        &self.operations
    }
}

/// Decides whether an authentication token is acceptable.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Client of the service registry that supplies raw endpoint lists.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the current endpoints for `key`.
    /// Returns `None` when the registry does not know the service.
    async fn fetch_endpoints(&self, key: &ServiceKey) -> anyhow::Result<Option<Vec<RawEndpoint>>>;
}

/// Network transport that carries an outbound invocation to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, also the URI scheme of the addresses it accepts.
    fn name(&self) -> &str;

    async fn send(
        &self,
        endpoint: &Endpoint,
        invocation: &Invocation,
    ) -> Result<Response, InvocationError>;
}

/// Lookup of transports by name.
pub trait TransportRegistry: Send + Sync {
    fn find(&self, name: &str) -> Option<Arc<dyn Transport>>;
}

/// Application logic behind one operation id.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Serve one inbound invocation and return the value to encode.
    async fn handle(&self, invocation: &Invocation) -> Result<serde_json::Value, InvocationError>;
}
