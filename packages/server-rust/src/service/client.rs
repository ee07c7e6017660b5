//! Outbound calls to another microservice.

use std::sync::Arc;
use std::time::Duration;

use courier_core::context::SOURCE_SERVICE;
use courier_core::endpoint::LATEST_VERSION;
use courier_core::{InvocationContext, ServiceKey};

use super::chain::HandlerChain;
use super::invocation::{Invocation, InvocationError, Response};
use super::registry::RouteRegistry;
use crate::config::DispatchConfig;

/// Invokes operations of one remote service through a consumer chain.
///
/// `routes` holds the remote service's operations; the chain normally ends
/// in a `TransportHandler`.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    key: ServiceKey,
    routes: Arc<RouteRegistry>,
    chain: Arc<HandlerChain>,
    source: Option<String>,
}

impl ServiceClient {
    #[must_use]
    pub fn new(key: ServiceKey, routes: Arc<RouteRegistry>, chain: Arc<HandlerChain>) -> Self {
        Self {
            key,
            routes,
            chain,
            source: None,
        }
    }

    /// Client for `microservice_name` in the configured application, any
    /// version, tagged with the local service name as call source.
    #[must_use]
    pub fn from_config(
        config: &DispatchConfig,
        microservice_name: &str,
        transport: &str,
        routes: Arc<RouteRegistry>,
        chain: Arc<HandlerChain>,
    ) -> Self {
        let key = ServiceKey::new(&config.app_id, microservice_name, LATEST_VERSION, transport);
        let client = Self::new(key, routes, chain);
        if config.microservice_name.is_empty() {
            client
        } else {
            client.with_source(&config.microservice_name)
        }
    }

    /// Sets the `x-source-service` context entry sent with every call.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn service_key(&self) -> &ServiceKey {
        &self.key
    }

    /// Calls `operation_id` with positional `arguments`, one per parameter.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::UnknownOperation`] or
    /// [`InvocationError::InvalidArguments`] before anything is sent, or
    /// whatever error the consumer chain completes with.
    pub async fn call(
        &self,
        operation_id: &str,
        arguments: Vec<Option<String>>,
    ) -> Result<Response, InvocationError> {
        self.call_with(operation_id, arguments, InvocationContext::new(), None)
            .await
    }

    /// Like [`call`](Self::call), with an explicit context and timeout.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with(
        &self,
        operation_id: &str,
        arguments: Vec<Option<String>>,
        mut context: InvocationContext,
        timeout: Option<Duration>,
    ) -> Result<Response, InvocationError> {
        let route = self
            .routes
            .get(operation_id)
            .ok_or_else(|| InvocationError::UnknownOperation {
                operation_id: operation_id.to_string(),
            })?;
        if arguments.len() != route.parameters().len() {
            return Err(InvocationError::InvalidArguments {
                operation_id: operation_id.to_string(),
                expected: route.parameters().len(),
                actual: arguments.len(),
            });
        }

        if let Some(source) = &self.source {
            context.insert(SOURCE_SERVICE, source.clone());
        }
        let mut invocation =
            Invocation::consumer(route, self.key.clone(), arguments).with_context(context);
        if let Some(timeout) = timeout {
            invocation = invocation.with_timeout(timeout);
        }
        self.chain.invoke(invocation).await
    }
}
