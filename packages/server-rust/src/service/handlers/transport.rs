//! Terminal handler for outbound invocations.

use std::sync::Arc;

use tracing::debug;

use crate::config::DispatchConfig;
use crate::endpoint::{EndpointCache, EndpointError, EndpointSelector, LoadBalance};
use crate::service::chain::{Handler, Responder};
use crate::service::invocation::{Invocation, InvocationError};

/// Resolves the invocation's service key through the [`EndpointCache`],
/// picks one endpoint and hands the invocation to that endpoint's transport.
pub struct TransportHandler {
    cache: Arc<EndpointCache>,
    selector: Arc<EndpointSelector>,
}

impl TransportHandler {
    pub const NAME: &'static str = "transport";

    #[must_use]
    pub fn new(cache: Arc<EndpointCache>, strategy: LoadBalance) -> Self {
        Self {
            cache,
            selector: Arc::new(EndpointSelector::new(strategy)),
        }
    }

    /// Selects endpoints with the configured `load_balance` strategy.
    #[must_use]
    pub fn from_config(cache: Arc<EndpointCache>, config: &DispatchConfig) -> Self {
        Self::new(cache, config.load_balance)
    }

    #[must_use]
    pub fn strategy(&self) -> LoadBalance {
        self.selector.strategy()
    }
}

impl Handler for TransportHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handle(&self, invocation: Invocation, responder: Responder) {
        let Some(key) = invocation.service_key().cloned() else {
            responder.fail(InvocationError::Internal(anyhow::anyhow!(
                "outbound invocation {} has no service key",
                invocation.id()
            )));
            return;
        };
        let cache = Arc::clone(&self.cache);
        let selector = Arc::clone(&self.selector);

        tokio::spawn(async move {
            let snapshot = match cache.resolve(&key).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    responder.fail(e.into());
                    return;
                }
            };
            let Some(endpoint) = selector.select(snapshot.endpoints()) else {
                responder.fail(EndpointError::NoEndpoints(key).into());
                return;
            };
            debug!(
                invocation_id = %invocation.id(),
                %key,
                address = endpoint.address(),
                generation = snapshot.generation(),
                "sending invocation"
            );
            match endpoint.transport().send(endpoint, &invocation).await {
                Ok(response) => responder.succeed(response),
                Err(e) => responder.fail(e),
            }
        });
    }
}
