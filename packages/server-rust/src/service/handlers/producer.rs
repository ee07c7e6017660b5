//! Terminal handler for inbound invocations.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::service::chain::{Handler, Responder};
use crate::service::invocation::{Invocation, InvocationError, Response};
use crate::traits::OperationHandler;

/// Runs the application's [`OperationHandler`] for the invoked operation and
/// encodes its result with the negotiated encoder.
#[derive(Default)]
pub struct ProducerHandler {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl ProducerHandler {
    pub const NAME: &'static str = "producer";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the application logic for `operation_id`, replacing any
    /// previous registration.
    #[must_use]
    pub fn with_operation(
        mut self,
        operation_id: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        self.handlers.insert(operation_id.into(), handler);
        self
    }

    #[must_use]
    pub fn handles(&self, operation_id: &str) -> bool {
        self.handlers.contains_key(operation_id)
    }
}

impl Handler for ProducerHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handle(&self, invocation: Invocation, responder: Responder) {
        let operation_id = invocation.operation().operation_id();
        let Some(handler) = self.handlers.get(operation_id).cloned() else {
            responder.fail(InvocationError::NoHandler {
                operation_id: operation_id.to_string(),
            });
            return;
        };
        let Some(encoder) = invocation.encoder().cloned() else {
            responder.fail(InvocationError::Internal(anyhow::anyhow!(
                "inbound invocation {} has no negotiated encoder",
                invocation.id()
            )));
            return;
        };

        tokio::spawn(async move {
            let value = match handler.handle(&invocation).await {
                Ok(value) => value,
                Err(e) => {
                    debug!(invocation_id = %invocation.id(), error = %e, "operation failed");
                    responder.fail(e);
                    return;
                }
            };
            match encoder.encode(&value) {
                Ok(body) => responder.succeed(Response::ok(body).with_content_type(encoder.name())),
                Err(e) => responder.fail(InvocationError::Internal(e)),
            }
        });
    }
}
