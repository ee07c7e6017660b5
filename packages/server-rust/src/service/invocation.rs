//! Invocation types: the per-call unit of work, its response, and its errors.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::{Encoder, InvocationContext, NegotiationError, OperationRoute, ServiceKey};
use http::StatusCode;
use uuid::Uuid;

use crate::endpoint::EndpointError;

/// Boxed future returned by every `tower::Service<Invocation>` in the pipeline.
pub type InvocationFuture =
    Pin<Box<dyn Future<Output = Result<Response, InvocationError>> + Send>>;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Direction of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Inbound call served by local application logic.
    Producer,
    /// Outbound call to another service.
    Consumer,
}

/// State carried through one traversal of a handler chain.
///
/// Created once per call and consumed by the chain; never reused.
pub struct Invocation {
    id: Uuid,
    kind: InvocationKind,
    operation: Arc<OperationRoute>,
    context: InvocationContext,
    /// One entry per parameter binding, by binding index.
    arguments: Vec<Option<String>>,
    body: Bytes,
    encoder: Option<Arc<dyn Encoder>>,
    service_key: Option<ServiceKey>,
    timeout: Option<Duration>,
    chain_position: usize,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("operation", &self.operation.operation_id())
            .field("chain_position", &self.chain_position)
            .finish_non_exhaustive()
    }
}

impl Invocation {
    /// Inbound invocation with the negotiated response encoder.
    #[must_use]
    pub fn producer(
        operation: Arc<OperationRoute>,
        arguments: Vec<Option<String>>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        Self::new(InvocationKind::Producer, operation, arguments, Some(encoder), None)
    }

    /// Outbound invocation addressed to the endpoints behind `key`.
    #[must_use]
    pub fn consumer(
        operation: Arc<OperationRoute>,
        key: ServiceKey,
        arguments: Vec<Option<String>>,
    ) -> Self {
        Self::new(InvocationKind::Consumer, operation, arguments, None, Some(key))
    }

    fn new(
        kind: InvocationKind,
        operation: Arc<OperationRoute>,
        arguments: Vec<Option<String>>,
        encoder: Option<Arc<dyn Encoder>>,
        service_key: Option<ServiceKey>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            operation,
            context: InvocationContext::new(),
            arguments,
            body: Bytes::new(),
            encoder,
            service_key,
            timeout: None,
            chain_position: 0,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: InvocationContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Overrides the chain's default deadline for this call only.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    #[must_use]
    pub fn operation(&self) -> &Arc<OperationRoute> {
        &self.operation
    }

    #[must_use]
    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut InvocationContext {
        &mut self.context
    }

    #[must_use]
    pub fn arguments(&self) -> &[Option<String>] {
        &self.arguments
    }

    /// Bound value of the parameter called `name`.
    #[must_use]
    pub fn argument(&self, name: &str) -> Option<&str> {
        let binding = self.operation.param_by_name(name)?;
        self.arguments.get(binding.index)?.as_deref()
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn encoder(&self) -> Option<&Arc<dyn Encoder>> {
        self.encoder.as_ref()
    }

    #[must_use]
    pub fn service_key(&self) -> Option<&ServiceKey> {
        self.service_key.as_ref()
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Index of the next handler to run.
    #[must_use]
    pub fn chain_position(&self) -> usize {
        self.chain_position
    }

    pub(crate) fn advance(&mut self) {
        self.chain_position += 1;
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Successful outcome of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Response {
    /// `200 OK` with the given body and no content type.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: None,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Which part of the handler contract was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ViolationKind {
    #[error("returned without proceeding, succeeding, or failing")]
    NoSignal,
    #[error("proceeded past the end of the chain")]
    ChainExhausted,
}

/// A handler broke the chain contract. Indicates a bug in the handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler `{handler}` {kind}")]
pub struct ProtocolViolation {
    pub handler: String,
    pub kind: ViolationKind,
}

/// Failure of an invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    NotAcceptable(#[from] NegotiationError),
    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("unknown operation: {operation_id}")]
    UnknownOperation { operation_id: String },
    #[error("operation {operation_id} takes {expected} arguments, got {actual}")]
    InvalidArguments {
        operation_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("no handler registered for operation {operation_id}")]
    NoHandler { operation_id: String },
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("{message}")]
    Business { status: StatusCode, message: String },
    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl InvocationError {
    /// Application-level failure with an explicit status.
    #[must_use]
    pub fn business(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Business {
            status,
            message: message.into(),
        }
    }

    /// HTTP status reported to the caller.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownOperation { .. } => StatusCode::NOT_FOUND,
            Self::InvalidArguments { .. } => StatusCode::BAD_REQUEST,
            Self::Endpoint(e) => e.status(),
            Self::Business { status, .. } => *status,
            Self::NoHandler { .. } | Self::ProtocolViolation(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
