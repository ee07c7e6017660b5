//! Per-invocation span with timing and outcome.
//!
//! The span names the direction, operation, route template and negotiated
//! encoder (or target service for outbound calls), so log lines emitted by
//! handlers inside the chain carry them too.

use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{field, info, info_span, warn, Instrument, Span};

use crate::service::invocation::{
    Invocation, InvocationError, InvocationFuture, InvocationKind, Response,
};

/// How an invocation ended, as recorded on its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 4xx: the caller's fault.
    Rejected,
    /// 5xx: ours or a downstream's.
    Failed,
}

impl Outcome {
    #[must_use]
    pub fn of(result: &Result<Response, InvocationError>) -> Self {
        let status = match result {
            Ok(response) => response.status,
            Err(e) => e.status(),
        };
        if status.is_server_error() {
            Self::Failed
        } else if status.is_client_error() {
            Self::Rejected
        } else {
            Self::Success
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn invocation_span(invocation: &Invocation) -> Span {
    let route = invocation.operation();
    let kind = match invocation.kind() {
        InvocationKind::Producer => "inbound",
        InvocationKind::Consumer => "outbound",
    };
    let span = info_span!(
        "invocation",
        invocation_id = %invocation.id(),
        kind,
        operation = route.operation_id(),
        method = route.http_method(),
        route = route.absolute_path(),
        encoder = field::Empty,
        target = field::Empty,
        duration_ms = field::Empty,
        status = field::Empty,
        outcome = field::Empty,
    );
    if let Some(encoder) = invocation.encoder() {
        span.record("encoder", encoder.name());
    }
    if let Some(key) = invocation.service_key() {
        span.record("target", field::display(key));
    }
    span
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = Response, Error = InvocationError> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = InvocationError;
    type Future = InvocationFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let span = invocation_span(&invocation);
        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let outcome = Outcome::of(&result);
                let status = match &result {
                    Ok(response) => response.status.as_u16(),
                    Err(e) => e.status().as_u16(),
                };

                let span = Span::current();
                span.record("duration_ms", duration_ms);
                span.record("status", status);
                span.record("outcome", outcome.as_str());

                match &result {
                    Err(e) if outcome == Outcome::Failed => {
                        warn!(duration_ms, status, error = %e, "invocation failed");
                    }
                    _ => info!(duration_ms, status, "invocation complete"),
                }
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
