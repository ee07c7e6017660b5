//! Handler chain: ordered, named handlers driven by explicit completion signals.
//!
//! Each handler receives the [`Invocation`] together with a [`Responder`] and
//! must consume the responder exactly once, either to pass the invocation to
//! the next handler or to finish it. Signals may be given from any task.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{error, warn};

use super::invocation::{
    Invocation, InvocationError, InvocationFuture, ProtocolViolation, Response, ViolationKind,
};

type Outcome = Result<Response, InvocationError>;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// A cross-cutting processing step.
///
/// `handle` must eventually call exactly one of [`Responder::proceed`],
/// [`Responder::succeed`] or [`Responder::fail`]. It may do so before
/// returning or later from a spawned task.
pub trait Handler: Send + Sync {
    /// Name unique within a chain; used in logs and protocol violations.
    fn name(&self) -> &str;

    fn handle(&self, invocation: Invocation, responder: Responder);
}

/// Handler built from a closure. See [`from_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(Invocation, Responder) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, invocation: Invocation, responder: Responder) {
        (self.f)(invocation, responder);
    }
}

/// Wraps a closure as a named [`Handler`].
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Invocation, Responder) + Send + Sync,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

struct CompletionInner {
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
    done: CancellationToken,
}

/// Shared, one-shot outcome slot of a single invocation.
///
/// The first terminal signal wins. Later signals are logged and dropped.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Completion {
    fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            inner: Arc::new(CompletionInner {
                sender: Mutex::new(Some(tx)),
                done: CancellationToken::new(),
            }),
        };
        (completion, rx)
    }

    /// Whether a terminal signal has already been delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Resolves once the invocation has completed, by any party.
    pub async fn completed(&self) {
        self.inner.done.cancelled().await;
    }

    /// Completes the invocation with an error on behalf of `source`.
    ///
    /// Returns `false` when the invocation had already completed.
    pub fn fail(&self, source: &str, error: InvocationError) -> bool {
        self.settle(source, Err(error))
    }

    fn settle(&self, source: &str, outcome: Outcome) -> bool {
        let sender = self.inner.sender.lock().take();
        let Some(tx) = sender else {
            warn!(handler = source, "late signal after completion ignored");
            return false;
        };
        self.inner.done.cancel();
        // Receiver gone means the caller stopped waiting.
        let _ = tx.send(outcome);
        true
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Single-use response sink handed to a handler.
///
/// Dropping it without signalling completes the invocation with a
/// [`ViolationKind::NoSignal`] protocol violation.
pub struct Responder {
    chain: Arc<HandlerChain>,
    /// Position of the handler holding this responder.
    index: usize,
    completion: Completion,
    signalled: bool,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("handler", &self.handler_name())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Responder {
    /// Name of the handler this responder was issued to.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        self.chain.handlers[self.index].name()
    }

    /// Handle on the invocation's outcome, for racing a terminal signal.
    #[must_use]
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Passes the invocation to the next handler.
    pub fn proceed(mut self, invocation: Invocation) {
        self.signalled = true;
        if self.completion.is_completed() {
            warn!(
                handler = self.handler_name(),
                "proceed after completion ignored"
            );
            return;
        }
        let chain = Arc::clone(&self.chain);
        chain.run(invocation, self.completion.clone());
    }

    /// Completes the invocation successfully.
    pub fn succeed(mut self, response: Response) {
        self.signalled = true;
        self.completion.settle(self.handler_name(), Ok(response));
    }

    /// Completes the invocation with an error.
    pub fn fail(mut self, error: InvocationError) {
        self.signalled = true;
        self.completion.settle(self.handler_name(), Err(error));
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.signalled {
            return;
        }
        let violation = ProtocolViolation {
            handler: self.handler_name().to_string(),
            kind: ViolationKind::NoSignal,
        };
        let handler = violation.handler.clone();
        error!(handler = %handler, "{violation}");
        self.completion.settle(&handler, Err(violation.into()));
    }
}

// ---------------------------------------------------------------------------
// HandlerChain
// ---------------------------------------------------------------------------

/// Error building a [`HandlerChain`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("handler chain is empty")]
    Empty,
    #[error("duplicate handler name: {0}")]
    DuplicateHandler(String),
}

/// Ordered list of uniquely named handlers. Registration order is execution
/// order.
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl HandlerChain {
    #[must_use]
    pub fn builder() -> HandlerChainBuilder {
        HandlerChainBuilder::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.name())
    }

    /// Drives `invocation` through the chain from its current position and
    /// waits for the first terminal signal.
    ///
    /// # Errors
    ///
    /// Returns whatever error the chain completed with.
    pub async fn invoke(self: &Arc<Self>, invocation: Invocation) -> Outcome {
        let (completion, rx) = Completion::new();
        let chain = Arc::clone(self);
        let start =
            panic::catch_unwind(AssertUnwindSafe(move || chain.run(invocation, completion)));
        if start.is_err() {
            // The unwinding responder has already reported the violation.
            error!("handler panicked during invocation");
        }
        rx.await.map_err(|_| {
            InvocationError::Internal(anyhow::anyhow!("invocation completion dropped"))
        })?
    }

    fn run(self: Arc<Self>, mut invocation: Invocation, completion: Completion) {
        let index = invocation.chain_position();
        let Some(handler) = self.handlers.get(index).cloned() else {
            let last = index.saturating_sub(1).min(self.handlers.len().saturating_sub(1));
            let violation = ProtocolViolation {
                handler: self
                    .handlers
                    .get(last)
                    .map_or_else(String::new, |h| h.name().to_string()),
                kind: ViolationKind::ChainExhausted,
            };
            let handler = violation.handler.clone();
            error!(handler = %handler, "{violation}");
            completion.settle(&handler, Err(violation.into()));
            return;
        };
        invocation.advance();
        let responder = Responder {
            chain: self,
            index,
            completion,
            signalled: false,
        };
        handler.handle(invocation, responder);
    }
}

/// Builder for [`HandlerChain`].
#[derive(Default)]
pub struct HandlerChainBuilder {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChainBuilder {
    /// Appends a handler.
    #[must_use]
    pub fn handler(self, handler: impl Handler + 'static) -> Self {
        self.shared(Arc::new(handler))
    }

    /// Appends an already shared handler.
    #[must_use]
    pub fn shared(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// # Errors
    ///
    /// Returns [`ChainError`] for an empty chain or a repeated handler name.
    pub fn build(self) -> Result<HandlerChain, ChainError> {
        if self.handlers.is_empty() {
            return Err(ChainError::Empty);
        }
        let mut seen = HashSet::new();
        for handler in &self.handlers {
            if !seen.insert(handler.name()) {
                return Err(ChainError::DuplicateHandler(handler.name().to_string()));
            }
        }
        Ok(HandlerChain {
            handlers: self.handlers,
        })
    }
}

// ---------------------------------------------------------------------------
// ChainService
// ---------------------------------------------------------------------------

/// Innermost `tower::Service` of the invocation pipeline.
#[derive(Debug, Clone)]
pub struct ChainService {
    chain: Arc<HandlerChain>,
}

impl ChainService {
    #[must_use]
    pub fn new(chain: Arc<HandlerChain>) -> Self {
        Self { chain }
    }
}

impl Service<Invocation> for ChainService {
    type Response = Response;
    type Error = InvocationError;
    type Future = InvocationFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let chain = Arc::clone(&self.chain);
        Box::pin(async move { chain.invoke(invocation).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use http::StatusCode;

    use super::*;
    use crate::service::invocation::testing;

    fn invocation() -> Invocation {
        testing::invocation("ping")
    }

    fn passthrough(
        name: &str,
        hits: Arc<AtomicUsize>,
    ) -> FnHandler<impl Fn(Invocation, Responder) + Send + Sync> {
        from_fn(name, move |inv, r: Responder| {
            hits.fetch_add(1, Ordering::SeqCst);
            r.proceed(inv);
        })
    }

    fn terminal(body: &'static str) -> FnHandler<impl Fn(Invocation, Responder) + Send + Sync> {
        from_fn("terminal", move |_inv, r: Responder| r.succeed(Response::ok(body)))
    }

    #[tokio::test]
    async fn handlers_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (Arc::clone(&order), Arc::clone(&order));
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(from_fn("first", move |inv, r: Responder| {
                    o1.lock().push("first");
                    r.proceed(inv);
                }))
                .handler(from_fn("second", move |_inv, r: Responder| {
                    o2.lock().push("second");
                    r.succeed(Response::ok("done"));
                }))
                .build()
                .unwrap(),
        );

        let response = chain.invoke(invocation()).await.unwrap();
        assert_eq!(response.body, "done");
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failing_middle_handler_short_circuits() {
        let first = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let third_hits = Arc::clone(&third);
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(passthrough("first", Arc::clone(&first)))
                .handler(from_fn("second", |_inv, r: Responder| {
                    r.fail(InvocationError::Unauthorized);
                }))
                .handler(from_fn("third", move |_inv, r: Responder| {
                    third_hits.fetch_add(1, Ordering::SeqCst);
                    r.succeed(Response::ok("unreachable"));
                }))
                .build()
                .unwrap(),
        );

        let err = chain.invoke(invocation()).await.unwrap_err();
        assert!(matches!(err, InvocationError::Unauthorized));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_responder_is_a_protocol_violation() {
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(from_fn("silent", |_inv, r: Responder| drop(r)))
                .build()
                .unwrap(),
        );

        let err = chain.invoke(invocation()).await.unwrap_err();
        match err {
            InvocationError::ProtocolViolation(v) => {
                assert_eq!(v.handler, "silent");
                assert_eq!(v.kind, ViolationKind::NoSignal);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_reports_no_signal() {
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(from_fn("boom", |_inv, _r: Responder| panic!("boom")))
                .build()
                .unwrap(),
        );

        let err = chain.invoke(invocation()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(matches!(
            err,
            InvocationError::ProtocolViolation(ProtocolViolation {
                kind: ViolationKind::NoSignal,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn proceeding_past_the_end_is_chain_exhausted() {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(passthrough("only", Arc::clone(&hits)))
                .build()
                .unwrap(),
        );

        let err = chain.invoke(invocation()).await.unwrap_err();
        match err {
            InvocationError::ProtocolViolation(v) => {
                assert_eq!(v.handler, "only");
                assert_eq!(v.kind, ViolationKind::ChainExhausted);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn signals_may_come_from_another_task() {
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(from_fn("async-hop", |inv, r: Responder| {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        r.proceed(inv);
                    });
                }))
                .handler(terminal("hopped"))
                .build()
                .unwrap(),
        );

        let response = chain.invoke(invocation()).await.unwrap();
        assert_eq!(response.body, "hopped");
    }

    #[tokio::test]
    async fn context_changes_are_visible_downstream() {
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(from_fn("tagger", |mut inv: Invocation, r: Responder| {
                    inv.context_mut().insert("tenant", "acme");
                    r.proceed(inv);
                }))
                .handler(from_fn("reader", |inv: Invocation, r: Responder| {
                    let tenant = inv.context().get("tenant").unwrap_or("none").to_string();
                    r.succeed(Response::ok(tenant));
                }))
                .build()
                .unwrap(),
        );

        let response = chain.invoke(invocation()).await.unwrap();
        assert_eq!(response.body, "acme");
    }

    #[tokio::test]
    async fn first_signal_wins() {
        let chain = Arc::new(
            HandlerChain::builder()
                .handler(from_fn("racer", |_inv, r: Responder| {
                    let completion = r.completion();
                    assert!(completion.fail("racer", InvocationError::Overloaded));
                    assert!(completion.is_completed());
                    // Arrives second and is dropped.
                    r.succeed(Response::ok("late"));
                }))
                .build()
                .unwrap(),
        );

        let err = chain.invoke(invocation()).await.unwrap_err();
        assert!(matches!(err, InvocationError::Overloaded));
    }

    #[test]
    fn builder_rejects_empty_and_duplicates() {
        assert_eq!(HandlerChain::builder().build().unwrap_err(), ChainError::Empty);

        let err = HandlerChain::builder()
            .handler(terminal("a"))
            .handler(terminal("b"))
            .build()
            .unwrap_err();
        assert_eq!(err, ChainError::DuplicateHandler("terminal".to_string()));
    }

    #[tokio::test]
    async fn chain_service_drives_the_chain() {
        use tower::ServiceExt;

        let chain = Arc::new(HandlerChain::builder().handler(terminal("svc")).build().unwrap());
        let response = ChainService::new(chain)
            .oneshot(invocation())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }
}
