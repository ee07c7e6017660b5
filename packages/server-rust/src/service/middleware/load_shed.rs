//! Admission control for the invocation pipeline.
//!
//! One budget of `max_concurrent_invocations` is shared by every service the
//! layer produces. Invocations over budget fail fast with
//! [`InvocationError::Overloaded`]; nothing is queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::debug;

use crate::service::invocation::{
    Invocation, InvocationError, InvocationFuture, InvocationKind, Response,
};

/// Point-in-time view of an admission budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub limit: usize,
    pub in_flight: usize,
    /// Invocations admitted since start.
    pub admitted: u64,
    /// Inbound invocations rejected since start.
    pub shed_inbound: u64,
    /// Outbound invocations rejected since start.
    pub shed_outbound: u64,
}

impl LoadStats {
    #[must_use]
    pub fn shed(&self) -> u64 {
        self.shed_inbound + self.shed_outbound
    }
}

#[derive(Debug)]
struct Budget {
    permits: Arc<Semaphore>,
    limit: usize,
    admitted: AtomicU64,
    shed_inbound: AtomicU64,
    shed_outbound: AtomicU64,
}

impl Budget {
    fn stats(&self) -> LoadStats {
        LoadStats {
            limit: self.limit,
            in_flight: self.limit - self.permits.available_permits(),
            admitted: self.admitted.load(Ordering::Relaxed),
            shed_inbound: self.shed_inbound.load(Ordering::Relaxed),
            shed_outbound: self.shed_outbound.load(Ordering::Relaxed),
        }
    }

    /// Counts the rejection and returns the running total for its direction.
    fn record_shed(&self, kind: InvocationKind) -> u64 {
        let counter = match kind {
            InvocationKind::Producer => &self.shed_inbound,
            InvocationKind::Consumer => &self.shed_outbound,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Layer sharing one admission budget across all wrapped services.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    budget: Arc<Budget>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        let limit = max_concurrent as usize;
        Self {
            budget: Arc::new(Budget {
                permits: Arc::new(Semaphore::new(limit)),
                limit,
                admitted: AtomicU64::new(0),
                shed_inbound: AtomicU64::new(0),
                shed_outbound: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> LoadStats {
        self.budget.stats()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            budget: Arc::clone(&self.budget),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    budget: Arc<Budget>,
}

impl<S> LoadShedService<S> {
    #[must_use]
    pub fn stats(&self) -> LoadStats {
        self.budget.stats()
    }
}

impl<S> Service<Invocation> for LoadShedService<S>
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
        let Ok(permit) = Arc::clone(&self.budget.permits).try_acquire_owned() else {
            let total = self.budget.record_shed(invocation.kind());
            debug!(
                invocation_id = %invocation.id(),
                kind = ?invocation.kind(),
                operation = invocation.operation().operation_id(),
                limit = self.budget.limit,
                total,
                "invocation shed"
            );
            return Box::pin(async { Err(InvocationError::Overloaded) });
        };
        self.budget.admitted.fetch_add(1, Ordering::Relaxed);

        let fut = self.inner.call(invocation);
        Box::pin(async move {
            let _permit = permit;
            fut.await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::ServiceKey;
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    use super::*;
    use crate::service::invocation::testing;

    /// Holds every invocation until the matching gate is released.
    struct Gated {
        gates: Vec<oneshot::Receiver<()>>,
    }

    impl Service<Invocation> for Gated {
        type Response = Response;
        type Error = InvocationError;
        type Future = InvocationFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, invocation: Invocation) -> Self::Future {
            let gate = self.gates.pop();
            let id = invocation.operation().operation_id().to_string();
            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(Response::ok(id))
            })
        }
    }

    fn outbound(operation_id: &str) -> Invocation {
        Invocation::consumer(
            testing::route(operation_id),
            ServiceKey::new("app", "svc", "latest", "rest"),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn admits_under_budget() {
        let layer = LoadShedLayer::new(4);
        let svc = layer.layer(Gated { gates: Vec::new() });
        let resp = svc.oneshot(testing::invocation("a")).await.unwrap();
        assert_eq!(resp.body, "a");

        let stats = layer.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.shed(), 0);
    }

    #[tokio::test]
    async fn sheds_by_direction_and_frees_budget_on_completion() {
        let (release, gate) = oneshot::channel();
        let layer = LoadShedLayer::new(1);
        let mut svc = layer.layer(Gated { gates: vec![gate] });

        let held = tokio::spawn(svc.call(testing::invocation("first")));
        assert_eq!(svc.stats().in_flight, 1);

        let err = svc.call(testing::invocation("second")).await.unwrap_err();
        assert!(matches!(err, InvocationError::Overloaded));
        let err = svc.call(outbound("third")).await.unwrap_err();
        assert!(matches!(err, InvocationError::Overloaded));

        let stats = svc.stats();
        assert_eq!((stats.shed_inbound, stats.shed_outbound), (1, 1));

        release.send(()).unwrap();
        assert_eq!(held.await.unwrap().unwrap().body, "first");

        assert_eq!(svc.stats().in_flight, 0);
        assert!(svc.call(testing::invocation("fourth")).await.is_ok());
        assert_eq!(layer.stats().admitted, 2);
    }

    #[tokio::test]
    async fn clones_share_one_budget() {
        let (_release, gate) = oneshot::channel::<()>();
        let layer = LoadShedLayer::new(1);
        let mut first = layer.layer(Gated { gates: vec![gate] });
        let mut second = layer.layer(Gated { gates: Vec::new() });

        let _held = tokio::spawn(first.call(testing::invocation("a")));
        let err = second.call(testing::invocation("b")).await.unwrap_err();
        assert!(matches!(err, InvocationError::Overloaded));
    }
}
