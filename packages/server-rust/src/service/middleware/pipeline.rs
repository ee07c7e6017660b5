//! Pipeline composition: wraps the handler chain in the tower layers.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::config::DispatchConfig;
use crate::service::chain::{ChainService, HandlerChain};

/// The composed invocation service returned by [`build_invocation_pipeline`].
pub type InvocationPipeline = LoadShedService<MetricsService<ChainService>>;

/// Build the invocation pipeline around `chain`.
///
/// Shed invocations never open a span; deadlines are enforced inside the
/// chain by `DeadlineHandler`.
#[must_use]
pub fn build_invocation_pipeline(
    chain: Arc<HandlerChain>,
    config: &DispatchConfig,
) -> InvocationPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_invocations))
        .layer(MetricsLayer)
        .service(ChainService::new(chain))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
