//! Tower middleware layers for the invocation pipeline.
//!
//! Outermost first: [`load_shed`] admits or rejects, [`metrics`] opens the
//! invocation span, and [`pipeline`] stacks both on the handler chain.

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::{LoadShedLayer, LoadStats};
pub use metrics::{MetricsLayer, Outcome};
pub use pipeline::{build_invocation_pipeline, InvocationPipeline};
