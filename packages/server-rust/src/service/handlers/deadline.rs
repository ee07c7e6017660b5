//! Per-invocation deadline enforcement.

use std::time::Duration;

use tracing::debug;

use crate::config::DispatchConfig;
use crate::service::chain::{Handler, Responder};
use crate::service::invocation::{Invocation, InvocationError};

/// Fails the invocation with [`InvocationError::Timeout`] when the rest of
/// the chain has not completed within the invocation's timeout, or the
/// configured default when it has none.
///
/// The handlers behind it keep running after a timeout; their late signals
/// are dropped.
#[derive(Debug, Clone)]
pub struct DeadlineHandler {
    default_timeout: Duration,
}

impl DeadlineHandler {
    pub const NAME: &'static str = "deadline";

    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Uses `default_timeout_ms` for invocations without their own timeout.
    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.default_timeout())
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

impl Handler for DeadlineHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handle(&self, invocation: Invocation, responder: Responder) {
        let timeout = invocation.timeout().unwrap_or(self.default_timeout);
        let completion = responder.completion();
        let invocation_id = invocation.id();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = completion.completed() => {}
                () = tokio::time::sleep(timeout) => {
                    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    if completion.fail(Self::NAME, InvocationError::Timeout { timeout_ms }) {
                        debug!(%invocation_id, timeout_ms, "invocation deadline exceeded");
                    }
                }
            }
        });

        responder.proceed(invocation);
    }
}
