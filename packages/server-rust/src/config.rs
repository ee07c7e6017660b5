use std::time::Duration;

use clap::Args;

use crate::endpoint::LoadBalance;

/// Dispatch-level configuration.
///
/// Controls invocation deadlines, concurrency limits, and outbound endpoint
/// selection. Every field can come from a flag or an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct DispatchConfig {
    /// Application the local microservice belongs to.
    #[arg(long, env = "COURIER_APP_ID", default_value = "default")]
    pub app_id: String,
    /// Name of the local microservice.
    #[arg(long, env = "COURIER_SERVICE_NAME", default_value = "")]
    pub microservice_name: String,
    /// Deadline for invocations without their own timeout, in milliseconds.
    #[arg(long, env = "COURIER_DEFAULT_TIMEOUT_MS", default_value_t = 30_000)]
    pub default_timeout_ms: u64,
    /// Maximum number of concurrent inbound invocations before load shedding.
    #[arg(long, env = "COURIER_MAX_CONCURRENT_INVOCATIONS", default_value_t = 1000)]
    pub max_concurrent_invocations: u32,
    /// Endpoint selection strategy for outbound calls.
    #[arg(
        long,
        env = "COURIER_LOAD_BALANCE",
        value_enum,
        default_value_t = LoadBalance::RoundRobin
    )]
    pub load_balance: LoadBalance,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            app_id: "default".to_string(),
            microservice_name: String::new(),
            default_timeout_ms: 30_000,
            max_concurrent_invocations: 1000,
            load_balance: LoadBalance::RoundRobin,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        dispatch: DispatchConfig,
    }

    #[test]
    fn flags_match_default() {
        let cli = Cli::try_parse_from(["courier"]).unwrap();
        assert_eq!(cli.dispatch, DispatchConfig::default());
        assert_eq!(cli.dispatch.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "courier",
            "--app-id",
            "shop",
            "--microservice-name",
            "orders",
            "--default-timeout-ms",
            "250",
            "--max-concurrent-invocations",
            "8",
            "--load-balance",
            "random",
        ])
        .unwrap();
        assert_eq!(cli.dispatch.app_id, "shop");
        assert_eq!(cli.dispatch.microservice_name, "orders");
        assert_eq!(cli.dispatch.default_timeout(), Duration::from_millis(250));
        assert_eq!(cli.dispatch.max_concurrent_invocations, 8);
        assert_eq!(cli.dispatch.load_balance, LoadBalance::Random);
    }

    #[test]
    fn flags_reach_handlers() {
        use std::sync::Arc;

        use crate::endpoint::cache::tests::StaticRegistry;
        use crate::endpoint::testing::table;
        use crate::endpoint::EndpointCache;
        use crate::service::handlers::{DeadlineHandler, TransportHandler};

        let cli = Cli::try_parse_from([
            "courier",
            "--default-timeout-ms",
            "1500",
            "--load-balance",
            "random",
        ])
        .unwrap();
        let cache = Arc::new(EndpointCache::new(
            Arc::new(StaticRegistry::default()),
            table(&["rest"]),
        ));

        let deadline = DeadlineHandler::from_config(&cli.dispatch);
        assert_eq!(deadline.default_timeout(), Duration::from_millis(1500));
        let transport = TransportHandler::from_config(cache, &cli.dispatch);
        assert_eq!(transport.strategy(), LoadBalance::Random);
    }
}
