//! Client-side endpoint selection.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Endpoint;

/// Strategy for picking one endpoint out of a snapshot.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalance {
    #[default]
    RoundRobin,
    Random,
}

/// Stateful selector applying a [`LoadBalance`] strategy.
#[derive(Debug, Default)]
pub struct EndpointSelector {
    strategy: LoadBalance,
    next: AtomicUsize,
}

impl EndpointSelector {
    #[must_use]
    pub fn new(strategy: LoadBalance) -> Self {
        Self {
            strategy,
            next: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> LoadBalance {
        self.strategy
    }

    /// Picks an endpoint, or `None` for an empty list.
    pub fn select<'a>(&self, endpoints: &'a [Endpoint]) -> Option<&'a Endpoint> {
        if endpoints.is_empty() {
            return None;
        }
        let index = match self.strategy {
            LoadBalance::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % endpoints.len(),
            LoadBalance::Random => rand::rng().random_range(0..endpoints.len()),
        };
        endpoints.get(index)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::RawEndpoint;

    use super::*;
    use crate::endpoint::testing::EchoTransport;

    fn endpoints(n: usize) -> Vec<Endpoint> {
        let transport = Arc::new(EchoTransport("rest"));
        (0..n)
            .map(|i| Endpoint::new(transport.clone(), RawEndpoint::new(format!("rest://h{i}"))))
            .collect()
    }

    #[test]
    fn round_robin_cycles() {
        let selector = EndpointSelector::new(LoadBalance::RoundRobin);
        let list = endpoints(3);
        let picked: Vec<&str> = (0..4)
            .filter_map(|_| selector.select(&list))
            .map(Endpoint::address)
            .collect();
        assert_eq!(picked, vec!["rest://h0", "rest://h1", "rest://h2", "rest://h0"]);
    }

    #[test]
    fn random_stays_in_bounds() {
        let selector = EndpointSelector::new(LoadBalance::Random);
        let list = endpoints(2);
        for _ in 0..100 {
            assert!(selector.select(&list).is_some());
        }
    }

    #[test]
    fn empty_list_selects_nothing() {
        let selector = EndpointSelector::default();
        assert_eq!(selector.strategy(), LoadBalance::RoundRobin);
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn strategy_serde_names() {
        let parsed: LoadBalance = serde_json::from_str("\"round-robin\"").unwrap();
        assert_eq!(parsed, LoadBalance::RoundRobin);
        assert_eq!(serde_json::to_string(&LoadBalance::Random).unwrap(), "\"random\"");
    }
}
