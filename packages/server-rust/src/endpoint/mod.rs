//! Endpoint resolution for outbound calls.
//!
//! - `Endpoint`: a raw registry address paired with the transport that reaches it
//! - `TransportTable`: in-process [`TransportRegistry`]
//! - `cache`: per-service-key endpoint snapshots
//! - `watcher`: background task applying registry pushes to the cache
//! - `balance`: endpoint selection strategies

pub mod balance;
pub mod cache;
pub mod watcher;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use courier_core::{RawEndpoint, ServiceKey};
use dashmap::DashMap;
use http::StatusCode;

use crate::traits::{Transport, TransportRegistry};

pub use balance::{EndpointSelector, LoadBalance};
pub use cache::{EndpointCache, EndpointSnapshot};
pub use watcher::{RegistryEvent, RegistryWatcher};

// ---------------------------------------------------------------------------
// EndpointError
// ---------------------------------------------------------------------------

/// Failure to produce connectable endpoints for a service key.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("service {0} is unknown to the registry")]
    UnknownService(ServiceKey),
    #[error("service {0} has no available endpoints")]
    NoEndpoints(ServiceKey),
    #[error("service registry unavailable: {0}")]
    RegistryUnavailable(#[source] anyhow::Error),
    #[error("no transport registered under `{0}`")]
    UnknownTransport(String),
}

impl EndpointError {
    /// HTTP status reported when an invocation fails with this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnknownService(_) | Self::NoEndpoints(_) | Self::RegistryUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A connectable address bound to the transport that reaches it.
#[derive(Clone)]
pub struct Endpoint {
    transport: Arc<dyn Transport>,
    address: String,
    metadata: BTreeMap<String, String>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("transport", &self.transport.name())
            .field("address", &self.address)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.metadata == other.metadata
            && self.transport.name() == other.transport.name()
    }
}

impl Eq for Endpoint {}

impl Endpoint {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, raw: RawEndpoint) -> Self {
        Self {
            transport,
            address: raw.address,
            metadata: raw.metadata,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

// ---------------------------------------------------------------------------
// TransportTable
// ---------------------------------------------------------------------------

/// Transports registered in this process, keyed by name.
#[derive(Default)]
pub struct TransportTable {
    transports: DashMap<String, Arc<dyn Transport>>,
}

impl fmt::Debug for TransportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.transports.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("TransportTable").field("transports", &names).finish()
    }
}

impl TransportTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport under its own name, replacing any previous one.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        self.transports
            .insert(transport.name().to_string(), transport);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl TransportRegistry for TransportTable {
    fn find(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).map(|t| Arc::clone(t.value()))
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
