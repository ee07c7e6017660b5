//! Logical service keys and raw endpoint descriptors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version rule matching whatever version the registry considers current.
pub const LATEST_VERSION: &str = "latest";

/// Identifies a resolvable set of endpoints: application, service name,
/// version rule, and transport. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    app_id: String,
    microservice_name: String,
    version_rule: String,
    transport_name: String,
}

impl ServiceKey {
    #[must_use]
    pub fn new(
        app_id: impl Into<String>,
        microservice_name: impl Into<String>,
        version_rule: impl Into<String>,
        transport_name: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            microservice_name: microservice_name.into(),
            version_rule: version_rule.into(),
            transport_name: transport_name.into(),
        }
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    #[must_use]
    pub fn microservice_name(&self) -> &str {
        &self.microservice_name
    }

    #[must_use]
    pub fn version_rule(&self) -> &str {
        &self.version_rule
    }

    #[must_use]
    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{} ({})",
            self.app_id, self.microservice_name, self.version_rule, self.transport_name
        )
    }
}

/// Endpoint descriptor as reported by the service registry.
///
/// `address` is usually a URI such as `rest://10.0.0.7:8080`; addresses
/// without a scheme are accepted for every transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEndpoint {
    pub address: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RawEndpoint {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// The URI scheme of `address`, if any.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.address.split_once("://").map(|(scheme, _)| scheme)
    }
}
