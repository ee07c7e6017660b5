//! Invocation context: string key/value pairs carried through the handler chain.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Context key holding the caller's authentication token.
pub const AUTH_TOKEN: &str = "x-auth-token";

/// Request header carrying a JSON object of additional context entries.
pub const CONTEXT_HEADER: &str = "x-courier-context";

/// Context key holding the id of the node that originated the call.
pub const SOURCE_SERVICE: &str = "x-source-service";

/// Per-invocation context, readable and writable by every handler.
///
/// Serializes as a flat JSON object so it can travel in [`CONTEXT_HEADER`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationContext {
    entries: HashMap<String, String>,
}

impl InvocationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the JSON object form used by [`CONTEXT_HEADER`].
    ///
    /// # Errors
    ///
    /// Returns an error when `json` is not an object of string values.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Renders the context as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> String {
        // A map of strings always serializes.
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "{}".to_string())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Sets `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Copies every entry of `other` into `self`, overwriting on conflict.
    pub fn merge(&mut self, other: InvocationContext) {
        self.entries.extend(other.entries);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InvocationContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
