//! Response encoders and accept-header negotiation.
//!
//! The [`EncoderRegistry`] is the process-wide table of encoders, built once at
//! startup and passed explicitly to every [`EncodingNegotiator`]. Each
//! operation owns a negotiator holding the subset of encoders it supports.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Accept token meaning "any media type".
pub const WILDCARD: &str = "*/*";
/// JSON media type; the canonical default encoding.
pub const APPLICATION_JSON: &str = "application/json";
/// Plain text media type.
pub const TEXT_PLAIN: &str = "text/plain";

/// Serializes response values into one wire format.
pub trait Encoder: Send + Sync + fmt::Debug {
    /// Encoding identifier, normally a `type/subtype` media type.
    fn name(&self) -> &str;

    /// Encodes a response value.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be represented in this format.
    fn encode(&self, value: &serde_json::Value) -> anyhow::Result<Vec<u8>>;
}

/// `application/json` encoder backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn name(&self) -> &str {
        APPLICATION_JSON
    }

    fn encode(&self, value: &serde_json::Value) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }
}

/// `text/plain` encoder. Strings are written verbatim, everything else as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextPlainEncoder;

impl Encoder for TextPlainEncoder {
    fn name(&self) -> &str {
        TEXT_PLAIN
    }

    fn encode(&self, value: &serde_json::Value) -> anyhow::Result<Vec<u8>> {
        match value {
            serde_json::Value::String(s) => Ok(s.clone().into_bytes()),
            other => Ok(other.to_string().into_bytes()),
        }
    }
}

/// Errors from building an [`EncoderRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("no encoders registered")]
    NoEncoders,
    #[error("default encoding `{name}` is not registered")]
    UnknownDefault { name: String },
}

/// Per-request negotiation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("no acceptable encoding for accept header {accept:?}")]
    NotAcceptable { accept: String },
}

// ---------------------------------------------------------------------------
// EncoderRegistry
// ---------------------------------------------------------------------------

/// Global encoder table with a designated canonical default.
///
/// Read-only once built; share it behind an `Arc`.
pub struct EncoderRegistry {
    encoders: Vec<Arc<dyn Encoder>>,
    index: HashMap<String, usize>,
    default_index: usize,
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderRegistry")
            .field("encoders", &self.names().collect::<Vec<_>>())
            .field("default", &self.canonical_default_name())
            .finish()
    }
}

impl EncoderRegistry {
    #[must_use]
    pub fn builder() -> EncoderRegistryBuilder {
        EncoderRegistryBuilder::default()
    }

    /// Registry with the JSON (default) and plain-text encoders.
    #[must_use]
    pub fn with_defaults() -> Self {
        let encoders: Vec<Arc<dyn Encoder>> = vec![
            Arc::new(JsonEncoder) as Arc<dyn Encoder>,
            Arc::new(TextPlainEncoder),
        ];
        let index = encoders
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name().to_string(), i))
            .collect();
        Self {
            encoders,
            index,
            default_index: 0,
        }
    }

    /// Looks up an encoder by its exact identifier.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<dyn Encoder>> {
        self.index.get(name).map(|&i| Arc::clone(&self.encoders[i]))
    }

    #[must_use]
    pub fn canonical_default(&self) -> Arc<dyn Encoder> {
        Arc::clone(&self.encoders[self.default_index])
    }

    #[must_use]
    pub fn canonical_default_name(&self) -> &str {
        self.encoders[self.default_index].name()
    }

    /// All encoders in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Encoder>> {
        self.encoders.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.encoders.iter().map(|e| e.name())
    }
}

/// Collects encoders before freezing them into an [`EncoderRegistry`].
pub struct EncoderRegistryBuilder {
    encoders: Vec<Arc<dyn Encoder>>,
    default_name: String,
}

impl Default for EncoderRegistryBuilder {
    fn default() -> Self {
        Self {
            encoders: Vec::new(),
            default_name: APPLICATION_JSON.to_string(),
        }
    }
}

impl EncoderRegistryBuilder {
    /// Adds an encoder. A later encoder with the same name replaces the earlier one.
    #[must_use]
    pub fn register(mut self, encoder: Arc<dyn Encoder>) -> Self {
        match self.encoders.iter().position(|e| e.name() == encoder.name()) {
            Some(pos) => self.encoders[pos] = encoder,
            None => self.encoders.push(encoder),
        }
        self
    }

    /// Designates the canonical default encoding. Defaults to `application/json`.
    #[must_use]
    pub fn default_encoding(mut self, name: impl Into<String>) -> Self {
        self.default_name = name.into();
        self
    }

    /// # Errors
    ///
    /// Fails when no encoder is registered or the default is not among them.
    pub fn build(self) -> Result<EncoderRegistry, EncodingError> {
        if self.encoders.is_empty() {
            return Err(EncodingError::NoEncoders);
        }
        let index: HashMap<String, usize> = self
            .encoders
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name().to_string(), i))
            .collect();
        let default_index = *index
            .get(&self.default_name)
            .ok_or(EncodingError::UnknownDefault {
                name: self.default_name,
            })?;
        Ok(EncoderRegistry {
            encoders: self.encoders,
            index,
            default_index,
        })
    }
}

// ---------------------------------------------------------------------------
// EncodingNegotiator
// ---------------------------------------------------------------------------

/// Per-operation encoder selection.
pub struct EncodingNegotiator {
    /// Supported encoders in declaration order, keyed by declared identifier.
    supported: Vec<(String, Arc<dyn Encoder>)>,
    default_encoding: Option<Arc<dyn Encoder>>,
    canonical_name: String,
    canonical: Arc<dyn Encoder>,
}

impl fmt::Debug for EncodingNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodingNegotiator")
            .field("supported", &self.supported_names().collect::<Vec<_>>())
            .field("default", &self.default_encoding.as_ref().map(|e| e.name()))
            .finish_non_exhaustive()
    }
}

impl EncodingNegotiator {
    /// Builds the negotiator for an operation declaring `declared` encodings.
    ///
    /// An empty declaration inherits every registered encoder. Declared
    /// identifiers unknown to the registry are dropped with a warning.
    #[must_use]
    pub fn new(declared: &[String], registry: &EncoderRegistry) -> Self {
        let mut supported: Vec<(String, Arc<dyn Encoder>)> = Vec::new();
        if declared.is_empty() {
            supported.extend(registry.iter().map(|e| (e.name().to_string(), Arc::clone(e))));
        } else {
            for name in declared {
                if supported.iter().any(|(n, _)| n == name) {
                    continue;
                }
                match registry.find(name) {
                    Some(encoder) => supported.push((name.clone(), encoder)),
                    None => tracing::warn!(encoding = %name, "encoding is not supported, dropped"),
                }
            }
        }

        let canonical_name = registry.canonical_default_name().to_string();
        let default_encoding = supported
            .iter()
            .find(|(n, _)| *n == canonical_name)
            .or_else(|| supported.first())
            .map(|(_, e)| Arc::clone(e));

        Self {
            supported,
            default_encoding,
            canonical_name,
            canonical: registry.canonical_default(),
        }
    }

    /// The encoder used when the client expresses no usable preference.
    #[must_use]
    pub fn default_encoding(&self) -> Option<&Arc<dyn Encoder>> {
        self.default_encoding.as_ref()
    }

    /// Looks up a supported encoder by its declared identifier.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Arc<dyn Encoder>> {
        self.supported.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn supported_names(&self) -> impl Iterator<Item = &str> {
        self.supported.iter().map(|(n, _)| n.as_str())
    }

    /// Picks the response encoder for an accept header.
    ///
    /// An absent or empty header and a `*/*` token both yield the default
    /// encoding. A token naming the canonical default encoding yields the
    /// registry's canonical encoder even when this operation does not list
    /// it. Otherwise the first token, in client order, that this operation
    /// supports wins. `None` means nothing is acceptable.
    #[must_use]
    pub fn select(&self, accept: Option<&str>) -> Option<Arc<dyn Encoder>> {
        let accept = match accept {
            None | Some("") => return self.default_encoding.clone(),
            Some(accept) => accept,
        };

        let types = split_accept_types(accept);
        if types.iter().any(|t| *t == WILDCARD) {
            return self.default_encoding.clone();
        }
        if types.iter().any(|t| *t == self.canonical_name) {
            return Some(Arc::clone(&self.canonical));
        }
        types
            .iter()
            .find_map(|t| self.find(t))
            .map(Arc::clone)
    }

    /// Like [`select`](Self::select) but reports a miss as an error.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::NotAcceptable`] when no encoder fits.
    pub fn ensure_find_encoder(
        &self,
        accept: Option<&str>,
    ) -> Result<Arc<dyn Encoder>, NegotiationError> {
        self.select(accept).ok_or_else(|| NegotiationError::NotAcceptable {
            accept: accept.unwrap_or_default().to_string(),
        })
    }
}

/// Splits an accept header into bare media types, client order preserved.
///
/// Parameters such as `q=0.9` or `charset=utf-8` are discarded: of the
/// `;`-separated pieces of each token, the first containing `/` is kept.
#[must_use]
pub fn split_accept_types(accept: &str) -> Vec<&str> {
    accept
        .split(',')
        .map(|token| {
            token
                .split(';')
                .find(|piece| piece.contains('/'))
                .unwrap_or(token)
                .trim()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
