//! Operation metadata: declared schemas and compiled routes.
//!
//! A [`ServiceSchema`] is what a metadata provider hands over; an
//! [`OperationRoute`] is the immutable, validated form used at request time.
//! All validation happens in [`OperationRoute::new`], so a route that exists
//! is always usable.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::encoding::{EncoderRegistry, EncodingNegotiator, Encoder, NegotiationError};
use crate::path::{concat_path, PathError, PathTemplate, PathValues};

// ---------------------------------------------------------------------------
// Declared schema
// ---------------------------------------------------------------------------

/// Where a parameter value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
    Form,
    Body,
}

/// Declared parameter type tag, used to pick a value decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Binary,
}

/// One declared operation parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParamLocation,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
}

/// One declared operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSchema {
    pub operation_id: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSchema>,
    /// Parameter count of the handler signature serving this operation.
    /// `None` when the provider has no separate signature information.
    #[serde(default)]
    pub signature_arity: Option<usize>,
    /// Declared response encodings; empty means "inherit".
    #[serde(default)]
    pub produces: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Everything a metadata provider declares for one service schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSchema {
    #[serde(default)]
    pub schema_id: String,
    #[serde(default)]
    pub base_path: String,
    /// Schema-level encodings used by operations that declare none.
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub operations: Vec<OperationSchema>,
}

// ---------------------------------------------------------------------------
// RegistrationError
// ---------------------------------------------------------------------------

/// Startup-time failure that keeps one operation out of the route registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("operation {operation_id}: invalid path {path:?}: {source}")]
    InvalidPath {
        operation_id: String,
        path: String,
        #[source]
        source: PathError,
    },
    #[error(
        "operation {operation_id}: {declared} declared parameters, signature takes {signature}"
    )]
    ParameterCountMismatch {
        operation_id: String,
        declared: usize,
        signature: usize,
    },
    #[error("operation {operation_id}: duplicate parameter `{name}`")]
    DuplicateParameter { operation_id: String, name: String },
    #[error("operation {operation_id}: path variable `{name}` has no path parameter")]
    UnboundPathVariable { operation_id: String, name: String },
    #[error("operation {operation_id}: {method} {path} is already registered")]
    DuplicateRoute {
        operation_id: String,
        method: String,
        path: String,
    },
    #[error("operation id {operation_id} is already registered")]
    DuplicateOperationId { operation_id: String },
}

// ---------------------------------------------------------------------------
// OperationRoute
// ---------------------------------------------------------------------------

/// A parameter bound to its source location and signature position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBinding {
    pub index: usize,
    pub name: String,
    pub location: ParamLocation,
    pub param_type: ParamType,
    pub required: bool,
}

/// Compiled, validated metadata for one operation.
#[derive(Debug)]
pub struct OperationRoute {
    operation_id: String,
    http_method: String,
    absolute_path: String,
    template: PathTemplate,
    parameters: Vec<ParameterBinding>,
    by_name: HashMap<String, usize>,
    negotiator: EncodingNegotiator,
}

impl OperationRoute {
    /// Validates `op` and compiles it under `base_path`.
    ///
    /// `inherited_produces` applies when `op` declares no encodings of its
    /// own; when both are empty the operation supports every encoder in
    /// `encoders`.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistrationError`] for an uncompilable path, a parameter
    /// count that disagrees with the signature, duplicate parameter names, or
    /// a path variable without a path parameter.
    pub fn new(
        base_path: &str,
        inherited_produces: &[String],
        op: &OperationSchema,
        encoders: &EncoderRegistry,
    ) -> Result<Self, RegistrationError> {
        let operation_id = op.operation_id.clone();
        let absolute_path = concat_path(base_path, &op.path);
        let template =
            PathTemplate::compile(&absolute_path).map_err(|source| RegistrationError::InvalidPath {
                operation_id: operation_id.clone(),
                path: absolute_path.clone(),
                source,
            })?;

        let signature = op.signature_arity.unwrap_or(op.parameters.len());
        if signature != op.parameters.len() {
            return Err(RegistrationError::ParameterCountMismatch {
                operation_id,
                declared: op.parameters.len(),
                signature,
            });
        }

        let mut parameters = Vec::with_capacity(op.parameters.len());
        let mut by_name = HashMap::with_capacity(op.parameters.len());
        for (index, p) in op.parameters.iter().enumerate() {
            if by_name.insert(p.name.clone(), index).is_some() {
                return Err(RegistrationError::DuplicateParameter {
                    operation_id,
                    name: p.name.clone(),
                });
            }
            parameters.push(ParameterBinding {
                index,
                name: p.name.clone(),
                location: p.location,
                param_type: p.param_type,
                required: p.required || p.location == ParamLocation::Path,
            });
        }

        for var in template.variables() {
            let bound = by_name
                .get(var)
                .is_some_and(|&i| parameters[i].location == ParamLocation::Path);
            if !bound {
                return Err(RegistrationError::UnboundPathVariable {
                    operation_id,
                    name: var.clone(),
                });
            }
        }

        let declared: &[String] = if op.produces.is_empty() {
            inherited_produces
        } else {
            &op.produces
        };
        let negotiator = EncodingNegotiator::new(declared, encoders);

        Ok(Self {
            operation_id,
            http_method: op.method.to_ascii_uppercase(),
            absolute_path,
            template,
            parameters,
            by_name,
            negotiator,
        })
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Upper-case HTTP method.
    #[must_use]
    pub fn http_method(&self) -> &str {
        &self.http_method
    }

    #[must_use]
    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }

    #[must_use]
    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.template.is_static()
    }

    #[must_use]
    pub fn parameters(&self) -> &[ParameterBinding] {
        &self.parameters
    }

    #[must_use]
    pub fn param_by_index(&self, index: usize) -> Option<&ParameterBinding> {
        self.parameters.get(index)
    }

    #[must_use]
    pub fn param_by_name(&self, name: &str) -> Option<&ParameterBinding> {
        self.by_name.get(name).map(|&i| &self.parameters[i])
    }

    #[must_use]
    pub fn negotiator(&self) -> &EncodingNegotiator {
        &self.negotiator
    }

    /// Chooses the response encoder for `accept`.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::NotAcceptable`] when nothing fits.
    pub fn ensure_find_encoder(
        &self,
        accept: Option<&str>,
    ) -> Result<Arc<dyn Encoder>, NegotiationError> {
        self.negotiator.ensure_find_encoder(accept)
    }

    /// Builds the concrete path for an outbound call.
    ///
    /// `args` are positional, one per parameter binding; only path-located
    /// bindings are consulted.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::MissingValue`] when a path argument is absent.
    pub fn build_outbound_path(&self, args: &[Option<String>]) -> Result<String, PathError> {
        let mut values = PathValues::new();
        for binding in &self.parameters {
            if binding.location != ParamLocation::Path {
                continue;
            }
            if let Some(Some(value)) = args.get(binding.index) {
                values.insert(binding.name.clone(), value.clone());
            }
        }
        self.template.build(&values)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
