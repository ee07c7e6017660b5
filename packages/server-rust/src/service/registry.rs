//! Route registry: resolves inbound `(path, method)` pairs to operations.
//!
//! Built once at startup through [`RouteRegistryBuilder`] and shared
//! immutably afterwards.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use courier_core::{
    normalize_path, EncoderRegistry, OperationRoute, OperationSchema, PathValues,
    RegistrationError,
};
use tracing::{error, info};

use crate::traits::SchemaProvider;

// ---------------------------------------------------------------------------
// RouteMatch / RouteError
// ---------------------------------------------------------------------------

/// A resolved route with the values captured from the request path.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<OperationRoute>,
    pub values: PathValues,
}

/// Failure to resolve a request to an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no operation matches {path}")]
    NotFound { path: String },
    #[error("{method} is not allowed on {path}")]
    MethodNotAllowed {
        path: String,
        method: String,
        /// Methods that would have matched, in match order.
        allowed: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// RouteRegistry
// ---------------------------------------------------------------------------

/// Immutable snapshot of every registered operation.
///
/// Static paths are looked up by exact normalized path. Dynamic templates are
/// tried afterwards, most specific first: more literal characters, then fewer
/// variables.
pub struct RouteRegistry {
    static_routes: HashMap<String, Vec<Arc<OperationRoute>>>,
    dynamic_routes: Vec<Arc<OperationRoute>>,
    by_operation_id: HashMap<String, Arc<OperationRoute>>,
    encoders: Arc<EncoderRegistry>,
}

impl fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("operations", &self.by_operation_id.len())
            .field("dynamic", &self.dynamic_routes.len())
            .finish_non_exhaustive()
    }
}

impl RouteRegistry {
    #[must_use]
    pub fn builder(encoders: Arc<EncoderRegistry>) -> RouteRegistryBuilder {
        RouteRegistryBuilder::new(encoders)
    }

    /// Resolves a request path and method.
    ///
    /// The path is normalized first, so `/a/b` and `/a//b/` are equivalent.
    /// Method comparison is case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::MethodNotAllowed`] when the path matches only
    /// under other methods, and [`RouteError::NotFound`] otherwise.
    pub fn match_route(&self, path: &str, method: &str) -> Result<RouteMatch, RouteError> {
        let normalized = normalize_path(path);
        let method = method.to_ascii_uppercase();
        let mut allowed = Vec::new();

        if let Some(routes) = self.static_routes.get(&normalized) {
            for route in routes {
                if route.http_method() == method {
                    return Ok(RouteMatch {
                        route: Arc::clone(route),
                        values: PathValues::new(),
                    });
                }
                allowed.push(route.http_method().to_string());
            }
        }

        for route in &self.dynamic_routes {
            let Some(values) = route.template().matches(&normalized) else {
                continue;
            };
            if route.http_method() == method {
                return Ok(RouteMatch {
                    route: Arc::clone(route),
                    values,
                });
            }
            allowed.push(route.http_method().to_string());
        }

        if allowed.is_empty() {
            Err(RouteError::NotFound { path: normalized })
        } else {
            Err(RouteError::MethodNotAllowed {
                path: normalized,
                method,
                allowed,
            })
        }
    }

    /// Looks up an operation by id, as used by outbound clients.
    #[must_use]
    pub fn get(&self, operation_id: &str) -> Option<Arc<OperationRoute>> {
        self.by_operation_id.get(operation_id).cloned()
    }

    #[must_use]
    pub fn encoders(&self) -> &Arc<EncoderRegistry> {
        &self.encoders
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_operation_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_operation_id.is_empty()
    }

    /// Every operation, ordered by id.
    pub fn operations(&self) -> impl Iterator<Item = &Arc<OperationRoute>> {
        let mut routes: Vec<_> = self.by_operation_id.values().collect();
        routes.sort_by(|a, b| a.operation_id().cmp(b.operation_id()));
        routes.into_iter()
    }
}

// ---------------------------------------------------------------------------
// RouteRegistryBuilder
// ---------------------------------------------------------------------------

/// Collects operations before freezing them into a [`RouteRegistry`].
///
/// A failed registration leaves the builder exactly as it was.
pub struct RouteRegistryBuilder {
    encoders: Arc<EncoderRegistry>,
    routes: Vec<Arc<OperationRoute>>,
    /// `(method, path shape)` pairs already taken.
    shapes: HashSet<(String, String)>,
    operation_ids: HashSet<String>,
}

impl RouteRegistryBuilder {
    #[must_use]
    pub fn new(encoders: Arc<EncoderRegistry>) -> Self {
        Self {
            encoders,
            routes: Vec::new(),
            shapes: HashSet::new(),
            operation_ids: HashSet::new(),
        }
    }

    /// Registers one operation.
    ///
    /// # Errors
    ///
    /// Returns the [`RegistrationError`] that kept the operation out; it is
    /// also logged.
    pub fn register(
        &mut self,
        base_path: &str,
        inherited_produces: &[String],
        operation: &OperationSchema,
    ) -> Result<Arc<OperationRoute>, RegistrationError> {
        let result = self.try_register(base_path, inherited_produces, operation);
        if let Err(e) = &result {
            error!(
                operation = %operation.operation_id,
                error = %e,
                "operation registration failed"
            );
        }
        result
    }

    fn try_register(
        &mut self,
        base_path: &str,
        inherited_produces: &[String],
        operation: &OperationSchema,
    ) -> Result<Arc<OperationRoute>, RegistrationError> {
        let route = OperationRoute::new(base_path, inherited_produces, operation, &self.encoders)?;

        if self.operation_ids.contains(route.operation_id()) {
            return Err(RegistrationError::DuplicateOperationId {
                operation_id: route.operation_id().to_string(),
            });
        }
        let shape = (route.http_method().to_string(), path_shape(route.absolute_path()));
        if self.shapes.contains(&shape) {
            return Err(RegistrationError::DuplicateRoute {
                operation_id: route.operation_id().to_string(),
                method: shape.0,
                path: route.absolute_path().to_string(),
            });
        }

        let route = Arc::new(route);
        self.operation_ids.insert(route.operation_id().to_string());
        self.shapes.insert(shape);
        self.routes.push(Arc::clone(&route));
        Ok(route)
    }

    /// Registers every operation of `schema`, continuing past failures.
    ///
    /// Returns the errors for the operations that were skipped.
    pub fn register_schema(&mut self, schema: &dyn SchemaProvider) -> Vec<RegistrationError> {
        let mut errors = Vec::new();
        for operation in schema.operations() {
            if let Err(e) = self.register(schema.base_path(), schema.produces(), operation) {
                errors.push(e);
            }
        }
        info!(
            schema = schema.schema_id(),
            registered = schema.operations().len() - errors.len(),
            failed = errors.len(),
            "schema registered"
        );
        errors
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    #[must_use]
    pub fn build(self) -> RouteRegistry {
        let mut static_routes: HashMap<String, Vec<Arc<OperationRoute>>> = HashMap::new();
        let mut dynamic_routes = Vec::new();
        let mut by_operation_id = HashMap::new();

        for route in self.routes {
            by_operation_id.insert(route.operation_id().to_string(), Arc::clone(&route));
            if route.is_static() {
                static_routes
                    .entry(route.absolute_path().to_string())
                    .or_default()
                    .push(route);
            } else {
                dynamic_routes.push(route);
            }
        }
        dynamic_routes.sort_by(|a, b| {
            let (ta, tb) = (a.template(), b.template());
            tb.static_char_count()
                .cmp(&ta.static_char_count())
                .then(ta.variables().len().cmp(&tb.variables().len()))
                .then(a.absolute_path().cmp(b.absolute_path()))
        });

        RouteRegistry {
            static_routes,
            dynamic_routes,
            by_operation_id,
            encoders: self.encoders,
        }
    }
}

/// Path with every variable segment replaced by `{}`, so `/a/{x}/` and
/// `/a/{y}/` collide.
fn path_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| if segment.starts_with('{') { "{}" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::{ParamLocation, ParamType, ParameterSchema, ServiceSchema};

    use super::*;

    fn path_param(name: &str) -> ParameterSchema {
        ParameterSchema {
            name: name.to_string(),
            location: ParamLocation::Path,
            param_type: ParamType::String,
            required: true,
        }
    }

    fn op(id: &str, method: &str, path: &str, params: &[&str]) -> OperationSchema {
        OperationSchema {
            operation_id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            parameters: params.iter().map(|p| path_param(p)).collect(),
            signature_arity: None,
            produces: Vec::new(),
        }
    }

    fn registry(ops: &[OperationSchema]) -> RouteRegistry {
        let mut builder = RouteRegistry::builder(Arc::new(EncoderRegistry::with_defaults()));
        for op in ops {
            builder.register("/api", &[], op).unwrap();
        }
        builder.build()
    }

    #[test]
    fn static_and_dynamic_routes_resolve() {
        let registry = registry(&[
            op("listUsers", "GET", "/users", &[]),
            op("getUser", "GET", "/users/{id}", &["id"]),
        ]);

        let m = registry.match_route("/api/users", "get").unwrap();
        assert_eq!(m.route.operation_id(), "listUsers");
        assert!(m.values.is_empty());

        let m = registry.match_route("/api//users/42", "GET").unwrap();
        assert_eq!(m.route.operation_id(), "getUser");
        assert_eq!(m.values.get("id"), Some("42"));
    }

    #[test]
    fn static_path_wins_over_template() {
        let registry = registry(&[
            op("getUser", "GET", "/users/{id}", &["id"]),
            op("me", "GET", "/users/me", &[]),
        ]);
        let matched = registry.match_route("/api/users/me/", "GET").unwrap();
        assert_eq!(matched.route.operation_id(), "me");
        assert_eq!(
            registry.match_route("/api/users/you/", "GET").unwrap().route.operation_id(),
            "getUser"
        );
    }

    #[test]
    fn more_specific_template_wins() {
        let registry = registry(&[
            op("anyPart", "GET", "/files/{name}/{part}", &["name", "part"]),
            op("rawPart", "GET", "/files/{name}/raw", &["name"]),
        ]);
        let m = registry.match_route("/api/files/a.txt/raw", "GET").unwrap();
        assert_eq!(m.route.operation_id(), "rawPart");
        let m = registry.match_route("/api/files/a.txt/head", "GET").unwrap();
        assert_eq!(m.route.operation_id(), "anyPart");
        assert_eq!(m.values.get("part"), Some("head"));
    }

    #[test]
    fn wrong_method_and_unknown_path() {
        let registry = registry(&[
            op("getUser", "GET", "/users/{id}", &["id"]),
            op("deleteUser", "DELETE", "/users/{id}", &["id"]),
        ]);

        match registry.match_route("/api/users/1", "PUT").unwrap_err() {
            RouteError::MethodNotAllowed { method, allowed, .. } => {
                assert_eq!(method, "PUT");
                assert_eq!(allowed.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            registry.match_route("/api/orders", "GET").unwrap_err(),
            RouteError::NotFound {
                path: "/api/orders/".to_string()
            }
        );
        // Segment-bounded: a variable never spans two segments.
        assert!(registry.match_route("/api/users/1/2", "GET").is_err());
    }

    #[test]
    fn parameter_count_mismatch_leaves_registry_unchanged() {
        let mut builder = RouteRegistry::builder(Arc::new(EncoderRegistry::with_defaults()));
        builder.register("", &[], &op("ok", "GET", "/ok", &[])).unwrap();

        let mut bad = op("bad", "GET", "/bad/{id}", &["id"]);
        bad.signature_arity = Some(2);
        let err = builder.register("", &[], &bad).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::ParameterCountMismatch {
                declared: 1,
                signature: 2,
                ..
            }
        ));
        assert_eq!(builder.len(), 1);

        let registry = builder.build();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("bad").is_none());
        assert!(matches!(
            registry.match_route("/bad/1", "GET"),
            Err(RouteError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut builder = RouteRegistry::builder(Arc::new(EncoderRegistry::with_defaults()));
        builder.register("", &[], &op("a", "GET", "/x/{id}", &["id"])).unwrap();

        let err = builder
            .register("", &[], &op("b", "GET", "/x/{other}", &["other"]))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateRoute { .. }));

        let err = builder.register("", &[], &op("a", "POST", "/y", &[])).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateOperationId { .. }));

        // Same path under another method is fine.
        builder.register("", &[], &op("c", "PUT", "/x/{id}", &["id"])).unwrap();
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn register_schema_skips_bad_operations() {
        let schema = ServiceSchema {
            schema_id: "users".to_string(),
            base_path: "/users".to_string(),
            produces: vec!["text/plain".to_string()],
            operations: vec![
                op("list", "GET", "/", &[]),
                op("broken", "GET", "/{id", &[]),
                op("get", "GET", "/{id}", &["id"]),
            ],
        };
        let mut builder = RouteRegistry::builder(Arc::new(EncoderRegistry::with_defaults()));
        let errors = builder.register_schema(&schema);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], RegistrationError::InvalidPath { .. }));

        let registry = builder.build();
        let ids: Vec<&str> = registry.operations().map(|r| r.operation_id()).collect();
        assert_eq!(ids, vec!["get", "list"]);
        let list = registry.get("list").unwrap();
        assert_eq!(list.absolute_path(), "/users/");
        let names: Vec<&str> = list.negotiator().supported_names().collect();
        assert_eq!(names, vec!["text/plain"]);
    }
}
