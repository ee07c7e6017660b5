//! Inbound dispatch: HTTP request in, HTTP response out.
//!
//! Resolves the route, negotiates the response encoding, binds parameters
//! and pushes the resulting [`Invocation`] through the invocation pipeline.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use courier_core::context::{AUTH_TOKEN, CONTEXT_HEADER};
use courier_core::{
    InvocationContext, NegotiationError, ParamLocation, ParamType, ParameterBinding, PathValues,
};
use http::header::{ACCEPT, ALLOW, CONTENT_TYPE, COOKIE};
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use percent_encoding::percent_decode_str;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

use super::chain::HandlerChain;
use super::invocation::{Invocation, InvocationError, Response};
use super::middleware::{build_invocation_pipeline, InvocationPipeline, LoadStats};
use super::registry::{RouteError, RouteRegistry};
use crate::config::DispatchConfig;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Failure of one inbound request, before or during invocation.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    NotAcceptable(#[from] NegotiationError),
    #[error("missing required parameter `{name}`")]
    MissingParameter { name: String },
    #[error("parameter `{name}` is not valid UTF-8")]
    InvalidParameter { name: String },
    #[error("malformed x-courier-context header: {0}")]
    BadContext(#[source] serde_json::Error),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
}

impl DispatchError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Route(RouteError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Route(RouteError::MethodNotAllowed { .. }) => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Self::MissingParameter { .. }
            | Self::InvalidParameter { .. }
            | Self::BadContext(_) => StatusCode::BAD_REQUEST,
            Self::Invocation(e) => e.status(),
        }
    }

    fn into_response(self) -> http::Response<Bytes> {
        let status = self.status();
        let mut response = text_response(status, self.to_string());
        if let Self::Route(RouteError::MethodNotAllowed { allowed, .. }) = &self {
            if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
                response.headers_mut().insert(ALLOW, value);
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// `tower::Service` turning HTTP requests into invocations of registered
/// operations.
///
/// Never fails at the service level: every error becomes an HTTP response.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RouteRegistry>,
    pipeline: InvocationPipeline,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<RouteRegistry>,
        chain: Arc<HandlerChain>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            registry,
            pipeline: build_invocation_pipeline(chain, config),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// Admission budget shared by every clone of this dispatcher.
    #[must_use]
    pub fn load(&self) -> LoadStats {
        self.pipeline.stats()
    }

    /// Handles one request end to end.
    pub async fn dispatch(&self, request: Request<Bytes>) -> http::Response<Bytes> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let result = match self.prepare(request) {
            Ok(invocation) => self
                .pipeline
                .clone()
                .oneshot(invocation)
                .await
                .map_err(DispatchError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => into_http(response),
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    warn!(%method, %path, %status, error = %e, "dispatch failed");
                } else {
                    debug!(%method, %path, %status, error = %e, "request rejected");
                }
                e.into_response()
            }
        }
    }

    /// Resolve, negotiate and bind.
    fn prepare(&self, request: Request<Bytes>) -> Result<Invocation, DispatchError> {
        let (parts, body) = request.into_parts();
        let matched = self
            .registry
            .match_route(parts.uri.path(), parts.method.as_str())?;
        let route = matched.route;

        let accept = parts.headers.get(ACCEPT).and_then(|v| v.to_str().ok());
        let encoder = route.ensure_find_encoder(accept)?;

        let sources = Sources {
            path: &matched.values,
            query: parts.uri.query().unwrap_or_default().as_bytes(),
            headers: &parts.headers,
            form: is_form(&parts.headers).then_some(&body[..]).unwrap_or_default(),
            body: &body,
        };

        let mut arguments = Vec::with_capacity(route.parameters().len());
        for binding in route.parameters() {
            let value = sources.lookup(binding)?;
            let present = value.is_some() || (is_raw_body(binding) && !body.is_empty());
            if !present && binding.required {
                return Err(DispatchError::MissingParameter {
                    name: binding.name.clone(),
                });
            }
            arguments.push(value);
        }

        let context = request_context(&parts.headers)?;
        Ok(Invocation::producer(Arc::clone(&route), arguments, encoder)
            .with_context(context)
            .with_body(body))
    }
}

impl Service<Request<Bytes>> for Dispatcher {
    type Response = http::Response<Bytes>;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Infallible>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.dispatch(request).await) })
    }
}

// ---------------------------------------------------------------------------
// Parameter sources
// ---------------------------------------------------------------------------

struct Sources<'a> {
    path: &'a PathValues,
    query: &'a [u8],
    headers: &'a HeaderMap,
    /// Request body when it is `application/x-www-form-urlencoded`, else empty.
    form: &'a [u8],
    body: &'a Bytes,
}

impl Sources<'_> {
    fn lookup(&self, binding: &ParameterBinding) -> Result<Option<String>, DispatchError> {
        let name = binding.name.as_str();
        let invalid = || DispatchError::InvalidParameter {
            name: name.to_string(),
        };
        let value = match binding.location {
            ParamLocation::Path => match self.path.get(name) {
                Some(raw) => Some(
                    percent_decode_str(raw)
                        .decode_utf8()
                        .map_err(|_| invalid())?
                        .into_owned(),
                ),
                None => None,
            },
            ParamLocation::Query => urlencoded_value(self.query, name),
            ParamLocation::Form => urlencoded_value(self.form, name),
            ParamLocation::Header => match self.headers.get(name) {
                Some(value) => Some(value.to_str().map_err(|_| invalid())?.to_string()),
                None => None,
            },
            ParamLocation::Cookie => self
                .headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(|cookies| cookie_value(cookies, name)),
            // Raw bodies stay on `Invocation::body`.
            ParamLocation::Body if is_raw_body(binding) || self.body.is_empty() => None,
            ParamLocation::Body => Some(
                std::str::from_utf8(self.body)
                    .map_err(|_| invalid())?
                    .to_string(),
            ),
        };
        Ok(value)
    }
}

fn is_raw_body(binding: &ParameterBinding) -> bool {
    binding.location == ParamLocation::Body && binding.param_type == ParamType::Binary
}

/// First value of `name` in an `application/x-www-form-urlencoded` sequence.
fn urlencoded_value(input: &[u8], name: &str) -> Option<String> {
    form_urlencoded::parse(input)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Cookie values are opaque; they are returned as sent.
fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(FORM_URLENCODED))
}

/// Context from the `x-courier-context` JSON header plus the auth token header.
fn request_context(headers: &HeaderMap) -> Result<InvocationContext, DispatchError> {
    let mut context = match headers.get(CONTEXT_HEADER).map(HeaderValue::to_str) {
        Some(Ok(json)) => InvocationContext::from_json(json).map_err(DispatchError::BadContext)?,
        Some(Err(_)) | None => InvocationContext::new(),
    };
    if let Some(token) = headers.get(AUTH_TOKEN).and_then(|v| v.to_str().ok()) {
        context.insert(AUTH_TOKEN, token);
    }
    Ok(context)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn into_http(response: Response) -> http::Response<Bytes> {
    let mut http_response = http::Response::new(response.body);
    *http_response.status_mut() = response.status;
    if let Some(value) = response
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        http_response.headers_mut().insert(CONTENT_TYPE, value);
    }
    http_response
}

fn text_response(status: StatusCode, message: String) -> http::Response<Bytes> {
    let mut response = http::Response::new(Bytes::from(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
