//! Token authentication.

use std::sync::Arc;

use courier_core::context::AUTH_TOKEN;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::service::chain::{Handler, Responder};
use crate::service::invocation::{Invocation, InvocationError};
use crate::traits::TokenValidator;

/// Rejects invocations whose context lacks a valid `x-auth-token`.
pub struct AuthHandler {
    validator: Arc<dyn TokenValidator>,
}

impl AuthHandler {
    pub const NAME: &'static str = "auth";

    #[must_use]
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }
}

impl Handler for AuthHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handle(&self, invocation: Invocation, responder: Responder) {
        let accepted = invocation
            .context()
            .get(AUTH_TOKEN)
            .is_some_and(|token| self.validator.validate(token));
        if accepted {
            responder.proceed(invocation);
        } else {
            debug!(
                invocation_id = %invocation.id(),
                operation = invocation.operation().operation_id(),
                "authentication rejected"
            );
            responder.fail(InvocationError::Unauthorized);
        }
    }
}

/// Accepts a fixed set of tokens, compared in constant time.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: Vec<Vec<u8>>,
}

impl StaticTokenValidator {
    #[must_use]
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(|t| t.into().into_bytes()).collect(),
        }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        let candidate = token.as_bytes();
        // Check every entry so timing does not reveal which one matched.
        self.tokens
            .iter()
            .fold(false, |found, t| found | bool::from(t.as_slice().ct_eq(candidate)))
    }
}

/// Accepts HS256 JWTs signed with a shared secret and not yet expired.
pub struct JwtTokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenValidator {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenValidator for JwtTokenValidator {
    fn validate(&self, token: &str) -> bool {
        match jsonwebtoken::decode::<serde_json::Value>(token, &self.key, &self.validation) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "jwt rejected");
                false
            }
        }
    }
}
