//! Request authentication
//!
//! Two schemes are in use. Advertisers authenticate postbacks with their own
//! api key in `X-Api-Key`. Operator endpoints (cron, admin, payment
//! completion) take a shared bearer token from configuration; an empty
//! configured token disables the endpoint.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use secrecy::{ExposeSecret, Secret};
use std::convert::Infallible;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::{ApiError, ApiResult};

pub const API_KEY_HEADER: &str = "X-Api-Key";

/// The caller's advertiser api key, if one was sent. Validity is checked by
/// the conversion handler so rejections keep their fixed order.
#[derive(Debug, Clone, Default)]
pub struct ApiKey(pub Option<String>);

impl ApiKey {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ApiKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Ok(ApiKey(key))
    }
}

/// Extracts `Authorization: Bearer <token>`.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Checks the bearer token against the configured one for `scope`.
pub fn require_bearer(headers: &HeaderMap, expected: &Secret<String>, scope: &str) -> ApiResult<()> {
    let expected = expected.expose_secret();
    if expected.is_empty() {
        warn!(scope, "Rejected request to disabled endpoint");
        return Err(ApiError::auth(format!("{} endpoints are disabled", scope)));
    }

    match extract_bearer(headers) {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
        Some(_) => {
            warn!(scope, "Rejected request with invalid bearer token");
            Err(ApiError::auth("invalid bearer token"))
        }
        None => Err(ApiError::auth("missing bearer token")),
    }
}
