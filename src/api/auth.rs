// =============================================================================
// Bearer Token Authentication
// =============================================================================
//
// Mutating endpoints and the WebSocket feed require the token configured in
// the `KLINE_CACHE_ADMIN_TOKEN` environment variable. REST callers send it
// as `Authorization: Bearer <token>`; WebSocket clients pass `?token=`.
// Comparison is constant time. An unset token rejects every request.
// =============================================================================

use axum::http::{header, HeaderMap};
use tracing::warn;

pub const ADMIN_TOKEN_ENV: &str = "KLINE_CACHE_ADMIN_TOKEN";

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    NotConfigured,
    MissingHeader,
    InvalidToken,
}

impl AuthFailure {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NotConfigured => "Server authentication not configured",
            Self::MissingHeader => "Missing or invalid authorization token",
            Self::InvalidToken => "Invalid authorization token",
        }
    }
}

/// Compare two byte slices in constant time for equal lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn expected_token() -> Option<String> {
    std::env::var(ADMIN_TOKEN_ENV).ok().filter(|t| !t.is_empty())
}

/// Check `presented` against `expected`.
fn check(presented: &str, expected: Option<&str>) -> Result<(), AuthFailure> {
    let Some(expected) = expected else {
        warn!("{ADMIN_TOKEN_ENV} is not set; rejecting authenticated request");
        return Err(AuthFailure::NotConfigured);
    };
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        warn!("invalid admin token presented");
        return Err(AuthFailure::InvalidToken);
    }
    Ok(())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Validate the `Authorization: Bearer` header of a request.
pub fn require_bearer(headers: &HeaderMap) -> Result<(), AuthFailure> {
    let expected = expected_token();
    let Some(token) = bearer(headers) else {
        warn!("missing or malformed Authorization header");
        return Err(if expected.is_none() {
            AuthFailure::NotConfigured
        } else {
            AuthFailure::MissingHeader
        });
    };
    check(token, expected.as_deref())
}

/// Validate a token passed out of band (WebSocket query parameter).
pub fn validate_token(token: &str) -> bool {
    check(token, expected_token().as_deref()).is_ok()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer_string"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn check_requires_configured_token() {
        assert_eq!(check("anything", None), Err(AuthFailure::NotConfigured));
        assert_eq!(check("secret", Some("secret")), Ok(()));
        assert_eq!(check("secreT", Some("secret")), Err(AuthFailure::InvalidToken));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer(&headers), Some("abc"));
    }
}
