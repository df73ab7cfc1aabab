//! Bearer-token gate for the internal routes.

use crate::errors::AppError;
use crate::handlers::AppState;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Rejects requests whose `Authorization: Bearer` token differs from `CRON_SECRET`.
/// Without a configured secret every request passes.
pub async fn require_cron_secret(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.config.cron_secret.as_deref() {
        check_bearer(request.headers(), expected)?;
    }
    Ok(next.run(request).await)
}

pub fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;

    if !constant_time_compare(token.trim(), expected) {
        tracing::warn!("Invalid bearer token received");
        return Err(AppError::Unauthorized("Invalid token".to_string()));
    }
    Ok(())
}

/// Compares without short-circuiting on the first differing byte.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn compare() {
        assert!(constant_time_compare("s3cret", "s3cret"));
        assert!(!constant_time_compare("s3cret", "s3creT"));
        assert!(!constant_time_compare("short", "longer"));
    }

    #[test]
    fn bearer_checks() {
        assert!(check_bearer(&headers("Bearer s3cret"), "s3cret").is_ok());
        assert!(matches!(
            check_bearer(&headers("Bearer nope"), "s3cret"),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            check_bearer(&headers("Basic s3cret"), "s3cret"),
            Err(AppError::Unauthorized(_))
        ));
        assert!(check_bearer(&HeaderMap::new(), "s3cret").is_err());
    }
}
