//! Outbound pacing for vendor APIs.
//!
//! Every vendor client owns a [`VendorGate`]: a token bucket sized to the
//! vendor's published rate, a circuit breaker, and one honoured retry when the
//! vendor answers `429 Too Many Requests`.

use crate::circuit_breaker::{create_vendor_circuit_breaker, VendorBreaker};
use crate::errors::AppError;
use failsafe::futures::CircuitBreaker;
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use reqwest::{header::RETRY_AFTER, RequestBuilder, Response, StatusCode};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long a `Retry-After` header may park a batch.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

const BREAKER_THRESHOLD: u32 = 5;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug)]
enum TransientFailure {
    Transport(reqwest::Error),
    Server(StatusCode, String),
}

/// Shared per-vendor limiter and breaker. Cloning shares the same budget.
#[derive(Clone)]
pub struct VendorGate {
    name: &'static str,
    limiter: Arc<DirectLimiter>,
    breaker: Arc<VendorBreaker>,
}

impl VendorGate {
    /// One request per `min_interval`, no burst.
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        let quota = Quota::with_period(min_interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self {
            name,
            limiter: Arc::new(RateLimiter::direct(quota)),
            breaker: Arc::new(create_vendor_circuit_breaker(BREAKER_THRESHOLD)),
        }
    }

    /// Sends a request through the bucket and breaker.
    ///
    /// A 429 is retried once after its `Retry-After` delay (capped). Any other
    /// status is handed back to the caller untouched; 5xx answers and transport
    /// errors become `ExternalApiError` and count against the breaker.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AppError> {
        let retry = request.try_clone();
        let response = self.send_once(request).await?;

        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }

        let wait = retry_after(&response).unwrap_or(Duration::from_secs(1));
        let Some(retry) = retry else {
            return Ok(response);
        };

        tracing::warn!(
            "{} rate limited us, retrying in {}ms",
            self.name,
            wait.as_millis()
        );
        tokio::time::sleep(wait).await;
        self.send_once(retry).await
    }

    async fn send_once(&self, request: RequestBuilder) -> Result<Response, AppError> {
        let limiter = self.limiter.clone();
        let call = async move {
            limiter.until_ready().await;
            let response = request.send().await.map_err(TransientFailure::Transport)?;
            let status = response.status();
            if status.is_server_error() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(TransientFailure::Server(status, body));
            }
            Ok(response)
        };

        match self.breaker.call(call).await {
            Ok(response) => Ok(response),
            Err(failsafe::Error::Rejected) => {
                tracing::warn!("{} circuit open, skipping call", self.name);
                Err(AppError::VendorUnavailable(format!(
                    "{} circuit open",
                    self.name
                )))
            }
            // Query strings carry API keys
            Err(failsafe::Error::Inner(TransientFailure::Transport(e))) => {
                Err(AppError::ExternalApiError(format!(
                    "{} request failed: {}",
                    self.name,
                    e.without_url()
                )))
            }
            Err(failsafe::Error::Inner(TransientFailure::Server(status, body))) => {
                Err(AppError::ExternalApiError(format!(
                    "{} returned {}: {}",
                    self.name, status, body
                )))
            }
        }
    }
}

/// Reads `Retry-After` as delta-seconds, capped at [`MAX_RETRY_AFTER`].
fn retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value)
}

pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs).min(MAX_RETRY_AFTER))
}

/// Turns a non-success response into an `ExternalApiError` carrying the body.
pub async fn error_for_status(vendor: &str, response: Response) -> Result<Response, AppError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    tracing::error!("{} returned error {}: {}", vendor, status, error_text);
    Err(AppError::ExternalApiError(format!(
        "{} returned {}: {}",
        vendor, status, error_text
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_capped() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("600"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn bucket_spaces_requests() {
        let gate = VendorGate::new("test", Duration::from_millis(200));
        let start = std::time::Instant::now();
        gate.limiter.until_ready().await;
        gate.limiter.until_ready().await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
