use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::time::Duration;

/// Breaker type shared by every vendor client.
pub type VendorBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Creates a circuit breaker for one vendor API.
///
/// # Configuration
///
/// - **Failure threshold**: `threshold` consecutive failures open the circuit.
/// - **Backoff**: exponential from 10s to 60s before a half-open probe.
///
/// Only transport errors and 5xx answers are reported as failures, so a vendor
/// that rejects a single bad input keeps its circuit closed.
pub fn create_vendor_circuit_breaker(threshold: u32) -> VendorBreaker {
    let backoff_strategy = backoff::exponential(Duration::from_secs(10), Duration::from_secs(60));

    let failure_policy = failure_policy::consecutive_failures(threshold, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::futures::CircuitBreaker;
    use failsafe::Error;

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let cb = create_vendor_circuit_breaker(5);

        for _ in 0..5 {
            let result = cb.call(async { Err::<(), &str>("vendor down") }).await;
            assert!(matches!(result, Err(Error::Inner("vendor down"))));
        }

        let result = cb.call(async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(Error::Rejected)));
    }

    #[tokio::test]
    async fn success_resets_the_count() {
        let cb = create_vendor_circuit_breaker(2);

        let _ = cb.call(async { Err::<(), &str>("blip") }).await;
        let ok = cb.call(async { Ok::<i32, &str>(42) }).await;
        assert!(matches!(ok, Ok(42)));
        let _ = cb.call(async { Err::<(), &str>("blip") }).await;

        let still_closed = cb.call(async { Ok::<i32, &str>(7) }).await;
        assert!(matches!(still_closed, Ok(7)));
    }
}
