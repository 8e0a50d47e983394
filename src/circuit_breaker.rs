// =============================================================================
// circuit_breaker.rs — PER-PROXY FAILURE FUSE
// =============================================================================
//
// Every proxy in the pool carries one of these. A proxy that fails N probes
// (or N routed requests) in a row trips its breaker and drops out of
// rotation. Once the cooldown has passed the breaker goes half-open and
// lets traffic through again; M successes close it, one failure re-opens it.
//
// The proxy's own status (active/inactive) says what the last probe saw.
// The breaker says whether we are willing to route through it right now.
// =============================================================================

use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    /// Traffic flows.
    Closed,
    /// Tripped. Nothing routed until the cooldown ends.
    Open,
    /// Cooldown over, on probation.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    total_trips: u64,
}

pub struct CircuitBreaker {
    name: String,
    inner: RwLock<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        let name = name.into();
        debug!(
            name = %name,
            failure_threshold = failure_threshold,
            reset_timeout_secs = reset_timeout.as_secs(),
            success_threshold = success_threshold,
            "Circuit breaker armed"
        );

        Self {
            name,
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                last_state_change: Instant::now(),
                total_trips: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Whether traffic may be routed now. An open breaker whose cooldown
    /// has expired moves to half-open and answers yes.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    info!(name = %self.name, "Circuit breaker OPEN -> HALF_OPEN");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.last_state_change = Instant::now();
                }
                cooled_down
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    info!(name = %self.name, "Circuit breaker HALF_OPEN -> CLOSED");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.last_state_change = Instant::now();
                }
            }
            // A probe that started before the trip can land late
            CircuitState::Open => {
                debug!(name = %self.name, "Success recorded while OPEN — ignored");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        name = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker TRIPPED — CLOSED -> OPEN"
                    );
                    trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(name = %self.name, "Probation failed — HALF_OPEN -> OPEN");
                inner.consecutive_failures = self.failure_threshold;
                trip(&mut inner);
            }
            // Extend the cooldown
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.read();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_trips: inner.total_trips,
            time_in_current_state_secs: inner.last_state_change.elapsed().as_secs(),
        }
    }
}

fn trip(inner: &mut BreakerInner) {
    inner.state = CircuitState::Open;
    inner.opened_at = Some(Instant::now());
    inner.total_trips += 1;
    inner.last_state_change = Instant::now();
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_trips: u64,
    pub time_in_current_state_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new("proxy-a", 3, Duration::from_secs(5), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_trips_after_consecutive_failures() {
        let cb = CircuitBreaker::new("proxy-a", 3, Duration::from_secs(5), 1);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert_eq!(cb.snapshot().total_trips, 1);
    }

    #[test]
    fn test_success_breaks_the_streak() {
        let cb = CircuitBreaker::new("proxy-a", 3, Duration::from_secs(5), 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_close() {
        let cb = CircuitBreaker::new("proxy-a", 1, Duration::from_millis(20), 2);
        cb.record_failure();
        assert!(!cb.allow_request());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("proxy-a", 1, Duration::from_millis(10), 1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().total_trips, 2);
    }
}
