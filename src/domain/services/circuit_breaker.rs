//! Circuit breaker guarding calls to the external exchange.
//!
//! Standard three-state pattern: Closed (normal), Open (fail fast),
//! HalfOpen (probing recovery). Five consecutive failures open the breaker
//! for 30 seconds.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Whether a call may proceed. An open breaker whose timeout has elapsed
    /// transitions to half-open and admits one probe.
    pub async fn is_call_permitted(&self) -> bool {
        let mut s = self.state.lock().await;
        match s.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match s.opened_at {
                Some(at) if at.elapsed() >= self.config.open_timeout => {
                    s.state = CircuitState::HalfOpen;
                    s.consecutive_successes = 0;
                    true
                }
                _ => false,
            },
        }
    }

    pub async fn on_success(&self) {
        let mut s = self.state.lock().await;
        match s.state {
            CircuitState::HalfOpen => {
                s.consecutive_successes += 1;
                if s.consecutive_successes >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.consecutive_failures = 0;
                    s.opened_at = None;
                }
            }
            CircuitState::Closed => {
                s.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn on_failure(&self) {
        let mut s = self.state.lock().await;
        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    s.state = CircuitState::Open;
                    s.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.consecutive_failures = 1;
                s.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    /// Run an operation under the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.is_call_permitted().await {
            return Err(CircuitBreakerError::CircuitOpen);
        }
        match f().await {
            Ok(v) => {
                self.on_success().await;
                Ok(v)
            }
            Err(e) => {
                self.on_failure().await;
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "operation failed: {e}"),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn config(failures: u32, timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: 1,
            open_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config(3, 1_000));
        for _ in 0..3 {
            breaker.on_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.is_call_permitted().await);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(config(3, 1_000));
        breaker.on_failure().await;
        breaker.on_failure().await;
        breaker.on_success().await;
        breaker.on_failure().await;
        breaker.on_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn probes_half_open_after_timeout_then_closes() {
        let breaker = CircuitBreaker::new(config(1, 50));
        breaker.on_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        assert!(breaker.is_call_permitted().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.on_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(config(1, 50));
        breaker.on_failure().await;
        sleep(Duration::from_millis(80)).await;
        let _ = breaker.is_call_permitted().await;
        breaker.on_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn call_rejects_when_open() {
        let breaker = CircuitBreaker::new(config(1, 60_000));
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        let result = breaker.call(|| async { Ok::<_, String>("fine") }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }
}
