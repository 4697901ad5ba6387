// =====================================================================================
// CIRCUIT BREAKER FOR WEBHOOK EVENT PROCESSING
// =====================================================================================

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::error::WebhookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,    // Normal operation
    Open,      // Failing, reject requests
    HalfOpen,  // Testing if downstream recovered
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            call_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Probe,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_started_at: None,
            }),
            config,
        }
    }

    /// Runs `operation` unless the circuit is open. The lock is never held
    /// while the operation runs.
    #[instrument(skip(self, operation), fields(breaker = self.name))]
    pub async fn execute<F, T>(&self, operation: F) -> Result<T, WebhookError>
    where
        F: Future<Output = Result<T, WebhookError>>,
    {
        let permit = self.acquire().await?;

        let result = match self.config.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation).await {
                Ok(result) => result,
                Err(_) => Err(WebhookError::Processing(format!(
                    "handler did not finish within {}s",
                    timeout.as_secs()
                ))),
            },
            None => operation.await,
        };

        match &result {
            Ok(_) => self.on_success(permit).await,
            Err(error) if error.is_downstream_failure() => self.on_failure(permit).await,
            Err(_) => self.on_neutral(permit).await,
        }

        result
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().await;
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            cooldown_seconds: self.config.cooldown.as_secs(),
        }
    }

    async fn acquire(&self) -> Result<Permit, WebhookError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);

                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started_at = Some(now);
                    info!(breaker = self.name, "Circuit breaker HALF_OPEN, sending probe");
                    Ok(Permit::Probe)
                } else {
                    let remaining = self.config.cooldown - elapsed;
                    Err(WebhookError::CircuitOpen {
                        retry_after_secs: remaining.as_secs_f64().ceil().max(1.0) as u64,
                    })
                }
            },
            CircuitState::HalfOpen => {
                // One probe at a time; a probe that never reported back
                // (cancelled request) is replaced after another cooldown.
                let probe_stale = inner.probe_started_at
                    .map_or(true, |started| now.saturating_duration_since(started) >= self.config.cooldown);

                if probe_stale {
                    inner.probe_started_at = Some(now);
                    Ok(Permit::Probe)
                } else {
                    Err(WebhookError::CircuitOpen { retry_after_secs: 1 })
                }
            },
        }
    }

    /// Only the half-open probe may close the circuit. A call admitted while
    /// closed that finishes after the circuit opened leaves it open.
    async fn on_success(&self, permit: Permit) {
        let mut inner = self.inner.lock().await;

        match (inner.state, permit) {
            (CircuitState::Closed, _) => inner.consecutive_failures = 0,
            (CircuitState::HalfOpen, Permit::Probe) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_started_at = None;
                info!(breaker = self.name, "Circuit breaker reset to CLOSED state");
            },
            _ => {},
        }
    }

    async fn on_failure(&self, permit: Permit) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => permit == Permit::Probe,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_started_at = None;
            warn!(
                breaker = self.name,
                failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit breaker opened due to {} consecutive failures",
                inner.consecutive_failures
            );
        }
    }

    /// Client errors say nothing about downstream health; a probe that ended
    /// in one just frees the slot for the next caller.
    async fn on_neutral(&self, permit: Permit) {
        if permit == Permit::Probe {
            let mut inner = self.inner.lock().await;
            if inner.state == CircuitState::HalfOpen {
                inner.probe_started_at = None;
            }
        }
    }
}
