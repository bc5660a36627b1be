//! Circuit breaker guarding calls to flaky collaborators.
//!
//! ```text
//! CLOSED    → OPEN       failure_threshold consecutive failures
//! OPEN      → HALF_OPEN  recovery_timeout elapsed (next caller becomes the probe)
//! HALF_OPEN → CLOSED     probe succeeded
//! HALF_OPEN → OPEN       probe failed
//! ```
//!
//! While a probe is in flight every other caller is rejected. A call whose
//! future is dropped before completing (timeout, cancellation) counts as a
//! failure. Every state change starts a new generation; outcomes of calls
//! admitted under an older generation are ignored, so a slow call that
//! started while CLOSED cannot close a breaker that has since tripped.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Breaker in front of the rotation persistence collaborator.
pub const ROTATION_STORE_BREAKER: &str = "rotation-state-store";
/// Breaker in front of the schedule validator collaborator.
pub const VALIDATOR_BREAKER: &str = "schedule-validator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent OPEN before a probe is let through.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker refused the call; the wrapped operation never ran.
    #[error("circuit '{name}' is {state}, call rejected")]
    Rejected { name: String, state: CircuitState },

    /// The wrapped operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of a breaker for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    generation: u64,
}

impl BreakerInner {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.probe_in_flight = false;
        self.generation += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_at_utc = None;
        self.probe_in_flight = false;
        self.generation += 1;
    }
}

/// What `try_acquire` handed out to an admitted call.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    probe: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_utc: None,
                probe_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn get_stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_utc,
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// The closure is only invoked when the breaker admits the call, so a
    /// rejected call has no side effects.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.try_acquire()?;

        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };
        let result = operation().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(admission);
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        self.lock().close();
        info!(circuit = %self.name, "circuit reset");
    }

    /// Trip the breaker regardless of the failure count.
    pub fn force_open(&self) {
        self.lock().open();
        warn!(circuit = %self.name, "circuit force-opened");
    }

    fn try_acquire<E>(&self) -> Result<Admission, CircuitBreakerError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                generation: inner.generation,
                probe: false,
            }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.generation += 1;
                    info!(circuit = %self.name, "circuit half-open, admitting probe");
                    Ok(Admission {
                        generation: inner.generation,
                        probe: true,
                    })
                } else {
                    Err(self.rejected(inner.state))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.rejected(inner.state))
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission {
                        generation: inner.generation,
                        probe: true,
                    })
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        if inner.generation != admission.generation {
            debug!(circuit = %self.name, state = %inner.state, "ignoring stale success");
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if admission.probe => {
                inner.close();
                info!(circuit = %self.name, "probe succeeded, circuit closed");
            }
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        if inner.generation != admission.generation {
            debug!(circuit = %self.name, state = %inner.state, "ignoring stale failure");
            return;
        }
        match inner.state {
            CircuitState::HalfOpen if admission.probe => {
                inner.consecutive_failures += 1;
                inner.open();
                warn!(circuit = %self.name, "probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open();
                    warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            _ => {}
        }
    }

    fn rejected<E>(&self, state: CircuitState) -> CircuitBreakerError<E> {
        CircuitBreakerError::Rejected {
            name: self.name.clone(),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records a failure if the call future is dropped before it settles.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(circuit = %self.breaker.name, "call abandoned before completion");
            self.breaker.record_failure(self.admission);
        }
    }
}

/// One breaker per named resource, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Stats for every breaker created so far, sorted by name.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<BreakerStats> = breakers.values().map(|b| b.get_stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitBreakerError<String>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("boom".to_string())
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<u32, CircuitBreakerError<String>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(7)
        })
        .await
    }

    #[tokio::test]
    async fn closed_breaker_passes_calls_through() {
        let b = breaker(2, 1000);
        let calls = AtomicU32::new(0);
        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_invoking() {
        let b = breaker(2, 60_000);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(fail(&b, &calls).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);
        // Third call was already rejected.
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(matches!(
            err,
            CircuitBreakerError::Rejected {
                state: CircuitState::Open,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let b = breaker(2, 60_000);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = succeed(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.get_stats().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let b = breaker(2, 20);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(b.get_stats().opened_at.is_none());
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let b = breaker(2, 20);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(
            fail(&b, &calls).await,
            Err(CircuitBreakerError::Inner(_))
        ));
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&b, &calls).await,
            Err(CircuitBreakerError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn only_one_probe_admitted_while_half_open() {
        let b = Arc::new(breaker(1, 20));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = Arc::clone(&b);
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
        });

        // Let the probe claim the half-open slot.
        while b.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            succeed(&b, &calls).await,
            Err(CircuitBreakerError::Rejected {
                state: CircuitState::HalfOpen,
                ..
            })
        ));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn slow_success_cannot_close_a_tripped_breaker() {
        let b = Arc::new(breaker(1, 60_000));
        let calls = AtomicU32::new(0);

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_breaker = Arc::clone(&b);
        let slow = tokio::spawn(async move {
            slow_breaker
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
        });
        started_rx.await.unwrap();

        assert!(fail(&b, &calls).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
        let opened_at = b.get_stats().opened_at;

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.get_stats().opened_at, opened_at);
        assert!(matches!(
            succeed(&b, &calls).await,
            Err(CircuitBreakerError::Rejected {
                state: CircuitState::Open,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stale_failure_is_ignored_after_reset() {
        let b = Arc::new(breaker(1, 20));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = Arc::clone(&b);
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Err::<(), _>("late".to_string())
                })
                .await
        });
        started_rx.await.unwrap();
        b.reset();
        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_err());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.get_stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn abandoned_call_counts_as_failure() {
        let b = breaker(1, 60_000);
        let pending = b.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_and_force_open() {
        let b = breaker(5, 60_000);
        b.force_open();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.get_stats().opened_at.is_some());
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_returns_shared_named_instances() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get(ROTATION_STORE_BREAKER);
        let b = registry.get(ROTATION_STORE_BREAKER);
        assert!(Arc::ptr_eq(&a, &b));

        registry.get(VALIDATOR_BREAKER).force_open();
        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, ROTATION_STORE_BREAKER);
        assert_eq!(stats[0].state, CircuitState::Closed);
        assert_eq!(stats[1].name, VALIDATOR_BREAKER);
        assert_eq!(stats[1].state, CircuitState::Open);
    }

    #[test]
    fn state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
