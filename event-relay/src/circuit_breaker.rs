//! # Circuit Breaker
//!
//! Fault isolation around any fallible async operation. After `max_failures`
//! consecutive failures the breaker opens and rejects work without running it.
//! Once `reset_timeout` has passed since the last failure, exactly one trial is
//! admitted: its success closes the breaker, its failure reopens it and restarts
//! the cooldown.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{info, warn};
use snafu::Snafu;
use tokio::time::Instant;

use crate::metrics::CIRCUIT_STATE;

/// Position of the breaker's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operations run normally.
    Closed,
    /// Operations are rejected until the cooldown passes.
    Open,
    /// A single trial decides whether to close or reopen.
    HalfOpen,
}

impl CircuitState {
    /// Value published on the state gauge.
    fn gauge_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Failure of [`CircuitBreaker::execute`].
#[derive(Debug, Snafu)]
pub enum CircuitError<E>
where
    E: std::error::Error + 'static,
{
    /// The breaker rejected the call without running the operation.
    #[snafu(display("circuit open, next trial allowed in {retry_in:?}"))]
    Open {
        /// Time left before a trial is admitted.
        retry_in: Duration,
    },

    /// The operation ran and failed.
    #[snafu(display("{source}"))]
    Operation {
        /// The operation's own error.
        source: E,
    },
}

/// Mutable part of a [`CircuitBreaker`].
#[derive(Debug)]
struct BreakerState {
    /// Current position of the state machine.
    state: CircuitState,
    /// Failures since the last success.
    consecutive_failures: u32,
    /// When the cooldown started.
    last_failure: Option<Instant>,
    /// Set while the half-open trial runs.
    trial_in_flight: bool,
}

/// Three-state circuit breaker. Holds no domain knowledge.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive failures that open the circuit.
    max_failures: u32,
    /// Cooldown before a trial is admitted.
    reset_timeout: Duration,
    /// Shared state.
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker. A `max_failures` of zero is treated as one.
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        CIRCUIT_STATE.set(CircuitState::Closed.gauge_value());
        Self {
            max_failures: max_failures.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Current position of the state machine.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted so far.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Runs `operation` unless the breaker is open.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.admit()
            .map_err(|retry_in| CircuitError::Open { retry_in })?;

        // A dropped operation counts as a failure so a cancelled trial cannot
        // leave the breaker half-open forever.
        let mut attempt = Attempt {
            breaker: self,
            settled: false,
        };
        let result = operation().await;
        attempt.settled = true;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result.map_err(|source| CircuitError::Operation { source })
    }

    /// Locks the state, recovering it from a panicked holder.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lets a call through, or returns the time left before one is admitted.
    fn admit(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.reset_timeout);
                if elapsed < self.reset_timeout {
                    return Err(self.reset_timeout - elapsed);
                }
                info!("Circuit half-open, admitting a trial");
                transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(())
            }
        }
    }

    /// Closes a half-open circuit and clears the count.
    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit trial succeeded, closing");
            transition(&mut inner, CircuitState::Closed);
        }
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
    }

    /// Counts a failure, opening or reopening the circuit when due.
    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("Circuit trial failed, reopening");
                inner.trial_in_flight = false;
                transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.max_failures => {
                warn!(
                    "Circuit opening after {} consecutive failure(s)",
                    inner.consecutive_failures
                );
                transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }
}

/// Moves to `to` and publishes it.
fn transition(inner: &mut BreakerState, to: CircuitState) {
    inner.state = to;
    CIRCUIT_STATE.set(to.gauge_value());
}

/// Records a failure if dropped before the operation settles.
struct Attempt<'a> {
    /// Breaker the operation runs under.
    breaker: &'a CircuitBreaker,
    /// Set once the outcome has been recorded.
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    async fn fail(calls: &AtomicUsize) -> Result<(), Boom> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Boom)
    }

    async fn succeed(calls: &AtomicUsize) -> Result<u32, Boom> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }

    #[tokio::test(start_paused = true)]
    async fn we_can_open_after_three_failures_and_admit_one_trial() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(
                breaker.execute(|| fail(&calls)).await,
                Err(CircuitError::Operation { .. })
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // rejected without running
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(
            breaker.execute(|| fail(&calls)).await,
            Err(CircuitError::Open { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // trial runs exactly once
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.execute(|| succeed(&calls)).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn we_can_restart_the_cooldown_after_a_failed_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        breaker.execute(|| fail(&calls)).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.execute(|| fail(&calls)).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            breaker.execute(|| succeed(&calls)).await,
            Err(CircuitError::Open { retry_in }) if retry_in == Duration::from_secs(5)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn we_can_reset_the_consecutive_count_on_success() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        breaker.execute(|| fail(&calls)).await.unwrap_err();
        breaker.execute(|| fail(&calls)).await.unwrap_err();
        breaker.execute(|| succeed(&calls)).await.unwrap();
        breaker.execute(|| fail(&calls)).await.unwrap_err();
        breaker.execute(|| fail(&calls)).await.unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn we_cannot_run_two_trials_at_once() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(1)));
        let calls = Arc::new(AtomicUsize::new(0));
        breaker.execute(|| fail(&calls)).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let release = Arc::new(Notify::new());
        let trial = tokio::spawn({
            let breaker = breaker.clone();
            let release = release.clone();
            async move {
                breaker
                    .execute(|| async move {
                        release.notified().await;
                        Ok::<_, Boom>(())
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(matches!(
            breaker.execute(|| succeed(&calls)).await,
            Err(CircuitError::Open { .. })
        ));

        release.notify_one();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn we_can_count_a_dropped_trial_as_a_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(1));
        let calls = AtomicUsize::new(0);
        breaker.execute(|| fail(&calls)).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = breaker.execute(|| std::future::pending::<Result<(), Boom>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), trial).await;

        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
