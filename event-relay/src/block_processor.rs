//! # Block Processor
//!
//! The driving loop. Each cycle runs inside the [`CircuitBreaker`] and walks one
//! height through three steps:
//!
//! 1. **Scanning**: scan the current height. A block that does not exist yet ends
//!    the cycle quietly; a scan that exhausted its retries fails it.
//! 2. **Resolving**: for every event, skip it if the ledger already has it
//!    completed, otherwise claim it, execute the action and record the outcome.
//!    Events are independent and resolved concurrently.
//! 3. **Advancing**: re-read the ledger for every event of the block. Only when all
//!    of them are completed is the height checkpointed and the cursor moved on.
//!
//! A completion that cannot be written even after retries is parked in memory,
//! flushed before anything else on the next cycle, and keeps the height pinned.
//! The event is never executed again while its completion is parked.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use snafu::{ResultExt, Snafu};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};

use crate::block_scanner::BlockScanner;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::event_ledger::{EventLedger, LedgerError};
use crate::executor::ActionExecutor;
use crate::metrics::{BLOCKS_ADVANCED, CURRENT_HEIGHT, CYCLE_FAILURES, EVENT_OUTCOMES};
use crate::model::{BlockHeight, Event, EventFilter, EventKey, ScanStatus};

/// Tunables of a [`BlockProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Lease of every claim. Must exceed `action_timeout`.
    pub claim_lease: Duration,
    /// Deadline of a single action execution.
    pub action_timeout: Duration,
    /// Pause between two cycles of [`BlockProcessor::run`].
    pub poll_interval: Duration,
    /// Attempts at writing a completion before it is parked.
    pub store_retries: u32,
    /// Pause between two completion write attempts.
    pub store_retry_delay: Duration,
    /// Events of one block resolved at the same time.
    pub max_concurrent_events: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            claim_lease: Duration::from_secs(300),
            action_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            store_retries: 3,
            store_retry_delay: Duration::from_millis(500),
            max_concurrent_events: 4,
        }
    }
}

/// How a successful cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The block at `height` does not exist yet.
    NotMined {
        /// Scanned height.
        height: BlockHeight,
    },
    /// Every event of `height` is completed and the cursor moved past it.
    Advanced {
        /// Checkpointed height.
        height: BlockHeight,
        /// Matching events in the block.
        events: usize,
    },
    /// Some events are claimed by another worker; the height stays.
    Pending {
        /// Scanned height.
        height: BlockHeight,
        /// Events not yet completed.
        unresolved: usize,
    },
    /// Another cycle was still in flight, nothing was done.
    Busy,
}

/// Why a cycle failed. Every variant counts against the circuit breaker.
#[derive(Debug, Snafu)]
pub enum CycleError {
    /// The scanner gave up on the block.
    #[snafu(display("scan of block {height} failed: {message}"))]
    Scan {
        /// Scanned height.
        height: BlockHeight,
        /// The scanner's description of the last failure.
        message: String,
    },

    /// One or more actions failed and were recorded as FAILED.
    #[snafu(display("{failed} action(s) failed in block {height}"))]
    Execution {
        /// Scanned height.
        height: BlockHeight,
        /// Failed actions.
        failed: usize,
    },

    /// Ledger writes or reads for individual events failed.
    #[snafu(display("{failed} event(s) in block {height} could not be recorded"))]
    Persistence {
        /// Scanned height.
        height: BlockHeight,
        /// Events whose ledger operations failed.
        failed: usize,
    },

    /// The ledger could not confirm the block's events.
    #[snafu(display("could not confirm events of block {height}: {source}"))]
    Confirm {
        /// Scanned height.
        height: BlockHeight,
        /// The underlying ledger error.
        source: LedgerError,
    },

    /// The block was drained but its checkpoint could not be saved.
    #[snafu(display("could not checkpoint block {height}: {source}"))]
    Checkpoint {
        /// Drained height.
        height: BlockHeight,
        /// The underlying checkpoint error.
        source: CheckpointError,
    },

    /// The circuit breaker rejected the cycle.
    #[snafu(display("circuit open, next trial in {retry_in:?}"))]
    CircuitOpen {
        /// Time left before a trial is admitted.
        retry_in: Duration,
    },
}

impl CycleError {
    /// Metric label of this failure.
    fn kind(&self) -> &'static str {
        match self {
            CycleError::Scan { .. } => "scan",
            CycleError::Execution { .. } => "execution",
            CycleError::Persistence { .. } | CycleError::Confirm { .. } => "ledger",
            CycleError::Checkpoint { .. } => "checkpoint",
            CycleError::CircuitOpen { .. } => "circuit_open",
        }
    }
}

/// What happened to one event during the resolving step.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    /// Completed before this cycle looked at it.
    AlreadyCompleted,
    /// Claimed by someone else.
    Contended,
    /// Executed and recorded as COMPLETED.
    Completed,
    /// Executed and failed; recorded as FAILED where possible.
    ActionFailed,
    /// A ledger read or claim failed before anything ran.
    StoreFailed,
    /// Executed, but the completion is parked until the ledger takes it.
    CompletionParked,
}

impl Resolution {
    /// Metric label of this outcome.
    fn label(&self) -> &'static str {
        match self {
            Resolution::AlreadyCompleted => "skipped",
            Resolution::Contended => "contended",
            Resolution::Completed => "completed",
            Resolution::ActionFailed => "failed",
            Resolution::StoreFailed | Resolution::CompletionParked => "unrecorded",
        }
    }
}

/// Height as a gauge value, saturating at `i64::MAX`.
fn gauge_value(height: BlockHeight) -> i64 {
    i64::try_from(height).unwrap_or(i64::MAX)
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct InFlight<'a>(
    /// The processor's in-flight flag.
    &'a AtomicBool,
);

impl<'a> InFlight<'a> {
    /// Sets the flag, or returns `None` if it was already set.
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one event stream from its checkpoint forward.
pub struct BlockProcessor {
    /// Reads one height at a time.
    scanner: BlockScanner,
    /// Events this processor acts on.
    filter: EventFilter,
    /// Claims and completions.
    ledger: EventLedger,
    /// Persisted cursor.
    checkpoint: CheckpointStore,
    /// Performs the action of an event.
    executor: Arc<dyn ActionExecutor>,
    /// Wraps every cycle.
    breaker: CircuitBreaker,
    /// Tunables.
    config: ProcessorConfig,
    /// Next height to drain.
    current_height: AtomicU64,
    /// Set while a cycle runs.
    in_flight: AtomicBool,
    /// Result tokens of executed events whose completion is not yet written.
    parked_completions: Mutex<HashMap<EventKey, String>>,
}

impl BlockProcessor {
    /// Creates a processor, seeding its height from the checkpoint store.
    pub async fn new(
        scanner: BlockScanner,
        filter: EventFilter,
        ledger: EventLedger,
        checkpoint: CheckpointStore,
        executor: Arc<dyn ActionExecutor>,
        breaker: CircuitBreaker,
        config: ProcessorConfig,
    ) -> Result<Self, CheckpointError> {
        let height = checkpoint.load().await?;
        CURRENT_HEIGHT.set(gauge_value(height));

        Ok(Self {
            scanner,
            filter,
            ledger,
            checkpoint,
            executor,
            breaker,
            config,
            current_height: AtomicU64::new(height),
            in_flight: AtomicBool::new(false),
            parked_completions: Mutex::new(HashMap::new()),
        })
    }

    /// The next height to be drained.
    pub fn current_height(&self) -> BlockHeight {
        self.current_height.load(Ordering::Acquire)
    }

    /// The breaker guarding the cycles.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Polls until `shutdown` turns true or its sender goes away.
    ///
    /// Shutdown is only observed between cycles; a started cycle always runs to
    /// its end so no claim is abandoned halfway.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Block processor starting at height {}", self.current_height());

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Advanced { height, events }) => {
                    info!("Block {} drained ({} event(s))", height, events)
                }
                Ok(outcome) => debug!("Cycle ended: {:?}", outcome),
                Err(CycleError::CircuitOpen { retry_in }) => {
                    debug!("Circuit open, skipping cycle ({:?} left)", retry_in)
                }
                Err(e) => error!("Cycle at height {} failed: {}", self.current_height(), e),
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Block processor stopped at height {}", self.current_height());
    }

    /// Runs one cycle unless another is in flight.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            return Ok(CycleOutcome::Busy);
        };

        let result = self
            .breaker
            .execute(|| self.cycle())
            .await
            .map_err(|e| match e {
                CircuitError::Open { retry_in } => CycleError::CircuitOpen { retry_in },
                CircuitError::Operation { source } => source,
            });

        if let Err(e) = &result {
            CYCLE_FAILURES.with_label_values(&[e.kind()]).inc();
        }
        result
    }

    /// Takes the current height through one cycle.
    async fn cycle(&self) -> Result<CycleOutcome, CycleError> {
        let height = self.current_height();
        self.flush_parked_completions().await;

        let scan = self.scanner.scan(height, &self.filter).await;
        let events = match scan.status {
            ScanStatus::NotMined => return Ok(CycleOutcome::NotMined { height }),
            ScanStatus::Error => {
                return Err(CycleError::Scan {
                    height,
                    message: scan.error.unwrap_or_default(),
                })
            }
            ScanStatus::Mined => scan.events,
        };

        // built up front so the cycle future stays Send
        let resolving: Vec<_> = events.iter().map(|event| self.resolve(event)).collect();
        let resolutions: Vec<Resolution> = stream::iter(resolving)
            .buffer_unordered(self.config.max_concurrent_events.max(1))
            .collect()
            .await;

        let keys: BTreeSet<&EventKey> = events.iter().map(|event| &event.key).collect();
        let mut unresolved = 0;
        for key in &keys {
            let completed = self
                .ledger
                .is_completed(key)
                .await
                .context(ConfirmSnafu { height })?;
            if !completed {
                unresolved += 1;
            }
        }

        if unresolved == 0 {
            self.checkpoint
                .save(height)
                .await
                .context(CheckpointSnafu { height })?;
            self.current_height.store(height + 1, Ordering::Release);
            CURRENT_HEIGHT.set(gauge_value(height + 1));
            BLOCKS_ADVANCED.inc();
            return Ok(CycleOutcome::Advanced {
                height,
                events: events.len(),
            });
        }

        let count = |wanted: &[Resolution]| {
            resolutions
                .iter()
                .filter(|resolution| wanted.contains(resolution))
                .count()
        };
        let failed = count(&[Resolution::ActionFailed]);
        let unrecorded = count(&[Resolution::StoreFailed, Resolution::CompletionParked]);

        warn!(
            "Block {} not drained: {} of {} event(s) unresolved",
            height,
            unresolved,
            keys.len()
        );
        if failed > 0 {
            return Err(CycleError::Execution { height, failed });
        }
        if unrecorded > 0 {
            return Err(CycleError::Persistence {
                height,
                failed: unrecorded,
            });
        }
        Ok(CycleOutcome::Pending { height, unresolved })
    }

    /// Resolves one event and counts the outcome.
    async fn resolve(&self, event: &Event) -> Resolution {
        let resolution = self.try_resolve(event).await;
        EVENT_OUTCOMES
            .with_label_values(&[resolution.label()])
            .inc();
        resolution
    }

    /// Takes one event through the ledger and its action.
    async fn try_resolve(&self, event: &Event) -> Resolution {
        let key = &event.key;
        let height = event.block_height;

        if self.parked_completions.lock().await.contains_key(key) {
            return Resolution::CompletionParked;
        }

        match self.ledger.is_completed(key).await {
            Ok(true) => {
                debug!("Event {} at height {} already completed", key, height);
                return Resolution::AlreadyCompleted;
            }
            Ok(false) => {}
            Err(e) => {
                error!("Could not read ledger for event {} at height {}: {}", key, height, e);
                return Resolution::StoreFailed;
            }
        }

        match self.ledger.claim(key, self.config.claim_lease).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Event {} at height {} is claimed elsewhere", key, height);
                return Resolution::Contended;
            }
            Err(e) => {
                error!("Could not claim event {} at height {}: {}", key, height, e);
                return Resolution::StoreFailed;
            }
        }

        let outcome = timeout(self.config.action_timeout, self.executor.execute(event))
            .await
            .map_err(|_| format!("action timed out after {:?}", self.config.action_timeout))
            .and_then(|result| result.map_err(|e| e.to_string()));

        match outcome {
            Ok(token) => {
                info!("Event {} at height {} executed: {}", key, height, token);
                self.record_completion(key, height, token).await
            }
            Err(message) => {
                warn!("Action for event {} at height {} failed: {}", key, height, message);
                if let Err(e) = self.ledger.mark_failed(key, &message).await {
                    error!(
                        "Could not record failure of event {} at height {}: {}",
                        key, height, e
                    );
                }
                Resolution::ActionFailed
            }
        }
    }

    /// Writes a completion with a bounded number of attempts, parking it on
    /// exhaustion.
    async fn record_completion(
        &self,
        key: &EventKey,
        height: BlockHeight,
        token: String,
    ) -> Resolution {
        let attempts = self.config.store_retries.max(1);
        for attempt in 1..=attempts {
            match self.ledger.mark_complete(key, token.clone()).await {
                Ok(()) => return Resolution::Completed,
                Err(e) => {
                    warn!(
                        "Completion write {}/{} for event {} at height {} failed: {}",
                        attempt, attempts, key, height, e
                    );
                    if attempt < attempts {
                        sleep(self.config.store_retry_delay).await;
                    }
                }
            }
        }

        error!(
            "Parking completion of event {} at height {} until the ledger recovers",
            key, height
        );
        self.parked_completions
            .lock()
            .await
            .insert(key.clone(), token);
        Resolution::CompletionParked
    }

    /// Retries every parked completion once, keeping those the ledger still refuses.
    async fn flush_parked_completions(&self) {
        let mut parked = self.parked_completions.lock().await;
        if parked.is_empty() {
            return;
        }

        let mut flushed = Vec::new();
        for (key, token) in parked.iter() {
            match self.ledger.mark_complete(key, token.clone()).await {
                Ok(()) => {
                    info!("Recorded parked completion of event {}", key);
                    flushed.push(key.clone());
                }
                Err(e) => warn!("Parked completion of event {} still unrecorded: {}", key, e),
            }
        }
        for key in flushed {
            parked.remove(&key);
        }
    }
}
