//! # Event Ledger
//!
//! The ledger is the single source of truth for "has this event's action already
//! happened". The action itself (publishing a reply) is not idempotent, so every
//! execution is bracketed by ledger writes:
//!
//! 1. [`EventLedger::claim`] takes an exclusive, lease-bound claim on the key.
//! 2. The caller runs the action.
//! 3. [`EventLedger::mark_complete`] records the terminal outcome, or
//!    [`EventLedger::mark_failed`] records an advisory failure that releases the
//!    key for a later retry.
//!
//! A COMPLETED record is irreversible: it is never overwritten, never expires and
//! rejects every later claim. An expired claim is treated as absent so a crashed
//! worker's event becomes claimable again once its lease runs out.
//!
//! Two backing stores are provided. [`MemoryLedgerStore`] keeps the index in
//! memory. [`FileLedgerStore`] appends every record to a JSON-lines log, which
//! doubles as the audit trail, and rebuilds its index from the log on open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use snafu::{ensure, ResultExt, Snafu};
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::durable::write_flushed;
use crate::model::{
    now_millis,
    ClaimRecord,
    CompletionRecord,
    EventKey,
    LedgerRecord,
    TimestampMs,
};

/// Failure messages longer than this are truncated before they are stored.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Errors raised by the ledger and its backing stores.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LedgerError {
    /// Reading or writing the ledger log failed.
    #[snafu(display("ledger io on '{}' failed: {source}", path.display()))]
    Io {
        /// The ledger log.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A record could not be serialized.
    #[snafu(display("could not encode ledger record: {source}"))]
    Encode {
        /// The underlying serialization error.
        source: serde_json::Error,
    },

    /// A line in the middle of the log could not be parsed.
    #[snafu(display("ledger '{}' is corrupt at line {line}: {source}", path.display()))]
    Corrupt {
        /// The ledger log.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// The store did not answer in time.
    #[snafu(display("ledger {operation} timed out after {timeout:?}"))]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// The store is unreachable for a reason of its own.
    #[snafu(display("ledger store unavailable: {message}"))]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

/// Type alias for ledger results.
pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

/// Durable key/value space holding the latest [`LedgerRecord`] per [`EventKey`].
///
/// Implementations must make each method atomic with respect to the others.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Latest record for `key`.
    async fn get(&self, key: &EventKey) -> Result<Option<LedgerRecord>>;

    /// Writes `claim` unless the key is completed or holds a claim still live at
    /// `now`. Returns whether the claim was written.
    async fn try_claim(&self, claim: ClaimRecord, now: TimestampMs) -> Result<bool>;

    /// Writes a terminal record unless one already exists. Returns the record that
    /// is in effect afterwards.
    async fn complete(&self, record: CompletionRecord) -> Result<CompletionRecord>;

    /// Writes an advisory failure unless the key is completed. Returns whether
    /// the failure was written.
    async fn fail(&self, record: CompletionRecord) -> Result<bool>;
}

/// The per-key decision logic shared by every store.
#[derive(Debug, Default)]
struct LedgerIndex {
    /// Latest record per key.
    records: HashMap<EventKey, LedgerRecord>,
}

impl LedgerIndex {
    /// Latest record for `key`.
    fn get(&self, key: &EventKey) -> Option<&LedgerRecord> {
        self.records.get(key)
    }

    /// Whether `key` is free to be claimed at `now`.
    fn admits_claim(&self, key: &EventKey, now: TimestampMs) -> bool {
        match self.records.get(key) {
            None => true,
            Some(LedgerRecord::Completion(completion)) => !completion.is_terminal(),
            Some(LedgerRecord::Claim(claim)) => !claim.is_live(now),
        }
    }

    /// The COMPLETED record of `key`, if any.
    fn terminal(&self, key: &EventKey) -> Option<&CompletionRecord> {
        match self.records.get(key) {
            Some(LedgerRecord::Completion(completion)) if completion.is_terminal() => {
                Some(completion)
            }
            _ => None,
        }
    }

    /// Applies a record, refusing to replace a terminal one.
    fn apply(&mut self, record: LedgerRecord) {
        if self.terminal(record.key()).is_some() {
            return;
        }
        self.records.insert(record.key().clone(), record);
    }
}

/// [`LedgerStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    /// Every record held.
    index: Mutex<LedgerIndex>,
}

impl MemoryLedgerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get(&self, key: &EventKey) -> Result<Option<LedgerRecord>> {
        Ok(self.index.lock().await.get(key).cloned())
    }

    async fn try_claim(&self, claim: ClaimRecord, now: TimestampMs) -> Result<bool> {
        let mut index = self.index.lock().await;
        if !index.admits_claim(&claim.key, now) {
            return Ok(false);
        }
        index.apply(LedgerRecord::Claim(claim));
        Ok(true)
    }

    async fn complete(&self, record: CompletionRecord) -> Result<CompletionRecord> {
        let mut index = self.index.lock().await;
        if let Some(existing) = index.terminal(&record.key) {
            return Ok(existing.clone());
        }
        index.apply(LedgerRecord::Completion(record.clone()));
        Ok(record)
    }

    async fn fail(&self, record: CompletionRecord) -> Result<bool> {
        let mut index = self.index.lock().await;
        if index.terminal(&record.key).is_some() {
            return Ok(false);
        }
        index.apply(LedgerRecord::Completion(record));
        Ok(true)
    }
}

/// State of a [`FileLedgerStore`] guarded by its mutex.
struct FileLedgerInner {
    /// Latest record per key, as replayed and appended.
    index: LedgerIndex,
    /// The log, opened for appending.
    file: File,
    /// Length of the log up to its last complete record.
    len: u64,
    /// Set when a failed append could not be rolled back; the log then ends in a
    /// partial line and no further record may follow it.
    poisoned: bool,
}

/// [`LedgerStore`] backed by an append-only JSON-lines log.
///
/// Every record is appended, flushed and synced before it takes effect in the
/// index, so a failed write never leaves the index ahead of the log. A failed
/// append is cut back off the log so the next record starts on a clean line.
pub struct FileLedgerStore {
    /// Location of the log.
    path: PathBuf,
    /// Index and log handle, locked for every check-and-write.
    inner: Mutex<FileLedgerInner>,
}

impl FileLedgerStore {
    /// Opens the log at `path`, creating it if needed, and replays it.
    ///
    /// A torn final line left by a crash mid-append is discarded. Corruption
    /// anywhere else is an error.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context(IoSnafu { path: path.clone() })?;
        }

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).context(IoSnafu { path: path.clone() }),
        };

        let (index, valid_len) = replay(&path, &contents)?;
        if valid_len < contents.len() {
            warn!(
                "Discarding torn tail of ledger '{}' ({} byte(s))",
                path.display(),
                contents.len() - valid_len
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .context(IoSnafu { path: path.clone() })?;
            file.set_len(valid_len as u64)
                .await
                .context(IoSnafu { path: path.clone() })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(IoSnafu { path: path.clone() })?;

        info!(
            "Opened ledger '{}' with {} key(s)",
            path.display(),
            index.records.len()
        );

        Ok(Self {
            path,
            inner: Mutex::new(FileLedgerInner {
                index,
                file,
                len: valid_len as u64,
                poisoned: false,
            }),
        })
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `record` to the log, then applies it to the index.
    async fn append(&self, inner: &mut FileLedgerInner, record: LedgerRecord) -> Result<()> {
        ensure!(
            !inner.poisoned,
            UnavailableSnafu {
                message: format!(
                    "ledger '{}' ends in a partial record and must be reopened",
                    self.path.display()
                ),
            }
        );

        let mut line = serde_json::to_string(&record).context(EncodeSnafu)?;
        line.push('\n');
        if let Err(source) = write_line(&mut inner.file, line.as_bytes()).await {
            self.roll_back(inner).await;
            return Err(source).context(IoSnafu {
                path: self.path.clone(),
            });
        }

        inner.len += line.len() as u64;
        inner.index.apply(record);
        Ok(())
    }

    /// Cuts whatever a failed append left behind off the end of the log.
    async fn roll_back(&self, inner: &mut FileLedgerInner) {
        match inner.file.set_len(inner.len).await {
            Ok(()) => warn!(
                "Rolled ledger '{}' back to {} byte(s) after a failed append",
                self.path.display(),
                inner.len
            ),
            Err(e) => {
                error!(
                    "Could not roll back ledger '{}' after a failed append: {}",
                    self.path.display(),
                    e
                );
                inner.poisoned = true;
            }
        }
    }
}

/// Appends `line` and syncs it to disk.
async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    write_flushed(file, line).await?;
    file.sync_data().await
}

/// Rebuilds the index from log contents. Returns the index and the byte length
/// of the valid prefix.
fn replay(path: &Path, contents: &str) -> Result<(LedgerIndex, usize)> {
    let mut index = LedgerIndex::default();
    let mut offset = 0;

    for (number, segment) in contents.split_inclusive('\n').enumerate() {
        // records and their newline go out in one write, so a missing newline
        // marks an append that never finished
        if !segment.ends_with('\n') {
            break;
        }
        let line = segment.trim_end();
        if !line.is_empty() {
            let record = serde_json::from_str::<LedgerRecord>(line).context(CorruptSnafu {
                path: path.to_path_buf(),
                line: number + 1,
            })?;
            index.apply(record);
        }
        offset += segment.len();
    }

    Ok((index, offset))
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn get(&self, key: &EventKey) -> Result<Option<LedgerRecord>> {
        Ok(self.inner.lock().await.index.get(key).cloned())
    }

    async fn try_claim(&self, claim: ClaimRecord, now: TimestampMs) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.index.admits_claim(&claim.key, now) {
            return Ok(false);
        }
        self.append(&mut inner, LedgerRecord::Claim(claim)).await?;
        Ok(true)
    }

    async fn complete(&self, record: CompletionRecord) -> Result<CompletionRecord> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.index.terminal(&record.key) {
            return Ok(existing.clone());
        }
        self.append(&mut inner, LedgerRecord::Completion(record.clone()))
            .await?;
        Ok(record)
    }

    async fn fail(&self, record: CompletionRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.index.terminal(&record.key).is_some() {
            return Ok(false);
        }
        self.append(&mut inner, LedgerRecord::Completion(record))
            .await?;
        Ok(true)
    }
}

/// Source of the current time in milliseconds since the unix epoch.
pub type Clock = Arc<dyn Fn() -> TimestampMs + Send + Sync>;

/// Claim and completion ledger keyed by [`EventKey`].
#[derive(Clone)]
pub struct EventLedger {
    /// Where records live.
    store: Arc<dyn LedgerStore>,
    /// Time used for leases.
    clock: Clock,
    /// Deadline of every store call.
    op_timeout: Duration,
}

impl EventLedger {
    /// Creates a ledger over `store` using wall-clock time.
    pub fn new(store: Arc<dyn LedgerStore>, op_timeout: Duration) -> Self {
        Self::with_clock(store, op_timeout, Arc::new(now_millis))
    }

    /// Creates a ledger over `store` reading time from `clock`.
    pub fn with_clock(store: Arc<dyn LedgerStore>, op_timeout: Duration, clock: Clock) -> Self {
        Self {
            store,
            clock,
            op_timeout,
        }
    }

    /// Runs a store call under `op_timeout`.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        future: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        timeout(self.op_timeout, future)
            .await
            .map_err(|_| LedgerError::Timeout {
                operation,
                timeout: self.op_timeout,
            })?
    }

    /// Latest record for `key`, for observability.
    pub async fn record(&self, key: &EventKey) -> Result<Option<LedgerRecord>> {
        self.bounded("read", self.store.get(key)).await
    }

    /// Whether `key` has a COMPLETED record.
    pub async fn is_completed(&self, key: &EventKey) -> Result<bool> {
        Ok(self
            .record(key)
            .await?
            .is_some_and(|record| record.is_terminal()))
    }

    /// Result token of a completed `key`.
    pub async fn get_result(&self, key: &EventKey) -> Result<Option<String>> {
        Ok(match self.record(key).await? {
            Some(LedgerRecord::Completion(completion)) if completion.is_terminal() => {
                completion.result_token
            }
            _ => None,
        })
    }

    /// Attempts to take an exclusive claim on `key` for `lease`.
    ///
    /// Returns `false` if `key` is completed or another live claim holds it.
    pub async fn claim(&self, key: &EventKey, lease: Duration) -> Result<bool> {
        let now = (self.clock)();
        let claim = ClaimRecord {
            key: key.clone(),
            claimed_at: now,
            lease_expires_at: now.saturating_add(lease.as_millis() as TimestampMs),
        };
        let claimed = self
            .bounded("claim", self.store.try_claim(claim, now))
            .await?;
        debug!("Claim on {} {}", key, if claimed { "taken" } else { "refused" });
        Ok(claimed)
    }

    /// Records the terminal outcome of `key`.
    ///
    /// Completing an already completed key keeps the first record.
    pub async fn mark_complete(&self, key: &EventKey, result_token: String) -> Result<()> {
        let record = CompletionRecord::completed(key.clone(), result_token.clone(), (self.clock)());
        let effective = self.bounded("complete", self.store.complete(record)).await?;
        if effective.result_token.as_deref() != Some(result_token.as_str()) {
            info!("{} was already completed, keeping its original result", key);
        }
        Ok(())
    }

    /// Records an advisory failure for `key`, releasing it for a later retry.
    ///
    /// Ignored, with a warning, if `key` is already completed.
    pub async fn mark_failed(&self, key: &EventKey, error_message: &str) -> Result<()> {
        let message: String = error_message.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        let record = CompletionRecord::failed(key.clone(), message, (self.clock)());
        if !self.bounded("fail", self.store.fail(record)).await? {
            warn!("Ignoring failure report for completed event {}", key);
        }
        Ok(())
    }
}
