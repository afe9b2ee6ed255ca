//! Fakes shared by the unit tests.
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::io::AsyncWrite;

use crate::chain::{Block, ChainError, ChainReader, RawEvent, Transaction};
use crate::checkpoint::{self, CheckpointError, CursorStore, MemoryCursorStore};
use crate::event_ledger::{self, LedgerError, LedgerStore, MemoryLedgerStore};
use crate::executor::{ActionError, ActionExecutor};
use crate::model::{
    BlockHeight,
    Checkpoint,
    ClaimRecord,
    CompletionRecord,
    Event,
    EventKey,
    LedgerRecord,
    TimestampMs,
};

/// A small test utility for creating a directory for use in a test that gets automatically
/// deleted at the end of the test or in the event of a failure by `Drop`.
pub struct TestDirectory {
    /// The path of the created test directory.
    pub path: PathBuf,
}

impl TestDirectory {
    /// Generate a random directory for this test.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let sub_directory_name: u128 = rng.gen();

        let path = std::env::temp_dir()
            .join("event_relay_tests")
            .join(sub_directory_name.to_string());

        std::fs::create_dir_all(&path).unwrap();

        TestDirectory { path }
    }
}

impl Drop for TestDirectory {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Writer that buffers every write and fails once the buffer is flushed, the way
/// a buffered file behaves on a full disk.
#[derive(Debug, Default)]
pub struct FullDisk {
    /// Bytes accepted into the buffer.
    pub buffered: usize,
}

impl AsyncWrite for FullDisk {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffered += buf.len();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Other,
            "no space left on device",
        )))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

/// Hand-driven millisecond clock.
#[derive(Clone)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: TimestampMs) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn as_clock(&self) -> event_ledger::Clock {
        let now = self.0.clone();
        Arc::new(move || now.load(Ordering::SeqCst))
    }
}

/// Builds a block with one transaction per event.
pub fn block_with_events(height: BlockHeight, events: Vec<(&str, Value)>) -> Block {
    Block {
        block_height: height,
        block_hash: Some(format!("0x{height:064x}")),
        transactions: Some(
            events
                .into_iter()
                .enumerate()
                .map(|(index, (event_type, data))| Transaction {
                    hash: Some(format!("0x{height:x}{index:04x}")),
                    events: vec![RawEvent {
                        event_type: event_type.to_string(),
                        data,
                    }],
                })
                .collect(),
        ),
    }
}

/// In-memory chain with injectable failures.
#[derive(Default)]
pub struct FakeChain {
    blocks: Mutex<HashMap<BlockHeight, Block>>,
    reads: AtomicUsize,
    failures_left: AtomicUsize,
    stall: Mutex<Option<Duration>>,
}

impl FakeChain {
    pub fn insert(&self, block: Block) {
        self.blocks
            .lock()
            .unwrap()
            .insert(block.block_height, block);
    }

    pub fn fail_next(&self, reads: usize) {
        self.failures_left.store(reads, Ordering::SeqCst);
    }

    pub fn stall_reads(&self, by: Duration) {
        *self.stall.lock().unwrap() = Some(by);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn get_block(
        &self,
        height: BlockHeight,
        _with_transactions: bool,
    ) -> Result<Option<Block>, ChainError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let stall = *self.stall.lock().unwrap();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChainError::Other {
                message: "node unreachable".to_string(),
            });
        }

        Ok(self.blocks.lock().unwrap().get(&height).cloned())
    }
}

/// Executor that records calls and fails on demand.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<EventKey>>,
    failures_left: AtomicUsize,
    always_failing: Mutex<HashSet<EventKey>>,
}

impl RecordingExecutor {
    pub fn fail_next(&self, calls: usize) {
        self.failures_left.store(calls, Ordering::SeqCst);
    }

    pub fn always_fail(&self, key: &EventKey) {
        self.always_failing.lock().unwrap().insert(key.clone());
    }

    pub fn calls(&self) -> Vec<EventKey> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &EventKey) -> usize {
        self.calls().iter().filter(|call| *call == key).count()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, event: &Event) -> Result<String, ActionError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(event.key.clone());
            calls.len()
        };

        let failing = self.always_failing.lock().unwrap().contains(&event.key)
            || self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if failing {
            return Err(ActionError::Rejected {
                message: "timeout".to_string(),
            });
        }

        Ok(format!("t{call}"))
    }
}

/// Ledger store wrapper with injectable stalls and completion failures.
#[derive(Default)]
pub struct FlakyLedgerStore {
    inner: MemoryLedgerStore,
    stall: Mutex<Option<Duration>>,
    complete_failures_left: AtomicUsize,
    completes: AtomicUsize,
    writes: AtomicUsize,
}

impl FlakyLedgerStore {
    pub fn stall(&self, by: Duration) {
        *self.stall.lock().unwrap() = Some(by);
    }

    pub fn fail_next_completes(&self, count: usize) {
        self.complete_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    /// Claims, completions and failures attempted so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn maybe_stall(&self) {
        let stall = *self.stall.lock().unwrap();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyLedgerStore {
    async fn get(&self, key: &EventKey) -> event_ledger::Result<Option<LedgerRecord>> {
        self.maybe_stall().await;
        self.inner.get(key).await
    }

    async fn try_claim(&self, claim: ClaimRecord, now: TimestampMs) -> event_ledger::Result<bool> {
        self.maybe_stall().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.try_claim(claim, now).await
    }

    async fn complete(&self, record: CompletionRecord) -> event_ledger::Result<CompletionRecord> {
        self.maybe_stall().await;
        self.completes.fetch_add(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .complete_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Unavailable {
                message: "store offline".to_string(),
            });
        }
        self.inner.complete(record).await
    }

    async fn fail(&self, record: CompletionRecord) -> event_ledger::Result<bool> {
        self.maybe_stall().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.fail(record).await
    }
}

/// Cursor store wrapper whose reads and writes can be switched off.
#[derive(Default)]
pub struct FlakyCursorStore {
    inner: MemoryCursorStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyCursorStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CursorStore for FlakyCursorStore {
    fn describe(&self) -> String {
        "flaky".to_string()
    }

    async fn read(&self) -> checkpoint::Result<Option<Checkpoint>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable {
                message: "read refused".to_string(),
            });
        }
        self.inner.read().await
    }

    async fn write(&self, checkpoint: Checkpoint) -> checkpoint::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable {
                message: "write refused".to_string(),
            });
        }
        self.inner.write(checkpoint).await
    }
}
