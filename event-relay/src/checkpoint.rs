//! # Checkpoint Store
//!
//! Durable cursor of the stream. A saved height means every event at or below it
//! has been terminally processed, so the relay resumes one block above it.
//!
//! The cursor lives in a fast local store and is mirrored to an optional durable
//! shared store. Saves hit the local store first and the mirror second; a failed
//! mirror write is logged and does not fail the save. Loads take the higher of
//! the heights the stores report and fall back to the genesis height when
//! neither holds a cursor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use snafu::{ensure, ResultExt, Snafu};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::durable::write_flushed;
use crate::model::{now_millis, BlockHeight, Checkpoint};

/// Errors raised by the checkpoint store and its cursor stores.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Reading or writing a cursor file failed.
    #[snafu(display("cursor io on '{}' failed: {source}", path.display()))]
    Io {
        /// The cursor file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A cursor could not be serialized.
    #[snafu(display("could not encode checkpoint: {source}"))]
    Encode {
        /// The underlying serialization error.
        source: serde_json::Error,
    },

    /// A cursor file held something other than a checkpoint.
    #[snafu(display("could not decode checkpoint in '{}': {source}", path.display()))]
    Decode {
        /// The cursor file.
        path: PathBuf,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// A cursor store did not answer in time.
    #[snafu(display("checkpoint {operation} on {store} timed out after {timeout:?}"))]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The store that timed out.
        store: String,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// A save would skip or repeat a height.
    #[snafu(display("checkpoint must advance to {expected}, got {height}"))]
    OutOfOrder {
        /// The only height that may be saved next.
        expected: BlockHeight,
        /// The rejected height.
        height: BlockHeight,
    },

    /// No configured store could be read.
    #[snafu(display("no readable checkpoint: {message}"))]
    NoReadableCursor {
        /// The failures, one per store.
        message: String,
    },

    /// A cursor store is unreachable for a reason of its own.
    #[snafu(display("cursor store unavailable: {message}"))]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

/// Type alias for checkpoint results.
pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

/// A place a single [`Checkpoint`] can be kept.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Short description used in logs.
    fn describe(&self) -> String;

    /// The stored checkpoint, if any.
    async fn read(&self) -> Result<Option<Checkpoint>>;

    /// Replaces the stored checkpoint.
    async fn write(&self, checkpoint: Checkpoint) -> Result<()>;
}

/// [`CursorStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    /// The stored checkpoint.
    checkpoint: Mutex<Option<Checkpoint>>,
}

impl MemoryCursorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn read(&self) -> Result<Option<Checkpoint>> {
        Ok(*self.checkpoint.lock().await)
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<()> {
        *self.checkpoint.lock().await = Some(checkpoint);
        Ok(())
    }
}

/// [`CursorStore`] backed by a JSON file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    /// Location of the cursor file.
    path: PathBuf,
}

impl FileCursorStore {
    /// Creates a store at `path`. Nothing is touched until the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the cursor file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file each write goes to before it is renamed over the cursor.
    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        staging.into()
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    fn describe(&self) -> String {
        format!("file '{}'", self.path.display())
    }

    async fn read(&self) -> Result<Option<Checkpoint>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(IoSnafu {
                    path: self.path.clone(),
                })
            }
        };

        let checkpoint = serde_json::from_str(&contents).context(DecodeSnafu {
            path: self.path.clone(),
        })?;
        Ok(Some(checkpoint))
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<()> {
        if let Some(parent) = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent).await.context(IoSnafu {
                path: self.path.clone(),
            })?;
        }

        let contents = serde_json::to_vec(&checkpoint).context(EncodeSnafu)?;
        let staging = self.staging_path();
        // the cursor is only replaced by a staging file known to be on disk
        if let Err(source) = write_staging(&staging, &contents).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(source).context(IoSnafu { path: staging });
        }

        tokio::fs::rename(&staging, &self.path)
            .await
            .context(IoSnafu {
                path: self.path.clone(),
            })
    }
}

/// Creates `path` holding exactly `contents`, flushed and synced.
async fn write_staging(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    write_flushed(&mut file, contents).await?;
    file.sync_all().await
}

/// Cursor of the stream, persisted locally and mirrored to a shared store.
pub struct CheckpointStore {
    /// Store every save must reach.
    local: Arc<dyn CursorStore>,
    /// Best-effort mirror.
    shared: Option<Arc<dyn CursorStore>>,
    /// Height to start at when no store holds a checkpoint.
    genesis_height: BlockHeight,
    /// Deadline of every store call.
    op_timeout: Duration,
    /// The only height the next save accepts, once known.
    next_height: Mutex<Option<BlockHeight>>,
}

impl CheckpointStore {
    /// Creates a store over `local`, mirroring to `shared` when given.
    pub fn new(
        local: Arc<dyn CursorStore>,
        shared: Option<Arc<dyn CursorStore>>,
        genesis_height: BlockHeight,
        op_timeout: Duration,
    ) -> Self {
        Self {
            local,
            shared,
            genesis_height,
            op_timeout,
            next_height: Mutex::new(None),
        }
    }

    /// Reads `store` under `op_timeout`.
    async fn read_bounded(&self, store: &dyn CursorStore) -> Result<Option<Checkpoint>> {
        timeout(self.op_timeout, store.read())
            .await
            .map_err(|_| CheckpointError::Timeout {
                operation: "read",
                store: store.describe(),
                timeout: self.op_timeout,
            })?
    }

    /// Writes `store` under `op_timeout`.
    async fn write_bounded(&self, store: &dyn CursorStore, checkpoint: Checkpoint) -> Result<()> {
        timeout(self.op_timeout, store.write(checkpoint))
            .await
            .map_err(|_| CheckpointError::Timeout {
                operation: "write",
                store: store.describe(),
                timeout: self.op_timeout,
            })?
    }

    /// Returns the height to resume scanning from.
    ///
    /// That is one above the highest checkpoint any store reports, or the genesis
    /// height when none holds one. An unreadable store is logged and skipped; if
    /// every store is unreadable the load fails rather than restarting at genesis.
    pub async fn load(&self) -> Result<BlockHeight> {
        let mut failures = Vec::new();
        let mut answered = false;
        let mut highest: Option<BlockHeight> = None;

        let stores = std::iter::once(&self.local).chain(self.shared.as_ref());
        for store in stores {
            match self.read_bounded(store.as_ref()).await {
                Ok(checkpoint) => {
                    answered = true;
                    if let Some(checkpoint) = checkpoint {
                        highest = highest.max(Some(checkpoint.height));
                    }
                }
                Err(e) => {
                    warn!("Could not read checkpoint from {}: {}", store.describe(), e);
                    failures.push(format!("{}: {}", store.describe(), e));
                }
            }
        }

        ensure!(
            answered,
            NoReadableCursorSnafu {
                message: failures.join("; "),
            }
        );

        let resume = match highest {
            Some(height) => height.saturating_add(1).max(self.genesis_height),
            None => self.genesis_height,
        };
        info!(
            "Resuming at height {} (last checkpoint: {:?})",
            resume, highest
        );
        *self.next_height.lock().await = Some(resume);
        Ok(resume)
    }

    /// Records `height` as fully drained.
    ///
    /// Only the height directly after the previous checkpoint (or the resume
    /// height reported by [`CheckpointStore::load`]) is accepted.
    pub async fn save(&self, height: BlockHeight) -> Result<()> {
        let mut next_height = self.next_height.lock().await;
        if let Some(expected) = *next_height {
            ensure!(height == expected, OutOfOrderSnafu { expected, height });
        }

        let checkpoint = Checkpoint {
            height,
            updated_at: now_millis(),
        };
        self.write_bounded(self.local.as_ref(), checkpoint).await?;
        *next_height = Some(height.saturating_add(1));

        if let Some(shared) = &self.shared {
            if let Err(e) = self.write_bounded(shared.as_ref(), checkpoint).await {
                error!(
                    "Checkpoint {} saved locally but not mirrored to {}: {}",
                    height,
                    shared.describe(),
                    e
                );
            }
        }

        Ok(())
    }

    /// The highest checkpoint saved or loaded so far.
    pub async fn last_saved(&self) -> Option<BlockHeight> {
        self.next_height
            .lock()
            .await
            .and_then(|next| next.checked_sub(1))
            .filter(|height| *height >= self.genesis_height)
    }
}
