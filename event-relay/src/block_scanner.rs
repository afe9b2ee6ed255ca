//! # Block Scanner
//!
//! Fetches one block and extracts the events a [`EventFilter`] selects. A missing
//! block is the normal state while waiting for the chain and is reported as
//! [`ScanStatus::NotMined`](crate::model::ScanStatus::NotMined), not as a failure.
//! Transport and decoding failures are retried with a fixed delay; once the
//! budget is spent the scan reports [`ScanStatus::Error`](crate::model::ScanStatus::Error)
//! instead of raising, leaving the escalation decision to the caller.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use snafu::{ensure, ResultExt, Snafu};
use tokio::time::{sleep, timeout};

use crate::chain::{ChainError, ChainReader};
use crate::metrics::SCAN_RESULTS;
use crate::model::{BlockHeight, BlockScanResult, DecodeError, Event, EventFilter};

/// Retry and deadline settings of a [`BlockScanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPolicy {
    /// Total attempts per scan. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause between two attempts.
    pub retry_delay: Duration,
    /// Deadline of a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a single scan attempt failed.
#[derive(Debug, Snafu)]
enum AttemptError {
    /// The node could not be read.
    #[snafu(display("chain read failed: {source}"))]
    Read {
        /// The underlying chain error.
        source: ChainError,
    },

    /// The node did not answer in time.
    #[snafu(display("chain read timed out after {timeout:?}"))]
    Timeout {
        /// Deadline of the attempt.
        timeout: Duration,
    },

    /// A matching event could not be decoded.
    #[snafu(display("{source}"))]
    Decode {
        /// The underlying decode error.
        source: DecodeError,
    },

    /// The node answered with some other block.
    #[snafu(display("node returned block {returned} for height {requested}"))]
    HeightMismatch {
        /// Height asked for.
        requested: BlockHeight,
        /// Height of the returned block.
        returned: BlockHeight,
    },
}

/// Reads blocks and decodes the events of interest.
pub struct BlockScanner {
    /// Chain access.
    reader: Arc<dyn ChainReader>,
    /// Retries and deadlines.
    policy: ScanPolicy,
}

impl BlockScanner {
    /// Creates a scanner reading through `reader`.
    pub fn new(reader: Arc<dyn ChainReader>, policy: ScanPolicy) -> Self {
        Self { reader, policy }
    }

    /// Scans the block at `height` for events matching `filter`.
    ///
    /// Never fails: exhausted retries come back as an error-status result.
    pub async fn scan(&self, height: BlockHeight, filter: &EventFilter) -> BlockScanResult {
        let result = self.scan_with_retries(height, filter).await;
        SCAN_RESULTS
            .with_label_values(&[&result.status.to_string()])
            .inc();
        result
    }

    /// Attempts the scan until one attempt succeeds or the budget is spent.
    async fn scan_with_retries(&self, height: BlockHeight, filter: &EventFilter) -> BlockScanResult {
        if height == 0 {
            return BlockScanResult::error("block heights start at 1".to_string());
        }

        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.attempt(height, filter).await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(
                        "Scan attempt {}/{} for block {} failed: {}",
                        attempt, attempts, height, e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        BlockScanResult::error(format!(
            "scan of block {height} failed after {attempts} attempt(s): {last_error}"
        ))
    }

    /// One bounded read and decode of `height`.
    async fn attempt(
        &self,
        height: BlockHeight,
        filter: &EventFilter,
    ) -> Result<BlockScanResult, AttemptError> {
        let read = timeout(self.policy.attempt_timeout, self.reader.get_block(height, true))
            .await
            .map_err(|_| {
                TimeoutSnafu {
                    timeout: self.policy.attempt_timeout,
                }
                .build()
            })?
            .context(ReadSnafu)?;

        let Some(block) = read else {
            debug!("Block {} not produced yet", height);
            return Ok(BlockScanResult::not_mined());
        };

        ensure!(
            block.block_height == height,
            HeightMismatchSnafu {
                requested: height,
                returned: block.block_height,
            }
        );

        let mut events = Vec::new();
        for transaction in block.transactions() {
            for raw in transaction
                .events
                .iter()
                .filter(|raw| filter.matches(&raw.event_type))
            {
                let event = Event::decode(
                    filter,
                    &raw.event_type,
                    height,
                    transaction.hash.clone(),
                    &raw.data,
                )
                .context(DecodeSnafu)?;
                events.push(event);
            }
        }

        debug!("Block {} yielded {} matching event(s)", height, events.len());
        Ok(BlockScanResult::mined(events))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::ScanStatus;
    use crate::test_utils::{block_with_events, FakeChain};

    fn filter() -> EventFilter {
        EventFilter::new("0x1", "mentions", "MentionEvent")
    }

    fn policy() -> ScanPolicy {
        ScanPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn we_can_report_missing_blocks_as_not_mined() {
        let chain = Arc::new(FakeChain::default());
        let scanner = BlockScanner::new(chain.clone(), policy());

        let result = scanner.scan(100, &filter()).await;

        assert_eq!(result, BlockScanResult::not_mined());
        assert_eq!(chain.reads(), 1);
    }

    #[tokio::test]
    async fn we_can_extract_only_matching_events() {
        let chain = Arc::new(FakeChain::default());
        chain.insert(block_with_events(
            100,
            vec![
                ("0x1::mentions::MentionEvent", json!({"post_id": "1"})),
                ("0x1::coin::DepositEvent", json!({"amount": "5"})),
                ("0x1::mentions::MentionEvent", json!({"post_id": "2"})),
            ],
        ));
        let scanner = BlockScanner::new(chain, policy());

        let result = scanner.scan(100, &filter()).await;

        assert_eq!(result.status, ScanStatus::Mined);
        assert_eq!(result.events.len(), 2);
        assert!(result.events.iter().all(|event| event.block_height == 100));
        assert_eq!(result.events[1].payload["post_id"], json!("2"));
    }

    #[tokio::test]
    async fn we_can_scan_blocks_without_matches() {
        let chain = Arc::new(FakeChain::default());
        chain.insert(block_with_events(
            7,
            vec![("0x1::coin::DepositEvent", json!({"amount": "5"}))],
        ));
        let scanner = BlockScanner::new(chain, policy());

        let result = scanner.scan(7, &filter()).await;

        assert_eq!(result, BlockScanResult::mined(vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn we_can_retry_transient_failures() {
        let chain = Arc::new(FakeChain::default());
        chain.insert(block_with_events(
            9,
            vec![("0x1::mentions::MentionEvent", json!({"post_id": "1"}))],
        ));
        chain.fail_next(2);
        let scanner = BlockScanner::new(chain.clone(), policy());

        let result = scanner.scan(9, &filter()).await;

        assert_eq!(result.status, ScanStatus::Mined);
        assert_eq!(result.events.len(), 1);
        assert_eq!(chain.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn we_cannot_scan_past_the_retry_budget() {
        let chain = Arc::new(FakeChain::default());
        chain.fail_next(10);
        let scanner = BlockScanner::new(chain.clone(), policy());

        let result = scanner.scan(9, &filter()).await;

        assert_eq!(result.status, ScanStatus::Error);
        assert!(result.events.is_empty());
        assert!(result.error.unwrap().contains("after 3 attempt(s)"));
        assert_eq!(chain.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn we_cannot_scan_blocks_with_undecodable_events() {
        let chain = Arc::new(FakeChain::default());
        chain.insert(block_with_events(
            4,
            vec![("0x1::mentions::MentionEvent", json!(["not", "an", "object"]))],
        ));
        let scanner = BlockScanner::new(chain, policy());

        let result = scanner.scan(4, &filter()).await;

        assert_eq!(result.status, ScanStatus::Error);
        assert!(result.error.unwrap().contains("non-object"));
    }

    #[tokio::test(start_paused = true)]
    async fn we_cannot_wait_on_stuck_reads() {
        let chain = Arc::new(FakeChain::default());
        chain.stall_reads(Duration::from_secs(60));
        let scanner = BlockScanner::new(chain, policy());

        let result = scanner.scan(4, &filter()).await;

        assert_eq!(result.status, ScanStatus::Error);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn we_cannot_scan_height_zero() {
        let chain = Arc::new(FakeChain::default());
        let scanner = BlockScanner::new(chain.clone(), policy());

        let result = scanner.scan(0, &filter()).await;

        assert_eq!(result.status, ScanStatus::Error);
        assert_eq!(chain.reads(), 0);
    }
}
