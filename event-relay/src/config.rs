//! Command line and environment configuration of the relay.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use snafu::{ensure, Snafu};
use url::Url;

use crate::block_processor::ProcessorConfig;
use crate::block_scanner::ScanPolicy;
use crate::model::{BlockHeight, EventFilter};

/// Configuration rejected by [`RelayArgs::validate`].
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A claim could expire while its action is still allowed to run.
    #[snafu(display(
        "claim lease ({claim_lease_ms}ms) must exceed the action timeout ({action_timeout_ms}ms)"
    ))]
    LeaseTooShort {
        /// Configured lease.
        claim_lease_ms: u64,
        /// Configured action timeout.
        action_timeout_ms: u64,
    },

    /// The breaker would open before any failure.
    #[snafu(display("circuit_max_failures must be at least 1"))]
    ZeroMaxFailures,

    /// Heights start at 1.
    #[snafu(display("genesis_height must be at least 1"))]
    ZeroGenesisHeight,
}

/// CLI args of one relayed event stream.
#[derive(Debug, Clone, Args)]
pub struct RelayArgs {
    /// Base url of the chain node REST api.
    #[arg(long, env, default_value = "http://127.0.0.1:8080")]
    pub node_url: Url,

    /// Account address that emits the relayed events.
    #[arg(long, env)]
    pub event_address: String,

    /// Module declaring the relayed event.
    #[arg(long, env)]
    pub event_module: String,

    /// Name of the relayed event struct.
    #[arg(long, env)]
    pub event_name: String,

    /// Payload fields identifying a logical event, comma separated.
    ///
    /// Empty means the whole payload identifies the event.
    #[arg(long, env, value_delimiter = ',')]
    pub key_fields: Vec<String>,

    /// Endpoint performing the action of each event.
    #[arg(long, env)]
    pub action_url: Url,

    /// Append-only file of claims and completions.
    #[arg(long, env, default_value = "event-relay.ledger")]
    pub ledger_path: PathBuf,

    /// File holding the last drained height.
    #[arg(long, env, default_value = "event-relay.checkpoint")]
    pub checkpoint_path: PathBuf,

    /// Durable mirror of the checkpoint, e.g. on a shared volume.
    #[arg(long, env)]
    pub shared_checkpoint_path: Option<PathBuf>,

    /// Height to start from when no checkpoint exists.
    #[arg(long, env, default_value_t = 1)]
    pub genesis_height: BlockHeight,

    /// Pause between two processing cycles.
    #[arg(long, env, default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Scan attempts per cycle before the block counts as failed.
    #[arg(long, env, default_value_t = 3)]
    pub max_scan_retries: u32,

    /// Pause between two scan attempts.
    #[arg(long, env, default_value_t = 1000)]
    pub scan_retry_delay_ms: u64,

    /// Deadline of a single block read.
    #[arg(long, env, default_value_t = 30000)]
    pub scan_timeout_ms: u64,

    /// Lease of an event claim.
    #[arg(long, env, default_value_t = 300000)]
    pub claim_lease_ms: u64,

    /// Deadline of a single action.
    #[arg(long, env, default_value_t = 120000)]
    pub action_timeout_ms: u64,

    /// Deadline of a single ledger or checkpoint operation.
    #[arg(long, env, default_value_t = 10000)]
    pub store_timeout_ms: u64,

    /// Attempts at recording a completion before it is parked.
    #[arg(long, env, default_value_t = 3)]
    pub store_retries: u32,

    /// Pause between two attempts at recording a completion.
    #[arg(long, env, default_value_t = 500)]
    pub store_retry_delay_ms: u64,

    /// Consecutive failed cycles that open the circuit.
    #[arg(long, env, default_value_t = 5)]
    pub circuit_max_failures: u32,

    /// Time the circuit stays open before a trial.
    #[arg(long, env, default_value_t = 60000)]
    pub circuit_reset_timeout_ms: u64,

    /// Events of one block resolved at the same time.
    #[arg(long, env, default_value_t = 4)]
    pub max_concurrent_events: usize,

    /// Bind address for Prometheus metrics.
    #[arg(long, env, default_value = "0.0.0.0:9100")]
    pub metrics_bind: SocketAddr,
}

impl RelayArgs {
    /// Rejects combinations the relay cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.claim_lease_ms > self.action_timeout_ms,
            LeaseTooShortSnafu {
                claim_lease_ms: self.claim_lease_ms,
                action_timeout_ms: self.action_timeout_ms,
            }
        );
        ensure!(self.circuit_max_failures > 0, ZeroMaxFailuresSnafu);
        ensure!(self.genesis_height > 0, ZeroGenesisHeightSnafu);
        Ok(())
    }

    /// The relayed event type and its key fields.
    pub fn filter(&self) -> EventFilter {
        EventFilter::new(&self.event_address, &self.event_module, &self.event_name)
            .with_key_fields(
                self.key_fields
                    .iter()
                    .map(|field| field.trim().to_string())
                    .filter(|field| !field.is_empty())
                    .collect(),
            )
    }

    /// Retry behaviour of the scanner.
    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            max_attempts: self.max_scan_retries.max(1),
            retry_delay: Duration::from_millis(self.scan_retry_delay_ms),
            attempt_timeout: Duration::from_millis(self.scan_timeout_ms),
        }
    }

    /// Tunables of the processor.
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            claim_lease: Duration::from_millis(self.claim_lease_ms),
            action_timeout: Duration::from_millis(self.action_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            store_retries: self.store_retries,
            store_retry_delay: Duration::from_millis(self.store_retry_delay_ms),
            max_concurrent_events: self.max_concurrent_events.max(1),
        }
    }

    /// Deadline of a single ledger or checkpoint operation.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Time the circuit stays open before a trial.
    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_timeout_ms)
    }

    /// Deadline of a single block read.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Deadline of a single action.
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}
