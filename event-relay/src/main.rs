//! This binary relays one kind of chain event to an external action endpoint,
//! performing the action exactly once per logical event.
//!
//! ## Usage
//! ```sh
//! cargo run --bin event-relay -- \
//!   --node-url https://fullnode.testnet.example/ \
//!   --event-address 0x1 --event-module mentions --event-name MentionEvent \
//!   --key-fields post_id \
//!   --action-url http://127.0.0.1:3000/reply
//! ```
use std::sync::Arc;

use clap::Parser;
use event_relay::block_processor::BlockProcessor;
use event_relay::block_scanner::BlockScanner;
use event_relay::chain::RestChainReader;
use event_relay::checkpoint::{
    CheckpointError,
    CheckpointStore,
    CursorStore,
    FileCursorStore,
};
use event_relay::circuit_breaker::CircuitBreaker;
use event_relay::config::{ConfigError, RelayArgs};
use event_relay::event_ledger::{EventLedger, FileLedgerStore, LedgerError};
use event_relay::executor::WebhookExecutor;
use event_relay::metrics::serve_metrics;
use log::{error, info};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;

/// Errors that stop the relay before it starts processing.
#[derive(Debug, Snafu)]
enum RelayError {
    /// Rejected arguments.
    #[snafu(display("Invalid configuration: {source}"))]
    Config {
        /// Why they were rejected.
        source: ConfigError,
    },

    /// The chain or action client could not be built.
    #[snafu(display("Failed to build http client: {source}"))]
    HttpClient {
        /// The underlying client error.
        source: reqwest::Error,
    },

    /// The ledger log could not be opened or replayed.
    #[snafu(display("Failed to open event ledger: {source}"))]
    OpenLedger {
        /// The underlying ledger error.
        source: LedgerError,
    },

    /// No cursor store could be read.
    #[snafu(display("Failed to load checkpoint: {source}"))]
    LoadCheckpoint {
        /// The underlying checkpoint error.
        source: CheckpointError,
    },
}

/// Type alias for returning results with `RelayError`
type Result<T, E = RelayError> = std::result::Result<T, E>;

/// CLI arguments parser using `clap` derive syntax
#[derive(Parser, Debug)]
#[command(
    name = "event-relay",
    version,
    about = "Performs an external action exactly once for every matching chain event"
)]
struct Cli {
    /// Options of the relayed stream.
    #[command(flatten)]
    relay: RelayArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse().relay;
    args.validate().context(ConfigSnafu)?;
    let filter = args.filter();
    info!("Starting event relay for {}", filter.type_tag());

    tokio::spawn({
        let addr = args.metrics_bind;
        async move {
            if let Err(e) = serve_metrics(addr).await {
                error!("Failed to start metrics server: {}", e);
            }
        }
    });

    let reader = RestChainReader::new(args.node_url.clone(), args.scan_timeout())
        .context(HttpClientSnafu)?;
    let executor = WebhookExecutor::new(args.action_url.clone(), args.action_timeout())
        .context(HttpClientSnafu)?;

    let ledger_store = FileLedgerStore::open(&args.ledger_path)
        .await
        .context(OpenLedgerSnafu)?;
    let ledger = EventLedger::new(Arc::new(ledger_store), args.store_timeout());

    let shared = args
        .shared_checkpoint_path
        .as_ref()
        .map(|path| Arc::new(FileCursorStore::new(path)) as Arc<dyn CursorStore>);
    let checkpoint = CheckpointStore::new(
        Arc::new(FileCursorStore::new(&args.checkpoint_path)),
        shared,
        args.genesis_height,
        args.store_timeout(),
    );

    let processor = BlockProcessor::new(
        BlockScanner::new(Arc::new(reader), args.scan_policy()),
        filter,
        ledger,
        checkpoint,
        Arc::new(executor),
        CircuitBreaker::new(args.circuit_max_failures, args.circuit_reset_timeout()),
        args.processor_config(),
    )
    .await
    .context(LoadCheckpointSnafu)?;

    let (shutdown, receiver) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing the current cycle");
                let _ = shutdown.send(true);
            }
            Err(e) => {
                // keep the sender alive so the processor keeps running
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    processor.run(receiver).await;
    Ok(())
}
