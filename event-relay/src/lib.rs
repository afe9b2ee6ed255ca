//! # Event Relay Library
//!
//! Watches a block-based chain for one kind of event and performs an external,
//! non-idempotent action exactly once per logical event.
//!
//! Blocks are drained strictly in height order. A height is only checkpointed once
//! every matching event in it has a COMPLETED record in the event ledger, so a
//! crash at any point replays at most the unfinished work and never repeats a
//! finished action.
//!
//! ## Modules
//! - [`block_processor`]: The cycle driver tying scanning, resolving and advancing together.
//! - [`block_scanner`]: Reads one height from the chain and extracts matching events.
//! - [`event_ledger`]: Claims and completions keyed by event identity.
//! - [`checkpoint`]: The persisted cursor of the stream.
//! - [`circuit_breaker`]: Fails cycles fast while the chain or stores are unhealthy.

/// Scanning, resolving and advancing one height per cycle.
pub mod block_processor;

/// Single-height chain reads with bounded retries.
pub mod block_scanner;

/// Chain node access: the [`chain::ChainReader`] capability and its REST adapter.
pub mod chain;

/// The persisted cursor: the last fully drained height.
pub mod checkpoint;

/// Consecutive-failure circuit breaker around processing cycles.
pub mod circuit_breaker;

/// Command line and environment configuration.
pub mod config;

/// Writes that surface deferred I/O errors.
mod durable;

/// Idempotency ledger of claims and completions.
///
/// The ledger, not the checkpoint, is what prevents an action from running twice:
/// a completed key is never claimed again, whichever block it is re-observed in.
pub mod event_ledger;

/// The [`executor::ActionExecutor`] capability and its webhook implementation.
pub mod executor;

/// Prometheus collectors and the metrics endpoint.
pub mod metrics;

/// Events, keys, ledger records and scan results.
pub mod model;

#[cfg(test)]
pub(crate) mod test_utils;
