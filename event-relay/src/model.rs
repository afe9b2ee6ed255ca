//! # Relay Data Model
//!
//! Types shared by the scanner, the ledger, the checkpoint store and the driver.
//!
//! - [`Event`]: an immutable record decoded from a block. Never persisted; it is
//!   re-derived from the source block on every scan.
//! - [`EventKey`]: the deterministic, payload-derived identity of an [`Event`].
//! - [`LedgerRecord`]: the tagged union of [`ClaimRecord`] and [`CompletionRecord`]
//!   stored per key by the event ledger.
//! - [`Checkpoint`]: the stream cursor.
//! - [`BlockScanResult`]: the transient outcome of scanning one height.

use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use snafu::Snafu;

/// Height of a block on the source chain.
pub type BlockHeight = u64;

/// Milliseconds since the unix epoch, the timestamp unit of every persisted record.
pub type TimestampMs = u64;

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_millis() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as TimestampMs)
        .unwrap_or_default()
}

/// Selects the events of interest out of a block.
///
/// Events are matched on their fully qualified type tag,
/// `<address>::<module>::<EventName>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    /// Account address that published the module.
    pub address: String,
    /// Module that emits the event.
    pub module: String,
    /// Name of the event struct.
    pub event_name: String,
    /// Payload fields hashed into the [`EventKey`]. Empty means the whole payload.
    pub key_fields: Vec<String>,
}

impl EventFilter {
    /// Creates a filter keyed on the whole payload.
    pub fn new(
        address: impl Into<String>,
        module: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            module: module.into(),
            event_name: event_name.into(),
            key_fields: Vec::new(),
        }
    }

    /// Restricts key derivation to the given payload fields.
    pub fn with_key_fields(mut self, key_fields: Vec<String>) -> Self {
        self.key_fields = key_fields;
        self
    }

    /// The fully qualified type tag this filter matches.
    pub fn type_tag(&self) -> String {
        format!("{}::{}::{}", self.address, self.module, self.event_name)
    }

    /// Returns true if `event_type` names the event this filter selects.
    ///
    /// The address part is compared case-insensitively since nodes render hex
    /// addresses in either case.
    pub fn matches(&self, event_type: &str) -> bool {
        let mut parts = event_type.splitn(3, "::");
        match (parts.next(), parts.next(), parts.next()) {
            (Some(address), Some(module), Some(event_name)) => {
                address.eq_ignore_ascii_case(&self.address)
                    && module == self.module
                    && event_name == self.event_name
            }
            _ => false,
        }
    }
}

/// Errors raised while turning raw event data into an [`Event`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum DecodeError {
    /// The event data was not a JSON object.
    #[snafu(display("event {event_type} at height {height} carries non-object data"))]
    PayloadNotObject {
        /// Type tag of the offending event.
        event_type: String,
        /// Height of the block the event came from.
        height: BlockHeight,
    },

    /// A configured key field was absent from the payload.
    #[snafu(display("event {event_type} at height {height} is missing key field '{field}'"))]
    MissingKeyField {
        /// Type tag of the offending event.
        event_type: String,
        /// Height of the block the event came from.
        height: BlockHeight,
        /// The missing field.
        field: String,
    },
}

/// Deterministic identity of a logical event.
///
/// Derived from the event type and stable payload fields only, so the same logical
/// event keeps its key no matter which block or transaction it is re-observed in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKey(
    /// Hex SHA-256 digest.
    String,
);

impl EventKey {
    /// Derives the key for an event.
    ///
    /// The digest covers the event type and the canonical JSON rendering of either
    /// the whole payload or only `key_fields`. `serde_json` maps keep their keys
    /// sorted, which makes the rendering canonical. Returns the first missing field
    /// if `key_fields` names one the payload does not have.
    pub fn derive(
        event_type: &str,
        payload: &Map<String, Value>,
        key_fields: &[String],
    ) -> Result<Self, String> {
        let selected = if key_fields.is_empty() {
            Value::Object(payload.clone())
        } else {
            let mut selected = Map::new();
            for field in key_fields {
                let value = payload.get(field).ok_or_else(|| field.clone())?;
                selected.insert(field.clone(), value.clone());
            }
            Value::Object(selected)
        };

        let mut hasher = Sha256::new();
        hasher.update(event_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(selected.to_string().as_bytes());
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Wraps an already derived key, e.g. one read back from storage.
    pub fn from_hex(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The hex form of the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event of interest decoded from a block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Fully qualified type tag.
    pub event_type: String,
    /// Height of the block the event was observed in.
    pub block_height: BlockHeight,
    /// Hash of the emitting transaction, when the node reports one.
    pub transaction_hash: Option<String>,
    /// Domain payload, e.g. a reference to the text to reply to and its author.
    pub payload: Map<String, Value>,
    /// Payload-derived identity.
    pub key: EventKey,
}

impl Event {
    /// Decodes raw event data observed at `height` into an [`Event`].
    pub fn decode(
        filter: &EventFilter,
        event_type: &str,
        height: BlockHeight,
        transaction_hash: Option<String>,
        data: &Value,
    ) -> Result<Self, DecodeError> {
        let Value::Object(payload) = data else {
            return Err(DecodeError::PayloadNotObject {
                event_type: event_type.to_string(),
                height,
            });
        };

        let key = EventKey::derive(event_type, payload, &filter.key_fields).map_err(|field| {
            DecodeError::MissingKeyField {
                event_type: event_type.to_string(),
                height,
                field,
            }
        })?;

        Ok(Self {
            event_type: event_type.to_string(),
            block_height: height,
            transaction_hash,
            payload: payload.clone(),
            key,
        })
    }
}

/// A live or expired intent marker held by the worker processing an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Claimed event.
    pub key: EventKey,
    /// When the claim was taken.
    pub claimed_at: TimestampMs,
    /// When the claim stops excluding other workers.
    pub lease_expires_at: TimestampMs,
}

impl ClaimRecord {
    /// A claim is live until its lease expiry instant.
    pub fn is_live(&self, now: TimestampMs) -> bool {
        now < self.lease_expires_at
    }
}

/// Outcome recorded for an executed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    /// Terminal. The action ran and must never run again.
    Completed,
    /// Advisory. The action failed and may be retried.
    Failed,
}

impl Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            CompletionStatus::Completed => "COMPLETED",
            CompletionStatus::Failed => "FAILED",
        };
        write!(f, "{}", str)
    }
}

/// Result of executing an event's action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Executed event.
    pub key: EventKey,
    /// Terminal or advisory status.
    pub status: CompletionStatus,
    /// Token returned by the action executor, set when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_token: Option<String>,
    /// Failure description, set when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the outcome was recorded.
    pub completed_at: TimestampMs,
}

impl CompletionRecord {
    /// Builds a terminal record.
    pub fn completed(key: EventKey, result_token: String, at: TimestampMs) -> Self {
        Self {
            key,
            status: CompletionStatus::Completed,
            result_token: Some(result_token),
            error_message: None,
            completed_at: at,
        }
    }

    /// Builds an advisory failure record.
    pub fn failed(key: EventKey, error_message: String, at: TimestampMs) -> Self {
        Self {
            key,
            status: CompletionStatus::Failed,
            result_token: None,
            error_message: Some(error_message),
            completed_at: at,
        }
    }

    /// Whether this record forbids any further execution.
    pub fn is_terminal(&self) -> bool {
        self.status == CompletionStatus::Completed
    }
}

/// One entry of the event ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    /// A worker claimed the event.
    Claim(ClaimRecord),
    /// The event's action completed or failed.
    Completion(CompletionRecord),
}

impl LedgerRecord {
    /// The event this record belongs to.
    pub fn key(&self) -> &EventKey {
        match self {
            LedgerRecord::Claim(claim) => &claim.key,
            LedgerRecord::Completion(completion) => &completion.key,
        }
    }

    /// Whether this record forbids any further execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerRecord::Completion(completion) if completion.is_terminal())
    }
}

/// Cursor of the stream: every event at or below `height` is terminally processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last fully drained height.
    pub height: BlockHeight,
    /// When the cursor was written.
    pub updated_at: TimestampMs,
}

/// Outcome class of scanning one height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// The block does not exist yet. Expected while waiting on the chain.
    NotMined,
    /// The block exists. Its matching events, if any, were decoded.
    Mined,
    /// The retry budget ran out.
    Error,
}

impl Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            ScanStatus::NotMined => "not_mined",
            ScanStatus::Mined => "mined",
            ScanStatus::Error => "error",
        };
        write!(f, "{}", str)
    }
}

/// Transient result of one scan attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockScanResult {
    /// Outcome class.
    pub status: ScanStatus,
    /// Decoded events, empty unless `status` is [`ScanStatus::Mined`].
    pub events: Vec<Event>,
    /// Description of the last failure when `status` is [`ScanStatus::Error`].
    pub error: Option<String>,
}

impl BlockScanResult {
    /// The block has not been produced yet.
    pub fn not_mined() -> Self {
        Self {
            status: ScanStatus::NotMined,
            events: Vec::new(),
            error: None,
        }
    }

    /// The block exists and yielded `events`.
    pub fn mined(events: Vec<Event>) -> Self {
        Self {
            status: ScanStatus::Mined,
            events,
            error: None,
        }
    }

    /// The scan gave up.
    pub fn error(message: String) -> Self {
        Self {
            status: ScanStatus::Error,
            events: Vec::new(),
            error: Some(message),
        }
    }
}
