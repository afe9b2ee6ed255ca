//! # Chain Read Interface
//!
//! The scanner only ever needs one thing from a node: the block at a height, with
//! its transactions and their events, or the knowledge that the block does not
//! exist yet. [`ChainReader`] is that seam. [`RestChainReader`] implements it over
//! a node's REST API (`/v1/blocks/by_height/{height}`), where event types are
//! rendered as `<address>::<module>::<EventName>`.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use url::Url;

use crate::model::BlockHeight;

/// A block as returned by the node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Block {
    /// Height of the block.
    #[serde(deserialize_with = "height_from_string_or_number")]
    pub block_height: BlockHeight,
    /// Hash of the block.
    #[serde(default)]
    pub block_hash: Option<String>,
    /// Transactions of the block. Absent when requested without transactions.
    #[serde(default)]
    pub transactions: Option<Vec<Transaction>>,
}

impl Block {
    /// Transactions of the block, empty when none were returned.
    pub fn transactions(&self) -> &[Transaction] {
        self.transactions.as_deref().unwrap_or_default()
    }
}

/// A transaction inside a [`Block`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Transaction {
    /// Transaction hash.
    #[serde(default)]
    pub hash: Option<String>,
    /// Events emitted by the transaction.
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

/// An undecoded event emitted by a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEvent {
    /// Fully qualified type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event body.
    #[serde(default)]
    pub data: Value,
}

/// Accepts a height written either as a JSON number or as a decimal string.
fn height_from_string_or_number<'de, D>(deserializer: D) -> Result<BlockHeight, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        /// `123`
        Number(BlockHeight),
        /// `"123"`
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(height) => Ok(height),
        Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
    }
}

/// Errors returned by a [`ChainReader`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ChainError {
    /// The request never produced a response.
    #[snafu(display("request for block {height} failed: {source}"))]
    Request {
        /// Requested height.
        height: BlockHeight,
        /// The underlying transport error.
        source: reqwest::Error,
    },

    /// The node answered with an unexpected status.
    #[snafu(display("node answered block {height} with status {status}: {body}"))]
    UnexpectedStatus {
        /// Requested height.
        height: BlockHeight,
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnosis.
        body: String,
    },

    /// The response body could not be decoded into a [`Block`].
    #[snafu(display("could not decode block {height}: {source}"))]
    DecodeBlock {
        /// Requested height.
        height: BlockHeight,
        /// The underlying decoding error.
        source: serde_json::Error,
    },

    /// The request url could not be built.
    #[snafu(display("invalid node url: {source}"))]
    InvalidUrl {
        /// The underlying parse error.
        source: url::ParseError,
    },

    /// The reader failed for a reason of its own.
    #[snafu(display("{message}"))]
    Other {
        /// Description of the failure.
        message: String,
    },
}

/// Read access to the source chain.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Fetches the block at `height`.
    ///
    /// Returns `Ok(None)` when the block has not been produced yet.
    async fn get_block(
        &self,
        height: BlockHeight,
        with_transactions: bool,
    ) -> Result<Option<Block>, ChainError>;
}

/// [`ChainReader`] over a node's REST API.
pub struct RestChainReader {
    /// Shared http client with the request timeout applied.
    client: Client,
    /// Base url of the node, ending in `/`.
    node_url: Url,
}

impl RestChainReader {
    /// Creates a reader against `node_url`, bounding each request by `request_timeout`.
    pub fn new(node_url: Url, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            node_url: with_trailing_slash(node_url),
        })
    }

    /// Url of the block at `height`.
    fn block_url(&self, height: BlockHeight, with_transactions: bool) -> Result<Url, ChainError> {
        let mut url = self
            .node_url
            .join(&format!("v1/blocks/by_height/{height}"))
            .context(InvalidUrlSnafu)?;
        url.query_pairs_mut()
            .append_pair("with_transactions", &with_transactions.to_string());
        Ok(url)
    }
}

/// Makes relative joins land under the url's path.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Whether a non-success response means the block simply is not there yet.
fn is_block_not_found(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error_code").and_then(Value::as_str).map(str::to_owned))
        .is_some_and(|code| code == "block_not_found")
}

#[async_trait]
impl ChainReader for RestChainReader {
    async fn get_block(
        &self,
        height: BlockHeight,
        with_transactions: bool,
    ) -> Result<Option<Block>, ChainError> {
        let url = self.block_url(height, with_transactions)?;
        debug!("Fetching block {} from {}", height, url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context(RequestSnafu { height })?;
        let status = response.status();
        let body = response.text().await.context(RequestSnafu { height })?;

        if status.is_success() {
            let block = serde_json::from_str(&body).context(DecodeBlockSnafu { height })?;
            return Ok(Some(block));
        }

        if is_block_not_found(status, &body) {
            return Ok(None);
        }

        Err(ChainError::UnexpectedStatus {
            height,
            status: status.as_u16(),
            body,
        })
    }
}
