//! # Action Executors
//!
//! [`ActionExecutor`] is the single capability the driver needs from the outside
//! world: perform the action an event calls for and return a result token. The
//! action is assumed to be slow and not idempotent. Concrete handlers are chosen
//! by whoever composes the [`BlockProcessor`](crate::block_processor::BlockProcessor).
//!
//! [`WebhookExecutor`] hands each event to an HTTP endpoint that performs the
//! action (for example composing and publishing a reply) and answers with the
//! token identifying what it did.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use url::Url;

use crate::model::{BlockHeight, Event};

/// Failure of an [`ActionExecutor`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ActionError {
    /// The action endpoint could not be reached.
    #[snafu(display("action request failed: {source}"))]
    Request {
        /// The underlying transport error.
        source: reqwest::Error,
    },

    /// The action endpoint refused the event.
    #[snafu(display("action endpoint answered {status}: {body}"))]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnosis.
        body: String,
    },

    /// The action endpoint accepted the event but returned no result token.
    #[snafu(display("action endpoint returned an empty result token"))]
    EmptyToken,

    /// The executor rejected the event for a reason of its own.
    #[snafu(display("{message}"))]
    Rejected {
        /// Description of the failure.
        message: String,
    },
}

/// Performs the external action an event calls for.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Executes `event` and returns a token identifying the result, e.g. the id
    /// of a published reply.
    async fn execute(&self, event: &Event) -> Result<String, ActionError>;
}

/// Body posted to the action endpoint.
#[derive(Serialize)]
struct ActionRequest<'a> {
    /// Event identity, usable by the endpoint for its own deduplication.
    key: &'a str,
    /// Fully qualified type tag.
    event_type: &'a str,
    /// Height the event was observed at.
    block_height: BlockHeight,
    /// Emitting transaction, when known.
    transaction_hash: Option<&'a str>,
    /// Event body.
    payload: &'a Map<String, Value>,
}

/// JSON answer of the action endpoint.
#[derive(Deserialize)]
struct ActionResponse {
    /// Identifies the performed action.
    result_token: String,
}

/// [`ActionExecutor`] that POSTs events to an HTTP endpoint.
pub struct WebhookExecutor {
    /// Shared http client with the request timeout applied.
    client: Client,
    /// Action endpoint.
    url: Url,
}

impl WebhookExecutor {
    /// Creates an executor posting to `url`, bounding each call by `request_timeout`.
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, url })
    }
}

/// Extracts the token from a successful response body. A JSON body must carry
/// `result_token`; any other body is taken verbatim.
fn result_token(body: &str) -> Result<String, ActionError> {
    let token = match serde_json::from_str::<ActionResponse>(body) {
        Ok(response) => response.result_token,
        Err(_) => body.trim().to_string(),
    };
    if token.is_empty() {
        return Err(ActionError::EmptyToken);
    }
    Ok(token)
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    async fn execute(&self, event: &Event) -> Result<String, ActionError> {
        let request = ActionRequest {
            key: event.key.as_str(),
            event_type: &event.event_type,
            block_height: event.block_height,
            transaction_hash: event.transaction_hash.as_deref(),
            payload: &event.payload,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .context(RequestSnafu)?;
        let status = response.status();
        let body = response.text().await.context(RequestSnafu)?;

        if !status.is_success() {
            return Err(ActionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token = result_token(&body)?;
        debug!("Action for {} returned {}", event.key, token);
        Ok(token)
    }
}
