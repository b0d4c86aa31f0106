//! The `error` module defines the error types used within `crispy`.
//!
//! Errors are grouped by the layer that raises them so callers can tell a
//! transient connection failure apart from a malformed topology or a failed
//! downstream call.

use thiserror::Error;

/// Malformed or conflicting topology declarations. Never retried.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("a queue name is required to consume messages")]
    MissingQueue,

    #[error("binding queue '{queue}' to {kind} exchange '{exchange}' requires a routing key")]
    EmptyRoutingKey {
        queue: String,
        exchange: String,
        kind: String,
    },

    #[error("{entity} '{name}' already declared with different parameters")]
    Conflict { entity: &'static str, name: String },

    #[error("exchange '{0}' does not exist")]
    UnknownExchange(String),

    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),
}

/// Errors raised by the broker connection, channel and clients.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("connection is closed")]
    Closed,

    #[error("channel is not open")]
    ChannelClosed,

    #[error("already consuming from queue '{0}'")]
    AlreadyConsuming(String),

    #[error("broker cancelled the consumer on queue '{0}'")]
    ConsumerCancelled(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("amqp error: {0}")]
    Amqp(String),

    #[error("invalid message body: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures of the external summarization call.
#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarizer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("summarizer answered with status {0}")]
    Status(u16),

    #[error("summarizer response could not be decoded: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Failures of the summary store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("stored record could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("'{0}' does not start with a YYYY-MM-DD date")]
    InvalidDate(String),
}

/// Worker pool failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
