//! The `transport` module is the seam between the messaging layer and the
//! broker client library.
//!
//! [`Connector`] opens a connection together with its channel, and
//! [`Channel`] exposes the handful of AMQP operations the publisher, listener
//! and topology code need. The production implementation lives in [`amqp`]
//! and is backed by `lapin`; `crate::broker::memory` (tests, or the
//! `memory-broker` feature) implements the same traits in process.

pub mod amqp;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::broker::connection::BrokerEndpoint;
use crate::broker::message::MessageProperties;
use crate::utils::error::BrokerError;

/// Exchange routing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Optional `x-` arguments attached to a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    /// Per-message TTL in milliseconds.
    pub message_ttl: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// What the broker reported for a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Confirmed by the broker.
    Acked,
    /// Mandatory message that no queue accepted.
    Unroutable,
    /// Negative confirmation.
    Nacked,
    /// Confirms are not enabled on the channel.
    Unconfirmed,
}

impl PublishOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, PublishOutcome::Acked | PublishOutcome::Unconfirmed)
    }
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, with the handle that settles it.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// An open broker channel together with the connection that owns it.
///
/// A channel is owned by exactly one publisher or listener and is never
/// shared between threads.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn enable_confirms(&self) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome, BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Closes the channel and its connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    type Channel: Channel + 'static;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Self::Channel, BrokerError>;
}
