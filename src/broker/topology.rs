//! Exchange/queue/binding declarations.
//!
//! A [`TopologyConfig`] is assembled with builder methods and resolved once
//! into an immutable [`Topology`]. Resolution applies the dead-letter
//! defaulting rule: a missing dead-letter exchange falls back to the primary
//! exchange and a missing dead-letter routing key falls back to the primary
//! routing key.
//!
//! [`ensure`] declares a resolved topology on an open channel. It relies on
//! the broker's idempotent declare semantics, so running it repeatedly with
//! the same topology neither errors nor duplicates bindings.

use tracing::{debug, info};

use crate::transport::{Binding, Channel, ExchangeKind, ExchangeSpec, QueueArguments, QueueSpec};
use crate::utils::error::{BrokerError, TopologyError};

/// Dead-letter wiring for a queue. Unset fields are defaulted on resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    /// Message TTL in milliseconds.
    pub message_ttl: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    queue: Option<String>,
    exchange: Option<String>,
    kind: Option<ExchangeKind>,
    routing_key: String,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    prefetch_count: u16,
    dead_letter: Option<DeadLetterConfig>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            queue: None,
            exchange: None,
            kind: None,
            routing_key: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            prefetch_count: 1,
            dead_letter: None,
        }
    }
}

impl TopologyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    pub fn exchange(mut self, name: impl Into<String>, kind: ExchangeKind) -> Self {
        self.exchange = Some(name.into());
        self.kind = Some(kind);
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Consumer prefetch. Ignored by publishers.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Enables dead-letter handling.
    pub fn dead_letter(mut self, dead_letter: DeadLetterConfig) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Validates the configuration and applies the defaulting rules.
    pub fn resolve(self) -> Result<Topology, TopologyError> {
        let exchange_name = self.exchange.filter(|name| !name.is_empty());
        let queue_name = self.queue.filter(|name| !name.is_empty());

        let exchange = match (&exchange_name, self.kind) {
            (Some(name), Some(kind)) => Some(ExchangeSpec {
                name: name.clone(),
                kind,
                durable: self.durable,
                auto_delete: self.auto_delete,
            }),
            _ => None,
        };

        let mut dead_letter_exchange = None;
        let arguments = match self.dead_letter {
            Some(dead_letter) => {
                let dlx = dead_letter
                    .exchange
                    .or_else(|| exchange_name.clone())
                    .unwrap_or_default();
                let dlk = dead_letter
                    .routing_key
                    .unwrap_or_else(|| self.routing_key.clone());

                if !dlx.is_empty() && exchange_name.as_deref() != Some(dlx.as_str()) {
                    dead_letter_exchange = Some(ExchangeSpec {
                        name: dlx.clone(),
                        kind: ExchangeKind::Direct,
                        durable: self.durable,
                        auto_delete: self.auto_delete,
                    });
                }

                QueueArguments {
                    dead_letter_exchange: Some(dlx),
                    dead_letter_routing_key: Some(dlk),
                    message_ttl: dead_letter.message_ttl,
                }
            }
            None => QueueArguments::default(),
        };

        let queue = queue_name.as_ref().map(|name| QueueSpec {
            name: name.clone(),
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments,
        });

        let binding = match (&queue_name, &exchange) {
            (Some(queue), Some(exchange)) => {
                if self.routing_key.is_empty() && exchange.kind != ExchangeKind::Fanout {
                    return Err(TopologyError::EmptyRoutingKey {
                        queue: queue.clone(),
                        exchange: exchange.name.clone(),
                        kind: exchange.kind.to_string(),
                    });
                }
                Some(Binding {
                    queue: queue.clone(),
                    exchange: exchange.name.clone(),
                    routing_key: self.routing_key.clone(),
                })
            }
            _ => None,
        };

        Ok(Topology {
            exchange,
            dead_letter_exchange,
            queue,
            binding,
            routing_key: self.routing_key,
            prefetch_count: self.prefetch_count,
        })
    }
}

/// A resolved, immutable topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: Option<ExchangeSpec>,
    pub dead_letter_exchange: Option<ExchangeSpec>,
    pub queue: Option<QueueSpec>,
    pub binding: Option<Binding>,
    pub routing_key: String,
    pub prefetch_count: u16,
}

impl Topology {
    /// Exchange messages are published to; the default exchange when unset.
    pub fn publish_exchange(&self) -> &str {
        self.exchange.as_ref().map_or("", |exchange| exchange.name.as_str())
    }

    /// The queue to consume from.
    pub fn require_queue(&self) -> Result<&str, TopologyError> {
        self.queue
            .as_ref()
            .map(|queue| queue.name.as_str())
            .ok_or(TopologyError::MissingQueue)
    }
}

/// Declares `topology` on `channel`.
pub async fn ensure<C>(channel: &C, topology: &Topology) -> Result<(), BrokerError>
where
    C: Channel + ?Sized,
{
    if !channel.is_open() {
        return Err(BrokerError::ChannelClosed);
    }

    if let Some(exchange) = &topology.exchange {
        channel.declare_exchange(exchange).await?;
        debug!(exchange = %exchange.name, kind = %exchange.kind, "exchange declared");
    }
    if let Some(dlx) = &topology.dead_letter_exchange {
        channel.declare_exchange(dlx).await?;
        debug!(exchange = %dlx.name, "dead-letter exchange declared");
    }
    if let Some(queue) = &topology.queue {
        channel.declare_queue(queue).await?;
        debug!(queue = %queue.name, "queue declared");
    }
    if let Some(binding) = &topology.binding {
        channel.bind_queue(binding).await?;
    }

    info!(
        exchange = topology.publish_exchange(),
        queue = topology.queue.as_ref().map(|q| q.name.as_str()),
        routing_key = %topology.routing_key,
        "topology ready"
    );
    Ok(())
}
