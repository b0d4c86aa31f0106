use tracing::{debug, error, info, warn};

use crate::broker::connection::BrokerConnection;
use crate::broker::message::Message;
use crate::broker::topology::{Topology, ensure};
use crate::transport::{Channel, Connector, PublishOutcome};
use crate::utils::error::BrokerError;

/// Sends messages one at a time to the exchange of its topology.
///
/// There is no local buffering or retry: a message the broker refuses is
/// reported through the `false` return of [`Publisher::publish`] and left to
/// the caller.
pub struct Publisher<C: Connector> {
    connection: BrokerConnection<C>,
    topology: Topology,
    confirm_delivery: bool,
}

impl<C: Connector> Publisher<C> {
    pub fn new(connection: BrokerConnection<C>, topology: Topology) -> Self {
        Self {
            connection,
            topology,
            confirm_delivery: true,
        }
    }

    /// Whether `publish` waits for a broker confirmation. Enabled by default.
    pub fn confirm_delivery(mut self, enabled: bool) -> Self {
        self.confirm_delivery = enabled;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Connects, enables confirms if requested and declares the topology.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        let channel = self.connection.connect().await?;
        if self.confirm_delivery {
            channel.enable_confirms().await?;
        }
        ensure(channel, &self.topology).await
    }

    fn routing_key(&self) -> &str {
        match (&self.topology.exchange, &self.topology.queue) {
            (None, Some(queue)) if self.topology.routing_key.is_empty() => &queue.name,
            _ => &self.topology.routing_key,
        }
    }

    /// Publishes `message`.
    ///
    /// Returns `Ok(false)` when the message was returned as unroutable,
    /// negatively confirmed or lost in transit. Errors are reserved for
    /// misuse: publishing before `connect`, after `close`, or a payload that
    /// cannot be encoded.
    pub async fn publish(&self, message: &Message) -> Result<bool, BrokerError> {
        let channel = self.connection.channel()?;
        let body = message.to_json()?;
        let exchange = self.topology.publish_exchange();
        let routing_key = self.routing_key();
        let message_id = message.properties.message_id.as_deref();

        match channel
            .publish(exchange, routing_key, body, &message.properties, message.mandatory)
            .await
        {
            Ok(outcome) if outcome.delivered() => {
                debug!(exchange, routing_key, message_id, ?outcome, "message published");
                Ok(true)
            }
            Ok(PublishOutcome::Unroutable) => {
                warn!(exchange, routing_key, message_id, "message returned as unroutable");
                Ok(false)
            }
            Ok(outcome) => {
                warn!(exchange, routing_key, message_id, ?outcome, "message not confirmed by broker");
                Ok(false)
            }
            Err(err) => {
                error!(exchange, routing_key, message_id, error = %err, "failed to publish message");
                Ok(false)
            }
        }
    }

    /// Releases channel and connection. Later publishes fail with
    /// [`BrokerError::Closed`].
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        if self.connection.is_closed() {
            return Ok(());
        }
        self.connection.close().await?;
        info!(exchange = self.topology.publish_exchange(), "publisher closed");
        Ok(())
    }
}
