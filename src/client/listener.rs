//! Queue consumer with bounded nack retry.
//!
//! A [`Listener`] walks `Disconnected -> Connecting -> Connected -> Consuming
//! -> Closed`. [`Listener::on_message`] owns the delivery loop: every
//! delivery is decoded into a [`Message`], handed to the
//! [`DeliveryHandler`] on the loop's own task, and settled according to the
//! returned [`Disposition`]. Handlers must not block; heavy work belongs on a
//! worker queue.

use std::fmt;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::{NackDecision, NackRetryPolicy, NackRetryTracker, RetryKey};
use crate::broker::connection::BrokerConnection;
use crate::broker::message::Message;
use crate::broker::topology::{Topology, ensure};
use crate::transport::{Channel, Connector, Delivery, DeliveryStream};
use crate::utils::error::BrokerError;

/// What to do with a delivery once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// `requeue: true` asks for a retry, bounded by the listener's
    /// [`NackRetryPolicy`].
    Nack { requeue: bool },
}

/// Receives decoded deliveries.
pub trait DeliveryHandler: Send {
    fn on_deliver(&mut self, message: &Message) -> Disposition;
}

impl<F> DeliveryHandler for F
where
    F: FnMut(&Message) -> Disposition + Send,
{
    fn on_deliver(&mut self, message: &Message) -> Disposition {
        self(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Connected,
    Consuming,
    Closed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Disconnected => "disconnected",
            ListenerState::Connecting => "connecting",
            ListenerState::Connected => "connected",
            ListenerState::Consuming => "consuming",
            ListenerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub struct Listener<C: Connector> {
    connection: BrokerConnection<C>,
    topology: Topology,
    retry: NackRetryTracker,
    state: ListenerState,
    consumer_tag: String,
    shutdown: CancellationToken,
}

impl<C: Connector> Listener<C> {
    pub fn new(connection: BrokerConnection<C>, topology: Topology) -> Self {
        Self {
            connection,
            topology,
            retry: NackRetryTracker::default(),
            state: ListenerState::Disconnected,
            consumer_tag: format!("crispy-{}", Uuid::new_v4()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_nack_policy(mut self, policy: NackRetryPolicy) -> Self {
        self.retry = NackRetryTracker::new(policy);
        self
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Cancelling this token makes [`Listener::on_message`] return after the
    /// delivery in progress is settled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.state == ListenerState::Closed {
            return Err(BrokerError::Closed);
        }
        self.state = ListenerState::Connecting;
        match self.connection.connect().await {
            Ok(_) => {
                self.state = ListenerState::Connected;
                Ok(())
            }
            Err(BrokerError::AlreadyConnected) => {
                self.state = ListenerState::Connected;
                Err(BrokerError::AlreadyConnected)
            }
            Err(err) => {
                self.state = ListenerState::Disconnected;
                Err(err)
            }
        }
    }

    /// Consumes the topology's queue until the shutdown token is cancelled.
    ///
    /// A stream ended by the broker is an error
    /// ([`BrokerError::ConsumerCancelled`]), not a clean stop.
    ///
    /// Connects first when needed. The topology is declared and the prefetch
    /// applied before the consumer is registered.
    pub async fn on_message<H: DeliveryHandler>(&mut self, mut handler: H) -> Result<(), BrokerError> {
        let queue = self.topology.require_queue()?.to_string();
        match self.state {
            ListenerState::Consuming => return Err(BrokerError::AlreadyConsuming(queue)),
            ListenerState::Closed => return Err(BrokerError::Closed),
            _ => {}
        }
        if !self.connection.is_connected() {
            self.connect().await?;
        }

        let channel = self.connection.channel()?;
        ensure(channel, &self.topology).await?;
        channel.set_prefetch(self.topology.prefetch_count).await?;
        let mut deliveries = channel.consume(&queue, &self.consumer_tag).await?;

        self.state = ListenerState::Consuming;
        info!(
            queue = %queue,
            consumer_tag = %self.consumer_tag,
            prefetch = self.topology.prefetch_count,
            "waiting for messages"
        );

        let result = dispatch(&queue, &mut deliveries, &mut handler, &mut self.retry, &self.shutdown).await;

        drop(deliveries);
        if channel.is_open() {
            if let Err(err) = channel.cancel(&self.consumer_tag).await {
                warn!(queue = %queue, error = %err, "failed to cancel consumer");
            }
        }
        self.state = ListenerState::Connected;
        result
    }

    /// Stops consuming and closes channel and connection.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        if self.state == ListenerState::Closed {
            return Ok(());
        }
        self.shutdown.cancel();
        self.state = ListenerState::Closed;
        self.connection.close().await?;
        info!(consumer_tag = %self.consumer_tag, "listener closed");
        Ok(())
    }
}

async fn dispatch<H: DeliveryHandler>(
    queue: &str,
    deliveries: &mut DeliveryStream,
    handler: &mut H,
    retry: &mut NackRetryTracker,
    shutdown: &CancellationToken,
) -> Result<(), BrokerError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("shutdown requested, no longer consuming");
                return Ok(());
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => handle_delivery(delivery, handler, retry).await?,
            Some(Err(err)) => return Err(err),
            None => {
                error!(queue, "delivery stream ended by broker");
                return Err(BrokerError::ConsumerCancelled(queue.to_string()));
            }
        }
    }
}

async fn handle_delivery<H: DeliveryHandler>(
    delivery: Delivery,
    handler: &mut H,
    retry: &mut NackRetryTracker,
) -> Result<(), BrokerError> {
    let key = RetryKey::for_delivery(&delivery);
    let tag = delivery.delivery_tag;

    let message = match Message::from_json(&delivery.body, delivery.properties.clone()) {
        Ok(mut message) => {
            message.retries = retry.attempts(&key);
            message
        }
        Err(err) => {
            warn!(delivery_tag = tag, error = %err, "rejecting undecodable message");
            retry.settle(&key);
            return delivery.acker.nack(false).await;
        }
    };

    match handler.on_deliver(&message) {
        Disposition::Ack => {
            retry.settle(&key);
            debug!(delivery_tag = tag, "message acknowledged");
            delivery.acker.ack().await
        }
        Disposition::Nack { requeue: false } => {
            retry.settle(&key);
            debug!(delivery_tag = tag, ?key, "message rejected");
            delivery.acker.nack(false).await
        }
        Disposition::Nack { requeue: true } => match retry.on_requeue_request(&key) {
            NackDecision::Requeue { attempt, delay } => {
                info!(
                    delivery_tag = tag,
                    ?key,
                    attempt,
                    max_retries = retry.policy().max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "requeueing message"
                );
                tokio::time::sleep(delay).await;
                delivery.acker.nack(true).await
            }
            NackDecision::Drop { attempts } => {
                warn!(delivery_tag = tag, ?key, attempts, "retry budget spent, dropping message");
                delivery.acker.nack(false).await
            }
        },
    }
}
