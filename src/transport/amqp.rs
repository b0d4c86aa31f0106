use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Connection, ConnectionProperties,
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
};
use tracing::{debug, info};

use super::{
    Acknowledger, Binding, Channel, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, PublishOutcome, QueueArguments, QueueSpec,
};
use crate::broker::connection::BrokerEndpoint;
use crate::broker::message::MessageProperties;
use crate::utils::error::BrokerError;

const REPLY_SUCCESS: u16 = 200;

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Amqp(err.to_string())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

/// Builds the connection URI field by field, so credentials and vhost are
/// passed through verbatim and never need escaping.
pub fn amqp_uri(endpoint: &BrokerEndpoint) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: endpoint.username.clone(),
                password: endpoint.password.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.vhost().to_string(),
        ..AMQPUri::default()
    }
}

/// Opens AMQP 0-9-1 connections with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    type Channel = AmqpChannel;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<AmqpChannel, BrokerError> {
        let connecting = Connection::connect_uri(amqp_uri(endpoint), ConnectionProperties::default());

        let connected = match endpoint.connection_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| BrokerError::Timeout(endpoint.address()))?,
            None => connecting.await,
        };
        let connection = connected.map_err(|e| BrokerError::Connect {
            endpoint: endpoint.address(),
            reason: e.to_string(),
        })?;

        let channel = connection.create_channel().await?;
        info!(endpoint = %endpoint.address(), channel = channel.id(), "connected to broker");

        Ok(AmqpChannel {
            connection,
            channel,
            confirms: AtomicBool::new(false),
        })
    }
}

/// A `lapin` connection and the single channel opened on it.
pub struct AmqpChannel {
    connection: Connection,
    channel: lapin::Channel,
    confirms: AtomicBool,
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(&spec.name, spec.kind.into(), options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(&spec.name, options, queue_arguments(&spec.arguments))
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        self.confirms.store(true, Ordering::Release);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome, BrokerError> {
        let options = BasicPublishOptions {
            mandatory,
            ..BasicPublishOptions::default()
        };
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, &body, basic_properties(properties))
            .await?;

        let outcome = match confirm.await? {
            Confirmation::Ack(None) => PublishOutcome::Acked,
            Confirmation::Ack(Some(_)) => PublishOutcome::Unroutable,
            Confirmation::Nack(_) => PublishOutcome::Nacked,
            Confirmation::NotRequested => PublishOutcome::Unconfirmed,
        };
        debug!(exchange, routing_key, ?outcome, "publish settled");
        Ok(outcome)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "OK").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "OK").await?;
        }
        info!("broker connection closed");
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            requeue,
            multiple: false,
        };
        self.0.nack(options).await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        body: delivery.data,
        acker: Box::new(AmqpAcker(delivery.acker)),
    }
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key.as_str())),
        );
    }
    if let Some(ttl) = arguments.message_ttl {
        table.insert(ShortString::from("x-message-ttl"), AMQPValue::LongUInt(ttl));
    }
    table
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(ShortString::from(content_type.as_str()));
    }
    if properties.persistent {
        props = props.with_delivery_mode(2);
    }
    if let Some(kind) = &properties.kind {
        props = props.with_kind(ShortString::from(kind.as_str()));
    }
    if let Some(id) = &properties.message_id {
        props = props.with_message_id(ShortString::from(id.as_str()));
    }
    props
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_owned()),
        persistent: *props.delivery_mode() == Some(2),
        kind: props.kind().as_ref().map(|s| s.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_owned()),
    }
}
