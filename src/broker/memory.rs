//! In-memory broker
//!
//! This module contains an in-process broker implementing the transport
//! traits, used to exercise publishers, listeners and the pipeline without a
//! running AMQP server. It is responsible for:
//! - idempotent exchange/queue declarations (a redeclare with different
//!   parameters fails the way `PRECONDITION_FAILED` does)
//! - routing published messages through direct, topic and fanout exchanges
//! - publisher confirms and mandatory returns
//! - delivering to one consumer per queue and recording every ack/nack,
//!   redelivering messages nacked with requeue
//!
//! Concurrency notes:
//! - All state sits behind one `Mutex`; no lock is held across an `.await`.
//! - Connection failures can be injected to exercise the retry budget.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::broker::connection::BrokerEndpoint;
use crate::broker::message::MessageProperties;
use crate::transport::{
    Acknowledger, Binding, Channel, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, PublishOutcome, QueueSpec,
};
use crate::utils::error::{BrokerError, TopologyError};

/// A publish as seen by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub mandatory: bool,
    pub outcome: PublishOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

type ConsumerSender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumer: Option<(String, ConsumerSender)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<Binding>,
    published: Vec<PublishedRecord>,
    acks: Vec<AckEvent>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_tag: u64,
    connect_attempts: u32,
    failing_connects: u32,
    nack_publishes: bool,
}

/// Shared handle to the in-memory broker. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// When set, every publish is negatively confirmed and not routed.
    pub fn nack_publishes(&self, enabled: bool) {
        self.state().nack_publishes = enabled;
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.state().published.clone()
    }

    pub fn ack_events(&self) -> Vec<AckEvent> {
        self.state().acks.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings: Vec<_> = self.state().bindings.iter().cloned().collect();
        bindings.sort();
        bindings
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state().queues.get(name).map(|q| q.spec.clone())
    }

    /// Messages waiting in `queue` that no consumer has taken.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Properties and bodies of the messages waiting in `queue`, oldest first.
    pub fn ready_messages(&self, queue: &str) -> Vec<(MessageProperties, Vec<u8>)> {
        self.state()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| (m.properties.clone(), m.body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => Err(TopologyError::Conflict {
                entity: "exchange",
                name: spec.name.clone(),
            }
            .into()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec == *spec => Ok(()),
            Some(_) => Err(TopologyError::Conflict {
                entity: "queue",
                name: spec.name.clone(),
            }
            .into()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&self, binding: &Binding) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.queues.contains_key(&binding.queue) {
            return Err(TopologyError::UnknownQueue(binding.queue.clone()).into());
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(TopologyError::UnknownExchange(binding.exchange.clone()).into());
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
        mandatory: bool,
        confirms: bool,
    ) -> Result<PublishOutcome, BrokerError> {
        let mut state = self.state();

        let targets: BTreeSet<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let kind = state
                .exchanges
                .get(exchange)
                .map(|spec| spec.kind)
                .ok_or_else(|| TopologyError::UnknownExchange(exchange.to_string()))?;
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && routes(kind, &b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };

        let outcome = if state.nack_publishes {
            PublishOutcome::Nacked
        } else if targets.is_empty() && mandatory {
            PublishOutcome::Unroutable
        } else if confirms {
            PublishOutcome::Acked
        } else {
            PublishOutcome::Unconfirmed
        };

        if outcome.delivered() {
            for queue in &targets {
                let message = StoredMessage {
                    properties: properties.clone(),
                    body: body.clone(),
                    redelivered: false,
                };
                self.enqueue(&mut state, queue, message);
            }
        }

        state.published.push(PublishedRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties: properties.clone(),
            mandatory,
            outcome,
        });
        Ok(outcome)
    }

    fn enqueue(&self, state: &mut BrokerState, queue: &str, message: StoredMessage) {
        let has_consumer = state
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some());
        if has_consumer {
            self.deliver(state, queue, message);
        } else if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(message);
        }
    }

    fn deliver(&self, state: &mut BrokerState, queue: &str, message: StoredMessage) {
        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let delivery = Delivery {
            delivery_tag,
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            body: message.body.clone(),
            acker: Box::new(MemoryAcker {
                broker: self.clone(),
                delivery_tag,
            }),
        };

        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let sent = q
            .consumer
            .as_ref()
            .is_some_and(|(_, sender)| sender.send(Ok(delivery)).is_ok());
        if sent {
            state.unacked.insert(delivery_tag, (queue.to_string(), message));
        } else {
            q.consumer = None;
            q.ready.push_front(message);
        }
    }

    fn attach_consumer(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state();

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TopologyError::UnknownQueue(queue.to_string()))?;
        if q.consumer.is_some() {
            return Err(BrokerError::Amqp(format!("queue '{queue}' already has a consumer")));
        }
        q.consumer = Some((consumer_tag.to_string(), sender));
        let backlog: Vec<_> = q.ready.drain(..).collect();

        for message in backlog {
            self.deliver(&mut state, queue, message);
        }

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    fn detach_consumer(&self, consumer_tag: &str) {
        let mut state = self.state();
        for q in state.queues.values_mut() {
            if q.consumer.as_ref().is_some_and(|(tag, _)| tag == consumer_tag) {
                q.consumer = None;
            }
        }
    }

    /// Ends the delivery stream of the queue's consumer, as a broker-side
    /// `basic.cancel` does.
    pub fn cancel_consumer(&self, queue: &str) {
        if let Some(q) = self.state().queues.get_mut(queue) {
            q.consumer = None;
        }
    }

    fn settle(&self, delivery_tag: u64, event: AckEvent) {
        let mut state = self.state();
        state.acks.push(event);
        let Some((queue, mut message)) = state.unacked.remove(&delivery_tag) else {
            return;
        };
        if let AckEvent::Nack { requeue: true, .. } = event {
            message.redelivered = true;
            self.enqueue(&mut state, &queue, message);
        }
    }
}

/// Whether a binding key routes `routing_key` for an exchange of `kind`.
pub fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_matches(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && topic_matches(rest, &words[1..]),
    }
}

/// Connects to a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Channel = MemoryChannel;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.broker.state();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Connect {
                endpoint: endpoint.address(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            confirms: AtomicBool::new(false),
            consumer_tags: Mutex::new(Vec::new()),
        })
    }
}

/// A channel on the in-memory broker.
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    open: AtomicBool,
    confirms: AtomicBool,
    consumer_tags: Mutex<Vec<String>>,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn tags(&self) -> MutexGuard<'_, Vec<String>> {
        self.consumer_tags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.declare_exchange(spec)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.declare_queue(spec)
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.bind(binding)
    }

    async fn set_prefetch(&self, _count: u16) -> Result<(), BrokerError> {
        self.check_open()
    }

    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.check_open()?;
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
        self.check_open()?;
        let confirms = self.confirms.load(Ordering::Acquire);
        self.broker
            .publish(exchange, routing_key, body, properties, mandatory, confirms)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.check_open()?;
        let stream = self.broker.attach_consumer(queue, consumer_tag)?;
        self.tags().push(consumer_tag.to_string());
        Ok(stream)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.detach_consumer(consumer_tag);
        self.tags().retain(|tag| tag != consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::Release);
        let tags: Vec<String> = self.tags().drain(..).collect();
        for tag in tags {
            self.broker.detach_consumer(&tag);
        }
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.settle(
            self.delivery_tag,
            AckEvent::Ack {
                delivery_tag: self.delivery_tag,
            },
        );
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.broker.settle(
            self.delivery_tag,
            AckEvent::Nack {
                delivery_tag: self.delivery_tag,
                requeue,
            },
        );
        Ok(())
    }
}
