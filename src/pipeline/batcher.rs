use std::mem;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::broker::message::{Message, Payload};
use crate::client::listener::{DeliveryHandler, Disposition};
use crate::worker::WorkerQueue;

/// Accumulates validated article payloads on the listener's task and hands
/// every full batch to the fetch workers.
///
/// Messages are acknowledged on receipt. A batch that fails later in the
/// pipeline is not redelivered.
pub struct ArticleBatcher {
    batch: Vec<Payload>,
    batch_size: usize,
    required_fields: Vec<String>,
    fetch_queue: Arc<WorkerQueue<Vec<Payload>>>,
}

impl ArticleBatcher {
    pub fn new(
        batch_size: usize,
        required_fields: Vec<String>,
        fetch_queue: Arc<WorkerQueue<Vec<Payload>>>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch: Vec::with_capacity(batch_size),
            batch_size,
            required_fields,
            fetch_queue,
        }
    }

    /// Payloads received since the last hand-off.
    pub fn pending(&self) -> &[Payload] {
        &self.batch
    }

    /// First required field that is absent, null or an empty string.
    fn missing_field(&self, payload: &Payload) -> Option<&str> {
        self.required_fields
            .iter()
            .find(|field| match payload.get(field.as_str()) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
            .map(String::as_str)
    }

    fn hand_off(&mut self) {
        let batch = mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        info!(batch_size = batch.len(), "article batch queued for summarization");
        if let Err(err) = self.fetch_queue.submit(batch) {
            error!(queue = self.fetch_queue.name(), error = %err, "failed to start fetch workers");
        }
    }
}

impl DeliveryHandler for ArticleBatcher {
    fn on_deliver(&mut self, message: &Message) -> Disposition {
        if let Some(field) = self.missing_field(&message.payload) {
            warn!(
                field,
                url = message.field_str("url"),
                message_id = message.properties.message_id.as_deref(),
                "invalid article payload, rejecting"
            );
            return Disposition::Nack { requeue: false };
        }

        self.batch.push(message.payload.clone());
        debug!(
            url = message.field_str("url"),
            buffered = self.batch.len(),
            batch_size = self.batch_size,
            "article received"
        );

        if self.batch.len() >= self.batch_size {
            self.hand_off();
        }
        Disposition::Ack
    }
}
