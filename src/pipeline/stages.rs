use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::model::{ArticleBatch, Summary, SummaryBatch};
use super::summarizer::Summarizer;
use crate::broker::connection::{BrokerConnection, BrokerEndpoint, RetryPolicy};
use crate::broker::message::{Message, MessageProperties, Payload};
use crate::broker::topology::Topology;
use crate::client::publisher::Publisher;
use crate::persistence::SummaryStore;
use crate::transport::Connector;
use crate::utils::error::BrokerError;
use crate::worker::WorkerQueue;

/// Calls the summarizer for one article batch and forwards the result to
/// the store workers. Failures drop the batch.
pub struct FetchStage {
    runtime: Handle,
    summarizer: Arc<dyn Summarizer>,
    store_queue: Arc<WorkerQueue<SummaryBatch>>,
}

impl FetchStage {
    pub fn new(
        runtime: Handle,
        summarizer: Arc<dyn Summarizer>,
        store_queue: Arc<WorkerQueue<SummaryBatch>>,
    ) -> Self {
        Self {
            runtime,
            summarizer,
            store_queue,
        }
    }

    /// Runs on a fetch worker thread.
    pub fn run(&self, batch: Vec<Payload>) {
        let request = ArticleBatch::from_payloads(&batch);
        let articles = request.articles.len();
        info!(articles, "fetching summaries");

        let started = Instant::now();
        let result = self.runtime.block_on(self.summarizer.summarize(&request));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(summaries) => {
                info!(articles, summaries = summaries.summaries.len(), elapsed_ms, "summaries fetched");
                if let Err(err) = self.store_queue.submit(summaries) {
                    error!(error = %err, "failed to start store workers");
                }
            }
            Err(err) => {
                error!(articles, elapsed_ms, error = %err, "summarization failed, dropping batch");
            }
        }
    }
}

/// Persists a summary batch and republishes one message per summary over a
/// publisher connection opened for this batch only.
pub struct StoreStage<C: Connector> {
    runtime: Handle,
    connector: Arc<C>,
    endpoint: BrokerEndpoint,
    retry: RetryPolicy,
    topology: Topology,
    confirm_delivery: bool,
    store: SummaryStore,
}

impl<C: Connector> StoreStage<C> {
    pub fn new(
        runtime: Handle,
        connector: Arc<C>,
        endpoint: BrokerEndpoint,
        retry: RetryPolicy,
        topology: Topology,
        store: SummaryStore,
    ) -> Self {
        Self {
            runtime,
            connector,
            endpoint,
            retry,
            topology,
            confirm_delivery: true,
            store,
        }
    }

    pub fn confirm_delivery(mut self, enabled: bool) -> Self {
        self.confirm_delivery = enabled;
        self
    }

    /// Runs on a store worker thread.
    pub fn run(&self, batch: SummaryBatch) {
        let total = batch.summaries.len();
        if let Err(err) = self.runtime.block_on(self.publish_batch(&batch)) {
            error!(summaries = total, error = %err, "failed to publish summary batch");
        }
    }

    /// Returns how many summaries the broker accepted.
    pub async fn publish_batch(&self, batch: &SummaryBatch) -> Result<usize, BrokerError> {
        let connection = BrokerConnection::new(Arc::clone(&self.connector), self.endpoint.clone(), self.retry);
        let mut publisher =
            Publisher::new(connection, self.topology.clone()).confirm_delivery(self.confirm_delivery);

        let result = self.store_and_publish(&mut publisher, batch).await;
        if let Err(err) = publisher.close().await {
            warn!(error = %err, "failed to close summary publisher");
        }
        result
    }

    async fn store_and_publish(
        &self,
        publisher: &mut Publisher<C>,
        batch: &SummaryBatch,
    ) -> Result<usize, BrokerError> {
        publisher.connect().await?;

        let mut published = 0;
        for summary in &batch.summaries {
            let stored = match self.store.upsert(summary) {
                Ok(stored) => stored,
                Err(err) => {
                    error!(article_id = %summary.article_id, url = %summary.url, error = %err, "failed to store summary, skipping");
                    continue;
                }
            };

            let message = summary_message(summary, stored.summary_id());
            if publisher.publish(&message).await? {
                published += 1;
                info!(article_id = %summary.article_id, summary_id = stored.summary_id(), "summary published");
            } else {
                warn!(article_id = %summary.article_id, summary_id = stored.summary_id(), "summary not delivered");
            }
        }

        info!(published, total = batch.summaries.len(), "summary batch drained");
        Ok(published)
    }
}

/// The outbound message announcing a stored summary.
pub fn summary_message(summary: &Summary, summary_id: &str) -> Message {
    let mut payload = Map::new();
    payload.insert("summary_id".to_string(), Value::from(summary_id));
    payload.insert("article_id".to_string(), Value::from(summary.article_id.as_str()));
    payload.insert("summary".to_string(), Value::from(summary.summary.as_str()));
    payload.insert("date".to_string(), Value::from(summary.date.as_str()));
    payload.insert("url".to_string(), Value::from(summary.url.as_str()));
    payload.insert("title".to_string(), Value::from(summary.title.as_str()));

    Message::new(payload)
        .with_properties(
            MessageProperties::json()
                .persistent()
                .with_kind("summary")
                .with_message_id(Uuid::new_v4().to_string()),
        )
        .with_mandatory(false)
}
