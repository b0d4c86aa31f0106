//! The summarization pipeline.
//!
//! ```text
//! article listener -> ArticleBatcher -> fetch workers (summarizer)
//!                                    -> store worker (sled + summary publisher)
//! ```
//!
//! The batcher runs on the listener's task and only hands batches off. The
//! fetch pool calls the summarizer; the single-worker store pool serializes
//! writes to the store and republishes each summary.

pub mod batcher;
pub mod model;
pub mod stages;
pub mod summarizer;
pub mod text;

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::broker::message::Payload;
use crate::transport::Connector;
use crate::worker::{WorkerQueue, WorkerQueueConfig};

pub use batcher::ArticleBatcher;
pub use model::{Article, ArticleBatch, Summary, SummaryBatch};
pub use stages::{FetchStage, StoreStage, summary_message};
pub use summarizer::{HttpSummarizer, Summarizer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Payload fields every article must carry with a non-empty value.
    pub required_fields: Vec<String>,
    pub fetch: WorkerQueueConfig,
    pub store: WorkerQueueConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            required_fields: vec!["content".to_string()],
            fetch: WorkerQueueConfig::new("fetch", 4),
            store: WorkerQueueConfig::new("store", 1),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    fetch_queue: Arc<WorkerQueue<Vec<Payload>>>,
    store_queue: Arc<WorkerQueue<SummaryBatch>>,
}

impl Pipeline {
    /// Wires both worker pools. Neither pool runs until the first batch
    /// needs it.
    pub fn new<C>(
        config: PipelineConfig,
        runtime: Handle,
        summarizer: Arc<dyn Summarizer>,
        store_stage: StoreStage<C>,
    ) -> Self
    where
        C: Connector + 'static,
    {
        let store_queue = Arc::new(WorkerQueue::new(config.store.clone(), move |batch| {
            store_stage.run(batch)
        }));

        let fetch_stage = FetchStage::new(runtime, summarizer, Arc::clone(&store_queue));
        let fetch_queue = Arc::new(WorkerQueue::new(config.fetch.clone(), move |batch| {
            fetch_stage.run(batch)
        }));

        Self {
            config,
            fetch_queue,
            store_queue,
        }
    }

    /// A delivery handler feeding this pipeline.
    pub fn batcher(&self) -> ArticleBatcher {
        ArticleBatcher::new(
            self.config.batch_size,
            self.config.required_fields.clone(),
            Arc::clone(&self.fetch_queue),
        )
    }

    pub fn fetch_queue(&self) -> &WorkerQueue<Vec<Payload>> {
        &self.fetch_queue
    }

    pub fn store_queue(&self) -> &WorkerQueue<SummaryBatch> {
        &self.store_queue
    }

    /// Stops both pools and waits for their workers. Tasks still queued are
    /// dropped.
    pub fn shutdown(&self) {
        self.fetch_queue.stop();
        self.fetch_queue.join();
        self.store_queue.stop();
        self.store_queue.join();
    }
}

#[cfg(test)]
mod tests;
