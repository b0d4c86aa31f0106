use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::runtime::Handle;

use crate::broker::connection::{BrokerConnection, BrokerEndpoint, RetryPolicy};
use crate::broker::memory::{AckEvent, MemoryBroker, MemoryConnector};
use crate::broker::message::{Message, MessageProperties};
use crate::client::listener::Listener;
use crate::client::publisher::Publisher;
use crate::config::Settings;
use crate::persistence::SummaryStore;
use crate::pipeline::{ArticleBatch, Pipeline, StoreStage, Summary, SummaryBatch, Summarizer};
use crate::utils::error::SummarizeError;

#[derive(Default)]
struct RecordingSummarizer {
    batches: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Summarizer for RecordingSummarizer {
    async fn summarize(&self, batch: &ArticleBatch) -> Result<SummaryBatch, SummarizeError> {
        let ids = batch.articles.iter().map(|a| a.article_id.clone()).collect();
        self.batches.lock().unwrap().push(ids);

        Ok(SummaryBatch {
            summaries: batch
                .articles
                .iter()
                .map(|a| Summary {
                    article_id: a.article_id.clone(),
                    summary: format!("summary of {}", a.title),
                    title: a.title.clone(),
                    url: a.url.clone(),
                    date: a.date.clone(),
                })
                .collect(),
        })
    }
}

fn retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(1),
    }
}

fn connection(connector: &Arc<MemoryConnector>) -> BrokerConnection<MemoryConnector> {
    BrokerConnection::new(Arc::clone(connector), BrokerEndpoint::default(), retry())
}

fn article(name: &str) -> Message {
    let payload = json!({
        "article_id": name,
        "url": format!("https://news.example/{name}"),
        "title": format!("Title {name}"),
        "content": format!("<p>Body of {name}</p>"),
        "date": "2024-03-01T08:00:00Z",
    });
    Message::new(payload.as_object().cloned().unwrap_or_default())
        .with_properties(MessageProperties::json().persistent().with_message_id(name))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn articles_flow_from_listener_to_summary_queue() {
    let broker = MemoryBroker::new();
    let connector = Arc::new(broker.connector());
    let dir = tempfile::tempdir().unwrap();
    let store = SummaryStore::open(dir.path().join("db")).unwrap();
    let settings = Settings::default();
    let summarizer = Arc::new(RecordingSummarizer::default());

    let store_stage = StoreStage::new(
        Handle::current(),
        Arc::clone(&connector),
        BrokerEndpoint::default(),
        retry(),
        settings.publisher.topology().unwrap(),
        store.clone(),
    );
    let mut config = settings.pipeline.pipeline_config();
    config.fetch.poll_interval = Duration::from_millis(5);
    config.store.poll_interval = Duration::from_millis(5);
    let pipeline = Arc::new(Pipeline::new(
        config,
        Handle::current(),
        summarizer.clone(),
        store_stage,
    ));

    // the scraper side publishes five articles
    let mut producer = Publisher::new(connection(&connector), settings.listener.topology().unwrap());
    producer.connect().await.unwrap();
    for name in ["A", "B", "C", "D", "E"] {
        assert!(producer.publish(&article(name)).await.unwrap());
    }
    producer.close().await.unwrap();

    let mut listener = Listener::new(connection(&connector), settings.listener.topology().unwrap());
    let shutdown = listener.shutdown_token();
    let batcher = pipeline.batcher();
    let consumer = tokio::spawn(async move {
        let result = listener.on_message(batcher).await;
        (listener, result)
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while broker.queue_depth("summary_queue") < 5 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    let (mut listener, result) = consumer.await.unwrap();
    result.unwrap();
    listener.close().await.unwrap();
    let workers = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || workers.shutdown()).await.unwrap();

    // one fetch task carrying the whole batch in receipt order
    assert_eq!(*summarizer.batches.lock().unwrap(), [["A", "B", "C", "D", "E"]]);

    // every article was acknowledged on receipt
    let acks = broker.ack_events();
    assert_eq!(acks.len(), 5);
    assert!(acks.iter().all(|e| matches!(e, AckEvent::Ack { .. })));

    // five upserts
    assert_eq!(store.partition_len("2024-03-01").unwrap(), 5);
    let stored = store.get("2024-03-01", "https://news.example/C").unwrap().unwrap();
    assert_eq!(stored.article_id, "C");
    assert_eq!(stored.summary, "summary of Title C");

    // five outbound publishes, one per summary
    let published: Vec<_> = broker
        .published()
        .into_iter()
        .filter(|r| r.exchange == "summary_exchange")
        .collect();
    assert_eq!(published.len(), 5);
    let article_ids: Vec<String> = published
        .iter()
        .map(|r| {
            let message = Message::from_json(&r.body, r.properties.clone()).unwrap();
            assert_eq!(message.properties.kind.as_deref(), Some("summary"));
            assert!(!message.mandatory);
            message.field_str("article_id").unwrap().to_string()
        })
        .collect();
    assert_eq!(article_ids, ["A", "B", "C", "D", "E"]);
    assert_eq!(broker.queue_depth("summary_queue"), 5);
}
