use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prost::Message as _;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::batcher::ArticleBatcher;
use super::model::{Article, ArticleBatch, Summary, SummaryBatch};
use super::stages::{FetchStage, StoreStage, summary_message};
use super::summarizer::{HttpSummarizer, Summarizer};
use super::text::preprocess;
use crate::broker::connection::{BrokerEndpoint, RetryPolicy};
use crate::broker::memory::MemoryBroker;
use crate::broker::message::{Message, MessageProperties, Payload};
use crate::broker::topology::TopologyConfig;
use crate::client::listener::{DeliveryHandler, Disposition};
use crate::persistence::SummaryStore;
use crate::transport::ExchangeKind;
use crate::utils::error::SummarizeError;
use crate::worker::{WorkerQueue, WorkerQueueConfig};

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

fn article(name: &str) -> Message {
    Message::new(payload(json!({
        "article_id": name,
        "url": format!("https://news.example/{name}"),
        "title": name,
        "content": format!("body of {name}"),
        "date": "2024-03-01T08:00:00Z",
    })))
    .with_properties(MessageProperties::json().with_message_id(name))
}

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn queue_config(name: &str) -> WorkerQueueConfig {
    WorkerQueueConfig::new(name, 1).poll_interval(Duration::from_millis(5))
}

fn recording_queue<T: Send + 'static>(name: &str) -> (Arc<WorkerQueue<T>>, Arc<Mutex<Vec<T>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let queue = WorkerQueue::new(queue_config(name), move |task: T| sink.lock().unwrap().push(task));
    (Arc::new(queue), seen)
}

fn summary(name: &str) -> Summary {
    Summary {
        article_id: name.to_string(),
        summary: format!("summary of {name}"),
        title: name.to_string(),
        url: format!("https://news.example/{name}"),
        date: "2024-03-01T08:00:00Z".to_string(),
    }
}

struct StubSummarizer {
    fail: bool,
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, batch: &ArticleBatch) -> Result<SummaryBatch, SummarizeError> {
        if self.fail {
            return Err(SummarizeError::Status(503));
        }
        Ok(SummaryBatch {
            summaries: batch.articles.iter().map(|a| summary(&a.article_id)).collect(),
        })
    }
}

#[test]
fn test_preprocess_cleans_article_text() {
    let raw = "Read <b>this</b> at https://x.io/a?b=1 now.\n\nCaf\u{e9}   news\tdone";
    assert_eq!(preprocess(raw), "Read this at now. Caf news done");
}

#[test]
fn test_article_from_payload() {
    let article = Article::from_payload(&payload(json!({
        "article_id": 17,
        "url": "https://a",
        "content": "<p>Hello\n world</p>",
        "date": null,
    })));
    assert_eq!(article.article_id, "17");
    assert_eq!(article.url, "https://a");
    assert_eq!(article.title, "");
    assert_eq!(article.content, "Hello world");
    assert_eq!(article.date, "");
}

#[test]
fn test_batch_below_size_queues_nothing() {
    let (fetch_queue, seen) = recording_queue::<Vec<Payload>>("fetch");
    let mut batcher = ArticleBatcher::new(5, vec!["content".to_string()], Arc::clone(&fetch_queue));

    for name in ["A", "B", "C", "D"] {
        assert_eq!(batcher.on_deliver(&article(name)), Disposition::Ack);
    }

    assert_eq!(batcher.pending().len(), 4);
    assert_eq!(fetch_queue.pending(), 0);
    assert!(!fetch_queue.is_running());
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_full_batch_becomes_one_ordered_task() {
    let (fetch_queue, seen) = recording_queue::<Vec<Payload>>("fetch");
    let mut batcher = ArticleBatcher::new(5, vec!["content".to_string()], Arc::clone(&fetch_queue));

    for name in ["A", "B", "C", "D", "E"] {
        assert_eq!(batcher.on_deliver(&article(name)), Disposition::Ack);
    }

    assert!(batcher.pending().is_empty());
    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 1));
    let tasks = seen.lock().unwrap();
    let ids: Vec<&str> = tasks[0]
        .iter()
        .map(|p| p["article_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["A", "B", "C", "D", "E"]);
    fetch_queue.stop();
    fetch_queue.join();
}

#[test]
fn test_invalid_articles_are_rejected_without_requeue() {
    let (fetch_queue, _seen) = recording_queue::<Vec<Payload>>("fetch");
    let mut batcher = ArticleBatcher::new(
        5,
        vec!["content".to_string(), "url".to_string()],
        fetch_queue,
    );

    let rejected = Disposition::Nack { requeue: false };
    let missing = Message::new(payload(json!({"url": "https://a"})));
    let empty = Message::new(payload(json!({"url": "https://a", "content": ""})));
    let null = Message::new(payload(json!({"url": "https://a", "content": null})));
    let no_url = Message::new(payload(json!({"content": "text"})));

    for message in [missing, empty, null, no_url] {
        assert_eq!(batcher.on_deliver(&message), rejected);
    }
    assert!(batcher.pending().is_empty());
}

#[test]
fn test_fetch_failure_drops_batch() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (store_queue, seen) = recording_queue::<SummaryBatch>("store");
    let stage = FetchStage::new(
        runtime.handle().clone(),
        Arc::new(StubSummarizer { fail: true }),
        Arc::clone(&store_queue),
    );

    stage.run(vec![article("A").payload]);

    assert!(!store_queue.is_running());
    assert_eq!(store_queue.pending(), 0);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_fetch_success_starts_store_workers() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (store_queue, seen) = recording_queue::<SummaryBatch>("store");
    let stage = FetchStage::new(
        runtime.handle().clone(),
        Arc::new(StubSummarizer { fail: false }),
        Arc::clone(&store_queue),
    );

    stage.run(vec![article("A").payload, article("B").payload]);

    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 1));
    let batches = seen.lock().unwrap();
    assert_eq!(batches[0].summaries.len(), 2);
    assert_eq!(batches[0].summaries[1].article_id, "B");
    store_queue.stop();
    store_queue.join();
}

/// Serves a single HTTP request and returns its body.
async fn serve_once(listener: TcpListener, status: &'static str, body: Vec<u8>) -> Vec<u8> {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut buf).await.unwrap();
        request.extend_from_slice(&buf[..n]);
        if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
    let length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    while request.len() < header_end + length {
        let n = socket.read(&mut buf).await.unwrap();
        request.extend_from_slice(&buf[..n]);
    }

    let head = format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/octet-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    socket.write_all(head.as_bytes()).await.unwrap();
    socket.write_all(&body).await.unwrap();
    socket.shutdown().await.unwrap();

    request[header_end..header_end + length].to_vec()
}

#[tokio::test]
async fn test_http_summarizer_posts_protobuf_batch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/api/crispy-sum", listener.local_addr().unwrap());
    let response = SummaryBatch {
        summaries: vec![summary("A")],
    };
    let server = tokio::spawn(serve_once(listener, "200 OK", response.encode_to_vec()));

    let summarizer = HttpSummarizer::new(url, Duration::from_secs(5)).unwrap();
    let request = ArticleBatch::from_payloads(&[article("A").payload]);
    let result = summarizer.summarize(&request).await.unwrap();

    assert_eq!(result, response);
    let sent = ArticleBatch::decode(server.await.unwrap().as_slice()).unwrap();
    assert_eq!(sent, request);
}

#[tokio::test]
async fn test_http_summarizer_rejects_non_200() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/api/crispy-sum", listener.local_addr().unwrap());
    let server = tokio::spawn(serve_once(listener, "500 Internal Server Error", Vec::new()));

    let summarizer = HttpSummarizer::new(url, Duration::from_secs(5)).unwrap();
    let err = summarizer
        .summarize(&ArticleBatch::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SummarizeError::Status(500)));
    server.await.unwrap();
}

#[test]
fn test_summary_message_shape() {
    let message = summary_message(&summary("A"), "sid-1");

    let keys: Vec<&String> = message.payload.keys().collect();
    assert_eq!(keys, ["summary_id", "article_id", "summary", "date", "url", "title"]);
    assert_eq!(message.field_str("summary_id"), Some("sid-1"));
    assert!(!message.mandatory);
    assert!(message.properties.persistent);
    assert_eq!(message.properties.kind.as_deref(), Some("summary"));
    assert_eq!(message.properties.content_type.as_deref(), Some("application/json"));
    assert!(message.properties.message_id.is_some());
}

#[tokio::test]
async fn test_store_stage_persists_and_publishes_each_summary() {
    let broker = MemoryBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let store = SummaryStore::open(dir.path().join("db")).unwrap();
    let topology = TopologyConfig::new()
        .queue("summary_queue")
        .exchange("summary_exchange", ExchangeKind::Topic)
        .routing_key("summary.article")
        .resolve()
        .unwrap();
    let stage = StoreStage::new(
        tokio::runtime::Handle::current(),
        Arc::new(broker.connector()),
        BrokerEndpoint::default(),
        RetryPolicy::default(),
        topology,
        store.clone(),
    );
    let batch = SummaryBatch {
        summaries: vec![summary("A"), summary("B")],
    };

    assert_eq!(stage.publish_batch(&batch).await.unwrap(), 2);
    assert_eq!(stage.publish_batch(&batch).await.unwrap(), 2);

    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(store.partition_len("2024-03-01").unwrap(), 2);
    assert_eq!(broker.queue_depth("summary_queue"), 4);

    let bodies = broker.ready_messages("summary_queue");
    let first = Message::from_json(&bodies[0].1, bodies[0].0.clone()).unwrap();
    let again = Message::from_json(&bodies[2].1, bodies[2].0.clone()).unwrap();
    assert_eq!(first.field_str("article_id"), Some("A"));
    assert_eq!(first.field_str("summary_id"), again.field_str("summary_id"));
    assert_ne!(first.properties.message_id, again.properties.message_id);
}
