use std::time::Duration;

use serde::Deserialize;

use crate::broker::connection::{BrokerEndpoint, RetryPolicy};
use crate::broker::topology::{DeadLetterConfig, Topology, TopologyConfig};
use crate::client::retry::NackRetryPolicy;
use crate::pipeline::PipelineConfig;
use crate::transport::ExchangeKind;
use crate::utils::error::TopologyError;
use crate::worker::WorkerQueueConfig;

/// Top-level configuration settings for the application.
///
/// Every section falls back to its defaults, so a partial file or a single
/// environment variable is enough to override one value.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub listener: ListenerSettings,
    pub publisher: PublisherSettings,
    pub pipeline: PipelineSettings,
    pub summarizer: SummarizerSettings,
    pub store: StoreSettings,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            listener: ListenerSettings::default(),
            publisher: PublisherSettings::default(),
            pipeline: PipelineSettings::default(),
            summarizer: SummarizerSettings::default(),
            store: StoreSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Broker address, credentials and the connection retry budget.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub connect_timeout_secs: Option<u64>,
    pub connect_attempts: u32,
    pub connect_delay_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            connect_timeout_secs: None,
            connect_attempts: 10,
            connect_delay_secs: 3,
        }
    }
}

impl BrokerSettings {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            virtual_host: self.vhost.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            connection_timeout: self.connect_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts,
            delay: Duration::from_secs(self.connect_delay_secs),
        }
    }
}

/// Where articles are consumed from.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerSettings {
    pub queue: String,
    pub exchange: String,
    pub kind: ExchangeKind,
    pub routing_key: String,
    pub prefetch: u16,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub nack_max_retries: u32,
    pub nack_delay_secs: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            queue: "article_queue".to_string(),
            exchange: "article_exchange".to_string(),
            kind: ExchangeKind::Topic,
            routing_key: "scraped.article".to_string(),
            prefetch: 1,
            durable: true,
            exclusive: false,
            auto_delete: false,
            nack_max_retries: 5,
            nack_delay_secs: 2,
        }
    }
}

impl ListenerSettings {
    pub fn topology(&self) -> Result<Topology, TopologyError> {
        TopologyConfig::new()
            .queue(&self.queue)
            .exchange(&self.exchange, self.kind)
            .routing_key(&self.routing_key)
            .durable(self.durable)
            .exclusive(self.exclusive)
            .auto_delete(self.auto_delete)
            .prefetch(self.prefetch)
            .resolve()
    }

    pub fn nack_policy(&self) -> NackRetryPolicy {
        NackRetryPolicy {
            max_retries: self.nack_max_retries,
            delay: Duration::from_secs(self.nack_delay_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DeadLetterSettings {
    pub enabled: bool,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub message_ttl_ms: Option<u32>,
}

/// Where summaries are published to.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PublisherSettings {
    /// Declared and bound when not empty.
    pub queue: String,
    pub exchange: String,
    pub kind: ExchangeKind,
    pub routing_key: String,
    pub durable: bool,
    pub confirm_delivery: bool,
    pub dead_letter: DeadLetterSettings,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            queue: "summary_queue".to_string(),
            exchange: "summary_exchange".to_string(),
            kind: ExchangeKind::Topic,
            routing_key: "summary.article".to_string(),
            durable: true,
            confirm_delivery: true,
            dead_letter: DeadLetterSettings::default(),
        }
    }
}

impl PublisherSettings {
    pub fn topology(&self) -> Result<Topology, TopologyError> {
        let mut config = TopologyConfig::new()
            .queue(&self.queue)
            .exchange(&self.exchange, self.kind)
            .routing_key(&self.routing_key)
            .durable(self.durable);
        if self.dead_letter.enabled {
            config = config.dead_letter(DeadLetterConfig {
                exchange: self.dead_letter.exchange.clone(),
                routing_key: self.dead_letter.routing_key.clone(),
                message_ttl: self.dead_letter.message_ttl_ms,
            });
        }
        config.resolve()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub fetch_workers: usize,
    pub store_workers: usize,
    pub idle_timeout_secs: u64,
    pub required_fields: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            fetch_workers: 4,
            store_workers: 1,
            idle_timeout_secs: 900,
            required_fields: vec!["content".to_string()],
        }
    }
}

impl PipelineSettings {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let idle = Duration::from_secs(self.idle_timeout_secs);
        PipelineConfig {
            batch_size: self.batch_size,
            required_fields: self.required_fields.clone(),
            fetch: WorkerQueueConfig::new("fetch", self.fetch_workers).idle_timeout(idle),
            store: WorkerQueueConfig::new("store", self.store_workers).idle_timeout(idle),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SummarizerSettings {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:7071/api/crispy-sum".to_string(),
            timeout_secs: 1200,
        }
    }
}

impl SummarizerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "summary_db".to_string(),
        }
    }
}
