use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::model::{ArticleBatch, SummaryBatch};
use crate::utils::error::SummarizeError;

/// Turns a batch of articles into a batch of summaries.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, batch: &ArticleBatch) -> Result<SummaryBatch, SummarizeError>;
}

/// Calls the summarization endpoint over HTTP with protobuf bodies.
#[derive(Debug, Clone)]
pub struct HttpSummarizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SummarizeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, batch: &ArticleBatch) -> Result<SummaryBatch, SummarizeError> {
        let body = batch.encode_to_vec();
        debug!(url = %self.url, articles = batch.articles.len(), bytes = body.len(), "posting article batch");

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SummarizeError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        Ok(SummaryBatch::decode(bytes)?)
    }
}
