//! Batch wire format of the summarization endpoint (protobuf).

use serde_json::Value;

use super::text::preprocess;
use crate::broker::message::Payload;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Article {
    #[prost(string, tag = "1")]
    pub article_id: String,

    #[prost(string, tag = "2")]
    pub url: String,

    #[prost(string, tag = "3")]
    pub title: String,

    #[prost(string, tag = "4")]
    pub content: String,

    /// `YYYY-MM-DD` or an ISO timestamp.
    #[prost(string, tag = "5")]
    pub date: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ArticleBatch {
    #[prost(message, repeated, tag = "1")]
    pub articles: Vec<Article>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Summary {
    #[prost(string, tag = "1")]
    pub article_id: String,

    #[prost(string, tag = "2")]
    pub summary: String,

    #[prost(string, tag = "3")]
    pub title: String,

    #[prost(string, tag = "4")]
    pub url: String,

    #[prost(string, tag = "5")]
    pub date: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SummaryBatch {
    #[prost(message, repeated, tag = "1")]
    pub summaries: Vec<Summary>,
}

fn text_field(payload: &Payload, name: &str) -> String {
    match payload.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl Article {
    /// Builds the request record for a scraped article payload. The content
    /// is preprocessed; numeric ids are rendered as strings.
    pub fn from_payload(payload: &Payload) -> Self {
        Self {
            article_id: text_field(payload, "article_id"),
            url: text_field(payload, "url"),
            title: text_field(payload, "title"),
            content: preprocess(&text_field(payload, "content")),
            date: text_field(payload, "date"),
        }
    }
}

impl ArticleBatch {
    pub fn from_payloads(payloads: &[Payload]) -> Self {
        Self {
            articles: payloads.iter().map(Article::from_payload).collect(),
        }
    }
}
