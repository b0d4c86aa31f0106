//! # Crispy
//!
//! `crispy` is the messaging backbone of an article summarization pipeline.
//! Scraped articles arrive on an AMQP queue, are grouped into fixed-size
//! batches, summarized by an external HTTP service, stored, and republished
//! as summary messages.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: Connection management with a retry budget, topology declaration, the message envelope and an in-memory broker for tests (`memory-broker` feature).
//! - `client`: The publisher and the listener, including bounded nack retry.
//! - `config`: Loads settings from an optional file and `CRISPY_*` environment variables.
//! - `persistence`: Stores summaries in `sled`, partitioned by day and deduplicated by URL.
//! - `pipeline`: Batching, the summarizer call and the store/republish stage.
//! - `transport`: The channel traits and their `lapin` implementation.
//! - `utils`: Error types and logging setup.
//! - `worker`: Thread pools draining an in-process FIFO, with idle shutdown.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod pipeline;
pub mod transport;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod tests;
