//! The `persistence` module stores generated summaries.
//!
//! Summaries are kept in `sled`, an embedded key-value store, with one tree
//! per day derived from the summary date. The source URL is the natural key:
//! storing the same URL twice for a day keeps the first record and hands its
//! id back to the caller.

pub mod sled_store;

pub use sled_store::{StoredSummary, SummaryStore, UpsertOutcome, date_partition};

#[cfg(test)]
mod tests;
