use std::path::Path;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sled::{CompareAndSwapError, Db};
use tracing::debug;
use uuid::Uuid;

use crate::pipeline::model::Summary;
use crate::utils::error::StoreError;

const TREE_PREFIX: &str = "summaries/";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredSummary {
    pub summary_id: String,
    pub article_id: String,
    pub summary: String,
    pub title: String,
    pub url: String,
    pub date: String,
    /// Unix timestamp of the first insert.
    pub stored_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(String),
    /// The URL was already stored in this partition; carries its id.
    Existing(String),
}

impl UpsertOutcome {
    pub fn summary_id(&self) -> &str {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Existing(id) => id,
        }
    }
}

/// Summaries partitioned by day, one `sled` tree per `YYYY-MM-DD`, keyed by
/// source URL.
#[derive(Clone)]
pub struct SummaryStore {
    db: Db,
}

impl SummaryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Inserts `summary` unless its URL is already present in the partition
    /// of its date.
    pub fn upsert(&self, summary: &Summary) -> Result<UpsertOutcome, StoreError> {
        let partition = date_partition(&summary.date)?;
        let tree = self.db.open_tree(tree_name(partition))?;

        let record = StoredSummary {
            summary_id: Uuid::new_v4().to_string(),
            article_id: summary.article_id.clone(),
            summary: summary.summary.clone(),
            title: summary.title.clone(),
            url: summary.url.clone(),
            date: summary.date.clone(),
            stored_at: Utc::now().timestamp(),
        };
        let encoded = serde_json::to_vec(&record)?;

        match tree.compare_and_swap(summary.url.as_bytes(), None as Option<&[u8]>, Some(encoded))? {
            Ok(()) => {
                debug!(partition, url = %summary.url, summary_id = %record.summary_id, "summary stored");
                Ok(UpsertOutcome::Inserted(record.summary_id))
            }
            Err(CompareAndSwapError { current, .. }) => {
                let existing: StoredSummary = match current {
                    Some(bytes) => serde_json::from_slice(&bytes)?,
                    None => return Ok(UpsertOutcome::Inserted(record.summary_id)),
                };
                debug!(partition, url = %summary.url, summary_id = %existing.summary_id, "summary already stored");
                Ok(UpsertOutcome::Existing(existing.summary_id))
            }
        }
    }

    pub fn get(&self, date: &str, url: &str) -> Result<Option<StoredSummary>, StoreError> {
        let tree = self.db.open_tree(tree_name(date_partition(date)?))?;
        match tree.get(url.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of summaries stored for the day of `date`.
    pub fn partition_len(&self, date: &str) -> Result<usize, StoreError> {
        let tree = self.db.open_tree(tree_name(date_partition(date)?))?;
        Ok(tree.len())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SummaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryStore").field("db", &"sled::Db").finish()
    }
}

fn tree_name(partition: &str) -> String {
    format!("{TREE_PREFIX}{partition}")
}

/// The leading `YYYY-MM-DD` of a date or ISO timestamp.
pub fn date_partition(date: &str) -> Result<&str, StoreError> {
    let invalid = || StoreError::InvalidDate(date.to_string());

    let day = date.get(..10).ok_or_else(invalid)?;
    match date[10..].chars().next() {
        None | Some('T') | Some(' ') => {}
        Some(_) => return Err(invalid()),
    }
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| invalid())?;
    Ok(day)
}
