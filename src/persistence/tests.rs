use tempfile::TempDir;

use super::sled_store::{SummaryStore, UpsertOutcome, date_partition};
use crate::pipeline::model::Summary;
use crate::utils::error::StoreError;

fn summary(url: &str, date: &str) -> Summary {
    Summary {
        article_id: format!("id-{url}"),
        summary: "short".to_string(),
        title: "Title".to_string(),
        url: url.to_string(),
        date: date.to_string(),
    }
}

fn open_store() -> (TempDir, SummaryStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SummaryStore::open(dir.path().join("db")).unwrap();
    (dir, store)
}

#[test]
fn test_date_partition_accepts_dates_and_timestamps() {
    assert_eq!(date_partition("2024-03-01").unwrap(), "2024-03-01");
    assert_eq!(date_partition("2024-03-01T10:22:00Z").unwrap(), "2024-03-01");
    assert_eq!(date_partition("2024-03-01 10:22").unwrap(), "2024-03-01");
}

#[test]
fn test_date_partition_rejects_other_shapes() {
    for bad in ["", "2024-3-1", "01/03/2024", "2024-02-30", "2024-03-011", "yesterday"] {
        assert!(
            matches!(date_partition(bad), Err(StoreError::InvalidDate(_))),
            "{bad} should be rejected"
        );
    }
}

#[test]
fn test_upsert_inserts_then_reuses_existing_id() {
    let (_dir, store) = open_store();

    let first = store.upsert(&summary("https://a", "2024-03-01T08:00:00")).unwrap();
    assert!(matches!(first, UpsertOutcome::Inserted(_)));

    let second = store.upsert(&summary("https://a", "2024-03-01T09:30:00")).unwrap();
    assert_eq!(second, UpsertOutcome::Existing(first.summary_id().to_string()));
    assert_eq!(store.partition_len("2024-03-01").unwrap(), 1);

    let stored = store.get("2024-03-01", "https://a").unwrap().unwrap();
    assert_eq!(stored.summary_id, first.summary_id());
    assert_eq!(stored.article_id, "id-https://a");
    assert_eq!(stored.date, "2024-03-01T08:00:00");
}

#[test]
fn test_partitions_are_separate() {
    let (_dir, store) = open_store();

    store.upsert(&summary("https://a", "2024-03-01")).unwrap();
    let other_day = store.upsert(&summary("https://a", "2024-03-02")).unwrap();
    store.upsert(&summary("https://b", "2024-03-02")).unwrap();

    assert!(matches!(other_day, UpsertOutcome::Inserted(_)));
    assert_eq!(store.partition_len("2024-03-01").unwrap(), 1);
    assert_eq!(store.partition_len("2024-03-02").unwrap(), 2);
    assert!(store.get("2024-03-03", "https://a").unwrap().is_none());
}

#[test]
fn test_upsert_with_invalid_date_fails() {
    let (_dir, store) = open_store();
    let err = store.upsert(&summary("https://a", "soon")).unwrap_err();
    assert!(matches!(err, StoreError::InvalidDate(date) if date == "soon"));
}
