use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use buffer::BufferStore;
use chrono::{NaiveDate, TimeZone, Utc};
use types::{Credentials, Reading, SensorRole};

fn reading(entity_id: &str, state: &str) -> Reading {
    Reading {
        role: SensorRole::Grid,
        entity_id: entity_id.to_string(),
        state: state.to_string(),
        attributes: BTreeMap::new(),
        timestamp: Utc.with_ymd_and_hms(2025, 10, 2, 10, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn buffer_enqueue_dequeue_delete() {
    let path = temp_db_path("buffer_enqueue_dequeue_delete");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");

    store.enqueue(&reading("sensor.grid_a", "100")).await.expect("enqueue");
    store.enqueue(&reading("sensor.grid_b", "-250.5")).await.expect("enqueue");

    let count = store.pending_count().await.expect("count");
    assert_eq!(count, 2);

    let batch = store.dequeue_batch(10).await.expect("dequeue");
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].reading.entity_id, "sensor.grid_a");
    assert_eq!(batch[0].reading.state, "100");
    assert_eq!(batch[1].reading.value(), Some(-250.5));

    let ids: Vec<i64> = batch.iter().map(|item| item.id).collect();
    store.delete_batch(&ids).await.expect("delete");

    let remaining = store.dequeue_batch(10).await.expect("dequeue");
    assert!(remaining.is_empty());

    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn buffer_delete_empty_is_noop() {
    let path = temp_db_path("buffer_delete_empty_is_noop");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");

    let count = store.pending_count().await.expect("count");
    assert_eq!(count, 0);

    store.delete_batch(&[]).await.expect("delete");

    let count = store.pending_count().await.expect("count");
    assert_eq!(count, 0);

    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn trim_keeps_newest_readings() {
    let path = temp_db_path("trim_keeps_newest_readings");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");

    for value in 0..5 {
        store
            .enqueue(&reading("sensor.grid", &value.to_string()))
            .await
            .expect("enqueue");
    }

    let dropped = store.trim_to(2).await.expect("trim");
    assert_eq!(dropped, 3);

    let batch = store.dequeue_batch(10).await.expect("dequeue");
    let states: Vec<&str> = batch.iter().map(|item| item.reading.state.as_str()).collect();
    assert_eq!(states, vec!["3", "4"]);

    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn credentials_round_trip_and_clear() {
    let path = temp_db_path("credentials_round_trip_and_clear");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");

    assert!(store.load_credentials().await.expect("load").is_none());

    let credentials = Credentials {
        api_token: "tok".to_string(),
        instance_id: "inst-1".to_string(),
        user_email: "owner@example.com".to_string(),
        api_url: "https://example.invalid".to_string(),
        paired_at: Utc.with_ymd_and_hms(2025, 10, 2, 9, 30, 0).unwrap(),
    };
    store.save_credentials(&credentials).await.expect("save");

    let replacement = Credentials {
        api_token: "tok-2".to_string(),
        ..credentials.clone()
    };
    store.save_credentials(&replacement).await.expect("save");

    let loaded = store.load_credentials().await.expect("load").expect("stored");
    assert_eq!(loaded, replacement);

    assert!(store.clear_credentials().await.expect("clear"));
    assert!(!store.clear_credentials().await.expect("clear"));
    assert!(store.load_credentials().await.expect("load").is_none());

    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn daily_counters_are_per_day() {
    let path = temp_db_path("daily_counters_are_per_day");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");

    let yesterday = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
    let today = NaiveDate::from_ymd_opt(2025, 10, 2).unwrap();

    assert_eq!(store.record_uploaded(yesterday, 7).await.expect("record"), 7);
    assert_eq!(store.record_uploaded(today, 3).await.expect("record"), 3);
    assert_eq!(store.record_uploaded(today, 2).await.expect("record"), 5);
    assert_eq!(store.uploaded_on(yesterday).await.expect("read"), 7);

    assert_eq!(store.prune_counters_before(today).await.expect("prune"), 1);
    assert_eq!(store.uploaded_on(yesterday).await.expect("read"), 0);
    assert_eq!(store.uploaded_on(today).await.expect("read"), 5);

    store.close().await;
    cleanup_db(&path);
}

fn temp_db_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("{prefix}-{pid}-{ts}.sqlite"));
    path
}

fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let wal = PathBuf::from(format!("{}-wal", path.display()));
    let shm = PathBuf::from(format!("{}-shm", path.display()));
    let _ = std::fs::remove_file(wal);
    let _ = std::fs::remove_file(shm);
}
