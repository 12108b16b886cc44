use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bridge_app::entities::{EntityContext, EntityPublisher};
use bridge_app::pipeline::buffer_task;
use bridge_app::{coordinator_alive, sync_delay, SyncConfig, SyncCoordinator};
use buffer::BufferStore;
use chrono::{TimeZone, Utc};
use cloud_client::{CloudClient, CloudConfig};
use ha_client::{ClientConfig, HaClient};
use mockito::{Matcher, Server};
use serde_json::json;
use tokio::sync::{mpsc, watch, Notify};
use types::{Credentials, Reading, SensorRole, SyncStatus};

fn reading(entity_id: &str, state: &str, minute: u32) -> Reading {
    Reading {
        role: SensorRole::Solar,
        entity_id: entity_id.to_string(),
        state: state.to_string(),
        attributes: BTreeMap::new(),
        timestamp: Utc.with_ymd_and_hms(2025, 10, 2, 10, minute, 0).unwrap(),
    }
}

fn cloud_for(url: String) -> CloudClient {
    let credentials = Credentials {
        api_token: "tok-123".to_string(),
        instance_id: "inst-42".to_string(),
        user_email: "owner@example.com".to_string(),
        api_url: url.clone(),
        paired_at: Utc::now(),
    };
    CloudClient::new(CloudConfig {
        api_url: url,
        timeout_ms: 2_000,
    })
    .expect("cloud client")
    .with_credentials(&credentials)
}

fn context() -> EntityContext {
    EntityContext::new("green_energy", "inst-42")
}

async fn coordinator(url: String, store: BufferStore, publisher: EntityPublisher) -> SyncCoordinator {
    SyncCoordinator::new(cloud_for(url), store, publisher, SyncConfig::default(), 100)
}

fn status_body() -> String {
    json!({
        "recommendation": "charge_battery",
        "recommendation_reason": "Cheap overnight rate",
        "recommendation_expires": "2025-10-02T23:00:00Z",
        "savings_today_pence": 125.0,
        "current_rate_pence": 7.5
    })
    .to_string()
}

#[tokio::test]
async fn sync_uploads_queue_and_applies_status() {
    let mut server = Server::new_async().await;
    let upload = server
        .mock("POST", "/api/ha/readings")
        .match_header("authorization", "Bearer tok-123")
        .match_body(Matcher::PartialJson(json!({"instance_id": "inst-42"})))
        .with_status(200)
        .with_body(json!({"status": "ok", "accepted": 2}).to_string())
        .expect(1)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::UrlEncoded("instance_id".into(), "inst-42".into()))
        .with_status(200)
        .with_body(status_body())
        .create_async()
        .await;

    let path = temp_db_path("sync_uploads_queue");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    store.enqueue(&reading("sensor.pv", "1500", 0)).await.expect("enqueue");
    store.enqueue(&reading("sensor.pv", "1600", 1)).await.expect("enqueue");

    let mut coordinator =
        coordinator(server.url(), store.clone(), EntityPublisher::dry_run(context())).await;
    let updates = coordinator.subscribe();
    coordinator.sync_once().await.expect("sync");

    let data = coordinator.data();
    assert_eq!(data.sync_status, SyncStatus::Synced);
    assert!(data.connected);
    assert!(data.last_sync.is_some());
    assert!(data.last_update_success);
    assert_eq!(data.readings_today, 2);
    assert_eq!(data.recommendation.as_deref(), Some("charge_battery"));
    assert_eq!(data.recommendation_reason.as_deref(), Some("Cheap overnight rate"));
    assert_eq!(data.savings_today_pence, 125.0);
    assert_eq!(data.tariff_rate, Some(7.5));
    assert_eq!(*updates.borrow(), data);
    assert_eq!(store.pending_count().await.expect("count"), 0);

    upload.assert_async().await;
    status.assert_async().await;
    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn failed_upload_keeps_readings_queued() {
    let mut server = Server::new_async().await;
    let _upload = server
        .mock("POST", "/api/ha/readings")
        .with_status(500)
        .create_async()
        .await;
    let _status = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({}).to_string())
        .create_async()
        .await;

    let path = temp_db_path("failed_upload_keeps");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    store.enqueue(&reading("sensor.pv", "1500", 0)).await.expect("enqueue");

    let mut coordinator =
        coordinator(server.url(), store.clone(), EntityPublisher::dry_run(context())).await;
    coordinator.sync_once().await.expect("status still refreshed");

    let data = coordinator.data();
    assert_eq!(data.sync_status, SyncStatus::Synced);
    assert_eq!(data.readings_today, 0);
    assert_eq!(data.recommendation.as_deref(), Some("No action needed"));
    assert_eq!(data.savings_today_pence, 0.0);
    assert_eq!(data.tariff_rate, None);
    assert_eq!(store.pending_count().await.expect("count"), 1);

    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn status_failure_keeps_previous_cloud_values() {
    let mut server = Server::new_async().await;
    let ok = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(status_body())
        .create_async()
        .await;

    let path = temp_db_path("status_failure_keeps");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    let mut coordinator =
        coordinator(server.url(), store.clone(), EntityPublisher::dry_run(context())).await;
    coordinator.sync_once().await.expect("first sync");
    let first_sync = coordinator.data().last_sync;

    ok.remove_async().await;
    let _down = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    let err = coordinator.sync_once().await.expect_err("status should fail");
    assert!(!err.is_auth_failure());

    let data = coordinator.data();
    assert_eq!(data.sync_status, SyncStatus::Error);
    assert!(!data.connected);
    assert!(!data.last_update_success);
    assert!(data.last_error.is_some());
    assert_eq!(data.recommendation.as_deref(), Some("charge_battery"));
    assert_eq!(data.tariff_rate, Some(7.5));
    assert_eq!(data.last_sync, first_sync);
    assert_eq!(coordinator.consecutive_failures(), 1);

    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn rejected_token_stops_the_cycle() {
    let mut server = Server::new_async().await;
    let _upload = server
        .mock("POST", "/api/ha/readings")
        .with_status(401)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let path = temp_db_path("rejected_token_stops");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    store.enqueue(&reading("sensor.pv", "1500", 0)).await.expect("enqueue");

    let mut coordinator =
        coordinator(server.url(), store.clone(), EntityPublisher::dry_run(context())).await;
    let err = coordinator.sync_once().await.expect_err("auth failure");

    assert!(err.is_auth_failure());
    assert_eq!(coordinator.data().sync_status, SyncStatus::Error);
    assert_eq!(coordinator.data().recommendation, None);
    assert_eq!(store.pending_count().await.expect("count"), 1);
    status.assert_async().await;

    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn sync_publishes_entities_to_home_assistant() {
    let mut cloud = Server::new_async().await;
    let _status = cloud
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(status_body())
        .create_async()
        .await;

    let mut ha = Server::new_async().await;
    let writes = ha
        .mock("POST", Matcher::Regex(r"^/api/states/(sensor|binary_sensor)\.green_energy_".to_string()))
        .match_header("authorization", "Bearer ha-token")
        .with_status(200)
        .with_body(json!({"entity_id": "sensor.green_energy_any", "state": "ok"}).to_string())
        .expect(8)
        .create_async()
        .await;

    let client = HaClient::new(ClientConfig {
        base_url: ha.url(),
        token: Some("ha-token".to_string()),
        retry_count: 0,
        ..ClientConfig::default()
    })
    .expect("ha client");

    let path = temp_db_path("sync_publishes_entities");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    let mut coordinator =
        coordinator(cloud.url(), store.clone(), EntityPublisher::new(client, context())).await;
    coordinator.sync_once().await.expect("sync");

    writes.assert_async().await;
    store.close().await;
    cleanup_db(&path);
}

#[test]
fn sync_delay_backs_off_within_bounds() {
    let interval = Duration::from_secs(60);
    let base = Duration::from_secs(30);
    let max = Duration::from_secs(600);

    assert_eq!(sync_delay(interval, 0, base, max), interval);
    // Short backoff never undercuts the interval.
    assert_eq!(sync_delay(interval, 1, base, max), interval);
    assert_eq!(sync_delay(interval, 2, base, max), Duration::from_secs(60));
    assert_eq!(sync_delay(interval, 3, base, max), Duration::from_secs(120));
    assert_eq!(sync_delay(interval, 5, base, max), Duration::from_secs(480));
    assert_eq!(sync_delay(interval, 6, base, max), max);
    assert_eq!(sync_delay(interval, 40, base, max), max);
    assert_eq!(
        sync_delay(Duration::from_secs(3_600), 6, base, max),
        Duration::from_secs(3_600)
    );
}

#[tokio::test]
async fn buffer_task_queues_trims_and_wakes() {
    let path = temp_db_path("buffer_task_queues");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    let wake = Arc::new(Notify::new());
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(buffer_task(rx, store.clone(), 2, wake.clone(), shutdown_rx));
    for minute in 0..3 {
        tx.send(reading("sensor.pv", &format!("{}", 100 + minute), minute))
            .await
            .expect("send");
    }
    drop(tx);
    handle.await.expect("buffer task");

    tokio::time::timeout(Duration::from_secs(1), wake.notified())
        .await
        .expect("coordinator woken");

    let batch = store.dequeue_batch(10).await.expect("dequeue");
    let states: Vec<&str> = batch.iter().map(|item| item.reading.state.as_str()).collect();
    assert_eq!(states, vec!["101", "102"]);

    store.close().await;
    cleanup_db(&path);
}

fn run_config(debounce: Duration) -> SyncConfig {
    SyncConfig {
        interval: Duration::from_secs(60),
        debounce,
        backoff_base: Duration::from_secs(60),
        backoff_max: Duration::from_secs(600),
    }
}

#[tokio::test]
async fn run_syncs_at_start_and_stops_on_shutdown() {
    let mut server = Server::new_async().await;
    let status = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(status_body())
        .expect(1)
        .create_async()
        .await;

    let path = temp_db_path("run_syncs_at_start");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    let coordinator = SyncCoordinator::new(
        cloud_for(server.url()),
        store.clone(),
        EntityPublisher::dry_run(context()),
        run_config(Duration::from_millis(10)),
        100,
    );
    let mut updates = coordinator.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(coordinator.run(Arc::new(Notify::new()), shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|data| data.sync_status == SyncStatus::Synced),
    )
    .await
    .expect("initial sync in time")
    .expect("coordinator alive");

    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run stopped")
        .expect("join");

    status.assert_async().await;
    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn wake_runs_one_debounced_cycle() {
    let mut server = Server::new_async().await;
    let upload = server
        .mock("POST", "/api/ha/readings")
        .with_status(200)
        .with_body(json!({"status": "ok", "accepted": 1}).to_string())
        .expect(1)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(status_body())
        .expect(2)
        .create_async()
        .await;

    let path = temp_db_path("wake_runs_debounced");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    let coordinator = SyncCoordinator::new(
        cloud_for(server.url()),
        store.clone(),
        EntityPublisher::dry_run(context()),
        run_config(Duration::from_millis(50)),
        100,
    );
    let mut updates = coordinator.subscribe();
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(coordinator.run(wake.clone(), shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|data| data.sync_status == SyncStatus::Synced),
    )
    .await
    .expect("initial sync in time")
    .expect("coordinator alive");

    store.enqueue(&reading("sensor.pv", "1500", 0)).await.expect("enqueue");
    wake.notify_one();

    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|data| data.readings_today == 1),
    )
    .await
    .expect("early sync in time")
    .expect("coordinator alive");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.pending_count().await.expect("count"), 0);
    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run stopped")
        .expect("join");

    upload.assert_async().await;
    status.assert_async().await;
    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn failing_status_holds_wakeups_until_backoff() {
    let mut server = Server::new_async().await;
    let status = server
        .mock("GET", "/api/ha/status")
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let path = temp_db_path("failing_status_holds");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    let coordinator = SyncCoordinator::new(
        cloud_for(server.url()),
        store.clone(),
        EntityPublisher::dry_run(context()),
        run_config(Duration::from_millis(10)),
        100,
    );
    let mut updates = coordinator.subscribe();
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(coordinator.run(wake.clone(), shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|data| data.sync_status == SyncStatus::Error),
    )
    .await
    .expect("initial sync in time")
    .expect("coordinator alive");

    for _ in 0..10 {
        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    // A failed first cycle keeps the coordinator running.
    assert!(!handle.is_finished());

    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run stopped")
        .expect("join");

    status.assert_async().await;
    store.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn coordinator_alive_until_dropped() {
    let path = temp_db_path("coordinator_alive");
    let store = BufferStore::new(path.to_str().expect("path")).await.expect("init");
    let coordinator =
        coordinator("http://127.0.0.1:9".to_string(), store.clone(), EntityPublisher::dry_run(context())).await;
    let updates = coordinator.subscribe();

    assert!(coordinator_alive(&updates));
    drop(coordinator);
    assert!(!coordinator_alive(&updates));

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
}
