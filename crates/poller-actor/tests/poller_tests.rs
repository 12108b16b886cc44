use std::time::Duration;

use ha_client::{ClientConfig, HaClient};
use mockito::Server;
use poller_actor::{ActorConfig, PollerActor, PollerError};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use types::SensorRole;

fn client_for(url: String) -> HaClient {
    HaClient::new(ClientConfig {
        base_url: url,
        token: Some("test_token".to_string()),
        timeout_ms: 1_000,
        retry_count: 0,
        retry_backoff_ms: 5,
        retry_max_backoff_ms: 5,
    })
    .expect("client")
}

fn fast_config() -> ActorConfig {
    ActorConfig {
        poll_interval: Duration::from_millis(20),
        jitter_ms: 0,
    }
}

#[tokio::test]
async fn unchanged_state_is_forwarded_once() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/states/sensor.battery_soc")
        .with_status(200)
        .with_body(
            json!({
                "entity_id": "sensor.battery_soc",
                "state": "87",
                "attributes": {"unit_of_measurement": "%", "device_class": "battery", "icon": "x"},
                "last_changed": "2025-10-02T10:00:00+00:00",
                "last_updated": "2025-10-02T10:00:00+00:00"
            })
            .to_string(),
        )
        .expect_at_least(2)
        .create_async()
        .await;

    let (tx, mut rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let actor = PollerActor::new(
        client_for(server.url()),
        SensorRole::Battery,
        "sensor.battery_soc",
        tx,
        shutdown_rx,
        fast_config(),
    );
    let handle = tokio::spawn(actor.run());

    let reading = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first reading")
        .expect("channel open");
    assert_eq!(reading.role, SensorRole::Battery);
    assert_eq!(reading.value(), Some(87.0));
    assert!(reading.attributes.contains_key("device_class"));
    assert!(!reading.attributes.contains_key("icon"));

    assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());

    shutdown_tx.send(true).expect("shutdown");
    let outcome = timeout(Duration::from_secs(2), handle)
        .await
        .expect("actor stops")
        .expect("join");
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn unavailable_state_produces_no_reading() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/states/sensor.solar_power")
        .with_status(200)
        .with_body(
            json!({
                "entity_id": "sensor.solar_power",
                "state": "unavailable",
                "attributes": {},
                "last_updated": "2025-10-02T10:00:00+00:00"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let (tx, mut rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let actor = PollerActor::new(
        client_for(server.url()),
        SensorRole::Solar,
        "sensor.solar_power",
        tx,
        shutdown_rx,
        fast_config(),
    );
    let handle = tokio::spawn(actor.run());

    assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());

    shutdown_tx.send(true).expect("shutdown");
    let outcome = timeout(Duration::from_secs(2), handle)
        .await
        .expect("actor stops")
        .expect("join");
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn rejected_token_stops_the_actor() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_status(401)
        .create_async()
        .await;

    let (tx, _rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let actor = PollerActor::new(
        client_for(server.url()),
        SensorRole::Grid,
        "sensor.grid_power",
        tx,
        shutdown_rx,
        fast_config(),
    );

    let outcome = timeout(Duration::from_secs(2), actor.run())
        .await
        .expect("actor returns");
    assert!(matches!(outcome, Err(PollerError::Unauthorized)));
}
