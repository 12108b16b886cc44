use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use ha_client::{ClientError, HaClient};
use types::{Reading, SensorRole};

#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub poll_interval: Duration,
    pub jitter_ms: u64,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("home assistant rejected the access token")]
    Unauthorized,
}

/// A lightweight polling task responsible for one monitored sensor.
pub struct PollerActor {
    client: HaClient,
    role: SensorRole,
    entity_id: String,
    sender: mpsc::Sender<Reading>,
    shutdown: watch::Receiver<bool>,
    config: ActorConfig,
    last_seen: Option<DateTime<Utc>>,
}

impl PollerActor {
    pub fn new(
        client: HaClient,
        role: SensorRole,
        entity_id: impl Into<String>,
        sender: mpsc::Sender<Reading>,
        shutdown: watch::Receiver<bool>,
        config: ActorConfig,
    ) -> Self {
        Self {
            client,
            role,
            entity_id: entity_id.into(),
            sender,
            shutdown,
            config,
            last_seen: None,
        }
    }

    pub async fn run(mut self) -> Result<(), PollerError> {
        let mut iteration = 0u64;
        info!(role = %self.role, entity_id = %self.entity_id, "poller started");

        loop {
            if *self.shutdown.borrow() {
                info!(role = %self.role, "poller shutdown requested");
                break;
            }

            let cycle_start = Instant::now();
            match self.poll_once().await {
                Ok(Some(reading)) => {
                    debug!(role = %self.role, state = %reading.state, "reading captured");
                    if let Err(err) = self.sender.send(reading).await {
                        warn!(role = %self.role, error = %err, "reading channel closed");
                        break;
                    }
                }
                Ok(None) => {}
                Err(ClientError::Unauthorized) => {
                    metrics::counter!("green_energy_poll_failures_total", "role" => self.role.as_str())
                        .increment(1);
                    return Err(PollerError::Unauthorized);
                }
                Err(err) => {
                    metrics::counter!("green_energy_poll_failures_total", "role" => self.role.as_str())
                        .increment(1);
                    warn!(
                        role = %self.role,
                        entity_id = %self.entity_id,
                        error = %err,
                        "home assistant read failed"
                    );
                }
            }

            iteration = iteration.wrapping_add(1);
            let elapsed = cycle_start.elapsed();
            let lag = elapsed.saturating_sub(self.config.poll_interval);
            let delay = jittered_delay(self.config.poll_interval, self.config.jitter_ms, iteration);
            debug!(
                role = %self.role,
                elapsed_ms = elapsed.as_millis(),
                lag_ms = lag.as_millis(),
                delay_ms = delay.as_millis(),
                "poll cycle complete"
            );

            tokio::select! {
                _ = sleep(delay) => {},
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!(role = %self.role, "poller shutdown requested");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Reads the entity once. Yields a reading only when the state changed
    /// since the previous poll and is numeric.
    async fn poll_once(&mut self) -> Result<Option<Reading>, ClientError> {
        let state = self.client.get_state(&self.entity_id).await?;
        let updated = state.last_updated.or(state.last_changed);

        if let (Some(updated), Some(seen)) = (updated, self.last_seen) {
            if updated <= seen {
                return Ok(None);
            }
        }
        self.last_seen = updated;

        let reading = Reading::from_state(
            self.role,
            state.entity_id.clone(),
            &state.state,
            &state.attributes,
            updated.unwrap_or_else(Utc::now),
        );
        if reading.is_none() {
            debug!(role = %self.role, state = %state.state, "skipping non-numeric state");
        }
        Ok(reading)
    }
}

fn jittered_delay(base: Duration, jitter_ms: u64, iteration: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }

    let jitter_window = jitter_ms.max(1);
    let seed = unix_ms().wrapping_add(iteration.wrapping_mul(1_664_525));
    let offset = seed % jitter_window;
    base + Duration::from_millis(offset)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
