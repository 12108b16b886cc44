use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use buffer::{BufferError, BufferStore};
use cloud_client::{CloudClient, CloudError, CloudStatus, DEFAULT_RECOMMENDATION};
use types::{Reading, SyncStatus};

use crate::entities::EntityPublisher;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_DEBOUNCE_MS: u64 = 5_000;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 30;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    /// Quiet period between new readings arriving and the early sync.
    pub debounce: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

/// Everything the published entities are rendered from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorData {
    pub connected: bool,
    pub sync_status: SyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub readings_today: i64,
    /// `None` until the first successful sync.
    pub recommendation: Option<String>,
    pub recommendation_reason: Option<String>,
    pub recommendation_expires: Option<String>,
    pub savings_today_pence: f64,
    pub tariff_rate: Option<f64>,
    pub last_error: Option<String>,
    pub last_update_success: bool,
}

impl CoordinatorData {
    fn apply_status(&mut self, status: CloudStatus, now: DateTime<Utc>) {
        self.connected = true;
        self.sync_status = SyncStatus::Synced;
        self.last_sync = Some(now);
        self.recommendation = Some(
            status
                .recommendation
                .unwrap_or_else(|| DEFAULT_RECOMMENDATION.to_string()),
        );
        self.recommendation_reason = status.recommendation_reason;
        self.recommendation_expires = status.recommendation_expires;
        self.savings_today_pence = status.savings_today_pence.unwrap_or(0.0);
        self.tariff_rate = status.current_rate_pence;
        self.last_error = None;
        self.last_update_success = true;
    }

    fn apply_failure(&mut self, err: &SyncError) {
        self.connected = false;
        self.sync_status = SyncStatus::Error;
        self.last_error = Some(err.to_string());
        self.last_update_success = false;
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upload failed: {0}")]
    Upload(CloudError),
    #[error("status refresh failed: {0}")]
    Status(CloudError),
    #[error("local store failed: {0}")]
    Store(#[from] BufferError),
}

impl SyncError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Upload(CloudError::Authentication(_))
                | SyncError::Status(CloudError::Authentication(_))
        )
    }
}

/// Drives sync cycles: drains queued readings to the cloud, refreshes the
/// cloud status and republishes the derived entities.
pub struct SyncCoordinator {
    cloud: CloudClient,
    store: BufferStore,
    publisher: EntityPublisher,
    config: SyncConfig,
    batch_size: i64,
    data: watch::Sender<CoordinatorData>,
    failures: u32,
}

impl SyncCoordinator {
    pub fn new(
        cloud: CloudClient,
        store: BufferStore,
        publisher: EntityPublisher,
        config: SyncConfig,
        batch_size: i64,
    ) -> Self {
        let (data, _) = watch::channel(CoordinatorData::default());
        Self {
            cloud,
            store,
            publisher,
            config,
            batch_size: batch_size.max(1),
            data,
            failures: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorData> {
        self.data.subscribe()
    }

    pub fn data(&self) -> CoordinatorData {
        self.data.borrow().clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// One full cycle. Cloud values from the last success are kept when
    /// the refresh fails.
    pub async fn sync_once(&mut self) -> Result<(), SyncError> {
        let today = Local::now().date_naive();

        self.data.send_modify(|data| data.sync_status = SyncStatus::Syncing);
        self.publisher.publish_sync_status(&self.data()).await;

        if let Err(err) = self.upload_pending(today).await {
            error!(error = %err, "failed to upload readings");
            if err.is_auth_failure() {
                return Err(self.fail(err, today).await);
            }
        }

        match self.cloud.get_status().await {
            Ok(status) => {
                let readings_today = self.readings_today(today).await;
                let mut data = self.data();
                data.apply_status(status, Utc::now());
                data.readings_today = readings_today;
                self.data.send_replace(data);
                self.failures = 0;
                metrics::counter!("green_energy_sync_cycles_total", "outcome" => "synced").increment(1);

                let data = self.data();
                info!(
                    readings_today,
                    recommendation = data.recommendation.as_deref().unwrap_or_default(),
                    "sync complete"
                );
                self.publisher.publish_all(&data).await;
                Ok(())
            }
            Err(err) => Err(self.fail(SyncError::Status(err), today).await),
        }
    }

    async fn fail(&mut self, err: SyncError, today: NaiveDate) -> SyncError {
        self.failures = self.failures.saturating_add(1);
        let readings_today = self.readings_today(today).await;
        self.data.send_modify(|data| {
            data.apply_failure(&err);
            data.readings_today = readings_today;
        });
        metrics::counter!("green_energy_sync_cycles_total", "outcome" => "error").increment(1);
        if err.is_auth_failure() {
            error!(error = %err, "cloud rejected the credentials; pair again to restore sync");
        }
        self.publisher.publish_all(&self.data()).await;
        err
    }

    /// Uploads queued readings oldest-first. A failed batch stays queued.
    pub async fn upload_pending(&self, today: NaiveDate) -> Result<usize, SyncError> {
        let mut uploaded = 0usize;

        loop {
            let batch = self.store.dequeue_batch(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let readings: Vec<Reading> = batch.iter().map(|item| item.reading.clone()).collect();
            self.cloud
                .post_readings(&readings)
                .await
                .map_err(SyncError::Upload)?;

            let ids: Vec<i64> = batch.iter().map(|item| item.id).collect();
            self.store.delete_batch(&ids).await?;
            self.store.record_uploaded(today, ids.len() as i64).await?;
            uploaded += ids.len();
            metrics::counter!("green_energy_readings_uploaded_total").increment(ids.len() as u64);

            if (batch.len() as i64) < self.batch_size {
                break;
            }
        }

        if let Ok(depth) = self.store.pending_count().await {
            metrics::gauge!("green_energy_buffer_depth").set(depth as f64);
        }
        if uploaded > 0 {
            debug!(uploaded, "readings uploaded");
        }
        Ok(uploaded)
    }

    async fn readings_today(&self, today: NaiveDate) -> i64 {
        if let Err(err) = self.store.prune_counters_before(today).await {
            warn!(error = %err, "counter pruning failed");
        }
        match self.store.uploaded_on(today).await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "reading counter unavailable");
                self.data.borrow().readings_today
            }
        }
    }

    fn next_delay(&self) -> Duration {
        sync_delay(
            self.config.interval,
            self.failures,
            self.config.backoff_base,
            self.config.backoff_max,
        )
    }

    /// Runs an initial cycle, then one per interval (stretched by backoff
    /// after failures). While healthy a wake-up runs a cycle early after the
    /// debounce; during backoff wake-ups wait for the scheduled cycle.
    pub async fn run(mut self, wake: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.sync_once().await {
            warn!(error = %err, "initial sync failed; retrying on schedule");
        }
        let mut next_due = Instant::now() + self.next_delay();

        loop {
            tokio::select! {
                _ = sleep_until(next_due) => {}
                _ = wake.notified() => {
                    if self.failures > 0 {
                        debug!(failures = self.failures, "new readings held until backoff elapses");
                        continue;
                    }
                    debug!(debounce_ms = self.config.debounce.as_millis(), "new readings queued");
                    tokio::select! {
                        _ = sleep(self.config.debounce) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!("sync shutdown requested");
                                break;
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sync shutdown requested");
                        break;
                    }
                    continue;
                }
            }

            let result = self.sync_once().await;
            let delay = self.next_delay();
            next_due = Instant::now() + delay;
            if let Err(err) = result {
                warn!(
                    error = %err,
                    failures = self.failures,
                    next_delay_ms = delay.as_millis(),
                    "sync cycle failed"
                );
            }
        }
    }
}

/// `false` once the coordinator behind `data` has stopped.
pub fn coordinator_alive(data: &watch::Receiver<CoordinatorData>) -> bool {
    data.has_changed().is_ok()
}

/// Delay before the next cycle: the interval while healthy, exponential
/// backoff (never shorter than the interval) after consecutive failures.
pub fn sync_delay(
    interval: Duration,
    failures: u32,
    backoff_base: Duration,
    backoff_max: Duration,
) -> Duration {
    if failures == 0 {
        return interval;
    }

    let shift = failures.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let candidate = backoff_base.saturating_mul(factor);
    let backoff = candidate.min(backoff_max);
    backoff.max(interval)
}
