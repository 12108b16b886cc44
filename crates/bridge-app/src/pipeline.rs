use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{error, info, warn};

use buffer::BufferStore;
use cloud_client::CloudClient;
use discovery::verify_selection;
use ha_client::{ClientError, HaClient};
use poller_actor::{ActorConfig, PollerActor, PollerError};
use types::{Reading, SensorRole};

use crate::config::BridgeConfig;
use crate::coordinator::{CoordinatorData, SyncCoordinator};
use crate::entities::{EntityContext, EntityPublisher};
use crate::http::{self, HttpState};

#[derive(Clone, Default)]
pub struct PipelineOptions {
    /// Log entity states instead of writing them to Home Assistant.
    pub dry_run: bool,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Clone)]
struct PollerSpec {
    client: HaClient,
    role: SensorRole,
    entity_id: String,
    config: ActorConfig,
    sender: mpsc::Sender<Reading>,
    shutdown: watch::Receiver<bool>,
}

type PollerOutcome = (SensorRole, Result<(), PollerError>);

/// One configured instance of the bridge: pollers, buffer task, sync
/// coordinator and the optional HTTP server.
pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    pollers: JoinSet<PollerOutcome>,
    specs: HashMap<SensorRole, PollerSpec>,
    tasks: Vec<JoinHandle<()>>,
    respawn_delay: Duration,
    store: BufferStore,
    data: watch::Receiver<CoordinatorData>,
}

impl Pipeline {
    pub async fn start(config: BridgeConfig, options: PipelineOptions) -> Result<Self> {
        let store = BufferStore::new(&config.buffer_path)
            .await
            .context("buffer init failed")?;
        let credentials = store
            .load_credentials()
            .await
            .context("load credentials failed")?
            .ok_or_else(|| {
                anyhow::anyhow!("not paired: run `green-energy-bridge pair --code <CODE>` first")
            })?;

        let ha = HaClient::new(config.home_assistant.clone()).context("home assistant client init failed")?;
        check_home_assistant(&ha, &config).await?;

        let cloud = CloudClient::new(config.cloud.clone())
            .context("cloud client init failed")?
            .with_credentials(&credentials);
        let context = EntityContext::new(config.entity_prefix.clone(), credentials.instance_id.clone());
        let publisher = if options.dry_run {
            EntityPublisher::dry_run(context)
        } else {
            EntityPublisher::new(ha.clone(), context)
        };

        let coordinator = SyncCoordinator::new(
            cloud,
            store.clone(),
            publisher,
            config.sync.clone(),
            config.buffer_batch_size,
        );
        let data = coordinator.subscribe();
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(config.channel_capacity);

        let mut tasks = vec![
            tokio::spawn(buffer_task(
                rx,
                store.clone(),
                config.buffer_max_pending,
                wake.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(coordinator.run(wake, shutdown_rx.clone())),
        ];

        if let Some(listen) = config.http_listen.as_deref() {
            let addr: SocketAddr = listen.parse().context("invalid http.listen address")?;
            let router = http::router(HttpState {
                data: data.clone(),
                metrics: options.metrics.clone(),
                config: Arc::new(config.clone()),
                credentials: Some(Arc::new(credentials.clone())),
                store: store.clone(),
            });
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = http::serve(addr, router, shutdown).await {
                    error!(error = %err, "http server failed");
                }
            }));
        }

        let mut specs = HashMap::new();
        for (role, entity_id) in config.sensors.entries() {
            specs.insert(
                role,
                PollerSpec {
                    client: ha.clone(),
                    role,
                    entity_id,
                    config: config.poller.clone(),
                    sender: tx.clone(),
                    shutdown: shutdown_rx.clone(),
                },
            );
        }
        if specs.is_empty() {
            warn!("no sensors selected; only cloud status will be synced");
        }

        let mut pollers = JoinSet::new();
        for spec in specs.values() {
            spawn_poller(spec.clone(), &mut pollers, Duration::ZERO);
        }

        info!(
            instance_id = %credentials.instance_id,
            sensors = specs.len(),
            dry_run = options.dry_run,
            "bridge pipeline started"
        );

        Ok(Self {
            shutdown_tx,
            pollers,
            specs,
            tasks,
            respawn_delay: Duration::from_millis(config.respawn_delay_ms),
            store,
            data,
        })
    }

    /// Runs the Home Assistant start-up checks for `config` without touching
    /// a running pipeline.
    pub async fn preflight(config: &BridgeConfig) -> Result<()> {
        let ha = HaClient::new(config.home_assistant.clone()).context("home assistant client init failed")?;
        check_home_assistant(&ha, config).await
    }

    pub fn data(&self) -> watch::Receiver<CoordinatorData> {
        self.data.clone()
    }

    /// Restarts exited pollers until `stop` resolves and returns its output.
    pub async fn supervise<F>(&mut self, stop: F) -> F::Output
    where
        F: Future,
    {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                output = &mut stop => return output,
                Some(result) = self.pollers.join_next(), if !self.pollers.is_empty() => {
                    match result {
                        Ok((role, outcome)) => {
                            if let Err(err) = outcome {
                                warn!(%role, error = %err, "poller exited with error");
                            } else {
                                info!(%role, "poller exited cleanly");
                            }
                            if let Some(spec) = self.specs.get(&role) {
                                spawn_poller(spec.clone(), &mut self.pollers, self.respawn_delay);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "poller task failed");
                        }
                    }
                }
            }
        }
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);

        self.pollers.abort_all();
        while let Some(result) = self.pollers.join_next().await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    warn!(error = %err, "poller task join failed");
                }
            }
        }

        for handle in self.tasks {
            let _ = handle.await;
        }
        self.store.close().await;
        info!("bridge pipeline stopped");
    }
}

async fn check_home_assistant(ha: &HaClient, config: &BridgeConfig) -> Result<()> {
    match ha.ping().await {
        Ok(true) => info!(base_url = %ha.base_url(), "home assistant reachable"),
        Ok(false) => warn!(base_url = %ha.base_url(), "home assistant not reachable yet"),
        Err(ClientError::Unauthorized) => {
            anyhow::bail!("home assistant rejected the access token")
        }
        Err(err) => warn!(error = %err, "home assistant probe failed"),
    }

    match verify_selection(ha, &config.sensors).await {
        Ok(issues) => {
            let fatal: Vec<String> = issues
                .iter()
                .filter(|issue| issue.is_fatal())
                .map(|issue| issue.to_string())
                .collect();
            if !fatal.is_empty() {
                anyhow::bail!("sensor selection is unusable: {}", fatal.join("; "));
            }
        }
        Err(err) => warn!(error = %err, "sensor verification skipped"),
    }
    Ok(())
}

fn spawn_poller(spec: PollerSpec, join_set: &mut JoinSet<PollerOutcome>, delay: Duration) {
    let role = spec.role;
    join_set.spawn(async move {
        if delay > Duration::ZERO {
            sleep(delay).await;
        }
        let actor = PollerActor::new(
            spec.client,
            spec.role,
            spec.entity_id,
            spec.sender,
            spec.shutdown,
            spec.config,
        );
        (role, actor.run().await)
    });
}

/// Moves readings from the pollers into the durable queue and wakes the
/// coordinator. The queue is capped at `max_pending`, dropping the oldest.
pub async fn buffer_task(
    mut rx: mpsc::Receiver<Reading>,
    store: BufferStore,
    max_pending: i64,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_reading = rx.recv() => {
                match maybe_reading {
                    Some(reading) => {
                        if let Err(err) = store.enqueue(&reading).await {
                            warn!(role = %reading.role, error = %err, "buffer enqueue failed");
                            continue;
                        }
                        metrics::counter!("green_energy_readings_buffered_total", "role" => reading.role.as_str())
                            .increment(1);

                        match store.trim_to(max_pending).await {
                            Ok(0) => {}
                            Ok(dropped) => warn!(dropped, max_pending, "buffer full; oldest readings dropped"),
                            Err(err) => warn!(error = %err, "buffer trim failed"),
                        }
                        if let Ok(depth) = store.pending_count().await {
                            metrics::gauge!("green_energy_buffer_depth").set(depth as f64);
                        }
                        wake.notify_one();
                    }
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("buffer shutdown requested");
                    break;
                }
            }
        }
    }
}
