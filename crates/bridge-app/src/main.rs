use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridge_app::diagnostics::{self, DiagnosticsInput};
use bridge_app::entities::{EntityContext, EntityPublisher};
use bridge_app::pairing;
use bridge_app::{BridgeConfig, CoordinatorData, Pipeline, PipelineOptions};
use buffer::BufferStore;
use discovery::discover_candidates;
use ha_client::HaClient;
use types::SensorRole;

#[derive(Debug, Parser)]
#[command(
    name = "green-energy-bridge",
    version,
    about = "Forwards Home Assistant energy sensors to the Green Energy service"
)]
struct Cli {
    /// TOML or JSON configuration file (defaults to $GREEN_ENERGY_CONFIG).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll sensors, upload readings and publish entities (default).
    Run {
        /// Log entity states instead of writing them to Home Assistant.
        #[arg(long)]
        dry_run: bool,
    },
    /// Link this bridge to an account with a one-time pairing code.
    Pair {
        #[arg(long)]
        code: String,
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
    },
    /// Revoke the pairing and clear all local state.
    Unpair,
    /// List Home Assistant sensors usable for a role.
    Entities {
        #[arg(long)]
        role: Option<SensorRole>,
        #[arg(long)]
        json: bool,
    },
    /// Print a redacted diagnostics report.
    Diagnostics,
}

enum Control {
    Reload,
    Terminate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run { dry_run: false }) {
        Command::Run { dry_run } => run(cli.config, dry_run).await,
        Command::Pair { code, api_url } => pair(cli.config, code, api_url).await,
        Command::Unpair => unpair(cli.config).await,
        Command::Entities { role, json } => entities(cli.config, role, json).await,
        Command::Diagnostics => print_diagnostics(cli.config).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<String>) -> Result<BridgeConfig> {
    let config = BridgeConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    Ok(config)
}

async fn run(config_path: Option<String>, dry_run: bool) -> Result<()> {
    let config = load_config(config_path.clone())?;
    config.require_home_assistant_token()?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "metrics recorder install failed");
            None
        }
    };
    let options = PipelineOptions { dry_run, metrics };

    let mut signals = Signals::new().context("signal handler install failed")?;
    let (process_tx, process_rx) = watch::channel(false);

    let mut pipeline = Pipeline::start(config.clone(), options.clone())
        .await
        .context("bridge start failed")?;
    let mut current = config;
    notify_ready();
    let (liveness_tx, liveness_rx) = watch::channel(pipeline.data());
    let watchdog_handle = start_watchdog(process_rx, liveness_rx);

    loop {
        match pipeline.supervise(signals.next()).await {
            Control::Terminate => {
                info!("shutdown signal received");
                break;
            }
            Control::Reload => {
                info!("reload signal received");
                let next = match load_config(config_path.clone())
                    .and_then(|config| config.require_home_assistant_token().map(|_| config))
                {
                    Ok(next) => next,
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "reload rejected; keeping current configuration");
                        continue;
                    }
                };
                if let Err(err) = Pipeline::preflight(&next).await {
                    error!(error = %format!("{err:#}"), "reload rejected; keeping current configuration");
                    continue;
                }

                pipeline.shutdown().await;
                pipeline = match Pipeline::start(next.clone(), options.clone()).await {
                    Ok(pipeline) => {
                        current = next;
                        pipeline
                    }
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "reload failed; restoring previous configuration");
                        Pipeline::start(current.clone(), options.clone())
                            .await
                            .context("bridge restart failed")?
                    }
                };
                liveness_tx.send_replace(pipeline.data());
            }
        }
    }

    pipeline.shutdown().await;
    let _ = process_tx.send(true);
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

async fn pair(config_path: Option<String>, code: String, api_url: Option<String>) -> Result<()> {
    let mut config = BridgeConfig::load_with_path(config_path).context("load config failed")?;
    if let Some(api_url) = api_url {
        config.cloud.api_url = api_url;
    }
    config.validate().context("config validation failed")?;

    let store = BufferStore::new(&config.buffer_path)
        .await
        .context("buffer init failed")?;
    let result = pairing::pair(&store, config.cloud.clone(), &code).await;
    store.close().await;

    match result {
        Ok(credentials) => {
            println!("Paired: {}", credentials.title());
            println!("Instance: {}", credentials.instance_id);
            Ok(())
        }
        Err(err) => anyhow::bail!(
            "pairing failed ({}): {err}\n{}",
            err.reason(),
            err.remedy(&config.cloud.api_url)
        ),
    }
}

async fn unpair(config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = BufferStore::new(&config.buffer_path)
        .await
        .context("buffer init failed")?;

    let publisher = match HaClient::new(config.home_assistant.clone()) {
        Ok(client) => Some(EntityPublisher::new(
            client,
            EntityContext::new(config.entity_prefix.clone(), ""),
        )),
        Err(err) => {
            warn!(error = %err, "home assistant unavailable; published entities left in place");
            None
        }
    };

    let result = pairing::unpair(&store, config.cloud.clone(), publisher.as_ref()).await;
    store.close().await;
    let outcome = result.context("unpair failed")?;

    match outcome.instance_id {
        Some(instance_id) if outcome.revoked => println!("Unpaired instance {instance_id}"),
        Some(instance_id) => {
            println!("Removed local pairing for {instance_id} (the service did not confirm revocation)")
        }
        None => println!("No pairing stored; local state cleared"),
    }
    println!(
        "Cleared {} queued readings, removed {} entities",
        outcome.cleared_readings, outcome.removed_entities
    );
    Ok(())
}

async fn entities(config_path: Option<String>, role: Option<SensorRole>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    config.require_home_assistant_token()?;
    let client = HaClient::new(config.home_assistant.clone()).context("home assistant client init failed")?;
    let candidates = discover_candidates(&client, role)
        .await
        .context("sensor discovery failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }

    if candidates.is_empty() {
        println!("No matching sensors found");
    }
    for candidate in candidates {
        println!(
            "{}\t{}\t{} {}\t{}",
            candidate.entity_id,
            candidate.device_class.as_deref().unwrap_or("-"),
            candidate.state,
            candidate.unit.as_deref().unwrap_or_default(),
            candidate.friendly_name.as_deref().unwrap_or_default(),
        );
    }
    Ok(())
}

async fn print_diagnostics(config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = BufferStore::new(&config.buffer_path)
        .await
        .context("buffer init failed")?;
    let credentials = store.load_credentials().await.context("load credentials failed")?;
    let pending = store.pending_count().await.context("buffer count failed")?;
    store.close().await;

    let report = diagnostics::build(DiagnosticsInput {
        config: &config,
        credentials: credentials.as_ref(),
        data: None,
        pending_readings: Some(pending),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn next(&mut self) -> Control {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => Control::Terminate,
            _ = self.terminate.recv() => Control::Terminate,
            _ = self.hangup.recv() => Control::Reload,
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> Control {
        let _ = tokio::signal::ctrl_c().await;
        Control::Terminate
    }
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

/// Pings the systemd watchdog while the current pipeline's coordinator is
/// running. `liveness` is swapped on every reload.
#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
    liveness: watch::Receiver<watch::Receiver<CoordinatorData>>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if !bridge_app::coordinator_alive(&liveness.borrow()) {
                        warn!("sync coordinator stopped; withholding watchdog ping");
                        continue;
                    }
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(
    _shutdown: watch::Receiver<bool>,
    _liveness: watch::Receiver<watch::Receiver<CoordinatorData>>,
) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
