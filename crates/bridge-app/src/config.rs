use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use cloud_client::CloudConfig;
use ha_client::{ClientConfig, DEFAULT_BASE_URL, SUPERVISOR_URL};
use poller_actor::ActorConfig;
use types::{SensorRole, SensorSelection};

use crate::coordinator::SyncConfig;

pub const MIN_SCAN_INTERVAL_SECS: u64 = 30;
pub const MAX_SCAN_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_RESPAWN_DELAY_MS: u64 = 1_000;
const DEFAULT_BUFFER_PATH: &str = "green-energy.sqlite";
const DEFAULT_BUFFER_BATCH_SIZE: i64 = 100;
const DEFAULT_BUFFER_MAX_PENDING: i64 = 10_000;
const DEFAULT_ENTITY_PREFIX: &str = "green_energy";

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub home_assistant: ClientConfig,
    pub cloud: CloudConfig,
    pub sensors: SensorSelection,
    pub sync: SyncConfig,
    pub poller: ActorConfig,
    pub buffer_path: String,
    pub buffer_batch_size: i64,
    pub buffer_max_pending: i64,
    pub entity_prefix: String,
    pub http_listen: Option<String>,
    pub channel_capacity: usize,
    pub respawn_delay_ms: u64,
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let interval = self.sync.interval.as_secs();
        if !(MIN_SCAN_INTERVAL_SECS..=MAX_SCAN_INTERVAL_SECS).contains(&interval) {
            anyhow::bail!(
                "sync.interval_secs must be between {MIN_SCAN_INTERVAL_SECS} and {MAX_SCAN_INTERVAL_SECS}"
            );
        }
        if self.sync.backoff_base.is_zero() {
            anyhow::bail!("sync.backoff_base_secs must be >= 1");
        }
        if self.sync.backoff_max < self.sync.backoff_base {
            anyhow::bail!("sync.backoff_max_secs must be >= sync.backoff_base_secs");
        }
        if self.poller.poll_interval.as_millis() == 0 {
            anyhow::bail!("poller.poll_interval_ms must be >= 1");
        }
        validate_http_url("home_assistant.base_url", &self.home_assistant.base_url)?;
        if self.home_assistant.timeout_ms == 0 {
            anyhow::bail!("home_assistant.timeout_ms must be >= 1");
        }
        if self.home_assistant.retry_backoff_ms == 0 {
            anyhow::bail!("home_assistant.retry_backoff_ms must be >= 1");
        }
        if self.home_assistant.retry_max_backoff_ms == 0 {
            anyhow::bail!("home_assistant.retry_max_backoff_ms must be >= 1");
        }
        validate_http_url("cloud.api_url", &self.cloud.api_url)?;
        if self.cloud.timeout_ms == 0 {
            anyhow::bail!("cloud.timeout_ms must be >= 1");
        }
        for (role, entity_id) in self.sensors.entries() {
            validate_sensor_entity(role, &entity_id)?;
        }
        validate_entity_prefix(&self.entity_prefix)?;
        if self.buffer_path.trim().is_empty() {
            anyhow::bail!("buffer.path must be non-empty");
        }
        if self.buffer_batch_size <= 0 {
            anyhow::bail!("buffer.batch_size must be >= 1");
        }
        if self.buffer_max_pending < self.buffer_batch_size {
            anyhow::bail!("buffer.max_pending must be >= buffer.batch_size");
        }
        if let Some(ref listen) = self.http_listen {
            listen
                .parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("http.listen must be a socket address (e.g. 0.0.0.0:9464)"))?;
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be >= 1");
        }
        if self.respawn_delay_ms == 0 {
            anyhow::bail!("respawn_delay_ms must be >= 1");
        }

        Ok(())
    }

    /// Home Assistant access is needed by `run` and `entities`, not by `pair`.
    pub fn require_home_assistant_token(&self) -> Result<()> {
        match self.home_assistant.token.as_deref() {
            Some(token) if !token.trim().is_empty() => Ok(()),
            _ => anyhow::bail!(
                "home assistant token missing: set home_assistant.token, HA_TOKEN or SUPERVISOR_TOKEN"
            ),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            home_assistant: ClientConfig::default(),
            cloud: CloudConfig::default(),
            sensors: SensorSelection::default(),
            sync: SyncConfig::default(),
            poller: ActorConfig::default(),
            buffer_path: DEFAULT_BUFFER_PATH.to_string(),
            buffer_batch_size: DEFAULT_BUFFER_BATCH_SIZE,
            buffer_max_pending: DEFAULT_BUFFER_MAX_PENDING,
            entity_prefix: DEFAULT_ENTITY_PREFIX.to_string(),
            http_listen: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
        }
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) {
    // Running as an add-on: the Supervisor proxies the core API.
    if let Ok(token) = env::var("SUPERVISOR_TOKEN") {
        if config.home_assistant.token.is_none() {
            config.home_assistant.token = Some(token);
            if config.home_assistant.base_url == DEFAULT_BASE_URL {
                config.home_assistant.base_url = SUPERVISOR_URL.to_string();
            }
        }
    }

    if let Some(value) = env_string("HA_BASE_URL").or_else(|| env_string("GREEN_ENERGY_HA_URL")) {
        config.home_assistant.base_url = value;
    }
    if let Some(value) = env_string("HA_TOKEN") {
        config.home_assistant.token = Some(value);
    }
    if let Some(timeout_ms) = parse_env_u64("GREEN_ENERGY_HA_TIMEOUT_MS") {
        config.home_assistant.timeout_ms = timeout_ms;
    }

    if let Some(value) = env_string("GREEN_ENERGY_API_URL") {
        config.cloud.api_url = value;
    }
    if let Some(timeout_ms) = parse_env_u64("GREEN_ENERGY_API_TIMEOUT_MS") {
        config.cloud.timeout_ms = timeout_ms;
    }

    for role in SensorRole::ALL {
        let key = format!("GREEN_ENERGY_{}_ENTITY", role.as_str().to_ascii_uppercase());
        if let Ok(value) = env::var(&key) {
            config.sensors.set(role, Some(value));
        }
    }

    if let Some(secs) = parse_env_u64("GREEN_ENERGY_SCAN_INTERVAL") {
        config.sync.interval = Duration::from_secs(secs);
    }
    if let Some(ms) = parse_env_u64("GREEN_ENERGY_DEBOUNCE_MS") {
        config.sync.debounce = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_env_u64("GREEN_ENERGY_POLL_INTERVAL_MS") {
        config.poller.poll_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_env_u64("GREEN_ENERGY_JITTER_MS") {
        config.poller.jitter_ms = ms;
    }

    if let Some(value) = env_string("GREEN_ENERGY_BUFFER_PATH") {
        config.buffer_path = value;
    }
    if let Some(value) = parse_env_i64("GREEN_ENERGY_BUFFER_BATCH_SIZE") {
        config.buffer_batch_size = value.max(1);
    }
    if let Some(value) = parse_env_i64("GREEN_ENERGY_BUFFER_MAX_PENDING") {
        config.buffer_max_pending = value;
    }

    if let Some(value) = env_string("GREEN_ENERGY_ENTITY_PREFIX") {
        config.entity_prefix = value;
    }
    config.http_listen = env_string("GREEN_ENERGY_HTTP_LISTEN").or(config.http_listen.take());
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    home_assistant: Option<FileHomeAssistantConfig>,
    cloud: Option<FileCloudConfig>,
    sensors: Option<FileSensorsConfig>,
    sync: Option<FileSyncConfig>,
    poller: Option<FilePollerConfig>,
    buffer: Option<FileBufferConfig>,
    entities: Option<FileEntitiesConfig>,
    http: Option<FileHttpConfig>,
    channel_capacity: Option<usize>,
    respawn_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHomeAssistantConfig {
    base_url: Option<String>,
    token: Option<String>,
    timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCloudConfig {
    api_url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSensorsConfig {
    solar: Option<String>,
    battery: Option<String>,
    grid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSyncConfig {
    interval_secs: Option<u64>,
    debounce_ms: Option<u64>,
    backoff_base_secs: Option<u64>,
    backoff_max_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePollerConfig {
    poll_interval_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBufferConfig {
    path: Option<String>,
    batch_size: Option<i64>,
    max_pending: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEntitiesConfig {
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHttpConfig {
    listen: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("GREEN_ENERGY_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut BridgeConfig, file: FileConfig) {
    if let Some(ha) = file.home_assistant {
        if let Some(base_url) = ha.base_url {
            config.home_assistant.base_url = base_url;
        }
        if let Some(token) = ha.token {
            config.home_assistant.token = Some(token);
        }
        if let Some(timeout_ms) = ha.timeout_ms {
            config.home_assistant.timeout_ms = timeout_ms;
        }
        if let Some(retry_count) = ha.retry_count {
            config.home_assistant.retry_count = retry_count;
        }
        if let Some(backoff) = ha.retry_backoff_ms {
            config.home_assistant.retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = ha.retry_max_backoff_ms {
            config.home_assistant.retry_max_backoff_ms = max_backoff;
        }
    }

    if let Some(cloud) = file.cloud {
        if let Some(api_url) = cloud.api_url {
            config.cloud.api_url = api_url;
        }
        if let Some(timeout_ms) = cloud.timeout_ms {
            config.cloud.timeout_ms = timeout_ms;
        }
    }

    if let Some(sensors) = file.sensors {
        config.sensors.set(SensorRole::Solar, sensors.solar);
        config.sensors.set(SensorRole::Battery, sensors.battery);
        config.sensors.set(SensorRole::Grid, sensors.grid);
    }

    if let Some(sync) = file.sync {
        if let Some(secs) = sync.interval_secs {
            config.sync.interval = Duration::from_secs(secs);
        }
        if let Some(ms) = sync.debounce_ms {
            config.sync.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = sync.backoff_base_secs {
            config.sync.backoff_base = Duration::from_secs(secs);
        }
        if let Some(secs) = sync.backoff_max_secs {
            config.sync.backoff_max = Duration::from_secs(secs);
        }
    }

    if let Some(poller) = file.poller {
        if let Some(interval_ms) = poller.poll_interval_ms {
            config.poller.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(jitter_ms) = poller.jitter_ms {
            config.poller.jitter_ms = jitter_ms;
        }
    }

    if let Some(buffer) = file.buffer {
        if let Some(path) = buffer.path {
            config.buffer_path = path;
        }
        if let Some(batch) = buffer.batch_size {
            config.buffer_batch_size = batch.max(1);
        }
        if let Some(max_pending) = buffer.max_pending {
            config.buffer_max_pending = max_pending;
        }
    }

    if let Some(prefix) = file.entities.and_then(|entities| entities.prefix) {
        config.entity_prefix = prefix;
    }
    if let Some(listen) = file.http.and_then(|http| http.listen) {
        config.http_listen = Some(listen);
    }
    if let Some(capacity) = file.channel_capacity {
        config.channel_capacity = capacity;
    }
    if let Some(delay) = file.respawn_delay_ms {
        config.respawn_delay_ms = delay;
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_i64(key: &str) -> Option<i64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn validate_http_url(key: &str, value: &str) -> Result<()> {
    let value = value.trim();
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .ok_or_else(|| anyhow::anyhow!("{key} must start with http:// or https://"))?;
    if rest.trim_end_matches('/').is_empty() {
        anyhow::bail!("{key} must include a host");
    }
    Ok(())
}

fn is_slug_char(ch: char) -> bool {
    ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_'
}

fn validate_sensor_entity(role: SensorRole, entity_id: &str) -> Result<()> {
    let (domain, object_id) = entity_id
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!("sensors.{role} must be an entity id like sensor.solar_power"))?;
    if domain != "sensor" {
        anyhow::bail!("sensors.{role} must be a sensor entity, got {entity_id}");
    }
    if object_id.is_empty() || !object_id.chars().all(is_slug_char) {
        anyhow::bail!("sensors.{role} has an invalid object id: {entity_id}");
    }
    Ok(())
}

fn validate_entity_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        anyhow::bail!("entities.prefix must be non-empty");
    }
    if !prefix.chars().all(is_slug_char) {
        anyhow::bail!("entities.prefix may only contain lowercase letters, digits and '_'");
    }
    if prefix.starts_with('_') || prefix.ends_with('_') {
        anyhow::bail!("entities.prefix must not start or end with '_'");
    }
    Ok(())
}
