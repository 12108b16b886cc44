use std::cmp::min;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const SUPERVISOR_URL: &str = "http://supervisor/core";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8123";

/// Connection and retry settings for the Home Assistant REST API.
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of retries per request after the initial attempt.
    pub retry_count: usize,
    /// Base delay between retries in milliseconds (exponential backoff).
    pub retry_backoff_ms: u64,
    /// Upper bound for retry backoff delay in milliseconds.
    pub retry_max_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout_ms: 10_000,
            retry_count: 2,
            retry_backoff_ms: 250,
            retry_max_backoff_ms: 4_000,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "**REDACTED**"))
            .field("timeout_ms", &self.timeout_ms)
            .field("retry_count", &self.retry_count)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("retry_max_backoff_ms", &self.retry_max_backoff_ms)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("authentication rejected by home assistant")]
    Unauthorized,
    #[error("home assistant returned status {status}: {message}")]
    Api { status: u16, message: String },
}

impl ClientError {
    /// True for failures that a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Http(_) | ClientError::Timeout { .. } | ClientError::Api { status: 500..=599, .. }
        )
    }
}

/// State object as returned by `/api/states`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl EntityState {
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or_default()
    }

    pub fn device_class(&self) -> Option<&str> {
        self.attributes.get("device_class").and_then(Value::as_str)
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes.get("friendly_name").and_then(Value::as_str)
    }
}

/// Body for `POST /api/states/<entity_id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateUpdate {
    pub state: String,
    pub attributes: Map<String, Value>,
}

impl StateUpdate {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct HaClient {
    config: ClientConfig,
    base_url: String,
    http: Client,
}

impl HaClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if config.token.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            return Err(ClientError::InvalidConfig(
                "home assistant token is not set (HA_TOKEN or SUPERVISOR_TOKEN)".to_string(),
            ));
        }
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClientError::InvalidConfig(format!(
                "home assistant url must be http(s): {base_url}"
            )));
        }
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            config,
            base_url,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_state(&self, entity_id: &str) -> Result<EntityState, ClientError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self.send_with_retry(|| self.http.get(&url)).await?;
        let response = check_status(response, Some(entity_id)).await?;
        let state = response.json::<EntityState>().await?;
        debug!(entity_id, state = %state.state, "home assistant state read");
        Ok(state)
    }

    pub async fn get_states(&self) -> Result<Vec<EntityState>, ClientError> {
        let url = format!("{}/api/states", self.base_url);
        let response = self.send_with_retry(|| self.http.get(&url)).await?;
        let response = check_status(response, None).await?;
        Ok(response.json::<Vec<EntityState>>().await?)
    }

    /// Creates or replaces the state of an entity owned by this client.
    pub async fn set_state(
        &self,
        entity_id: &str,
        update: &StateUpdate,
    ) -> Result<EntityState, ClientError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self
            .send_with_retry(|| self.http.post(&url).json(update))
            .await?;
        let response = check_status(response, None).await?;
        let state = response.json::<EntityState>().await?;
        debug!(entity_id, state = %state.state, "home assistant state written");
        Ok(state)
    }

    /// Removes an entity state. Returns `false` when it did not exist.
    pub async fn remove_state(&self, entity_id: &str) -> Result<bool, ClientError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self.send_with_retry(|| self.http.delete(&url)).await?;
        match check_status(response, Some(entity_id)).await {
            Ok(_) => Ok(true),
            Err(ClientError::EntityNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Health probe against `/api/`; transport failures report `false`.
    pub async fn ping(&self) -> Result<bool, ClientError> {
        let url = format!("{}/api/", self.base_url);
        match self.authorized(self.http.get(&url)).send().await {
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(ClientError::Unauthorized)
            }
            Ok(response) => Ok(response.status().is_success()),
            Err(err) => {
                warn!(error = %err, "home assistant ping failed");
                Ok(false)
            }
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<Response, ClientError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempts = 0usize;

        loop {
            let err = match self.authorized(build()).send().await {
                Ok(response) if response.status().is_server_error() => {
                    if attempts >= self.config.retry_count {
                        return Ok(response);
                    }
                    warn!(status = response.status().as_u16(), attempts, "home assistant server error");
                    None
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_timeout() => Some(ClientError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }),
                Err(err) => Some(ClientError::Http(err)),
            };

            if let Some(err) = err {
                if attempts >= self.config.retry_count {
                    return Err(err);
                }
                warn!(error = %err, attempts, "home assistant request failed");
            }

            let delay_ms = self.retry_delay_ms(attempts);
            attempts += 1;
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    fn retry_delay_ms(&self, attempt: usize) -> u64 {
        let base = self.config.retry_backoff_ms.max(1);
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        let max = self.config.retry_max_backoff_ms.max(base);
        min(delay, max)
    }
}

async fn check_status(response: Response, entity_id: Option<&str>) -> Result<Response, ClientError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND if entity_id.is_some() => Err(ClientError::EntityNotFound(
            entity_id.unwrap_or_default().to_string(),
        )),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ClientError::Unauthorized),
        status => {
            let message = response.text().await.unwrap_or_default();
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}
