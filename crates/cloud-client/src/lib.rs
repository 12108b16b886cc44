use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use types::{Credentials, Reading};

pub const DEFAULT_API_URL: &str = "https://green-energy-topaz.vercel.app";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RECOMMENDATION: &str = "No action needed";

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub api_url: String,
    pub timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("invalid or expired pairing code")]
    InvalidPairingCode,
    #[error("cannot connect: {0}")]
    CannotConnect(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("http client setup failed: {0}")]
    Setup(reqwest::Error),
}

impl CloudError {
    /// Stable key used in user-facing messages and diagnostics.
    pub fn reason(&self) -> &'static str {
        match self {
            CloudError::InvalidPairingCode => "invalid_code",
            CloudError::CannotConnect(_) => "cannot_connect",
            CloudError::Authentication(_) => "invalid_auth",
            CloudError::Api(_) | CloudError::Setup(_) => "unknown",
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CloudError::CannotConnect("request timed out".to_string())
        } else if err.is_decode() {
            CloudError::Api(format!("invalid response body: {err}"))
        } else {
            CloudError::CannotConnect(format!("connection error: {err}"))
        }
    }
}

/// Result of exchanging a pairing code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PairResponse {
    pub api_token: String,
    pub instance_id: String,
    #[serde(default)]
    pub user_email: Option<String>,
}

/// Acknowledgement returned for an uploaded batch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UploadAck {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub accepted: Option<u64>,
}

/// Recommendation, savings and tariff values computed by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudStatus {
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub recommendation_reason: Option<String>,
    #[serde(default)]
    pub recommendation_expires: Option<String>,
    #[serde(default)]
    pub savings_today_pence: Option<f64>,
    #[serde(default)]
    pub current_rate_pence: Option<f64>,
}

#[derive(Serialize)]
struct ReadingsPayload<'a> {
    instance_id: &'a str,
    readings: &'a [Reading],
}

#[derive(Debug, Clone)]
pub struct CloudClient {
    api_url: String,
    http: Client,
    token: Option<String>,
    instance_id: Option<String>,
}

impl CloudClient {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(CloudError::Setup)?;

        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            http,
            token: None,
            instance_id: None,
        })
    }

    /// Client bound to stored credentials, using the URL they were issued for.
    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        self.api_url = credentials.api_url.trim_end_matches('/').to_string();
        self.token = Some(credentials.api_token.clone());
        self.instance_id = Some(credentials.instance_id.clone());
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some() && self.instance_id.is_some()
    }

    /// Exchanges a pairing code for an API token. The token is kept for
    /// subsequent calls.
    pub async fn pair(&mut self, pairing_code: &str) -> Result<PairResponse, CloudError> {
        let url = format!("{}/api/ha/pair", self.api_url);
        let response = self
            .request(self.http.post(&url))
            .json(&json!({ "pairing_code": pairing_code }))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::BAD_REQUEST => {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                return match body.get("error").and_then(|value| value.as_str()) {
                    Some("invalid_code") => Err(CloudError::InvalidPairingCode),
                    Some(message) => Err(CloudError::Api(message.to_string())),
                    None => Err(CloudError::Api("Unknown error".to_string())),
                };
            }
            StatusCode::UNAUTHORIZED => return Err(CloudError::InvalidPairingCode),
            status => {
                return Err(CloudError::Api(format!(
                    "API returned status {}",
                    status.as_u16()
                )))
            }
        }

        let paired: PairResponse = response.json().await?;
        self.token = Some(paired.api_token.clone());
        self.instance_id = Some(paired.instance_id.clone());
        info!(instance_id = %paired.instance_id, "pairing accepted");
        Ok(paired)
    }

    pub async fn post_readings(&self, readings: &[Reading]) -> Result<UploadAck, CloudError> {
        let instance_id = self.require_instance()?;
        let url = format!("{}/api/ha/readings", self.api_url);
        let payload = ReadingsPayload {
            instance_id,
            readings,
        };

        debug!(count = readings.len(), "uploading readings");
        let response = self
            .request(self.http.post(&url))
            .json(&payload)
            .send()
            .await?;
        let response = check_authenticated(response)?;
        decode_or_default(response).await
    }

    pub async fn get_status(&self) -> Result<CloudStatus, CloudError> {
        let instance_id = self.require_instance()?;
        let url = format!("{}/api/ha/status", self.api_url);
        let response = self
            .request(self.http.get(&url))
            .query(&[("instance_id", instance_id)])
            .send()
            .await?;
        let response = check_authenticated(response)?;
        Ok(response.json::<CloudStatus>().await?)
    }

    /// Revokes the token server-side. `Ok(false)` when the service declined.
    pub async fn unpair(&self) -> Result<bool, CloudError> {
        let instance_id = self.require_instance()?;
        let url = format!("{}/api/ha/unpair", self.api_url);
        let response = self
            .request(self.http.post(&url))
            .json(&json!({ "instance_id": instance_id }))
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(CloudError::Authentication("Invalid or expired token".to_string()));
        }
        Ok(response.status() == StatusCode::OK)
    }

    fn require_instance(&self) -> Result<&str, CloudError> {
        match (&self.token, &self.instance_id) {
            (Some(_), Some(instance_id)) => Ok(instance_id.as_str()),
            _ => Err(CloudError::Authentication("Not authenticated".to_string())),
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn check_authenticated(response: Response) -> Result<Response, CloudError> {
    match response.status() {
        StatusCode::OK => Ok(response),
        StatusCode::UNAUTHORIZED => Err(CloudError::Authentication(
            "Invalid or expired token".to_string(),
        )),
        status => Err(CloudError::Api(format!(
            "API returned status {}",
            status.as_u16()
        ))),
    }
}

async fn decode_or_default<T>(response: Response) -> Result<T, CloudError>
where
    T: DeserializeOwned + Default,
{
    let body = response.text().await?;
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&body).map_err(|err| CloudError::Api(format!("invalid response body: {err}")))
}
