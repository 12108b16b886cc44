use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use buffer::{BufferError, BufferStore};
use cloud_client::{CloudClient, CloudConfig, CloudError};
use types::Credentials;

use crate::entities::EntityPublisher;

const PAIRING_PAGE: &str = "/dashboard/settings?tab=connections&conn=home-assistant";
const UNKNOWN_EMAIL: &str = "Unknown";

/// Dashboard page where pairing codes are generated.
pub fn pairing_url(api_url: &str) -> String {
    format!("{}{}", api_url.trim_end_matches('/'), PAIRING_PAGE)
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("invalid or expired pairing code")]
    InvalidCode,
    #[error("cannot connect to the green energy service: {0}")]
    CannotConnect(String),
    #[error("already paired as instance {instance_id}")]
    AlreadyConfigured { instance_id: String },
    #[error("local store failed: {0}")]
    Store(#[from] BufferError),
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl PairingError {
    pub fn reason(&self) -> &'static str {
        match self {
            PairingError::InvalidCode => "invalid_code",
            PairingError::CannotConnect(_) => "cannot_connect",
            PairingError::AlreadyConfigured { .. } => "already_configured",
            PairingError::Store(_) | PairingError::Unknown(_) => "unknown",
        }
    }

    /// What the user can do about it.
    pub fn remedy(&self, api_url: &str) -> String {
        match self {
            PairingError::InvalidCode => format!(
                "generate a new pairing code at {} and try again",
                pairing_url(api_url)
            ),
            PairingError::CannotConnect(_) => {
                "check the network connection and the service status, then retry".to_string()
            }
            PairingError::AlreadyConfigured { .. } => {
                "run `green-energy-bridge unpair` first to pair a different account".to_string()
            }
            PairingError::Store(_) | PairingError::Unknown(_) => {
                "retry; if the problem persists, check the logs".to_string()
            }
        }
    }
}

impl From<CloudError> for PairingError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::InvalidPairingCode => PairingError::InvalidCode,
            CloudError::CannotConnect(message) => PairingError::CannotConnect(message),
            other => PairingError::Unknown(other.to_string()),
        }
    }
}

/// Exchanges a pairing code and stores the resulting credentials.
pub async fn pair(
    store: &BufferStore,
    cloud: CloudConfig,
    pairing_code: &str,
) -> Result<Credentials, PairingError> {
    let code = pairing_code.trim();
    if code.is_empty() {
        return Err(PairingError::InvalidCode);
    }

    if let Some(existing) = store.load_credentials().await? {
        return Err(PairingError::AlreadyConfigured {
            instance_id: existing.instance_id,
        });
    }

    let mut client = CloudClient::new(cloud)?;
    let paired = client.pair(code).await?;

    let credentials = Credentials {
        api_token: paired.api_token,
        instance_id: paired.instance_id,
        user_email: paired
            .user_email
            .filter(|email| !email.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_EMAIL.to_string()),
        api_url: client.api_url().to_string(),
        paired_at: Utc::now(),
    };
    store.save_credentials(&credentials).await?;
    info!(instance_id = %credentials.instance_id, title = %credentials.title(), "pairing stored");

    Ok(credentials)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpairOutcome {
    pub instance_id: Option<String>,
    pub revoked: bool,
    pub cleared_readings: u64,
    pub removed_entities: usize,
}

/// Revokes the pairing (best effort) and clears all local state.
pub async fn unpair(
    store: &BufferStore,
    cloud: CloudConfig,
    publisher: Option<&EntityPublisher>,
) -> Result<UnpairOutcome, PairingError> {
    let mut outcome = UnpairOutcome::default();

    if let Some(credentials) = store.load_credentials().await? {
        outcome.instance_id = Some(credentials.instance_id.clone());
        match CloudClient::new(cloud) {
            Ok(client) => match client.with_credentials(&credentials).unpair().await {
                Ok(revoked) => outcome.revoked = revoked,
                Err(err) => warn!(error = %err, "remote unpair failed; clearing local state anyway"),
            },
            Err(err) => warn!(error = %err, "cloud client unavailable; clearing local state anyway"),
        }
    } else {
        info!("no stored pairing");
    }

    store.clear_credentials().await?;
    outcome.cleared_readings = store.clear_queue().await?;
    store.clear_counters().await?;

    if let Some(publisher) = publisher {
        match publisher.remove_all().await {
            Ok(removed) => outcome.removed_entities = removed,
            Err(err) => warn!(error = %err, "failed to remove published entities"),
        }
    }

    info!(
        instance_id = outcome.instance_id.as_deref().unwrap_or("none"),
        revoked = outcome.revoked,
        cleared_readings = outcome.cleared_readings,
        removed_entities = outcome.removed_entities,
        "unpair complete"
    );
    Ok(outcome)
}
