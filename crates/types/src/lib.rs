use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Entity attributes forwarded upstream with every reading.
pub const FORWARDED_ATTRIBUTES: [&str; 4] = [
    "unit_of_measurement",
    "device_class",
    "state_class",
    "friendly_name",
];

/// Logical role a monitored Home Assistant sensor plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    Solar,
    Battery,
    Grid,
}

impl SensorRole {
    pub const ALL: [SensorRole; 3] = [SensorRole::Solar, SensorRole::Battery, SensorRole::Grid];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorRole::Solar => "solar",
            SensorRole::Battery => "battery",
            SensorRole::Grid => "grid",
        }
    }
}

impl fmt::Display for SensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown sensor role '{0}' (expected solar, battery or grid)")]
pub struct UnknownRole(pub String);

impl FromStr for SensorRole {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "solar" => Ok(SensorRole::Solar),
            "battery" => Ok(SensorRole::Battery),
            "grid" => Ok(SensorRole::Grid),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Which Home Assistant entity backs each role. Every role is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSelection {
    pub solar: Option<String>,
    pub battery: Option<String>,
    pub grid: Option<String>,
}

impl SensorSelection {
    pub fn get(&self, role: SensorRole) -> Option<&str> {
        match role {
            SensorRole::Solar => self.solar.as_deref(),
            SensorRole::Battery => self.battery.as_deref(),
            SensorRole::Grid => self.grid.as_deref(),
        }
    }

    pub fn set(&mut self, role: SensorRole, entity_id: Option<String>) {
        let slot = match role {
            SensorRole::Solar => &mut self.solar,
            SensorRole::Battery => &mut self.battery,
            SensorRole::Grid => &mut self.grid,
        };
        *slot = entity_id.filter(|value| !value.trim().is_empty());
    }

    /// Configured `(role, entity_id)` pairs in role order.
    pub fn entries(&self) -> Vec<(SensorRole, String)> {
        SensorRole::ALL
            .iter()
            .filter_map(|role| self.get(*role).map(|id| (*role, id.to_string())))
            .collect()
    }

    pub fn monitored_entities(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// One sensor observation on its way to the cloud service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub role: SensorRole,
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Builds a reading from a raw entity state. Returns `None` for
    /// `unavailable`, `unknown` and other non-numeric states.
    pub fn from_state(
        role: SensorRole,
        entity_id: impl Into<String>,
        state: &str,
        attributes: &serde_json::Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Option<Self> {
        numeric_state(state)?;
        let attributes = attributes
            .iter()
            .filter(|(key, _)| FORWARDED_ATTRIBUTES.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Some(Self {
            role,
            entity_id: entity_id.into(),
            state: state.trim().to_string(),
            attributes,
            timestamp,
        })
    }

    pub fn value(&self) -> Option<f64> {
        numeric_state(&self.state)
    }
}

/// Parses a Home Assistant state string as a finite number.
pub fn numeric_state(state: &str) -> Option<f64> {
    state
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Connectivity/sync indicator surfaced as the sync status entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Unknown,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unknown => "unknown",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "mdi:cloud-check",
            SyncStatus::Syncing => "mdi:cloud-sync",
            SyncStatus::Error => "mdi:cloud-alert",
            SyncStatus::Unknown => "mdi:cloud-question",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable credentials obtained by exchanging a pairing code.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_token: String,
    pub instance_id: String,
    pub user_email: String,
    pub api_url: String,
    pub paired_at: DateTime<Utc>,
}

impl Credentials {
    pub fn title(&self) -> String {
        format!("Green Energy ({})", self.user_email)
    }
}

// Keeps the token out of `{:?}` output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_token", &"**REDACTED**")
            .field("instance_id", &self.instance_id)
            .field("user_email", &self.user_email)
            .field("api_url", &self.api_url)
            .field("paired_at", &self.paired_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Solar".parse::<SensorRole>().unwrap(), SensorRole::Solar);
        assert_eq!(" grid ".parse::<SensorRole>().unwrap(), SensorRole::Grid);
        assert!("wind".parse::<SensorRole>().is_err());
    }

    #[test]
    fn selection_entries_skip_unset_roles() {
        let mut selection = SensorSelection::default();
        selection.set(SensorRole::Grid, Some("sensor.grid_power".to_string()));
        selection.set(SensorRole::Solar, Some("  ".to_string()));

        assert_eq!(
            selection.entries(),
            vec![(SensorRole::Grid, "sensor.grid_power".to_string())]
        );
        assert!(!selection.is_empty());
        assert!(SensorSelection::default().is_empty());
    }

    #[test]
    fn reading_filters_attributes_and_rejects_non_numeric() {
        let attributes = json!({
            "unit_of_measurement": "W",
            "friendly_name": "Solar power",
            "icon": "mdi:solar-power",
        });
        let attributes = attributes.as_object().unwrap();
        let now = Utc::now();

        let reading =
            Reading::from_state(SensorRole::Solar, "sensor.pv", "1520.5", attributes, now)
                .expect("numeric state");
        assert_eq!(reading.value(), Some(1520.5));
        assert_eq!(reading.attributes.len(), 2);
        assert!(!reading.attributes.contains_key("icon"));

        assert!(
            Reading::from_state(SensorRole::Solar, "sensor.pv", "unavailable", attributes, now)
                .is_none()
        );
        assert!(Reading::from_state(SensorRole::Solar, "sensor.pv", "NaN", attributes, now).is_none());
    }

    #[test]
    fn credentials_debug_hides_token() {
        let credentials = Credentials {
            api_token: "secret-token".to_string(),
            instance_id: "inst-1".to_string(),
            user_email: "user@example.com".to_string(),
            api_url: "https://example.invalid".to_string(),
            paired_at: Utc::now(),
        };
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("secret-token"));
        assert_eq!(credentials.title(), "Green Energy (user@example.com)");
    }
}
