use serde_json::{json, Value};

use types::Credentials;

use crate::config::BridgeConfig;
use crate::coordinator::CoordinatorData;

pub const REDACTED: &str = "**REDACTED**";

/// Keys whose values never leave the process.
pub const SENSITIVE_KEYS: [&str; 2] = ["api_token", "token"];

/// Inputs for a diagnostics snapshot. Coordinator data is only available
/// inside a running bridge.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsInput<'a> {
    pub config: &'a BridgeConfig,
    pub credentials: Option<&'a Credentials>,
    pub data: Option<&'a CoordinatorData>,
    pub pending_readings: Option<i64>,
}

pub fn build(input: DiagnosticsInput<'_>) -> Value {
    let config = input.config;
    let mut report = json!({
        "config_entry": input.credentials.map(|credentials| json!({
            "title": credentials.title(),
            "api_token": credentials.api_token,
            "instance_id": credentials.instance_id,
            "user_email": credentials.user_email,
            "api_url": credentials.api_url,
            "paired_at": credentials.paired_at.to_rfc3339(),
        })),
        "options": {
            "solar_entity": config.sensors.solar,
            "battery_entity": config.sensors.battery,
            "grid_entity": config.sensors.grid,
            "scan_interval": config.sync.interval.as_secs(),
        },
        "home_assistant": {
            "base_url": config.home_assistant.base_url,
            "token": config.home_assistant.token,
        },
        "monitored_entities": config.sensors.monitored_entities(),
        "coordinator_data": input.data,
        "last_update_success": input.data.map(|data| data.last_update_success),
        "pending_readings": input.pending_readings,
    });

    redact(&mut report, &SENSITIVE_KEYS);
    report
}

/// Replaces the values of `keys` anywhere in `value`. Absent values stay
/// `null` so the report shows the field was unset.
pub fn redact(value: &mut Value, keys: &[&str]) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if keys.contains(&key.as_str()) {
                    if !entry.is_null() {
                        *entry = Value::String(REDACTED.to_string());
                    }
                } else {
                    redact(entry, keys);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact(item, keys);
            }
        }
        _ => {}
    }
}
