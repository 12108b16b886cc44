use serde_json::Value;
use tracing::{debug, info, warn};

use ha_client::{ClientError, HaClient, StateUpdate};

use crate::coordinator::CoordinatorData;

const ATTRIBUTION: &str = "Data provided by Green Energy";
const NO_DATA: &str = "No data";
const UNKNOWN: &str = "unknown";

/// The entities derived from coordinator data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    SyncStatus,
    LastSync,
    ReadingsToday,
    Recommendation,
    SavingsToday,
    TariffRate,
    Connected,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::SyncStatus,
        EntityKind::LastSync,
        EntityKind::ReadingsToday,
        EntityKind::Recommendation,
        EntityKind::SavingsToday,
        EntityKind::TariffRate,
        EntityKind::Connected,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            EntityKind::SyncStatus => "sync_status",
            EntityKind::LastSync => "last_sync",
            EntityKind::ReadingsToday => "readings_today",
            EntityKind::Recommendation => "recommendation",
            EntityKind::SavingsToday => "savings_today",
            EntityKind::TariffRate => "tariff_rate",
            EntityKind::Connected => "connected",
        }
    }

    fn domain(&self) -> &'static str {
        match self {
            EntityKind::Connected => "binary_sensor",
            _ => "sensor",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            EntityKind::SyncStatus => "Sync Status",
            EntityKind::LastSync => "Last Sync",
            EntityKind::ReadingsToday => "Readings Today",
            EntityKind::Recommendation => "Recommendation",
            EntityKind::SavingsToday => "Savings Today",
            EntityKind::TariffRate => "Current Tariff Rate",
            EntityKind::Connected => "Connected",
        }
    }

    fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            EntityKind::SyncStatus
                | EntityKind::LastSync
                | EntityKind::ReadingsToday
                | EntityKind::Connected
        )
    }

    pub fn entity_id(&self, prefix: &str) -> String {
        format!("{}.{}_{}", self.domain(), prefix, self.key())
    }

    fn state(&self, data: &CoordinatorData) -> String {
        match self {
            EntityKind::SyncStatus => data.sync_status.as_str().to_string(),
            EntityKind::LastSync => data
                .last_sync
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            EntityKind::ReadingsToday => data.readings_today.to_string(),
            EntityKind::Recommendation => data
                .recommendation
                .clone()
                .unwrap_or_else(|| NO_DATA.to_string()),
            EntityKind::SavingsToday => format!("{:.2}", data.savings_today_pence / 100.0),
            EntityKind::TariffRate => data
                .tariff_rate
                .map(|rate| rate.to_string())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            EntityKind::Connected => (if data.connected { "on" } else { "off" }).to_string(),
        }
    }

    fn decorate(&self, update: StateUpdate, data: &CoordinatorData) -> StateUpdate {
        match self {
            EntityKind::SyncStatus => update.attribute("icon", data.sync_status.icon()),
            EntityKind::LastSync => update.attribute("device_class", "timestamp"),
            EntityKind::ReadingsToday => update
                .attribute("state_class", "total_increasing")
                .attribute("icon", "mdi:counter"),
            EntityKind::Recommendation => update
                .attribute("icon", "mdi:lightbulb-on")
                .attribute("reason", optional(&data.recommendation_reason))
                .attribute("valid_until", optional(&data.recommendation_expires)),
            EntityKind::SavingsToday => update
                .attribute("device_class", "monetary")
                .attribute("state_class", "total")
                .attribute("unit_of_measurement", "GBP")
                .attribute("icon", "mdi:piggy-bank"),
            EntityKind::TariffRate => update
                .attribute("unit_of_measurement", "p/kWh")
                .attribute("icon", "mdi:lightning-bolt"),
            EntityKind::Connected => update.attribute("device_class", "connectivity"),
        }
    }
}

fn optional(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

/// Naming inputs shared by every published entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityContext {
    pub prefix: String,
    pub instance_id: String,
}

impl EntityContext {
    pub fn new(prefix: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn unique_id(&self, kind: EntityKind) -> String {
        format!("{}_{}", self.instance_id, kind.key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEntity {
    pub kind: EntityKind,
    pub entity_id: String,
    pub update: StateUpdate,
}

pub fn render_entity(
    kind: EntityKind,
    data: &CoordinatorData,
    context: &EntityContext,
) -> RenderedEntity {
    let mut update = StateUpdate::new(kind.state(data))
        .attribute("friendly_name", format!("Green Energy {}", kind.name()))
        .attribute("unique_id", context.unique_id(kind))
        .attribute("attribution", ATTRIBUTION);
    if kind.is_diagnostic() {
        update = update.attribute("entity_category", "diagnostic");
    }

    RenderedEntity {
        kind,
        entity_id: kind.entity_id(&context.prefix),
        update: kind.decorate(update, data),
    }
}

pub fn render_entities(data: &CoordinatorData, context: &EntityContext) -> Vec<RenderedEntity> {
    EntityKind::ALL
        .iter()
        .map(|kind| render_entity(*kind, data, context))
        .collect()
}

/// Writes rendered entities to Home Assistant. Without a client (dry run)
/// states are only logged.
#[derive(Debug, Clone)]
pub struct EntityPublisher {
    client: Option<HaClient>,
    context: EntityContext,
}

impl EntityPublisher {
    pub fn new(client: HaClient, context: EntityContext) -> Self {
        Self {
            client: Some(client),
            context,
        }
    }

    pub fn dry_run(context: EntityContext) -> Self {
        Self {
            client: None,
            context,
        }
    }

    pub fn context(&self) -> &EntityContext {
        &self.context
    }

    pub fn entity_ids(&self) -> Vec<String> {
        EntityKind::ALL
            .iter()
            .map(|kind| kind.entity_id(&self.context.prefix))
            .collect()
    }

    /// Publishes every entity; returns how many writes succeeded.
    pub async fn publish_all(&self, data: &CoordinatorData) -> usize {
        let mut published = 0;
        for entity in render_entities(data, &self.context) {
            if self.publish(&entity).await {
                published += 1;
            }
        }
        published
    }

    pub async fn publish_sync_status(&self, data: &CoordinatorData) -> bool {
        let entity = render_entity(EntityKind::SyncStatus, data, &self.context);
        self.publish(&entity).await
    }

    async fn publish(&self, entity: &RenderedEntity) -> bool {
        let Some(client) = &self.client else {
            info!(entity_id = %entity.entity_id, state = %entity.update.state, "dry run: entity not written");
            return true;
        };

        match client.set_state(&entity.entity_id, &entity.update).await {
            Ok(_) => {
                debug!(entity_id = %entity.entity_id, state = %entity.update.state, "entity published");
                true
            }
            Err(err) => {
                warn!(entity_id = %entity.entity_id, error = %err, "entity publish failed");
                false
            }
        }
    }

    /// Removes every published entity; returns how many existed.
    pub async fn remove_all(&self) -> Result<usize, ClientError> {
        let Some(client) = &self.client else {
            return Ok(0);
        };

        let mut removed = 0;
        for entity_id in self.entity_ids() {
            if client.remove_state(&entity_id).await? {
                removed += 1;
            }
        }
        info!(removed, "published entities removed");
        Ok(removed)
    }
}
