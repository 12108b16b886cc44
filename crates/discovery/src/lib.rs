use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use ha_client::{ClientError, EntityState, HaClient};
use types::{SensorRole, SensorSelection};

/// A Home Assistant sensor that can back a role.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entity_id: String,
    pub friendly_name: Option<String>,
    pub device_class: Option<String>,
    pub unit: Option<String>,
    pub state: String,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionIssue {
    Missing {
        role: SensorRole,
        entity_id: String,
    },
    WrongDomain {
        role: SensorRole,
        entity_id: String,
    },
    UnexpectedDeviceClass {
        role: SensorRole,
        entity_id: String,
        device_class: Option<String>,
    },
}

impl SelectionIssue {
    /// Issues that make the selection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SelectionIssue::Missing { .. } | SelectionIssue::WrongDomain { .. })
    }
}

impl fmt::Display for SelectionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionIssue::Missing { role, entity_id } => {
                write!(f, "{role} sensor {entity_id} does not exist in home assistant")
            }
            SelectionIssue::WrongDomain { role, entity_id } => {
                write!(f, "{role} entity {entity_id} is not a sensor")
            }
            SelectionIssue::UnexpectedDeviceClass {
                role,
                entity_id,
                device_class,
            } => write!(
                f,
                "{role} sensor {entity_id} has device_class {} (expected one of {})",
                device_class.as_deref().unwrap_or("<none>"),
                allowed_device_classes(*role).join(", ")
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("home assistant request failed: {0}")]
    Client(#[from] ClientError),
}

/// Device classes accepted for each role.
pub fn allowed_device_classes(role: SensorRole) -> &'static [&'static str] {
    match role {
        SensorRole::Solar | SensorRole::Grid => &["power", "energy"],
        SensorRole::Battery => &["battery", "power", "energy"],
    }
}

fn fits(role: Option<SensorRole>, device_class: Option<&str>) -> bool {
    let Some(device_class) = device_class else {
        return false;
    };
    match role {
        Some(role) => allowed_device_classes(role).contains(&device_class),
        None => SensorRole::ALL
            .iter()
            .any(|role| allowed_device_classes(*role).contains(&device_class)),
    }
}

/// Filters raw states down to sensors usable for `role` (any role when `None`).
pub fn candidates_from_states(states: &[EntityState], role: Option<SensorRole>) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = states
        .iter()
        .filter(|state| state.domain() == "sensor")
        .filter(|state| fits(role, state.device_class()))
        .map(|state| Candidate {
            entity_id: state.entity_id.clone(),
            friendly_name: state.friendly_name().map(str::to_string),
            device_class: state.device_class().map(str::to_string),
            unit: state
                .attributes
                .get("unit_of_measurement")
                .and_then(|value| value.as_str())
                .map(str::to_string),
            state: state.state.clone(),
        })
        .collect();
    candidates.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    candidates
}

pub async fn discover_candidates(
    client: &HaClient,
    role: Option<SensorRole>,
) -> Result<Vec<Candidate>, DiscoveryError> {
    let states = client.get_states().await?;
    let candidates = candidates_from_states(&states, role);
    info!(
        total = states.len(),
        matched = candidates.len(),
        role = role.map(|role| role.as_str()).unwrap_or("any"),
        "sensor discovery complete"
    );
    Ok(candidates)
}

/// Checks every selected entity against Home Assistant. Transport and
/// authentication failures are returned as errors; problems with the
/// selection itself are reported as issues.
pub async fn verify_selection(
    client: &HaClient,
    selection: &SensorSelection,
) -> Result<Vec<SelectionIssue>, DiscoveryError> {
    let mut issues = Vec::new();

    for (role, entity_id) in selection.entries() {
        if !entity_id.starts_with("sensor.") {
            issues.push(SelectionIssue::WrongDomain { role, entity_id });
            continue;
        }

        match client.get_state(&entity_id).await {
            Ok(state) => {
                if !fits(Some(role), state.device_class()) {
                    let issue = SelectionIssue::UnexpectedDeviceClass {
                        role,
                        entity_id,
                        device_class: state.device_class().map(str::to_string),
                    };
                    warn!(%issue, "selected sensor looks unusual");
                    issues.push(issue);
                } else {
                    debug!(%role, entity_id = %state.entity_id, "selected sensor verified");
                }
            }
            Err(ClientError::EntityNotFound(_)) => {
                issues.push(SelectionIssue::Missing { role, entity_id });
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(issues)
}
