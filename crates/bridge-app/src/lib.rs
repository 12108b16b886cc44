pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod entities;
pub mod http;
pub mod pairing;
pub mod pipeline;

pub use config::BridgeConfig;
pub use coordinator::{coordinator_alive, sync_delay, CoordinatorData, SyncConfig, SyncCoordinator, SyncError};
pub use entities::{render_entities, EntityContext, EntityKind, EntityPublisher};
pub use pipeline::{Pipeline, PipelineOptions};
