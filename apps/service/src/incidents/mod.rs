//! Incident lifecycle: grace periods, deduplication, auto-resolution and
//! ticket linking for every monitored entity.

pub mod coordinator;
pub mod timers;

pub use coordinator::{IncidentCoordinator, IncidentSettings};

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::database::StoreError;
use crate::database::models::{EntityKey, IncidentType, MetricsSnapshot, Severity};
use crate::monitoring::types::ComprehensiveResult;

#[derive(Debug, Error)]
pub enum IncidentError {
    /// The entity vanished from the store between probing and incident creation
    #[error("Entity {0} not found")]
    EntityNotFound(EntityKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What `process_monitoring_result` did with one probe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProcessOutcome {
    ProblemPersists { incident: Uuid },
    GracePeriodStarted { grace: Duration },
    GracePeriodActive,
    GracePeriodCancelled,
    RecoveryScheduled { incident: Uuid, resolve_in: Duration },
    RecoveryAlreadyScheduled { incident: Uuid },
    ServiceHealthy,
}

/// Lifecycle position of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    Healthy,
    GracePeriod,
    IncidentOpen,
    RecoveryScheduled,
}

/// Everything needed to open an incident once a grace period expires
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentRequest {
    pub key: EntityKey,
    pub incident_type: IncidentType,
    pub severity: Severity,
    pub description: String,
    pub snapshot: MetricsSnapshot,
}

impl IncidentRequest {
    /// OFFLINE or ERROR probe
    pub fn communication_offline(key: EntityKey, result: &ComprehensiveResult) -> Self {
        let reason = result.ping.error_message.as_deref().unwrap_or("No response from host");
        Self {
            key,
            incident_type: IncidentType::CommunicationOffline,
            severity: Severity::High,
            description: format!("Network communication lost - {reason}"),
            snapshot: MetricsSnapshot::from(result),
        }
    }

    /// SLOW probe
    pub fn slow_connection(key: EntityKey, result: &ComprehensiveResult) -> Self {
        let response = result.ping.response_time_ms.map_or_else(|| "N/A".to_string(), |ms| ms.to_string());
        Self {
            key,
            incident_type: IncidentType::SlowConnection,
            severity: Severity::Medium,
            description: format!(
                "Slow network connection detected - Response time: {response}ms, Packet loss: {}%",
                result.ping.packet_loss
            ),
            snapshot: MetricsSnapshot::from(result),
        }
    }
}
