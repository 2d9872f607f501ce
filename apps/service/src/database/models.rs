use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::monitoring::types::{ComprehensiveResult, ProbeResult, Status};

/// Convert a timestamp to unix seconds for storage
pub fn to_unix(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

/// Convert stored unix seconds back to a timestamp
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Device class of a monitored entity, each class has its own polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityClass {
    /// Branch router ("network site")
    Branch,
    /// ATM ("terminal device")
    Atm,
}

impl EntityClass {
    pub const ALL: [EntityClass; 2] = [EntityClass::Branch, EntityClass::Atm];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Branch => "BRANCH",
            EntityClass::Atm => "ATM",
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BRANCH" => Ok(EntityClass::Branch),
            "ATM" => Ok(EntityClass::Atm),
            other => Err(format!("unknown entity class: {other}")),
        }
    }
}

/// Identity of a monitored entity across the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub class: EntityClass,
    pub id: String,
}

impl EntityKey {
    pub fn new(class: EntityClass, id: impl Into<String>) -> Self {
        Self { class, id: id.into() }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.class, self.id)
    }
}

/// Monitored entity - a branch router or ATM with its addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredEntity {
    pub id: String,
    pub class: EntityClass,
    pub name: String,
    pub code: Option<String>,
    /// City for branches, physical location for ATMs
    pub location: Option<String>,
    pub ip_address: Option<String>,
    pub backup_ip_address: Option<String>,
    pub is_active: bool,
    pub monitoring_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoredEntity {
    /// Create a new, enabled entity with a primary address
    pub fn new(class: EntityClass, id: impl Into<String>, name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            class,
            name: name.into(),
            code: None,
            location: None,
            ip_address: Some(ip_address.into()),
            backup_ip_address: None,
            is_active: true,
            monitoring_enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_backup(mut self, backup: impl Into<String>) -> Self {
        self.backup_ip_address = Some(backup.into());
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.class, self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentType {
    CommunicationOffline,
    SlowConnection,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::CommunicationOffline => "COMMUNICATION_OFFLINE",
            IncidentType::SlowConnection => "SLOW_CONNECTION",
        }
    }

    /// Human title fragment, e.g. "COMMUNICATION OFFLINE"
    pub fn title(&self) -> String {
        self.as_str().replace('_', " ")
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMMUNICATION_OFFLINE" => Ok(IncidentType::CommunicationOffline),
            "SLOW_CONNECTION" => Ok(IncidentType::SlowConnection),
            other => Err(format!("unknown incident type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(IncidentStatus::Open),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            other => Err(format!("unknown incident status: {other}")),
        }
    }
}

/// Probe metrics captured at detection or resolution time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub host: String,
    pub response_time_ms: Option<u64>,
    pub packet_loss: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&ProbeResult> for MetricsSnapshot {
    fn from(probe: &ProbeResult) -> Self {
        Self {
            host: probe.host.clone(),
            response_time_ms: probe.response_time_ms,
            packet_loss: probe.packet_loss,
            timestamp: probe.timestamp,
        }
    }
}

impl From<&ComprehensiveResult> for MetricsSnapshot {
    fn from(result: &ComprehensiveResult) -> Self {
        Self { host: result.host.clone(), ..MetricsSnapshot::from(&result.ping) }
    }
}

/// Metrics column of an incident, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentMetrics {
    pub detected: MetricsSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<MetricsSnapshot>,
}

/// NetworkIncident model - a confirmed problem on one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkIncident {
    pub id: Uuid,
    pub entity_class: EntityClass,
    pub entity_id: String,
    pub incident_type: IncidentType,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub ticket_id: Option<String>,
    pub metrics: IncidentMetrics,
}

impl NetworkIncident {
    /// Create a new OPEN incident
    pub fn open(
        key: &EntityKey,
        incident_type: IncidentType,
        severity: Severity,
        description: String,
        detected: MetricsSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_class: key.class,
            entity_id: key.id.clone(),
            incident_type,
            severity,
            status: IncidentStatus::Open,
            description,
            detected_at: Utc::now(),
            resolved_at: None,
            ticket_id: None,
            metrics: IncidentMetrics { detected, resolved: None },
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_class, self.entity_id.clone())
    }

    pub fn is_open(&self) -> bool {
        self.status == IncidentStatus::Open
    }
}

/// MonitoringLog model - one raw probe outcome, append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringLog {
    pub id: Option<i64>,
    pub entity_class: EntityClass,
    pub entity_id: String,
    pub address: String,
    pub status: Status,
    pub response_time_ms: Option<u64>,
    pub packet_loss: f64,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl MonitoringLog {
    /// Create a log row from a probe result
    pub fn from_result(result: &ComprehensiveResult, key: &EntityKey) -> Self {
        Self {
            id: None,
            entity_class: key.class,
            entity_id: key.id.clone(),
            address: result.host.clone(),
            status: result.ping.status,
            response_time_ms: result.ping.response_time_ms,
            packet_loss: result.ping.packet_loss,
            error_message: result.ping.error_message.clone(),
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::new(EntityClass::Atm, "01").to_string(), "ATM-01");
        assert_eq!(EntityKey::new(EntityClass::Branch, "BR-02").to_string(), "BRANCH-BR-02");
    }

    #[test]
    fn test_incident_metrics_json_omits_missing_resolution() {
        let metrics = IncidentMetrics {
            detected: MetricsSnapshot {
                host: "10.0.0.1".into(),
                response_time_ms: None,
                packet_loss: 100.0,
                timestamp: from_unix(1_700_000_000),
            },
            resolved: None,
        };

        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("resolved").is_none());
        assert_eq!(json["detected"]["packet_loss"], 100.0);
    }

    #[test]
    fn test_unix_conversion() {
        let now = from_unix(to_unix(Utc::now()));
        assert_eq!(from_unix(to_unix(now)), now);
    }

    #[test]
    fn test_incident_type_title() {
        assert_eq!(IncidentType::CommunicationOffline.title(), "COMMUNICATION OFFLINE");
    }
}
