use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

/// Classified outcome of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Online,
    Slow,
    Offline,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "ONLINE",
            Status::Slow => "SLOW",
            Status::Offline => "OFFLINE",
            Status::Error => "ERROR",
        }
    }

    /// Whether a transition from `self` to `new` should gate downstream action.
    ///
    /// Anything into or out of OFFLINE counts, as does leaving or returning to
    /// ONLINE. Moves between SLOW and ERROR do not.
    pub fn is_significant_change(self, new: Status) -> bool {
        if self == new {
            return false;
        }

        match (self, new) {
            (Status::Offline, _) | (_, Status::Offline) => true,
            (Status::Online, Status::Slow | Status::Error) => true,
            (Status::Slow | Status::Error, Status::Online) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(Status::Online),
            "SLOW" => Ok(Status::Slow),
            "OFFLINE" => Ok(Status::Offline),
            "ERROR" => Ok(Status::Error),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Result of a single reachability/performance probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Address or hostname that was probed
    pub host: String,

    /// At least one echo reply came back
    pub reachable: bool,

    pub status: Status,

    /// Average round trip in milliseconds, `None` when unreachable
    pub response_time_ms: Option<u64>,

    /// Packet loss percentage (0-100)
    pub packet_loss: f64,

    pub error_message: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    /// A reachable host with an already classified status
    pub fn reachable(host: impl Into<String>, status: Status, response_time_ms: Option<u64>, packet_loss: f64) -> Self {
        Self {
            host: host.into(),
            reachable: true,
            status,
            response_time_ms,
            packet_loss,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    /// No replies at all
    pub fn offline(host: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            reachable: false,
            status: Status::Offline,
            response_time_ms: None,
            packet_loss: 100.0,
            error_message: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Transport or OS level failure while probing
    pub fn error(host: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            reachable: false,
            status: Status::Error,
            response_time_ms: None,
            packet_loss: 100.0,
            error_message: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of a name resolution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsResult {
    pub hostname: String,
    pub resolved: bool,
    pub addresses: Vec<IpAddr>,
    pub latency_ms: u64,
    pub error_message: Option<String>,
}

/// Ping plus (for hostnames) DNS outcome of one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveResult {
    pub host: String,
    pub is_ip: bool,
    pub ping: ProbeResult,
    pub dns: Option<DnsResult>,
    pub timestamp: DateTime<Utc>,
}

impl ComprehensiveResult {
    /// Result for a literal address, where no DNS step applies
    pub fn from_ping(ping: ProbeResult) -> Self {
        Self {
            host: ping.host.clone(),
            is_ip: true,
            timestamp: ping.timestamp,
            ping,
            dns: None,
        }
    }

    pub fn status(&self) -> Status {
        self.ping.status
    }
}
