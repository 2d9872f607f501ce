//! Trouble-ticket contract and its two backends.
//!
//! `LocalTicketService` keeps tickets in the monitoring database, `HttpTicketService`
//! talks JSON to an external helpdesk.

pub mod http;
pub mod local;

pub use http::HttpTicketService;
pub use local::LocalTicketService;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{TicketBackend, TicketingConfig};
use crate::database::models::{EntityKey, IncidentType, Severity};
use crate::pool::LibsqlPool;

/// Category tried when the requested one does not exist
pub const FALLBACK_CATEGORY: &str = "Infrastructure";
/// Category created when neither the requested nor the fallback one exists
pub const PROVISIONED_CATEGORY: &str = "Network Infrastructure";
pub const PROVISIONED_CATEGORY_DESCRIPTION: &str = "Network connectivity and infrastructure issues";

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Ticket API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Ticket store error: {0}")]
    Store(String),
    #[error("Invalid ticket service URL: {0}")]
    InvalidUrl(String),
    #[error("Ticket not found: {0}")]
    NotFound(String),
}

impl From<libsql::Error> for TicketError {
    fn from(e: libsql::Error) -> Self {
        TicketError::Store(e.to_string())
    }
}

impl From<url::ParseError> for TicketError {
    fn from(e: url::ParseError) -> Self {
        TicketError::InvalidUrl(e.to_string())
    }
}

pub type TicketResult<T> = std::result::Result<T, TicketError>;

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

wire_enum!(TicketPriority { Low => "LOW", Medium => "MEDIUM", High => "HIGH", Critical => "CRITICAL" });
wire_enum!(TicketStatus { Open => "OPEN", InProgress => "IN_PROGRESS", Resolved => "RESOLVED", Closed => "CLOSED" });
wire_enum!(IssueClassification { NetworkIssue => "NETWORK_ISSUE", PerformanceIssue => "PERFORMANCE_ISSUE" });
wire_enum!(CommentVisibility { Public => "PUBLIC", Internal => "INTERNAL" });

impl From<Severity> for TicketPriority {
    /// Monitoring never raises CRITICAL tickets on its own
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::High => TicketPriority::High,
            Severity::Medium => TicketPriority::Medium,
            Severity::Low => TicketPriority::Low,
        }
    }
}

impl From<IncidentType> for IssueClassification {
    fn from(incident_type: IncidentType) -> Self {
        match incident_type {
            IncidentType::CommunicationOffline => IssueClassification::NetworkIssue,
            IncidentType::SlowConnection => IssueClassification::PerformanceIssue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub id: String,
    /// Human ticket number, e.g. `NET-2024-0007`
    pub number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub category: CategoryRef,
    pub priority: TicketPriority,
    pub linked_entity: Option<EntityKey>,
    pub classification: IssueClassification,
}

/// Ticket operations the incident coordinator relies on
#[async_trait]
pub trait TicketService: Send + Sync {
    /// Exact name, then [`FALLBACK_CATEGORY`], then a newly provisioned
    /// [`PROVISIONED_CATEGORY`]
    async fn find_or_create_service_category(&self, name_hint: &str) -> TicketResult<CategoryRef>;

    async fn create_ticket(&self, ticket: NewTicket) -> TicketResult<TicketRef>;

    async fn update_ticket_status(&self, ticket_id: &str, status: TicketStatus, note: Option<&str>) -> TicketResult<()>;

    async fn append_ticket_comment(&self, ticket_id: &str, text: &str, visibility: CommentVisibility) -> TicketResult<()>;
}

/// Build the configured ticket backend
pub fn from_config(config: &TicketingConfig, pool: LibsqlPool) -> anyhow::Result<Arc<dyn TicketService>> {
    match config.backend {
        TicketBackend::Local => Ok(Arc::new(LocalTicketService::new(pool))),
        TicketBackend::Http => {
            let base_url = config
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("ticketing.base_url is required for the http backend"))?;
            let service = HttpTicketService::new(base_url, config.api_token.clone(), config.request_timeout())?;
            Ok(Arc::new(service))
        }
    }
}
