//! Retention of monitoring history.
//!
//! - Monitoring logs: deleted after 30 days
//! - Resolved incidents: deleted 90 days after resolution
//!
//! Open incidents are never purged.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::database::Database;

/// Retention policy for stored history
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Days to keep monitoring logs
    pub log_days: i64,
    /// Days to keep incidents after they were resolved
    pub incident_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { log_days: 30, incident_days: 90 }
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self { log_days: config.log_days, incident_days: config.incident_days }
    }
}

impl RetentionPolicy {
    fn log_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(self.log_days)
    }

    fn incident_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(self.incident_days)
    }
}

/// Rows removed by one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub logs_deleted: u64,
    pub incidents_deleted: u64,
}

/// Cleanup manager for expired history
pub struct RetentionCleanup {
    database: Arc<dyn Database>,
    policy: RetentionPolicy,
}

impl RetentionCleanup {
    pub fn new(database: Arc<dyn Database>, policy: RetentionPolicy) -> Self {
        Self { database, policy }
    }

    /// Purge expired logs and resolved incidents.
    ///
    /// Each purge fails on its own; a failure is logged and counted as zero.
    pub async fn run(&self) -> CleanupReport {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        match self.database.purge_monitoring_logs(self.policy.log_cutoff(now)).await {
            Ok(count) => report.logs_deleted = count,
            Err(e) => warn!(error = %e, "Failed to purge monitoring logs"),
        }

        match self.database.purge_resolved_incidents(self.policy.incident_cutoff(now)).await {
            Ok(count) => report.incidents_deleted = count,
            Err(e) => warn!(error = %e, "Failed to purge resolved incidents"),
        }

        info!(
            logs_deleted = report.logs_deleted,
            incidents_deleted = report.incidents_deleted,
            "Retention cleanup completed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_retention_policy_defaults() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.log_days, 30);
        assert_eq!(policy.incident_days, 90);
    }

    #[test]
    fn test_cutoffs() {
        let policy = RetentionPolicy { log_days: 7, incident_days: 14 };
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        assert_eq!(policy.log_cutoff(now), Utc.with_ymd_and_hms(2024, 6, 23, 12, 0, 0).unwrap());
        assert_eq!(policy.incident_cutoff(now), Utc.with_ymd_and_hms(2024, 6, 16, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetentionConfig { log_days: 10, incident_days: 20 };
        let policy = RetentionPolicy::from(&config);
        assert_eq!((policy.log_days, policy.incident_days), (10, 20));
    }
}
