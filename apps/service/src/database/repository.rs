use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use super::models::{
    EntityClass, IncidentMetrics, IncidentStatus, MonitoredEntity, MonitoringLog, NetworkIncident, from_unix,
    to_unix,
};
use crate::pool::{LibsqlManager, LibsqlPool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Query(#[from] libsql::Error),
    #[error("Connection pool error: {0}")]
    Pool(String),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Failed to decode row: {0}")]
    Decode(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Entity, monitoring log and incident store
#[async_trait]
pub trait Database: Send + Sync {
    /// Cheap liveness query (`SELECT 1`)
    async fn ping(&self) -> StoreResult<()>;

    /// Drop pooled connections so the next checkout opens fresh ones, then ping
    async fn reconnect(&self) -> StoreResult<()>;

    /// Active, monitoring-enabled entities of one class that have a primary address
    async fn list_monitored_entities(&self, class: EntityClass) -> StoreResult<Vec<MonitoredEntity>>;

    async fn get_entity(&self, class: EntityClass, id: &str) -> StoreResult<Option<MonitoredEntity>>;

    /// Insert or replace an entity
    async fn save_entity(&self, entity: &MonitoredEntity) -> StoreResult<()>;

    async fn append_monitoring_log(&self, log: &MonitoringLog) -> StoreResult<i64>;

    /// Newest first
    async fn recent_monitoring_logs(&self, class: EntityClass, id: &str, limit: usize) -> StoreResult<Vec<MonitoringLog>>;

    async fn insert_incident(&self, incident: &NetworkIncident) -> StoreResult<()>;

    async fn get_incident(&self, id: Uuid) -> StoreResult<Option<NetworkIncident>>;

    /// Persist status, resolution, ticket link and metrics of an existing incident
    async fn update_incident(&self, incident: &NetworkIncident) -> StoreResult<()>;

    /// Set only the ticket link, leaving status and resolution untouched
    async fn link_incident_ticket(&self, id: Uuid, ticket_id: &str) -> StoreResult<()>;

    async fn open_incidents(&self) -> StoreResult<Vec<NetworkIncident>>;

    async fn find_incidents(
        &self,
        class: EntityClass,
        id: &str,
        status: Option<IncidentStatus>,
    ) -> StoreResult<Vec<NetworkIncident>>;

    /// Most recent incident of the entity that carries a ticket and was detected
    /// or resolved at or after `since`
    async fn latest_ticketed_incident(
        &self,
        class: EntityClass,
        id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<NetworkIncident>>;

    /// Returns the number of deleted rows
    async fn purge_monitoring_logs(&self, before: DateTime<Utc>) -> StoreResult<u64>;

    /// Deletes RESOLVED incidents resolved before `before`, returns the count
    async fn purge_resolved_incidents(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

const ENTITY_COLUMNS: &str = "entity_class, entity_id, name, code, location, ip_address, backup_ip_address, is_active, monitoring_enabled, created_at, updated_at";

const INCIDENT_COLUMNS: &str =
    "id, entity_class, entity_id, incident_type, severity, status, description, detected_at, resolved_at, ticket_id, metrics";

const LOG_COLUMNS: &str =
    "id, entity_class, entity_id, address, status, response_time_ms, packet_loss, error_message, checked_at";

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
    query_timeout: Duration,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool, query_timeout: Duration) -> Self {
        Self { pool, query_timeout }
    }

    /// Pool handle, used by the local ticket desk which shares the database file
    pub fn pool(&self) -> &LibsqlPool {
        &self.pool
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> StoreResult<deadpool::managed::Object<LibsqlManager>> {
        self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
    }

    async fn bounded<T>(&self, operation: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        timeout(self.query_timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.query_timeout))?
    }

    async fn query_incidents(&self, sql: String, values: Vec<libsql::Value>) -> StoreResult<Vec<NetworkIncident>> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let mut rows = conn.query(&sql, values).await?;
            let mut incidents = Vec::new();
            while let Some(row) = rows.next().await? {
                incidents.push(incident_from_row(&row)?);
            }
            Ok(incidents)
        })
        .await
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: String) -> StoreResult<T> {
    value.parse().map_err(StoreError::Decode)
}

fn entity_from_row(row: &Row) -> StoreResult<MonitoredEntity> {
    Ok(MonitoredEntity {
        class: parse_column(row.get(0)?)?,
        id: row.get(1)?,
        name: row.get(2)?,
        code: row.get(3)?,
        location: row.get(4)?,
        ip_address: row.get(5)?,
        backup_ip_address: row.get(6)?,
        is_active: row.get::<i64>(7)? != 0,
        monitoring_enabled: row.get::<i64>(8)? != 0,
        created_at: from_unix(row.get(9)?),
        updated_at: from_unix(row.get(10)?),
    })
}

fn incident_from_row(row: &Row) -> StoreResult<NetworkIncident> {
    let id: String = row.get(0)?;
    let metrics: String = row.get(10)?;

    Ok(NetworkIncident {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Decode(format!("incident id {id}: {e}")))?,
        entity_class: parse_column(row.get(1)?)?,
        entity_id: row.get(2)?,
        incident_type: parse_column(row.get(3)?)?,
        severity: parse_column(row.get(4)?)?,
        status: parse_column(row.get(5)?)?,
        description: row.get(6)?,
        detected_at: from_unix(row.get(7)?),
        resolved_at: row.get::<Option<i64>>(8)?.map(from_unix),
        ticket_id: row.get(9)?,
        metrics: serde_json::from_str::<IncidentMetrics>(&metrics)
            .map_err(|e| StoreError::Decode(format!("incident {id} metrics: {e}")))?,
    })
}

fn log_from_row(row: &Row) -> StoreResult<MonitoringLog> {
    Ok(MonitoringLog {
        id: Some(row.get(0)?),
        entity_class: parse_column(row.get(1)?)?,
        entity_id: row.get(2)?,
        address: row.get(3)?,
        status: parse_column(row.get(4)?)?,
        response_time_ms: row.get::<Option<i64>>(5)?.map(|v| v.max(0) as u64),
        packet_loss: row.get(6)?,
        error_message: row.get(7)?,
        checked_at: from_unix(row.get(8)?),
    })
}

fn metrics_json(incident: &NetworkIncident) -> StoreResult<String> {
    serde_json::to_string(&incident.metrics).map_err(|e| StoreError::Decode(e.to_string()))
}

#[async_trait]
impl Database for DatabaseImpl {
    async fn ping(&self) -> StoreResult<()> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let mut rows = conn.query("SELECT 1", ()).await?;
            match rows.next().await? {
                Some(_) => Ok(()),
                None => Err(StoreError::NotFound("SELECT 1 returned no rows".into())),
            }
        })
        .await
    }

    async fn reconnect(&self) -> StoreResult<()> {
        let dropped = self.pool.retain(|_, _| false).removed.len();
        tracing::info!(dropped, "Dropped pooled database connections");
        self.ping().await
    }

    async fn list_monitored_entities(&self, class: EntityClass) -> StoreResult<Vec<MonitoredEntity>> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let sql = format!(
                "SELECT {ENTITY_COLUMNS} FROM monitored_entities
                 WHERE entity_class = ? AND is_active = 1 AND monitoring_enabled = 1
                   AND ip_address IS NOT NULL AND ip_address != ''
                 ORDER BY entity_id"
            );
            let mut rows = conn.query(&sql, params![class.as_str()]).await?;

            let mut entities = Vec::new();
            while let Some(row) = rows.next().await? {
                entities.push(entity_from_row(&row)?);
            }
            Ok(entities)
        })
        .await
    }

    async fn get_entity(&self, class: EntityClass, id: &str) -> StoreResult<Option<MonitoredEntity>> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let sql = format!("SELECT {ENTITY_COLUMNS} FROM monitored_entities WHERE entity_class = ? AND entity_id = ?");
            let mut rows = conn.query(&sql, params![class.as_str(), id]).await?;

            match rows.next().await? {
                Some(row) => Ok(Some(entity_from_row(&row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_entity(&self, entity: &MonitoredEntity) -> StoreResult<()> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let sql = format!(
                "INSERT OR REPLACE INTO monitored_entities ({ENTITY_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            conn.execute(
                &sql,
                params![
                    entity.class.as_str(),
                    entity.id.clone(),
                    entity.name.clone(),
                    entity.code.clone(),
                    entity.location.clone(),
                    entity.ip_address.clone(),
                    entity.backup_ip_address.clone(),
                    entity.is_active as i64,
                    entity.monitoring_enabled as i64,
                    to_unix(entity.created_at),
                    to_unix(entity.updated_at),
                ],
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn append_monitoring_log(&self, log: &MonitoringLog) -> StoreResult<i64> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            conn.execute(
                "INSERT INTO monitoring_logs (entity_class, entity_id, address, status, response_time_ms, packet_loss, error_message, checked_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    log.entity_class.as_str(),
                    log.entity_id.clone(),
                    log.address.clone(),
                    log.status.as_str(),
                    log.response_time_ms.map(|v| v as i64),
                    log.packet_loss,
                    log.error_message.clone(),
                    to_unix(log.checked_at),
                ],
            )
            .await?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn recent_monitoring_logs(&self, class: EntityClass, id: &str, limit: usize) -> StoreResult<Vec<MonitoringLog>> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let sql = format!(
                "SELECT {LOG_COLUMNS} FROM monitoring_logs
                 WHERE entity_class = ? AND entity_id = ?
                 ORDER BY checked_at DESC, id DESC LIMIT ?"
            );
            let mut rows = conn.query(&sql, params![class.as_str(), id, limit as i64]).await?;

            let mut logs = Vec::new();
            while let Some(row) = rows.next().await? {
                logs.push(log_from_row(&row)?);
            }
            Ok(logs)
        })
        .await
    }

    async fn insert_incident(&self, incident: &NetworkIncident) -> StoreResult<()> {
        let metrics = metrics_json(incident)?;
        self.bounded(async {
            let conn = self.get_conn().await?;
            let sql = format!("INSERT INTO network_incidents ({INCIDENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
            conn.execute(
                &sql,
                params![
                    incident.id.to_string(),
                    incident.entity_class.as_str(),
                    incident.entity_id.clone(),
                    incident.incident_type.as_str(),
                    incident.severity.as_str(),
                    incident.status.as_str(),
                    incident.description.clone(),
                    to_unix(incident.detected_at),
                    incident.resolved_at.map(to_unix),
                    incident.ticket_id.clone(),
                    metrics,
                ],
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_incident(&self, id: Uuid) -> StoreResult<Option<NetworkIncident>> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM network_incidents WHERE id = ?");
        let mut found = self.query_incidents(sql, vec![id.to_string().into()]).await?;
        Ok(found.pop())
    }

    async fn update_incident(&self, incident: &NetworkIncident) -> StoreResult<()> {
        let metrics = metrics_json(incident)?;
        self.bounded(async {
            let conn = self.get_conn().await?;
            let updated = conn
                .execute(
                    "UPDATE network_incidents
                     SET status = ?, severity = ?, description = ?, resolved_at = ?, ticket_id = ?, metrics = ?
                     WHERE id = ?",
                    params![
                        incident.status.as_str(),
                        incident.severity.as_str(),
                        incident.description.clone(),
                        incident.resolved_at.map(to_unix),
                        incident.ticket_id.clone(),
                        metrics,
                        incident.id.to_string(),
                    ],
                )
                .await?;

            if updated == 0 {
                return Err(StoreError::NotFound(format!("incident {}", incident.id)));
            }
            Ok(())
        })
        .await
    }

    async fn link_incident_ticket(&self, id: Uuid, ticket_id: &str) -> StoreResult<()> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let updated = conn
                .execute(
                    "UPDATE network_incidents SET ticket_id = ? WHERE id = ?",
                    params![ticket_id.to_string(), id.to_string()],
                )
                .await?;

            if updated == 0 {
                return Err(StoreError::NotFound(format!("incident {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn open_incidents(&self) -> StoreResult<Vec<NetworkIncident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM network_incidents WHERE status = 'OPEN' ORDER BY detected_at ASC"
        );
        self.query_incidents(sql, Vec::new()).await
    }

    async fn find_incidents(
        &self,
        class: EntityClass,
        id: &str,
        status: Option<IncidentStatus>,
    ) -> StoreResult<Vec<NetworkIncident>> {
        let mut sql = format!("SELECT {INCIDENT_COLUMNS} FROM network_incidents WHERE entity_class = ? AND entity_id = ?");
        let mut values: Vec<libsql::Value> = vec![class.as_str().into(), id.into()];
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            values.push(status.as_str().into());
        }
        sql.push_str(" ORDER BY detected_at DESC");
        self.query_incidents(sql, values).await
    }

    async fn latest_ticketed_incident(
        &self,
        class: EntityClass,
        id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<NetworkIncident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM network_incidents
             WHERE entity_class = ? AND entity_id = ? AND ticket_id IS NOT NULL
               AND (detected_at >= ? OR resolved_at >= ?)
             ORDER BY detected_at DESC LIMIT 1"
        );
        let since = to_unix(since);
        let mut found = self
            .query_incidents(sql, vec![class.as_str().into(), id.into(), since.into(), since.into()])
            .await?;
        Ok(found.pop())
    }

    async fn purge_monitoring_logs(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let deleted = conn
                .execute("DELETE FROM monitoring_logs WHERE checked_at < ?", params![to_unix(before)])
                .await?;
            Ok(deleted)
        })
        .await
    }

    async fn purge_resolved_incidents(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(async {
            let conn = self.get_conn().await?;
            let deleted = conn
                .execute(
                    "DELETE FROM network_incidents WHERE status = 'RESOLVED' AND resolved_at < ?",
                    params![to_unix(before)],
                )
                .await?;
            Ok(deleted)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{EntityKey, IncidentType, MetricsSnapshot, Severity};
    use crate::database::test_support::create_test_database;
    use crate::monitoring::types::Status;
    use chrono::Duration as ChronoDuration;

    fn incident_for(key: &EntityKey) -> NetworkIncident {
        NetworkIncident::open(
            key,
            IncidentType::CommunicationOffline,
            Severity::High,
            "unreachable".into(),
            MetricsSnapshot { host: "10.0.0.1".into(), response_time_ms: None, packet_loss: 100.0, timestamp: Utc::now() },
        )
    }

    #[tokio::test]
    async fn test_roster_filters_inactive_and_addressless() {
        let (_dir, db) = create_test_database().await.unwrap();

        db.save_entity(&MonitoredEntity::new(EntityClass::Atm, "01", "Lobby ATM", "10.0.0.1")).await.unwrap();

        let mut disabled = MonitoredEntity::new(EntityClass::Atm, "02", "Mall ATM", "10.0.0.2");
        disabled.monitoring_enabled = false;
        db.save_entity(&disabled).await.unwrap();

        let mut no_address = MonitoredEntity::new(EntityClass::Atm, "03", "Airport ATM", "10.0.0.3");
        no_address.ip_address = None;
        db.save_entity(&no_address).await.unwrap();

        db.save_entity(&MonitoredEntity::new(EntityClass::Branch, "BR-01", "Main", "10.1.0.1")).await.unwrap();

        let atms = db.list_monitored_entities(EntityClass::Atm).await.unwrap();
        assert_eq!(atms.len(), 1);
        assert_eq!(atms[0].id, "01");

        let fetched = db.get_entity(EntityClass::Atm, "03").await.unwrap().unwrap();
        assert_eq!(fetched.ip_address, None);
        assert!(db.get_entity(EntityClass::Branch, "01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incident_update_and_queries() {
        let (_dir, db) = create_test_database().await.unwrap();
        let key = EntityKey::new(EntityClass::Branch, "BR-02");

        let mut incident = incident_for(&key);
        db.insert_incident(&incident).await.unwrap();
        assert_eq!(db.open_incidents().await.unwrap().len(), 1);
        assert!(db.latest_ticketed_incident(key.class, &key.id, Utc::now() - ChronoDuration::hours(1)).await.unwrap().is_none());

        incident.ticket_id = Some("t-1".into());
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(Utc::now());
        db.update_incident(&incident).await.unwrap();

        let stored = db.get_incident(incident.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Resolved);
        assert_eq!(stored.ticket_id.as_deref(), Some("t-1"));
        assert!(db.open_incidents().await.unwrap().is_empty());

        let resolved = db.find_incidents(key.class, &key.id, Some(IncidentStatus::Resolved)).await.unwrap();
        assert_eq!(resolved.len(), 1);

        let recent = db.latest_ticketed_incident(key.class, &key.id, Utc::now() - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(recent.map(|i| i.id), Some(incident.id));
    }

    #[tokio::test]
    async fn test_update_missing_incident_is_not_found() {
        let (_dir, db) = create_test_database().await.unwrap();
        let incident = incident_for(&EntityKey::new(EntityClass::Atm, "09"));
        assert!(matches!(db.update_incident(&incident).await, Err(StoreError::NotFound(_))));
        assert!(matches!(db.link_incident_ticket(incident.id, "t-9").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_link_ticket_keeps_resolution() {
        let (_dir, db) = create_test_database().await.unwrap();
        let mut incident = incident_for(&EntityKey::new(EntityClass::Atm, "01"));
        db.insert_incident(&incident).await.unwrap();

        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(Utc::now());
        db.update_incident(&incident).await.unwrap();

        db.link_incident_ticket(incident.id, "t-2").await.unwrap();

        let stored = db.get_incident(incident.id).await.unwrap().unwrap();
        assert_eq!(stored.ticket_id.as_deref(), Some("t-2"));
        assert_eq!(stored.status, IncidentStatus::Resolved);
        assert!(stored.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_purge_only_expired_rows() {
        let (_dir, db) = create_test_database().await.unwrap();
        let key = EntityKey::new(EntityClass::Atm, "01");
        let now = Utc::now();

        for age_days in [40, 1] {
            let log = MonitoringLog {
                id: None,
                entity_class: key.class,
                entity_id: key.id.clone(),
                address: "10.0.0.1".into(),
                status: Status::Online,
                response_time_ms: Some(12),
                packet_loss: 0.0,
                error_message: None,
                checked_at: now - ChronoDuration::days(age_days),
            };
            db.append_monitoring_log(&log).await.unwrap();
        }

        let mut old = incident_for(&key);
        old.status = IncidentStatus::Resolved;
        old.resolved_at = Some(now - ChronoDuration::days(100));
        db.insert_incident(&old).await.unwrap();

        let still_open = incident_for(&key);
        db.insert_incident(&still_open).await.unwrap();

        assert_eq!(db.purge_monitoring_logs(now - ChronoDuration::days(30)).await.unwrap(), 1);
        assert_eq!(db.purge_resolved_incidents(now - ChronoDuration::days(90)).await.unwrap(), 1);

        let logs = db.recent_monitoring_logs(key.class, &key.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].response_time_ms, Some(12));
        assert!(db.get_incident(still_open.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ping_and_reconnect() {
        let (_dir, db) = create_test_database().await.unwrap();
        db.ping().await.unwrap();
        db.reconnect().await.unwrap();
        db.ping().await.unwrap();
    }
}
