use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::timers::TimerRegistry;
use super::{IncidentError, IncidentRequest, IncidentState, ProcessOutcome};
use crate::config::Config;
use crate::database::Database;
use crate::database::models::{
    EntityClass, EntityKey, IncidentStatus, MetricsSnapshot, MonitoredEntity, MonitoringLog, NetworkIncident,
};
use crate::monitoring::types::{ComprehensiveResult, Status};
use crate::orchestrator::retention::{CleanupReport, RetentionCleanup, RetentionPolicy};
use crate::ticketing::{CommentVisibility, NewTicket, TicketService, TicketStatus};

/// Audit events about incidents and tickets go to this target
const AUDIT: &str = "netwatch::incidents";

/// Category requested for monitoring tickets
const TICKET_CATEGORY: &str = "Network";

/// Timing and behaviour switches for the coordinator
#[derive(Debug, Clone)]
pub struct IncidentSettings {
    pub grace_time: Duration,
    pub auto_resolve_time: Duration,
    pub dedup_window: Duration,
    pub auto_create_tickets: bool,
    pub auto_resolve: bool,
    pub retention: RetentionPolicy,
}

impl Default for IncidentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl IncidentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            grace_time: config.grace_time(),
            auto_resolve_time: config.auto_resolve_time(),
            dedup_window: config.dedup_window(),
            auto_create_tickets: config.incidents.auto_create_tickets,
            auto_resolve: config.incidents.auto_resolve,
            retention: RetentionPolicy::from(&config.retention),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingResolution {
    incident_id: Uuid,
    final_probe: MetricsSnapshot,
}

#[derive(Default)]
struct CoordinatorState {
    /// At most one OPEN incident per key
    active: HashMap<EntityKey, NetworkIncident>,
    grace: TimerRegistry<EntityKey, IncidentRequest>,
    resolve: TimerRegistry<EntityKey, PendingResolution>,
}

struct Inner {
    database: Arc<dyn Database>,
    tickets: Arc<dyn TicketService>,
    settings: IncidentSettings,
    retention: RetentionCleanup,
    state: Mutex<CoordinatorState>,
}

/// Owns incident and timer state for every monitored entity.
///
/// Index and timer mutations, including timer callbacks, run under one async
/// mutex so a recovery can never interleave with a firing timer for the same
/// key. Store and ticket I/O run outside it: an incident reserves its key in
/// the index before it is persisted, and a resolution takes it out first.
#[derive(Clone)]
pub struct IncidentCoordinator {
    inner: Arc<Inner>,
}

impl IncidentCoordinator {
    pub fn new(database: Arc<dyn Database>, tickets: Arc<dyn TicketService>, settings: IncidentSettings) -> Self {
        let retention = RetentionCleanup::new(Arc::clone(&database), settings.retention.clone());
        Self {
            inner: Arc::new(Inner {
                database,
                tickets,
                settings,
                retention,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    /// Record one probe and drive the entity's incident state machine
    pub async fn process_monitoring_result(
        &self,
        result: &ComprehensiveResult,
        class: EntityClass,
        entity_id: &str,
    ) -> ProcessOutcome {
        let key = EntityKey::new(class, entity_id);

        let log = MonitoringLog::from_result(result, &key);
        if let Err(e) = self.inner.database.append_monitoring_log(&log).await {
            warn!(entity = %key, error = %e, "Failed to store monitoring log");
        }

        let outcome = match result.status() {
            Status::Offline | Status::Error => self.handle_problem_detected(&key, result).await,
            Status::Slow => self.handle_performance_issue(&key, result).await,
            Status::Online => self.handle_recovery(&key, result).await,
        };

        debug!(entity = %key, host = %result.host, status = %result.status(), ?outcome, "Processed monitoring result");
        outcome
    }

    /// OFFLINE or ERROR probe
    pub async fn handle_problem_detected(&self, key: &EntityKey, result: &ComprehensiveResult) -> ProcessOutcome {
        self.inner.start_grace(&self.inner, IncidentRequest::communication_offline(key.clone(), result)).await
    }

    /// SLOW probe
    pub async fn handle_performance_issue(&self, key: &EntityKey, result: &ComprehensiveResult) -> ProcessOutcome {
        self.inner.start_grace(&self.inner, IncidentRequest::slow_connection(key.clone(), result)).await
    }

    /// ONLINE probe
    pub async fn handle_recovery(&self, key: &EntityKey, result: &ComprehensiveResult) -> ProcessOutcome {
        self.inner.schedule_recovery(&self.inner, key, MetricsSnapshot::from(result)).await
    }

    /// Open an incident right away, bypassing the grace period.
    ///
    /// Returns `None` when the entity already has an OPEN incident.
    pub async fn create_network_incident(&self, request: IncidentRequest) -> Result<Option<NetworkIncident>, IncidentError> {
        self.inner.open_incident(request).await
    }

    /// Resolve an incident and its ticket. Missing or already resolved
    /// incidents are a no-op returning `None`.
    pub async fn auto_resolve_incident(
        &self,
        incident_id: Uuid,
        final_probe: &MetricsSnapshot,
    ) -> Result<Option<NetworkIncident>, IncidentError> {
        self.inner.resolve_incident(incident_id, final_probe).await
    }

    /// Load OPEN incidents from the store into the active index
    pub async fn restore_open_incidents(&self) -> Result<usize, IncidentError> {
        let open = self.inner.database.open_incidents().await?;
        let mut state = self.inner.state.lock().await;

        let mut restored = 0;
        // oldest first, so a duplicate OPEN row never displaces the original
        for incident in open {
            let key = incident.key();
            if let Some(existing) = state.active.get(&key) {
                warn!(entity = %key, kept = %existing.id, skipped = %incident.id, "Multiple OPEN incidents in store");
                continue;
            }
            state.active.insert(key, incident);
            restored += 1;
        }

        info!(restored, "Restored open incidents");
        Ok(restored)
    }

    /// Purge expired monitoring logs and resolved incidents
    pub async fn cleanup(&self) -> CleanupReport {
        self.inner.retention.run().await
    }

    /// Abort every pending timer, returning how many were pending
    pub async fn shutdown(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let aborted = state.grace.cancel_all() + state.resolve.cancel_all();
        info!(aborted, "Incident timers stopped");
        aborted
    }

    pub async fn state_of(&self, key: &EntityKey) -> IncidentState {
        let state = self.inner.state.lock().await;
        if state.active.contains_key(key) {
            if state.resolve.contains(key) {
                IncidentState::RecoveryScheduled
            } else {
                IncidentState::IncidentOpen
            }
        } else if state.grace.contains(key) {
            IncidentState::GracePeriod
        } else {
            IncidentState::Healthy
        }
    }

    pub async fn active_incident(&self, key: &EntityKey) -> Option<NetworkIncident> {
        self.inner.state.lock().await.active.get(key).cloned()
    }

    pub async fn open_incident_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    /// Pending (grace, resolve) timers
    pub async fn pending_timers(&self) -> (usize, usize) {
        let state = self.inner.state.lock().await;
        (state.grace.len(), state.resolve.len())
    }
}

impl Inner {
    async fn start_grace(&self, this: &Arc<Inner>, request: IncidentRequest) -> ProcessOutcome {
        let mut state = self.state.lock().await;
        let key = request.key.clone();

        if let Some(incident) = state.active.get(&key) {
            if incident.incident_type == request.incident_type {
                debug!(entity = %key, incident = %incident.id, "Problem persists");
                return ProcessOutcome::ProblemPersists { incident: incident.id };
            }
        }

        if state.grace.contains(&key) {
            return ProcessOutcome::GracePeriodActive;
        }

        let grace = self.settings.grace_time;
        let incident_type = request.incident_type;
        let inner = Arc::clone(this);
        let timer_key = key.clone();

        state.grace.arm(key.clone(), grace, request, move |timer_id| {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                inner.grace_expired(&timer_key, timer_id).await;
            })
        });

        info!(entity = %key, %incident_type, grace_secs = grace.as_secs(), "Grace period started");
        ProcessOutcome::GracePeriodStarted { grace }
    }

    async fn schedule_recovery(&self, this: &Arc<Inner>, key: &EntityKey, final_probe: MetricsSnapshot) -> ProcessOutcome {
        let mut state = self.state.lock().await;

        if state.grace.cancel(key).is_some() {
            info!(entity = %key, "Grace period cancelled - service recovered");
            return ProcessOutcome::GracePeriodCancelled;
        }

        let Some(incident_id) = state.active.get(key).map(|incident| incident.id) else {
            return ProcessOutcome::ServiceHealthy;
        };

        if state.resolve.contains(key) {
            return ProcessOutcome::RecoveryAlreadyScheduled { incident: incident_id };
        }

        if !self.settings.auto_resolve {
            info!(entity = %key, incident = %incident_id, "Service recovered, auto-resolve disabled");
            return ProcessOutcome::ServiceHealthy;
        }

        let resolve_in = self.settings.auto_resolve_time;
        let inner = Arc::clone(this);
        let timer_key = key.clone();
        let pending = PendingResolution { incident_id, final_probe };

        state.resolve.arm(key.clone(), resolve_in, pending, move |timer_id| {
            tokio::spawn(async move {
                tokio::time::sleep(resolve_in).await;
                inner.resolve_due(&timer_key, timer_id).await;
            })
        });

        info!(entity = %key, incident = %incident_id, resolve_in_secs = resolve_in.as_secs(), "Recovery detected, auto-resolve scheduled");
        ProcessOutcome::RecoveryScheduled { incident: incident_id, resolve_in }
    }

    async fn grace_expired(&self, key: &EntityKey, timer_id: u64) {
        let request = {
            let mut state = self.state.lock().await;
            match state.grace.claim(key, timer_id) {
                Some(request) => request,
                None => return,
            }
        };

        match self.open_incident(request).await {
            Ok(_) => {}
            Err(IncidentError::EntityNotFound(key)) => {
                error!(entity = %key, "Cannot open incident: entity not found");
            }
            Err(e) => error!(entity = %key, error = %e, "Failed to open incident"),
        }
    }

    async fn resolve_due(&self, key: &EntityKey, timer_id: u64) {
        let pending = {
            let mut state = self.state.lock().await;
            match state.resolve.claim(key, timer_id) {
                Some(pending) => pending,
                None => return,
            }
        };

        if let Err(e) = self.resolve_incident(pending.incident_id, &pending.final_probe).await {
            error!(entity = %key, incident = %pending.incident_id, error = %e, "Failed to auto-resolve incident");
        }
    }

    /// Reserve the key in the index, then persist and ticket without holding the lock
    async fn open_incident(&self, request: IncidentRequest) -> Result<Option<NetworkIncident>, IncidentError> {
        let key = request.key.clone();

        let entity = self
            .database
            .get_entity(key.class, &key.id)
            .await?
            .ok_or_else(|| IncidentError::EntityNotFound(key.clone()))?;

        let mut incident = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.active.get(&key) {
                warn!(
                    entity = %key,
                    open = %existing.id,
                    requested = %request.incident_type,
                    "Incident already open for entity, not opening another"
                );
                return Ok(None);
            }

            let incident =
                NetworkIncident::open(&key, request.incident_type, request.severity, request.description, request.snapshot);
            state.active.insert(key.clone(), incident.clone());
            incident
        };

        if let Err(e) = self.database.insert_incident(&incident).await {
            forget(&mut *self.state.lock().await, &key, incident.id);
            return Err(e.into());
        }

        info!(
            target: AUDIT,
            entity = %key,
            incident = %incident.id,
            incident_type = %incident.incident_type,
            severity = %incident.severity,
            "Network incident opened"
        );

        if self.settings.auto_create_tickets {
            match self.link_ticket(&entity, &incident).await {
                Ok(ticket_id) => {
                    self.attach_ticket(&incident, &ticket_id).await;
                    incident.ticket_id = Some(ticket_id);
                }
                Err(e) => warn!(entity = %key, incident = %incident.id, error = %e, "Failed to create ticket for incident"),
            }
        }

        Ok(Some(incident))
    }

    /// Reuse a ticket from the dedup window or raise a new one
    async fn link_ticket(&self, entity: &MonitoredEntity, incident: &NetworkIncident) -> anyhow::Result<String> {
        let window = ChronoDuration::from_std(self.settings.dedup_window).unwrap_or(ChronoDuration::zero());
        let since = Utc::now() - window;

        let recent = self.database.latest_ticketed_incident(entity.class, &entity.id, since).await?;
        if let Some(ticket_id) = recent.and_then(|previous| previous.ticket_id) {
            let note = format!("Issue recurred within the deduplication window (incident {})", incident.id);
            self.tickets
                .update_ticket_status(&ticket_id, TicketStatus::Open, Some(&note))
                .await
                .context("reopening deduplicated ticket")?;

            let comment = format!(
                "Recurring {} detected at {}: {}",
                incident.incident_type.title(),
                incident.detected_at.to_rfc3339(),
                incident.description
            );
            self.tickets
                .append_ticket_comment(&ticket_id, &comment, CommentVisibility::Internal)
                .await
                .context("commenting on deduplicated ticket")?;

            info!(target: AUDIT, entity = %entity.key(), ticket = %ticket_id, "Reusing ticket for recurring incident");
            return Ok(ticket_id);
        }

        let category = self.tickets.find_or_create_service_category(TICKET_CATEGORY).await?;
        let ticket = self
            .tickets
            .create_ticket(NewTicket {
                title: format!("{} - {}", incident.incident_type.title(), entity.name),
                description: ticket_description(entity, incident),
                category,
                priority: incident.severity.into(),
                linked_entity: Some(entity.key()),
                classification: incident.incident_type.into(),
            })
            .await?;

        info!(target: AUDIT, entity = %entity.key(), ticket = %ticket.number, "Ticket created");
        Ok(ticket.id)
    }

    /// Record the ticket on the index entry and the stored row.
    ///
    /// If the incident was resolved while the ticket was being raised, the
    /// ticket is resolved here since the resolution could not see it.
    async fn attach_ticket(&self, incident: &NetworkIncident, ticket_id: &str) {
        let key = incident.key();
        let still_open = {
            let mut state = self.state.lock().await;
            match state.active.get_mut(&key) {
                Some(active) if active.id == incident.id => {
                    active.ticket_id = Some(ticket_id.to_string());
                    true
                }
                _ => false,
            }
        };

        if let Err(e) = self.database.link_incident_ticket(incident.id, ticket_id).await {
            warn!(incident = %incident.id, error = %e, "Failed to store ticket link");
        }
        info!(target: AUDIT, entity = %key, incident = %incident.id, ticket = %ticket_id, "Ticket linked");

        if !still_open {
            let note = "Network service recovered before the ticket was linked";
            if let Err(e) = self.tickets.update_ticket_status(ticket_id, TicketStatus::Resolved, Some(note)).await {
                warn!(ticket = ticket_id, error = %e, "Failed to resolve ticket");
            }
        }
    }

    /// Take the incident out of the index, then persist and notify without holding the lock
    async fn resolve_incident(
        &self,
        incident_id: Uuid,
        final_probe: &MetricsSnapshot,
    ) -> Result<Option<NetworkIncident>, IncidentError> {
        let claimed = self.claim_active(incident_id).await;

        let stored = match self.database.get_incident(incident_id).await {
            Ok(stored) => stored,
            Err(e) => {
                self.reinstate(claimed).await;
                return Err(e.into());
            }
        };

        let Some(mut incident) = stored else {
            info!(incident = %incident_id, "Incident no longer exists, nothing to resolve");
            return Ok(None);
        };

        let key = incident.key();
        if !incident.is_open() {
            info!(entity = %key, incident = %incident_id, "Incident already resolved");
            return Ok(None);
        }

        // the index may carry a ticket link the stored row has not received yet
        if incident.ticket_id.is_none() {
            incident.ticket_id = claimed.as_ref().and_then(|active| active.ticket_id.clone());
        }
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(Utc::now());
        incident.metrics.resolved = Some(final_probe.clone());

        if let Err(e) = self.database.update_incident(&incident).await {
            self.reinstate(claimed).await;
            return Err(e.into());
        }

        let duration_mins = incident.resolved_at.map_or(0, |resolved| (resolved - incident.detected_at).num_minutes());
        info!(
            target: AUDIT,
            entity = %key,
            incident = %incident.id,
            duration_mins,
            "Network incident auto-resolved"
        );

        if let Some(ticket_id) = incident.ticket_id.as_deref() {
            let note = recovery_note(final_probe);
            if let Err(e) = self.tickets.update_ticket_status(ticket_id, TicketStatus::Resolved, Some(&note)).await {
                warn!(ticket = ticket_id, error = %e, "Failed to resolve ticket");
            }
            if let Err(e) = self
                .tickets
                .append_ticket_comment(ticket_id, &recovery_comment(final_probe), CommentVisibility::Public)
                .await
            {
                warn!(ticket = ticket_id, error = %e, "Failed to add recovery comment");
            }
        }

        Ok(Some(incident))
    }

    /// Remove `incident_id` from the index and drop its resolve timer
    async fn claim_active(&self, incident_id: Uuid) -> Option<NetworkIncident> {
        let mut state = self.state.lock().await;
        let key = state.active.iter().find(|(_, active)| active.id == incident_id).map(|(key, _)| key.clone())?;
        forget(&mut state, &key, incident_id)
    }

    /// Put a claimed incident back unless the key was taken meanwhile
    async fn reinstate(&self, claimed: Option<NetworkIncident>) {
        if let Some(incident) = claimed {
            let mut state = self.state.lock().await;
            state.active.entry(incident.key()).or_insert(incident);
        }
    }
}

/// Drop the index entry and any resolve timer belonging to `incident_id`
fn forget(state: &mut CoordinatorState, key: &EntityKey, incident_id: Uuid) -> Option<NetworkIncident> {
    if state.resolve.get(key).is_some_and(|timer| timer.payload.incident_id == incident_id) {
        state.resolve.cancel(key);
    }
    if state.active.get(key).is_some_and(|active| active.id == incident_id) {
        state.active.remove(key)
    } else {
        None
    }
}

fn response_text(snapshot: &MetricsSnapshot) -> String {
    snapshot.response_time_ms.map_or_else(|| "N/A".to_string(), |ms| ms.to_string())
}

fn ticket_description(entity: &MonitoredEntity, incident: &NetworkIncident) -> String {
    let detected = &incident.metrics.detected;
    format!(
        "Automated network monitoring alert:\n\n{}\n\nEntity: {}\nLocation: {}\nSeverity: {}\n\nMonitoring Details:\n- Host: {}\n- Response Time: {}ms\n- Packet Loss: {}%\n- Detection Time: {}",
        incident.description,
        entity.name,
        entity.location.as_deref().unwrap_or("N/A"),
        incident.severity,
        detected.host,
        response_text(detected),
        detected.packet_loss,
        incident.detected_at.to_rfc3339(),
    )
}

fn recovery_note(probe: &MetricsSnapshot) -> String {
    format!(
        "Network service automatically recovered. Response time: {}ms, Packet loss: {}%",
        response_text(probe),
        probe.packet_loss
    )
}

fn recovery_comment(probe: &MetricsSnapshot) -> String {
    format!(
        "Network service automatically recovered.\n\nRecovery Details:\n- Response Time: {}ms\n- Packet Loss: {}%\n- Recovery Time: {}\n\nThis incident has been automatically resolved by the network monitoring system.",
        response_text(probe),
        probe.packet_loss,
        Utc::now().to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseImpl;
    use crate::database::models::{IncidentType, Severity};
    use crate::database::test_support::create_test_database;
    use crate::monitoring::types::ProbeResult;
    use crate::ticketing::tests::{RecordingTicketService, TicketCall};
    use crate::ticketing::{IssueClassification, TicketPriority};
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Harness {
        _dir: TempDir,
        database: Arc<DatabaseImpl>,
        tickets: Arc<RecordingTicketService>,
        coordinator: IncidentCoordinator,
    }

    fn settings(grace: Duration, auto_resolve: Duration) -> IncidentSettings {
        IncidentSettings { grace_time: grace, auto_resolve_time: auto_resolve, ..IncidentSettings::default() }
    }

    async fn harness_with(settings: IncidentSettings, tickets: RecordingTicketService) -> Harness {
        let (dir, database) = create_test_database().await.unwrap();
        let database = Arc::new(database);

        database
            .save_entity(&MonitoredEntity::new(EntityClass::Atm, "01", "Lobby ATM", "10.0.0.1"))
            .await
            .unwrap();
        let mut branch = MonitoredEntity::new(EntityClass::Branch, "BR-02", "Harbour Branch", "10.1.0.2");
        branch.location = Some("Manado".into());
        database.save_entity(&branch).await.unwrap();

        let tickets = Arc::new(tickets);
        let coordinator = IncidentCoordinator::new(database.clone(), tickets.clone(), settings);
        Harness { _dir: dir, database, tickets, coordinator }
    }

    async fn harness(grace: Duration, auto_resolve: Duration) -> Harness {
        harness_with(settings(grace, auto_resolve), RecordingTicketService::default()).await
    }

    fn offline(host: &str) -> ComprehensiveResult {
        ComprehensiveResult::from_ping(ProbeResult::offline(host, "Request timed out"))
    }

    fn slow(host: &str, ms: u64) -> ComprehensiveResult {
        ComprehensiveResult::from_ping(ProbeResult::reachable(host, Status::Slow, Some(ms), 0.0))
    }

    fn online(host: &str) -> ComprehensiveResult {
        ComprehensiveResult::from_ping(ProbeResult::reachable(host, Status::Online, Some(12), 0.0))
    }

    fn atm() -> EntityKey {
        EntityKey::new(EntityClass::Atm, "01")
    }

    fn branch() -> EntityKey {
        EntityKey::new(EntityClass::Branch, "BR-02")
    }

    #[tokio::test(start_paused = true)]
    async fn test_atm_offline_past_grace_opens_one_incident() {
        let h = harness(2 * MINUTE, 10 * MINUTE).await;

        let first = h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(first, ProcessOutcome::GracePeriodStarted { grace: 2 * MINUTE });

        tokio::time::sleep(MINUTE).await;
        let second = h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(second, ProcessOutcome::GracePeriodActive);
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::GracePeriod);

        tokio::time::sleep(MINUTE + Duration::from_secs(1)).await;
        let incident = h.coordinator.active_incident(&atm()).await.expect("incident after grace");
        assert_eq!(incident.incident_type, IncidentType::CommunicationOffline);
        assert_eq!(incident.severity, Severity::High);
        assert!(incident.description.contains("Request timed out"));

        let third = h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(third, ProcessOutcome::ProblemPersists { incident: incident.id });

        let stored = h.database.find_incidents(EntityClass::Atm, "01", None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ticket_id.as_deref(), Some("ticket-1"));
        assert_eq!(h.database.recent_monitoring_logs(EntityClass::Atm, "01", 10).await.unwrap().len(), 3);

        let created = h.tickets.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].title, "COMMUNICATION OFFLINE - Lobby ATM");
        assert_eq!(created[0].priority, TicketPriority::High);
        assert_eq!(created[0].classification, IssueClassification::NetworkIssue);
        assert_eq!(created[0].linked_entity, Some(atm()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_branch_slow_past_grace_opens_slow_connection() {
        let h = harness(5 * MINUTE, 10 * MINUTE).await;

        let outcome = h.coordinator.process_monitoring_result(&slow("10.1.0.2", 700), EntityClass::Branch, "BR-02").await;
        assert!(matches!(outcome, ProcessOutcome::GracePeriodStarted { .. }));

        tokio::time::sleep(5 * MINUTE + Duration::from_secs(1)).await;

        let incident = h.coordinator.active_incident(&branch()).await.unwrap();
        assert_eq!(incident.incident_type, IncidentType::SlowConnection);
        assert_eq!(incident.severity, Severity::Medium);
        assert!(incident.description.contains("Response time: 700ms"));

        let created = h.tickets.created();
        assert_eq!(created[0].priority, TicketPriority::Medium);
        assert_eq!(created[0].classification, IssueClassification::PerformanceIssue);
        assert!(created[0].description.contains("Location: Manado"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_before_grace_cancels() {
        let h = harness(2 * MINUTE, 10 * MINUTE).await;

        h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;
        tokio::time::sleep(MINUTE).await;
        h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;

        let outcome = h.coordinator.process_monitoring_result(&online("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(outcome, ProcessOutcome::GracePeriodCancelled);

        tokio::time::sleep(5 * MINUTE).await;
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::Healthy);
        assert!(h.database.find_incidents(EntityClass::Atm, "01", None).await.unwrap().is_empty());
        assert!(h.tickets.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_keeps_first_armed_type() {
        let h = harness(2 * MINUTE, 10 * MINUTE).await;

        h.coordinator.process_monitoring_result(&offline("10.1.0.2"), EntityClass::Branch, "BR-02").await;
        let outcome = h.coordinator.process_monitoring_result(&slow("10.1.0.2", 1500), EntityClass::Branch, "BR-02").await;
        assert_eq!(outcome, ProcessOutcome::GracePeriodActive);

        tokio::time::sleep(2 * MINUTE + Duration::from_secs(1)).await;
        let incident = h.coordinator.active_incident(&branch()).await.unwrap();
        assert_eq!(incident.incident_type, IncidentType::CommunicationOffline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resolves_incident_and_ticket() {
        let h = harness(MINUTE, 2 * MINUTE).await;

        h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;
        tokio::time::sleep(MINUTE + Duration::from_secs(1)).await;
        let incident = h.coordinator.active_incident(&atm()).await.unwrap();

        let outcome = h.coordinator.process_monitoring_result(&online("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(outcome, ProcessOutcome::RecoveryScheduled { incident: incident.id, resolve_in: 2 * MINUTE });
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::RecoveryScheduled);

        let again = h.coordinator.process_monitoring_result(&online("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(again, ProcessOutcome::RecoveryAlreadyScheduled { incident: incident.id });

        tokio::time::sleep(2 * MINUTE + Duration::from_secs(1)).await;
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::Healthy);
        assert_eq!(h.coordinator.pending_timers().await, (0, 0));

        let stored = h.database.get_incident(incident.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Resolved);
        assert!(stored.resolved_at.is_some());
        assert_eq!(stored.metrics.resolved.as_ref().and_then(|m| m.response_time_ms), Some(12));

        let calls = h.tickets.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            TicketCall::Status(id, TicketStatus::Resolved, Some(note)) if id == "ticket-1" && note.contains("automatically recovered")
        )));
        assert!(calls.iter().any(|c| matches!(c, TicketCall::Comment(_, _, CommentVisibility::Public))));

        let healthy = h.coordinator.process_monitoring_result(&online("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(healthy, ProcessOutcome::ServiceHealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_resolve_twice_is_noop() {
        let h = harness(MINUTE, MINUTE).await;
        let request = IncidentRequest::communication_offline(atm(), &offline("10.0.0.1"));
        let incident = h.coordinator.create_network_incident(request).await.unwrap().unwrap();
        let probe = MetricsSnapshot::from(&online("10.0.0.1"));

        let first = h.coordinator.auto_resolve_incident(incident.id, &probe).await.unwrap();
        assert!(first.is_some());
        let calls_after_first = h.tickets.calls().len();

        let second = h.coordinator.auto_resolve_incident(incident.id, &probe).await.unwrap();
        assert!(second.is_none());
        assert_eq!(h.tickets.calls().len(), calls_after_first);

        assert!(h.coordinator.auto_resolve_incident(Uuid::new_v4(), &probe).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurrence_within_dedup_window_reuses_ticket() {
        let h = harness(MINUTE, MINUTE).await;
        let probe = MetricsSnapshot::from(&online("10.0.0.1"));

        let first = h
            .coordinator
            .create_network_incident(IncidentRequest::communication_offline(atm(), &offline("10.0.0.1")))
            .await
            .unwrap()
            .unwrap();
        h.coordinator.auto_resolve_incident(first.id, &probe).await.unwrap();

        let second = h
            .coordinator
            .create_network_incident(IncidentRequest::communication_offline(atm(), &offline("10.0.0.1")))
            .await
            .unwrap()
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.ticket_id, first.ticket_id);
        assert_eq!(h.tickets.created().len(), 1);

        let calls = h.tickets.calls();
        assert!(calls.iter().any(|c| matches!(c, TicketCall::Status(_, TicketStatus::Open, Some(_)))));
        assert!(calls.iter().any(|c| matches!(c, TicketCall::Comment(_, _, CommentVisibility::Internal))));
    }

    /// Resolved incident for ATM-01 detected 3h and resolved 2h ago
    async fn seed_old_ticketed_incident(database: &DatabaseImpl) {
        let mut old = NetworkIncident::open(
            &atm(),
            IncidentType::CommunicationOffline,
            Severity::High,
            "ATM ATM-01 is offline".into(),
            MetricsSnapshot::from(&offline("10.0.0.1")),
        );
        old.detected_at = Utc::now() - ChronoDuration::hours(3);
        old.status = IncidentStatus::Resolved;
        old.resolved_at = Some(Utc::now() - ChronoDuration::hours(2));
        old.ticket_id = Some("ticket-old".into());
        database.insert_incident(&old).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurrence_outside_dedup_window_raises_new_ticket() {
        let h = harness(MINUTE, MINUTE).await;
        seed_old_ticketed_incident(&h.database).await;

        let incident = h
            .coordinator
            .create_network_incident(IncidentRequest::communication_offline(atm(), &offline("10.0.0.1")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(incident.ticket_id.as_deref(), Some("ticket-1"));
        assert_eq!(h.tickets.created().len(), 1);
        assert!(!h.tickets.calls().iter().any(|c| matches!(c, TicketCall::Status(id, _, _) if id == "ticket-old")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wider_dedup_window_reaches_older_ticket() {
        let mut wide = settings(MINUTE, MINUTE);
        wide.dedup_window = Duration::from_secs(4 * 3600);
        let h = harness_with(wide, RecordingTicketService::default()).await;
        seed_old_ticketed_incident(&h.database).await;

        let incident = h
            .coordinator
            .create_network_incident(IncidentRequest::communication_offline(atm(), &offline("10.0.0.1")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(incident.ticket_id.as_deref(), Some("ticket-old"));
        assert!(h.tickets.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ticket_service_does_not_stall_other_entities() {
        let tickets = RecordingTicketService::with_create_delay(30 * MINUTE);
        let h = harness_with(settings(MINUTE, 10 * MINUTE), tickets).await;

        h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;
        tokio::time::sleep(MINUTE + Duration::from_secs(1)).await;

        // the ATM's ticket is still being raised
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            h.coordinator.process_monitoring_result(&slow("10.1.0.2", 900), EntityClass::Branch, "BR-02"),
        )
        .await
        .expect("branch result processed while the ATM ticket is pending");
        assert!(matches!(outcome, ProcessOutcome::GracePeriodStarted { .. }));

        let recovered = tokio::time::timeout(
            Duration::from_secs(1),
            h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01"),
        )
        .await
        .expect("ATM result processed while its ticket is pending");
        assert!(matches!(recovered, ProcessOutcome::ProblemPersists { .. }));

        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::IncidentOpen);
        assert_eq!(h.coordinator.active_incident(&atm()).await.unwrap().ticket_id, None);

        tokio::time::sleep(30 * MINUTE).await;
        let incident = h.coordinator.active_incident(&atm()).await.unwrap();
        assert_eq!(incident.ticket_id.as_deref(), Some("ticket-1"));
        let stored = h.database.get_incident(incident.id).await.unwrap().unwrap();
        assert_eq!(stored.ticket_id.as_deref(), Some("ticket-1"));
        assert_eq!(stored.status, IncidentStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_before_ticket_lands_resolves_ticket() {
        let tickets = RecordingTicketService::with_create_delay(30 * MINUTE);
        let h = harness_with(settings(MINUTE, 2 * MINUTE), tickets).await;

        h.coordinator.process_monitoring_result(&offline("10.0.0.1"), EntityClass::Atm, "01").await;
        tokio::time::sleep(MINUTE + Duration::from_secs(1)).await;
        let incident = h.coordinator.active_incident(&atm()).await.unwrap();

        let outcome = h.coordinator.process_monitoring_result(&online("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(outcome, ProcessOutcome::RecoveryScheduled { incident: incident.id, resolve_in: 2 * MINUTE });

        tokio::time::sleep(2 * MINUTE + Duration::from_secs(1)).await;
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::Healthy);
        assert!(h.tickets.calls().iter().all(|c| matches!(c, TicketCall::Category(_))));

        tokio::time::sleep(30 * MINUTE).await;
        assert!(h.tickets.calls().iter().any(|c| matches!(
            c,
            TicketCall::Status(id, TicketStatus::Resolved, Some(_)) if id == "ticket-1"
        )));

        let stored = h.database.get_incident(incident.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Resolved);
        assert_eq!(stored.ticket_id.as_deref(), Some("ticket-1"));
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_entity_aborts_creation() {
        let h = harness(MINUTE, MINUTE).await;
        let ghost = EntityKey::new(EntityClass::Atm, "99");

        let result = h
            .coordinator
            .create_network_incident(IncidentRequest::communication_offline(ghost.clone(), &offline("10.0.0.99")))
            .await;
        assert!(matches!(result, Err(IncidentError::EntityNotFound(key)) if key == ghost));
        assert_eq!(h.coordinator.open_incident_count().await, 0);

        // a grace timer for an unknown entity fires without opening anything
        h.coordinator.process_monitoring_result(&offline("10.0.0.99"), EntityClass::Atm, "99").await;
        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(h.coordinator.state_of(&ghost).await, IncidentState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_type_during_open_incident_is_not_duplicated() {
        let h = harness(MINUTE, MINUTE).await;
        let open = h
            .coordinator
            .create_network_incident(IncidentRequest::slow_connection(branch(), &slow("10.1.0.2", 900)))
            .await
            .unwrap()
            .unwrap();

        let outcome = h.coordinator.process_monitoring_result(&offline("10.1.0.2"), EntityClass::Branch, "BR-02").await;
        assert!(matches!(outcome, ProcessOutcome::GracePeriodStarted { .. }));

        tokio::time::sleep(2 * MINUTE).await;
        let open_rows = h.database.find_incidents(EntityClass::Branch, "BR-02", Some(IncidentStatus::Open)).await.unwrap();
        assert_eq!(open_rows.len(), 1);
        assert_eq!(open_rows[0].id, open.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_failure_keeps_incident() {
        let tickets = RecordingTicketService::failing();
        let h = harness_with(settings(MINUTE, MINUTE), tickets).await;

        let incident = h
            .coordinator
            .create_network_incident(IncidentRequest::communication_offline(atm(), &offline("10.0.0.1")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(incident.ticket_id, None);
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::IncidentOpen);
        assert!(h.database.get_incident(incident.id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_resolve_disabled_leaves_incident_open() {
        let mut disabled = settings(MINUTE, MINUTE);
        disabled.auto_resolve = false;
        disabled.auto_create_tickets = false;
        let h = harness_with(disabled, RecordingTicketService::default()).await;

        h.coordinator
            .create_network_incident(IncidentRequest::communication_offline(atm(), &offline("10.0.0.1")))
            .await
            .unwrap();

        let outcome = h.coordinator.process_monitoring_result(&online("10.0.0.1"), EntityClass::Atm, "01").await;
        assert_eq!(outcome, ProcessOutcome::ServiceHealthy);

        tokio::time::sleep(5 * MINUTE).await;
        assert_eq!(h.coordinator.state_of(&atm()).await, IncidentState::IncidentOpen);
        assert!(h.tickets.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_and_shutdown() {
        let h = harness(MINUTE, MINUTE).await;
        let incident = h
            .coordinator
            .create_network_incident(IncidentRequest::communication_offline(atm(), &offline("10.0.0.1")))
            .await
            .unwrap()
            .unwrap();

        // a fresh coordinator over the same store sees the open incident
        let restarted = IncidentCoordinator::new(h.database.clone(), h.tickets.clone(), settings(MINUTE, MINUTE));
        assert_eq!(restarted.restore_open_incidents().await.unwrap(), 1);
        assert_eq!(restarted.active_incident(&atm()).await.map(|i| i.id), Some(incident.id));

        restarted.process_monitoring_result(&online("10.0.0.1"), EntityClass::Atm, "01").await;
        restarted.process_monitoring_result(&offline("10.1.0.2"), EntityClass::Branch, "BR-02").await;
        assert_eq!(restarted.pending_timers().await, (1, 1));

        assert_eq!(restarted.shutdown().await, 2);
        tokio::time::sleep(5 * MINUTE).await;
        assert_eq!(restarted.state_of(&atm()).await, IncidentState::IncidentOpen);
        assert!(restarted.active_incident(&branch()).await.is_none());
    }
}
