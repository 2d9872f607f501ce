/// Orchestrator module - drives monitoring end to end
///
/// The orchestrator:
/// - Caches the roster of monitored entities and reloads it daily
/// - Runs one polling loop per entity class, probing entities one at a time
/// - Fails over to the backup address when a primary is OFFLINE
/// - Watches store health and memory, reconnecting the pool when needed
/// - Runs daily retention cleanup
pub mod health;
pub mod retention;


pub use health::{HealthMonitor, HealthStatus, MemoryUsage};
pub use retention::{CleanupReport, RetentionCleanup, RetentionPolicy};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::Database;
use crate::database::models::{EntityClass, MonitoredEntity};
use crate::incidents::{IncidentCoordinator, ProcessOutcome};
use crate::monitoring::scheduler::ScheduledTask;
use crate::monitoring::{ComprehensiveResult, ProbeEngine, Scheduler, Status};

/// Echo requests sent to a primary address per tick
pub const PRIMARY_PING_COUNT: u32 = 3;
/// Echo requests sent to a backup address
pub const BACKUP_PING_COUNT: u32 = 2;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Entities to monitor, replaced wholesale on reload
#[derive(Debug, Clone, Default, Serialize)]
pub struct Roster {
    pub branches: Vec<MonitoredEntity>,
    pub atms: Vec<MonitoredEntity>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl Roster {
    pub fn entities(&self, class: EntityClass) -> &[MonitoredEntity] {
        match class {
            EntityClass::Branch => &self.branches,
            EntityClass::Atm => &self.atms,
        }
    }
}

/// Probe results and coordinator outcomes for one entity in one tick
#[derive(Debug, Clone, Serialize)]
pub struct EntityCheck {
    pub entity: String,
    pub primary: ComprehensiveResult,
    pub primary_outcome: ProcessOutcome,
    pub backup: Option<(ComprehensiveResult, ProcessOutcome)>,
}

/// Counts for one pass over a class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub checked: usize,
    pub failed: usize,
    /// Entities left unprobed because the store went unavailable
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub test_mode: bool,
    pub branch_interval_secs: u64,
    pub atm_interval_secs: u64,
    pub health_interval_secs: u64,
    pub grace_secs: u64,
    pub auto_resolve_secs: u64,
    pub dedup_window_secs: u64,
    pub auto_create_tickets: bool,
    pub ticketing_backend: String,
}

/// Snapshot reported by the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub store_available: bool,
    pub monitored_branches: usize,
    pub monitored_atms: usize,
    pub roster_loaded_at: Option<DateTime<Utc>>,
    pub active_loops: Vec<String>,
    pub memory_rss_mb: Option<u64>,
    pub open_incidents: usize,
    pub pending_grace_timers: usize,
    pub pending_resolve_timers: usize,
    pub config: ConfigSummary,
}

/// Main orchestrator for the monitoring service
pub struct MonitoringOrchestrator {
    config: Arc<Config>,
    database: Arc<dyn Database>,
    coordinator: IncidentCoordinator,
    engine: Arc<ProbeEngine>,
    roster: RwLock<Arc<Roster>>,
    health: HealthMonitor,
    scheduler: Scheduler,
    tasks: Mutex<Vec<ScheduledTask>>,
    started_at: Instant,
    running: AtomicBool,
}

impl MonitoringOrchestrator {
    pub fn new(config: Config, database: Arc<dyn Database>, coordinator: IncidentCoordinator, engine: ProbeEngine) -> Self {
        let health = HealthMonitor::new(
            Arc::clone(&database),
            config.database.reconnect_attempts,
            RECONNECT_BACKOFF,
            config.health.memory_warn_mb,
        );

        Self {
            config: Arc::new(config),
            database,
            coordinator,
            engine: Arc::new(engine),
            roster: RwLock::new(Arc::new(Roster::default())),
            health,
            scheduler: Scheduler::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
            running: AtomicBool::new(false),
        }
    }

    /// Check the store, restore open incidents and load the roster.
    ///
    /// Only an unreachable store is fatal.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing network monitoring service...");

        self.database.ping().await.context("Database connectivity check failed")?;
        info!("Database connection established");

        if let Err(e) = self.coordinator.restore_open_incidents().await {
            warn!(error = %e, "Failed to restore open incidents");
        }

        if let Err(e) = self.reload_roster().await {
            warn!(error = %e, "Failed to load monitored entities, starting with an empty roster");
        }

        Ok(())
    }

    /// Current roster snapshot
    pub async fn roster(&self) -> Arc<Roster> {
        Arc::clone(&*self.roster.read().await)
    }

    /// Load both classes and swap the cached roster in one step
    pub async fn reload_roster(&self) -> Result<Arc<Roster>> {
        let branches = self.database.list_monitored_entities(EntityClass::Branch).await?;
        let atms = self.database.list_monitored_entities(EntityClass::Atm).await?;

        info!(branches = branches.len(), atms = atms.len(), "Loaded monitored entities");

        let roster = Arc::new(Roster { branches, atms, loaded_at: Some(Utc::now()) });
        *self.roster.write().await = Arc::clone(&roster);
        Ok(roster)
    }

    pub fn coordinator(&self) -> &IncidentCoordinator {
        &self.coordinator
    }

    pub fn is_store_available(&self) -> bool {
        self.health.is_available()
    }

    /// Probe one entity's primary address, and its backup when the primary is OFFLINE
    pub async fn monitor_entity(&self, entity: &MonitoredEntity) -> Result<EntityCheck> {
        let Some(primary_host) = entity.ip_address.as_deref().filter(|ip| !ip.is_empty()) else {
            bail!("{} has no primary address", entity.key());
        };

        let primary = self.engine.comprehensive_test(primary_host, &self.engine.options_with_count(PRIMARY_PING_COUNT)).await;
        let primary_outcome = self.coordinator.process_monitoring_result(&primary, entity.class, &entity.id).await;

        let status = primary.status();
        debug!(
            entity = %entity.key(),
            host = primary_host,
            status = %status,
            response_ms = primary.ping.response_time_ms,
            "Checked primary address"
        );

        let backup = match entity.backup_ip_address.as_deref() {
            Some(backup_host) if status == Status::Offline && !backup_host.is_empty() => {
                info!(entity = %entity.key(), backup = backup_host, "Primary address offline, checking backup");
                let result = self.engine.comprehensive_test(backup_host, &self.engine.options_with_count(BACKUP_PING_COUNT)).await;
                if result.status() == Status::Online {
                    info!(entity = %entity.key(), backup = backup_host, "Backup address is online");
                }
                let outcome = self.coordinator.process_monitoring_result(&result, entity.class, &entity.id).await;
                Some((result, outcome))
            }
            _ => None,
        };

        Ok(EntityCheck { entity: entity.key().to_string(), primary, primary_outcome, backup })
    }

    /// One sequential pass over every cached entity of `class`
    pub async fn run_class_tick(&self, class: EntityClass) -> TickReport {
        let roster = self.roster().await;
        let entities = roster.entities(class);
        let mut report = TickReport::default();

        debug!(%class, count = entities.len(), "Monitoring tick");

        for (index, entity) in entities.iter().enumerate() {
            if !self.is_store_available() {
                report.skipped = entities.len() - index;
                warn!(%class, skipped = report.skipped, "Store unavailable, skipping rest of tick");
                break;
            }

            match self.monitor_entity(entity).await {
                Ok(_) => report.checked += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(entity = %entity.key(), error = %e, "Error monitoring entity");
                }
            }
        }

        report
    }

    /// Daily cleanup followed by a roster reload
    pub async fn run_daily_maintenance(&self) -> CleanupReport {
        info!("Running daily maintenance");
        let report = self.coordinator.cleanup().await;
        if let Err(e) = self.reload_roster().await {
            error!(error = %e, "Failed to reload monitored entities");
        }
        report
    }

    pub async fn run_health_check(&self) -> HealthStatus {
        self.health.check().await
    }

    /// Probe the first entity of each class once
    pub async fn run_test_cycle(&self) -> Vec<EntityCheck> {
        let roster = self.roster().await;
        let mut checks = Vec::new();

        for class in EntityClass::ALL {
            let Some(entity) = roster.entities(class).first() else {
                info!(%class, "No entities to test");
                continue;
            };

            info!(entity = %entity.key(), name = %entity.name, "Testing entity");
            match self.monitor_entity(entity).await {
                Ok(check) => checks.push(check),
                Err(e) => error!(entity = %entity.key(), error = %e, "Test probe failed"),
            }
        }

        checks
    }

    /// Spawn the polling, health and daily loops
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Monitoring service is already running");
            return;
        }

        let intervals = &self.config.intervals;
        let mut tasks = Vec::new();

        for (class, delay, period) in [
            (EntityClass::Branch, intervals.branch_start_delay_secs, intervals.branch_secs),
            (EntityClass::Atm, intervals.atm_start_delay_secs, intervals.atm_secs),
        ] {
            let this = Arc::clone(self);
            let name = format!("{}-monitor", class.as_str().to_lowercase());
            tasks.push(self.scheduler.every(&name, Duration::from_secs(delay), Duration::from_secs(period), move || {
                let this = Arc::clone(&this);
                async move {
                    let report = this.run_class_tick(class).await;
                    debug!(%class, ?report, "Tick finished");
                }
            }));
            info!(%class, interval_secs = period, "Polling loop started");
        }

        let health_period = Duration::from_secs(intervals.health_secs);
        let this = Arc::clone(self);
        tasks.push(self.scheduler.every("health-check", health_period, health_period, move || {
            let this = Arc::clone(&this);
            async move {
                this.run_health_check().await;
            }
        }));

        let this = Arc::clone(self);
        tasks.push(self.scheduler.daily_at(
            "daily-maintenance",
            intervals.cleanup_hour,
            Duration::from_secs(intervals.roster_reload_secs),
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.run_daily_maintenance().await;
                }
            },
        ));

        self.lock_tasks().extend(tasks);
        info!("Network monitoring service started");
    }

    /// Stop every loop, wait for them to exit, then abort pending incident timers
    pub async fn shutdown(&self) {
        info!("Stopping network monitoring service...");
        self.scheduler.token().cancel();

        let tasks: Vec<ScheduledTask> = self.lock_tasks().drain(..).collect();
        let names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
        for (name, joined) in names.iter().zip(futures::future::join_all(tasks.into_iter().map(|t| t.handle)).await) {
            if let Err(e) = joined {
                warn!(task = %name, error = %e, "Scheduled task ended abnormally");
            }
        }

        // a tick finishing above may have armed a timer
        let aborted = self.coordinator.shutdown().await;
        debug!(aborted, "Pending incident timers aborted");

        self.running.store(false, Ordering::SeqCst);
        info!("Network monitoring service stopped");
    }

    pub async fn status(&self) -> ServiceStatus {
        let roster = self.roster().await;
        let (pending_grace_timers, pending_resolve_timers) = self.coordinator.pending_timers().await;
        let open_incidents = self.coordinator.open_incident_count().await;
        let active_loops = self.active_loops();
        let config = &self.config;

        ServiceStatus {
            running: self.running.load(Ordering::SeqCst),
            uptime_secs: self.started_at.elapsed().as_secs(),
            store_available: self.is_store_available(),
            monitored_branches: roster.branches.len(),
            monitored_atms: roster.atms.len(),
            roster_loaded_at: roster.loaded_at,
            active_loops,
            memory_rss_mb: MemoryUsage::current().map(|m| m.rss_mb()),
            open_incidents,
            pending_grace_timers,
            pending_resolve_timers,
            config: ConfigSummary {
                test_mode: config.test_mode,
                branch_interval_secs: config.intervals.branch_secs,
                atm_interval_secs: config.intervals.atm_secs,
                health_interval_secs: config.intervals.health_secs,
                grace_secs: config.incidents.grace_secs,
                auto_resolve_secs: config.incidents.auto_resolve_secs,
                dedup_window_secs: config.incidents.dedup_window_secs,
                auto_create_tickets: config.incidents.auto_create_tickets,
                ticketing_backend: config.ticketing.backend.to_string(),
            },
        }
    }

    /// Names of loops that have not exited yet
    pub fn active_loops(&self) -> Vec<String> {
        self.lock_tasks().iter().filter(|t| !t.handle.is_finished()).map(|t| t.name.clone()).collect()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledTask>> {
        // a poisoned list of join handles is still usable
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
