//! Self health check: store liveness, bounded reconnect and memory usage.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::database::Database;

/// Resident memory of this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub rss_bytes: u64,
}

impl MemoryUsage {
    /// Read `/proc/self/statm`, `None` off Linux or when unreadable
    pub fn current() -> Option<Self> {
        let content = std::fs::read_to_string("/proc/self/statm").ok()?;
        parse_statm(&content).map(|rss_bytes| Self { rss_bytes })
    }

    pub fn rss_mb(&self) -> u64 {
        self.rss_bytes / (1024 * 1024)
    }
}

/// Resident bytes from a statm line (second field, in 4 KiB pages)
pub fn parse_statm(content: &str) -> Option<u64> {
    let page_size = 4096u64;
    let rss_pages = content.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(rss_pages * page_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Ping failed, a reconnect attempt brought the store back
    Recovered { attempts: u32 },
    /// Every reconnect attempt failed
    Unavailable,
}

/// Periodic store and memory check.
///
/// Owns the availability flag the polling loops read; they skip their
/// remaining entities while it is down.
pub struct HealthMonitor {
    database: Arc<dyn Database>,
    available: AtomicBool,
    reconnect_attempts: u32,
    backoff: Duration,
    memory_warn_mb: u64,
}

impl HealthMonitor {
    pub fn new(database: Arc<dyn Database>, reconnect_attempts: u32, backoff: Duration, memory_warn_mb: u64) -> Self {
        Self { database, available: AtomicBool::new(true), reconnect_attempts, backoff, memory_warn_mb }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub async fn check(&self) -> HealthStatus {
        self.check_memory();

        match self.database.ping().await {
            Ok(()) => {
                self.available.store(true, Ordering::SeqCst);
                debug!("Health check passed");
                HealthStatus::Healthy
            }
            Err(e) => {
                error!(error = %e, "Database health check failed");
                self.available.store(false, Ordering::SeqCst);
                self.reconnect().await
            }
        }
    }

    /// Linear backoff: attempt `n` waits `n * backoff` first
    async fn reconnect(&self) -> HealthStatus {
        for attempt in 1..=self.reconnect_attempts {
            tokio::time::sleep(self.backoff * attempt).await;

            match self.database.reconnect().await {
                Ok(()) => {
                    info!(attempt, "Database reconnected");
                    self.available.store(true, Ordering::SeqCst);
                    return HealthStatus::Recovered { attempts: attempt };
                }
                Err(e) => warn!(attempt, max = self.reconnect_attempts, error = %e, "Database reconnect failed"),
            }
        }

        error!(attempts = self.reconnect_attempts, "Database unavailable, polling paused until next health check");
        HealthStatus::Unavailable
    }

    fn check_memory(&self) {
        let Some(usage) = MemoryUsage::current() else {
            return;
        };
        if usage.rss_mb() > self.memory_warn_mb {
            warn!(rss_mb = usage.rss_mb(), limit_mb = self.memory_warn_mb, "High memory usage");
        } else {
            debug!(rss_mb = usage.rss_mb(), "Memory usage");
        }
    }
}
