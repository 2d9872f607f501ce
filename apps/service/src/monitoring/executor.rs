use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

use super::checker::{PingOptions, Pinger, Resolver, SystemPinger, SystemResolver};
use super::types::{ComprehensiveResult, DnsResult, ProbeResult, Status};
use crate::config::{Config, Thresholds};

/// Classify a reachable host by packet loss first, then response time
pub fn classify(response_time_ms: Option<u64>, packet_loss: f64, thresholds: &Thresholds) -> Status {
    if packet_loss >= thresholds.loss_critical_pct {
        return Status::Error;
    }
    if packet_loss >= thresholds.loss_warning_pct {
        return Status::Slow;
    }

    let response = response_time_ms.unwrap_or(0);
    if response > thresholds.response_slow_ms {
        return Status::Slow;
    }
    if response > thresholds.response_warning_ms {
        return Status::Slow;
    }

    Status::Online
}

/// Probe engine - stateless reachability and performance tests
pub struct ProbeEngine {
    pinger: Arc<dyn Pinger>,
    resolver: Arc<dyn Resolver>,
    thresholds: Thresholds,
    defaults: PingOptions,
    multi_test_delay: Duration,
}

impl ProbeEngine {
    /// Create an engine with explicit probing backends
    pub fn new(
        pinger: Arc<dyn Pinger>,
        resolver: Arc<dyn Resolver>,
        thresholds: Thresholds,
        defaults: PingOptions,
        multi_test_delay: Duration,
    ) -> Self {
        Self { pinger, resolver, thresholds, defaults, multi_test_delay }
    }

    /// Create an engine using the system `ping` binary and resolver
    pub fn from_config(config: &Config) -> Self {
        let defaults = PingOptions {
            timeout: Duration::from_millis(config.probe.timeout_ms),
            count: config.probe.count,
            interval: Duration::from_millis(config.probe.interval_ms),
        };

        Self::new(
            Arc::new(SystemPinger),
            Arc::new(SystemResolver::with_timeout(defaults.timeout)),
            config.thresholds.clone(),
            defaults,
            Duration::from_millis(config.probe.multi_test_delay_ms),
        )
    }

    /// Default burst options from configuration
    pub fn options(&self) -> PingOptions {
        self.defaults.clone()
    }

    /// Default options with a different packet count
    pub fn options_with_count(&self, count: u32) -> PingOptions {
        PingOptions { count, ..self.defaults.clone() }
    }

    /// Issue one burst against `host` and classify it.
    ///
    /// Never fails: transport problems come back as `Status::Error`.
    pub async fn ping_host(&self, host: &str, options: &PingOptions) -> ProbeResult {
        let deadline = options.deadline();

        match timeout(deadline, self.pinger.ping(host, options)).await {
            Err(_) => ProbeResult::error(host, format!("Ping timed out after {}ms", deadline.as_millis())),
            Ok(Err(e)) => ProbeResult::error(host, e.to_string()),
            Ok(Ok(stats)) if stats.received == 0 => ProbeResult::offline(host, "Host unreachable"),
            Ok(Ok(stats)) => {
                let response_time_ms = stats.avg_rtt_ms.map(|rtt| rtt.round() as u64);
                let packet_loss = stats.packet_loss();
                let status = classify(response_time_ms, packet_loss, &self.thresholds);
                ProbeResult::reachable(host, status, response_time_ms, packet_loss)
            }
        }
    }

    /// Run `count` sequential single bursts and classify the aggregate
    pub async fn ping_multiple(&self, host: &str, count: u32) -> ProbeResult {
        let count = count.max(1);
        let options = self.options();
        let mut successes = 0u32;
        let mut total_response = 0u64;
        let mut timed_responses = 0u64;
        let mut last_error = None;

        for attempt in 0..count {
            if attempt > 0 {
                tokio::time::sleep(self.multi_test_delay).await;
            }

            let result = self.ping_host(host, &options).await;
            if result.reachable {
                successes += 1;
                if let Some(rt) = result.response_time_ms {
                    total_response += rt;
                    timed_responses += 1;
                }
            } else {
                last_error = result.error_message;
            }
        }

        debug!(host, successes, count, "ping_multiple finished");

        if successes == 0 {
            return ProbeResult::offline(host, last_error.unwrap_or_else(|| "Host unreachable".into()));
        }

        let packet_loss = f64::from(count - successes) / f64::from(count) * 100.0;
        let response_time_ms = (timed_responses > 0).then(|| total_response / timed_responses);
        let status = classify(response_time_ms, packet_loss, &self.thresholds);
        ProbeResult::reachable(host, status, response_time_ms, packet_loss)
    }

    /// Resolve a hostname, literal IP addresses are reported as resolved without a lookup
    pub async fn test_dns(&self, hostname: &str) -> DnsResult {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return DnsResult {
                hostname: hostname.to_string(),
                resolved: true,
                addresses: vec![ip],
                latency_ms: 0,
                error_message: None,
            };
        }

        let start = Instant::now();
        let outcome = self.resolver.resolve(hostname).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(addresses) => DnsResult {
                hostname: hostname.to_string(),
                resolved: true,
                addresses,
                latency_ms,
                error_message: None,
            },
            Err(e) => DnsResult {
                hostname: hostname.to_string(),
                resolved: false,
                addresses: Vec::new(),
                latency_ms,
                error_message: Some(e.to_string()),
            },
        }
    }

    /// Ping, plus DNS for hostnames.
    ///
    /// A hostname whose ping is not OFFLINE but whose DNS lookup failed is
    /// forced to ERROR.
    pub async fn comprehensive_test(&self, host: &str, options: &PingOptions) -> ComprehensiveResult {
        let is_ip = host.parse::<IpAddr>().is_ok();
        let mut ping = self.ping_host(host, options).await;

        let dns = if is_ip {
            None
        } else {
            let dns = self.test_dns(host).await;
            if !dns.resolved && ping.status != Status::Offline {
                let detail = dns.error_message.as_deref().unwrap_or("no addresses");
                ping.status = Status::Error;
                ping.error_message = Some(format!("DNS resolution failed: {}", detail));
            }
            Some(dns)
        };

        ComprehensiveResult { host: host.to_string(), is_ip, ping, dns, timestamp: Utc::now() }
    }
}
