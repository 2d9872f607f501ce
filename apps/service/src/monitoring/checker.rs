use anyhow::{Result, anyhow};
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Burst parameters for one ping invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingOptions {
    /// Per-reply timeout
    pub timeout: Duration,
    /// Echo requests in the burst
    pub count: u32,
    /// Delay between echo requests
    pub interval: Duration,
}

impl PingOptions {
    /// Upper bound for the whole burst, used to stop a hung ping process
    pub fn deadline(&self) -> Duration {
        self.timeout + self.interval * self.count.max(1) + Duration::from_secs(1)
    }
}

/// Raw statistics of one burst, before classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    /// Average round trip of the replies that came back
    pub avg_rtt_ms: Option<f64>,
}

impl PingStats {
    pub fn packet_loss(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted.saturating_sub(self.received);
        f64::from(lost) / f64::from(self.transmitted) * 100.0
    }
}

/// Sends ICMP echo bursts to a host
#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    /// `Err` means the probe itself could not run (spawn failure, garbage output),
    /// an unreachable host is `Ok` with zero replies.
    async fn ping(&self, host: &str, options: &PingOptions) -> Result<PingStats>;
}

/// Resolves hostnames to addresses
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>>;
}

/// Pinger backed by the system `ping` binary.
///
/// Raw ICMP sockets need elevated privileges, the setuid `ping` does not.
#[derive(Debug, Default)]
pub struct SystemPinger;

impl SystemPinger {
    fn command(host: &str, options: &PingOptions) -> Command {
        let mut command = Command::new("ping");

        if cfg!(windows) {
            command
                .arg("-n")
                .arg(options.count.to_string())
                .arg("-w")
                .arg(options.timeout.as_millis().to_string());
        } else {
            let wait_secs = options.timeout.as_secs().max(1);
            command
                .arg("-n")
                .arg("-c")
                .arg(options.count.to_string())
                .arg("-i")
                .arg(format!("{:.1}", options.interval.as_secs_f64().max(0.2)))
                .arg("-W")
                .arg(wait_secs.to_string());
        }

        command.arg(host).kill_on_drop(true);
        command
    }
}

#[async_trait::async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, host: &str, options: &PingOptions) -> Result<PingStats> {
        let output = timeout(options.deadline(), Self::command(host, options).output())
            .await
            .map_err(|_| anyhow!("ping timed out after {:?}", options.deadline()))?
            .map_err(|e| anyhow!("failed to run ping: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        // ping exits non-zero on total loss but still prints its summary
        match parse_ping_output(&stdout) {
            Ok(stats) => Ok(stats),
            Err(parse_error) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    Err(parse_error)
                } else {
                    Err(anyhow!("{}", stderr))
                }
            }
        }
    }
}

static UNIX_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received").expect("valid regex")
});

static UNIX_RTT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"min/avg/max/(?:mdev|stddev) = ([\d.]+)/([\d.]+)/([\d.]+)").expect("valid regex")
});

static WINDOWS_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Sent = (\d+), Received = (\d+)").expect("valid regex")
});

static WINDOWS_AVERAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Average = (\d+)ms").expect("valid regex"));

/// Parse the summary block of Linux, BSD/macOS or Windows ping output
pub fn parse_ping_output(output: &str) -> Result<PingStats> {
    if let Some(caps) = UNIX_SUMMARY.captures(output) {
        let transmitted = caps[1].parse()?;
        let received = caps[2].parse()?;
        let avg_rtt_ms = UNIX_RTT.captures(output).and_then(|rtt| rtt[2].parse::<f64>().ok());
        return Ok(PingStats { transmitted, received, avg_rtt_ms });
    }

    if let Some(caps) = WINDOWS_SUMMARY.captures(output) {
        let transmitted = caps[1].parse()?;
        let received = caps[2].parse()?;
        let avg_rtt_ms = WINDOWS_AVERAGE.captures(output).and_then(|avg| avg[1].parse::<f64>().ok());
        return Ok(PingStats { transmitted, received, avg_rtt_ms });
    }

    Err(anyhow!("Failed to parse ping output"))
}

/// Resolver backed by the operating system (getaddrinfo via tokio)
#[derive(Debug, Default)]
pub struct SystemResolver {
    timeout: Option<Duration>,
}

impl SystemResolver {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

#[async_trait::async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let lookup = tokio::net::lookup_host((hostname, 0));
        let addrs = match self.timeout {
            Some(limit) => timeout(limit, lookup)
                .await
                .map_err(|_| anyhow!("DNS lookup timed out after {:?}", limit))?,
            None => lookup.await,
        }
        .map_err(|e| anyhow!("DNS lookup failed: {}", e))?;

        let addresses: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        if addresses.is_empty() {
            return Err(anyhow!("DNS lookup returned no addresses for {}", hostname));
        }
        Ok(addresses)
    }
}
