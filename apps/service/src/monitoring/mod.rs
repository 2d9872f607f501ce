pub mod checker;
/// Probe engine module - stateless reachability checks
///
/// This module is responsible for:
/// - Sending ICMP bursts through the system `ping`
/// - Resolving hostnames
/// - Classifying results into ONLINE / SLOW / OFFLINE / ERROR
/// - Scheduling periodic background loops
pub mod executor;
pub mod scheduler;
pub mod types;

pub use checker::PingOptions;
pub use executor::ProbeEngine;
pub use scheduler::Scheduler;
pub use types::{ComprehensiveResult, ProbeResult, Status};
