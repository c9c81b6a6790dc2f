//! Load Balancer Health Checking Library
//!
//! Probes real servers behind each virtual service and feeds the results to
//! the balancer state machines:
//! - pluggable per-protocol checkers (dummy, TCP, HTTP, DNS, syslog)
//! - discovery of the real servers to probe
//! - a per-balancer health manager with rise/fall thresholds

pub mod checker;
pub mod discovery;
pub mod monitor;
pub mod types;

pub use checker::{build_checker, HealthChecker};
pub use discovery::{build_discovery, parse_target, DiscoveryConfig, DiscoveryResolver, StaticDiscovery};
pub use monitor::HealthManager;
pub use types::*;
