//! Brivas L4 Load Balancer
//!
//! Keeps a fleet of kernel LB services in line with configuration and
//! upstream health:
//! - per-service balancer state machines fed by health reports
//! - a control plane that assembles the full desired state and pushes it
//! - a data plane that diffs the desired state against the kernel, BGP and
//!   interface addresses and applies it in a traffic-safe order

pub mod balancer;
pub mod client;
pub mod comparator;
pub mod config;
pub mod control;
pub mod dataplane;
pub mod error;
pub mod fwmark;
pub mod modules;
pub mod stats;

pub use balancer::{Balancer, BalancerContext, BalancerSnapshot};
pub use client::{DataPlaneClient, HttpDataPlaneClient};
pub use comparator::{compare, SetDiff};
pub use config::{BalancerConfig, BalancerId, ControlPlaneConfig, FwmarkPoolConfig, RouteConfig};
pub use control::{build_state, filter_routes, ControlPlaneReconciler, ReconcilerContext};
pub use dataplane::{DataPlaneManager, KeepState, ShutdownHandler, WithdrawAndFlush};
pub use error::{FwmarkError, LbError, Result};
pub use fwmark::FwmarkAllocator;
pub use modules::DataPlaneModules;
pub use stats::{ServiceTraffic, StatsCollector, TrafficCounters};
