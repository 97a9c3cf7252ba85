//! Container runtime interaction core
//!
//! This crate provides the node agent's view of local workloads and the
//! operations it performs against them:
//! - Pod/container graph fused from Kubernetes and the container engine
//! - Command execution, file copy and namespace entry into containers
//! - The in-container helper protocol
//! - HTTP, SOCKS5 and port-forward access to pod networks
//! - OOM accounting, pod lifecycle events, health and metrics

pub mod copy;
pub mod cri;
pub mod engine;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod health;
pub mod helper;
pub mod lifecycle;
pub mod meta;
pub mod models;
pub mod netproxy;
pub mod nsenter;
pub mod observability;
pub mod oom;
pub mod path;
pub mod timezone;
pub mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cri::{Cri, CriOptions};
pub use error::{CriError, ErrorKind, Result};
pub use health::{
    ComponentHealth, ComponentStatus, Condition, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
