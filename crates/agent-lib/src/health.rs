//! Component conditions behind `/healthz` and `/readyz`
//!
//! Each service owns a [`Condition`] and updates it from its own outcomes:
//! the meta store after every reconcile, the engine when listing containers
//! fails, the gateway when its queue overflows or an export fails, the OOM
//! recorder when its event subscription drops. The [`HealthRegistry`] only
//! collects the conditions and derives the verdicts.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Consecutive failures after which a degraded component turns unhealthy
pub const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing but still serving, usually from the last good state
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last update
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug)]
struct ConditionState {
    health: ComponentHealth,
    failures: u32,
}

/// Shared condition of one component; clones observe the same state
#[derive(Debug, Clone)]
pub struct Condition {
    state: Arc<Mutex<ConditionState>>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConditionState {
                health: ComponentHealth::new(ComponentStatus::Healthy, None),
                failures: 0,
            })),
        }
    }

    fn set(&self, status: ComponentStatus, message: Option<String>, failures: u32) {
        let mut state = self.state.lock();
        state.health = ComponentHealth::new(status, message);
        state.failures = failures;
    }

    /// The last operation succeeded
    pub fn ok(&self) {
        self.set(ComponentStatus::Healthy, None, 0);
    }

    pub fn degraded(&self, message: impl Into<String>) {
        let failures = self.state.lock().failures;
        self.set(ComponentStatus::Degraded, Some(message.into()), failures);
    }

    pub fn unhealthy(&self, message: impl Into<String>) {
        let failures = self.state.lock().failures;
        self.set(ComponentStatus::Unhealthy, Some(message.into()), failures);
    }

    /// Count a failed operation; unhealthy from the [`FAILURE_THRESHOLD`]th in a row
    pub fn failure(&self, message: impl Into<String>) {
        let failures = self.state.lock().failures.saturating_add(1);
        let status = if failures >= FAILURE_THRESHOLD {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        self.set(status, Some(message.into()), failures);
    }

    pub fn get(&self) -> ComponentHealth {
        self.state.lock().health.clone()
    }

    pub fn status(&self) -> ComponentStatus {
        self.state.lock().health.status
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const META_STORE: &str = "meta_store";
    pub const ENGINE: &str = "engine";
    pub const NETPROXY: &str = "netproxy";
    pub const OOM_RECORDER: &str = "oom_recorder";
    pub const GATEWAY: &str = "gateway";

    /// Components whose failure makes the agent unready
    pub const CRITICAL: &[&str] = &[META_STORE, ENGINE];
}

/// Named component conditions plus the first-graph readiness latch
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, Condition>>>,
    ready: Arc<AtomicBool>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, condition: Condition) {
        self.components.write().insert(name.to_string(), condition);
    }

    pub fn condition(&self, name: &str) -> Option<Condition> {
        self.components.read().get(name).cloned()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Worst component status wins
    pub fn health(&self) -> HealthResponse {
        let components: BTreeMap<String, ComponentHealth> = self
            .components
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.get()))
            .collect();
        let status = components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        if !self.ready.load(Ordering::SeqCst) {
            return ReadinessResponse {
                ready: false,
                reason: Some("Pod graph not built yet".to_string()),
            };
        }
        let components = self.components.read();
        let failed = components::CRITICAL.iter().find(|name| {
            components
                .get(**name)
                .is_some_and(|c| !c.status().is_operational())
        });
        match failed {
            Some(name) => ReadinessResponse {
                ready: false,
                reason: Some(format!("Critical component {name} unhealthy")),
            },
            None => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_escalate_and_recover() {
        let condition = Condition::new();
        condition.failure("list failed");
        condition.failure("list failed");
        assert_eq!(condition.status(), ComponentStatus::Degraded);

        condition.failure("list failed");
        let health = condition.get();
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(health.message.as_deref(), Some("list failed"));

        condition.ok();
        assert_eq!(condition.status(), ComponentStatus::Healthy);
        condition.failure("again");
        assert_eq!(condition.status(), ComponentStatus::Degraded);
    }

    #[test]
    fn test_worst_component_decides() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.health().status, ComponentStatus::Healthy);

        let gateway = Condition::new();
        let meta = Condition::new();
        registry.register(components::GATEWAY, gateway.clone());
        registry.register(components::META_STORE, meta.clone());

        gateway.degraded("queue full");
        assert_eq!(registry.health().status, ComponentStatus::Degraded);
        meta.unhealthy("reconcile failing");
        assert_eq!(registry.health().status, ComponentStatus::Unhealthy);
    }

    #[test]
    fn test_readiness_needs_graph_and_critical_components() {
        let registry = HealthRegistry::new();
        let engine = Condition::new();
        let netproxy = Condition::new();
        registry.register(components::ENGINE, engine.clone());
        registry.register(components::NETPROXY, netproxy.clone());

        let readiness = registry.readiness();
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());

        registry.set_ready(true);
        netproxy.unhealthy("bind failed");
        assert!(registry.readiness().ready);

        engine.unhealthy("socket gone");
        let readiness = registry.readiness();
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains("engine"));
    }

    #[test]
    fn test_response_shape() {
        let registry = HealthRegistry::new();
        let meta = Condition::new();
        registry.register(components::META_STORE, meta.clone());
        meta.degraded("keeping previous graph");

        let json = serde_json::to_value(registry.health()).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["components"]["meta_store"]["message"], "keeping previous graph");
        assert!(json["components"]["meta_store"]["last_check_timestamp"].is_i64());
    }
}
