//! Agent metrics on the default Prometheus registry and `event`-tagged log lines

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Reconcile latency buckets in seconds
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static COLLECTORS: OnceLock<Collectors> = OnceLock::new();

fn collectors() -> &'static Collectors {
    COLLECTORS.get_or_init(|| Collectors::register(prometheus::default_registry()))
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid counter");
    registry.register(Box::new(c.clone())).expect("counter registered once");
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec");
    registry.register(Box::new(c.clone())).expect("counter vec registered once");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("valid gauge");
    registry.register(Box::new(g.clone())).expect("gauge registered once");
    g
}

/// Collectors grouped by the service that feeds them
struct Collectors {
    // meta store
    reconcile_latency: Histogram,
    reconcile_errors: IntCounter,
    pods: IntGauge,
    containers: IntGauge,
    helper_injection_failures: IntCounter,
    // exec and copy, labelled by path / strategy
    exec: IntCounterVec,
    exec_errors: IntCounterVec,
    copies: IntCounterVec,
    // netproxy
    proxy_connections: IntCounterVec,
    portforward_tasks: IntGauge,
    // oom and gateway
    oom_events: IntCounter,
    gateway_queue: IntGauge,
    gateway_dropped: IntCounter,
}

impl Collectors {
    fn register(registry: &Registry) -> Self {
        let reconcile_latency = Histogram::with_opts(
            HistogramOpts::new(
                "cric_reconcile_latency_seconds",
                "Time spent rebuilding the pod graph",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .expect("valid histogram");
        registry
            .register(Box::new(reconcile_latency.clone()))
            .expect("histogram registered once");

        Self {
            reconcile_latency,
            reconcile_errors: counter(
                registry,
                "cric_reconcile_errors_total",
                "Reconcile cycles aborted before installing a graph",
            ),
            pods: gauge(registry, "cric_pods", "Pods in the current graph"),
            containers: gauge(registry, "cric_containers", "Containers in the current graph"),
            helper_injection_failures: counter(
                registry,
                "cric_helper_injection_failures_total",
                "Failed attempts to copy the helper into a container",
            ),
            exec: counter_vec(registry, "cric_exec_total", "Commands executed in containers", &["path"]),
            exec_errors: counter_vec(
                registry,
                "cric_exec_errors_total",
                "Failed container command executions",
                &["path"],
            ),
            copies: counter_vec(
                registry,
                "cric_copy_total",
                "File copies into or out of containers",
                &["strategy", "result"],
            ),
            proxy_connections: counter_vec(
                registry,
                "cric_proxy_connections_total",
                "Connections accepted by the network proxies",
                &["proxy"],
            ),
            portforward_tasks: gauge(registry, "cric_portforward_tasks", "Active port-forward listeners"),
            oom_events: counter(
                registry,
                "cric_oom_events_total",
                "OOM events observed on non-sandbox containers",
            ),
            gateway_queue: gauge(
                registry,
                "cric_gateway_queue_items",
                "Metric points waiting in the gateway queue",
            ),
            gateway_dropped: counter(
                registry,
                "cric_gateway_dropped_total",
                "Metric batches rejected because the gateway queue was full",
            ),
        }
    }
}

/// Text exposition of every collector on the default registry, gateway gauges included
pub fn render_metrics() -> Result<String, prometheus::Error> {
    collectors();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Recording side of the agent's collectors; all handles share one set
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentMetrics;

impl AgentMetrics {
    pub fn new() -> Self {
        collectors();
        Self
    }

    pub fn observe_reconcile(&self, elapsed: Duration, pods: usize, containers: usize) {
        let c = collectors();
        c.reconcile_latency.observe(elapsed.as_secs_f64());
        c.pods.set(pods as i64);
        c.containers.set(containers as i64);
    }

    pub fn inc_reconcile_errors(&self) {
        collectors().reconcile_errors.inc();
    }

    pub fn inc_exec(&self, path: &str) {
        collectors().exec.with_label_values(&[path]).inc();
    }

    pub fn inc_exec_errors(&self, path: &str) {
        collectors().exec_errors.with_label_values(&[path]).inc();
    }

    pub fn inc_copy(&self, strategy: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        collectors().copies.with_label_values(&[strategy, result]).inc();
    }

    pub fn inc_helper_injection_failures(&self) {
        collectors().helper_injection_failures.inc();
    }

    pub fn inc_proxy_connections(&self, proxy: &str) {
        collectors().proxy_connections.with_label_values(&[proxy]).inc();
    }

    pub fn set_portforward_tasks(&self, count: usize) {
        collectors().portforward_tasks.set(count as i64);
    }

    pub fn inc_oom_events(&self) {
        collectors().oom_events.inc();
    }

    pub fn set_gateway_queue(&self, items: usize) {
        collectors().gateway_queue.set(items as i64);
    }

    pub fn inc_gateway_dropped(&self) {
        collectors().gateway_dropped.inc();
    }
}

/// Structured logger for agent events
///
/// Every line carries an `event` field so log pipelines can select on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, engine: &str, pod_source: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            engine = %engine,
            pod_source = %pod_source,
            "Runtime agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Runtime agent shutting down"
        );
    }

    pub fn log_reconcile(
        &self,
        pods: usize,
        containers: usize,
        added: usize,
        removed: usize,
        updated: usize,
        elapsed: Duration,
    ) {
        let changed = added + removed + updated > 0;
        info!(
            event = "reconcile_completed",
            node = %self.node_name,
            pods = pods,
            containers = containers,
            added = added,
            removed = removed,
            updated = updated,
            changed = changed,
            cost_ms = elapsed.as_millis() as u64,
            "Pod graph reconciled"
        );
    }

    pub fn log_helper_injection(&self, cid: &str, pod: &str, error: Option<&str>) {
        match error {
            None => info!(
                event = "helper_injected",
                node = %self.node_name,
                cid = %cid,
                pod = %pod,
                "Helper copied into container"
            ),
            Some(error) => warn!(
                event = "helper_injection_failed",
                node = %self.node_name,
                cid = %cid,
                pod = %pod,
                error = %error,
                "Failed to copy helper into container"
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_copy(
        &self,
        engine: &str,
        cid: &str,
        runtime: &str,
        strategy: &str,
        src: &str,
        dst: &str,
        elapsed: Duration,
        error: Option<&str>,
    ) {
        info!(
            event = "copy_digest",
            node = %self.node_name,
            engine = %engine,
            cid = %cid,
            runtime = %runtime,
            strategy = %strategy,
            src = %src,
            dst = %dst,
            cost_ms = elapsed.as_millis() as u64,
            error = error.unwrap_or(""),
            "Container copy"
        );
    }

    pub fn log_portforward_opened(&self, target: &str, listen: &str, survival: Duration) {
        info!(
            event = "portforward_opened",
            node = %self.node_name,
            target = %target,
            listen = %listen,
            survival_secs = survival.as_secs(),
            "Port-forward listener opened"
        );
    }

    pub fn log_portforward_closed(&self, target: &str, listen: &str, connections: u64) {
        info!(
            event = "portforward_closed",
            node = %self.node_name,
            target = %target,
            listen = %listen,
            connections = connections,
            "Port-forward listener closed"
        );
    }

    pub fn log_oom_flush(&self, containers: usize, events: u64, timestamp_ms: i64) {
        info!(
            event = "oom_flushed",
            node = %self.node_name,
            containers = containers,
            events = events,
            timestamp_ms = timestamp_ms,
            "OOM counters flushed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_text_carries_agent_collectors() {
        AgentMetrics::new().inc_proxy_connections("socks5");
        AgentMetrics.inc_proxy_connections("socks5");

        let text = render_metrics().unwrap();
        assert!(text.contains("cric_reconcile_latency_seconds_bucket"));
        let line = text
            .lines()
            .find(|l| l.starts_with("cric_proxy_connections_total{proxy=\"socks5\"}"))
            .unwrap();
        let value: f64 = line.rsplit(' ').next().unwrap().parse().unwrap();
        assert!(value >= 2.0);
    }
}
