//! OOM event counting
//!
//! Listens to engine events and counts `oom` actions per container. Every
//! minute (+2 s) the counts are flushed as `k8s_pod_oom` points and reset.
//! Tags are taken when the event arrives, so a container that is gone by
//! flush time still reports its OOMs.

use crate::engine::{actions, ContainerEngine, EventFilter};
use crate::gateway::{GatewayWriter, MetricPoint};
use crate::health::Condition;
use crate::meta::MetaStore;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::util::timer::AlignedTicker;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const OOM_METRIC: &str = "k8s_pod_oom";

const FLUSH_PERIOD: Duration = Duration::from_secs(60);
const FLUSH_OFFSET: Duration = Duration::from_secs(2);
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// OOMs of one container since the last flush
#[derive(Debug)]
struct Pending {
    tags: BTreeMap<String, String>,
    count: u64,
}

pub struct OomRecorder {
    engine: Arc<dyn ContainerEngine>,
    meta: MetaStore,
    /// Keyed by full container id
    counts: Mutex<HashMap<String, Pending>>,
    gateway: GatewayWriter,
    condition: Condition,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

impl OomRecorder {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        meta: MetaStore,
        gateway: GatewayWriter,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            engine,
            meta,
            counts: Mutex::new(HashMap::new()),
            gateway,
            condition: Condition::new(),
            logger,
            metrics: AgentMetrics::new(),
        }
    }

    /// Degraded while the engine event subscription is down
    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Count one engine event; returns true when it was an OOM of a known workload container
    pub fn record(&self, id: &str, action: &str) -> bool {
        if action != actions::OOM {
            return false;
        }
        let Some(container) = self.meta.get_container_by_cid(id) else {
            debug!(cid = %id, "OOM event for unknown container");
            return false;
        };
        if container.is_sandbox() {
            return false;
        }
        let tags = container.common_tags(self.meta.pod_of(&container).as_deref());
        self.counts
            .lock()
            .entry(container.id.clone())
            .or_insert_with(|| Pending { tags, count: 0 })
            .count += 1;
        self.metrics.inc_oom_events();
        info!(cid = %container.id, pod = %container.pod_key(), container = %container.name, "Container OOM");
        true
    }

    /// Take the pending counts as points stamped `timestamp_ms`
    pub fn flush(&self, timestamp_ms: i64) -> Vec<MetricPoint> {
        let counts = std::mem::take(&mut *self.counts.lock());
        let mut points = Vec::with_capacity(counts.len());
        let mut events = 0;
        for Pending { tags, count } in counts.into_values() {
            events += count;
            points.push(MetricPoint {
                name: OOM_METRIC.to_string(),
                tags,
                timestamp_ms,
                value: count as f64,
            });
        }
        if !points.is_empty() {
            self.logger.log_oom_flush(points.len(), events, timestamp_ms);
        }
        points
    }

    fn emit(&self, timestamp_ms: i64) {
        let points = self.flush(timestamp_ms);
        if let Err(e) = self.gateway.try_write(points) {
            warn!(error = %e, "Failed to queue OOM points");
        }
    }

    /// Consume engine events until the stream ends or fails
    async fn watch_events(&self) {
        let filter = EventFilter::actions([actions::START, actions::DIE, actions::OOM]);
        let mut stream = match self.engine.events(&filter).await {
            Ok(stream) => {
                self.condition.ok();
                stream
            }
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to engine events");
                self.condition.degraded(format!("event subscription failed: {e}"));
                return;
            }
        };
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    self.record(&event.id, &event.action);
                }
                Err(e) => {
                    warn!(error = %e, "Engine event stream failed");
                    self.condition.degraded(format!("event stream failed: {e}"));
                    return;
                }
            }
        }
        debug!("Engine event stream ended");
    }

    /// Run the event and flush loops until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("OOM recorder started");
        let gateway = self.gateway.acquire();

        let events = {
            let this = self.clone();
            async move {
                loop {
                    this.watch_events().await;
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                }
            }
        };
        tokio::pin!(events);

        let mut ticker = AlignedTicker::new(FLUSH_PERIOD, FLUSH_OFFSET);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("OOM recorder shutting down");
                    break;
                }
                _ = &mut events => {}
                ts = ticker.tick() => self.emit(ts),
            }
        }
        gateway.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayConfig, PointExporter};
    use crate::meta::MetaConfig;
    use crate::testing::{detail, k8s_pod, FakeEngine, FakeInjector, StaticPodSource};
    use async_trait::async_trait;
    use std::path::PathBuf;

    #[derive(Default)]
    struct Collecting {
        points: Mutex<Vec<MetricPoint>>,
    }

    #[async_trait]
    impl PointExporter for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn export(&self, batch: Vec<MetricPoint>) -> crate::error::Result<()> {
            self.points.lock().extend(batch);
            Ok(())
        }
    }

    async fn recorder() -> (Arc<FakeEngine>, Arc<OomRecorder>, Arc<Collecting>) {
        let (engine, oom, exporter, _) = recorder_with_meta().await;
        (engine, oom, exporter)
    }

    async fn recorder_with_meta() -> (Arc<FakeEngine>, Arc<OomRecorder>, Arc<Collecting>, MetaStore) {
        let engine = Arc::new(FakeEngine::new());
        let source = Arc::new(StaticPodSource::new());
        source.set(vec![k8s_pod("default", "web-1", "U1", "Running")]);
        engine.set(vec![
            detail("sandbox0000000000000001", "POD", "U1", "").sandbox(),
            detail("biz00000000000000000001", "web", "U1", "sandbox0000000000000001").pid(100),
        ]);
        let meta = MetaStore::new(
            MetaConfig {
                hostfs: PathBuf::from("/nonexistent-hostfs"),
                ..Default::default()
            },
            source,
            engine.clone(),
            Arc::new(FakeInjector::default()),
            StructuredLogger::new("test-node"),
        );
        meta.reconcile().await.unwrap();

        let exporter = Arc::new(Collecting::default());
        let gateway = GatewayWriter::new(GatewayConfig::default(), exporter.clone());
        let oom = Arc::new(OomRecorder::new(
            engine.clone(),
            meta.clone(),
            gateway,
            StructuredLogger::new("test-node"),
        ));
        (engine, oom, exporter, meta)
    }

    #[tokio::test]
    async fn test_counts_only_workload_ooms() {
        let (_, oom, _) = recorder().await;
        assert!(oom.record("biz000000000", actions::OOM));
        assert!(oom.record("biz00000000000000000001", actions::OOM));
        assert!(!oom.record("biz00000000000000000001", actions::DIE));
        assert!(!oom.record("sandbox0000000000000001", actions::OOM));
        assert!(!oom.record("gone", actions::OOM));

        let points = oom.flush(60_000);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].name, OOM_METRIC);
        assert_eq!(points[0].value, 2.0);
        assert_eq!(points[0].timestamp_ms, 60_000);
        assert_eq!(points[0].tags["pod"], "web-1");
        assert_eq!(points[0].tags["container"], "web");
        assert!(points[0].tags.contains_key("hostIP"));

        assert!(oom.flush(120_000).is_empty());
    }

    #[tokio::test]
    async fn test_container_removed_before_flush_still_reported() {
        let (engine, oom, _, meta) = recorder_with_meta().await;
        assert!(oom.record("biz00000000000000000001", actions::OOM));

        engine.remove("biz00000000000000000001");
        meta.reconcile().await.unwrap();
        assert!(meta.get_container_by_cid("biz00000000000000000001").is_none());

        let points = oom.flush(60_000);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 1.0);
        assert_eq!(points[0].tags["pod"], "web-1");
        assert_eq!(points[0].tags["container"], "web");
    }

    #[tokio::test]
    async fn test_run_consumes_engine_events() {
        let (engine, oom, _) = recorder().await;
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(oom.clone().run(rx));

        for _ in 0..100 {
            if engine.subscribers() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.emit("biz00000000000000000001", actions::OOM);
        engine.emit("biz00000000000000000001", actions::START);

        let mut seen = false;
        for _ in 0..100 {
            if let Some(p) = oom.flush(0).first() {
                seen = p.value == 1.0;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
