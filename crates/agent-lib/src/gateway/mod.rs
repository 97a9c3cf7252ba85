//! Metric gateway write path
//!
//! Producers hand point batches to a bounded in-memory queue; one consumer
//! task drains it in batches into a [`PointExporter`]. The writer is shared
//! by reference counting and stops when its last holder releases it.

pub mod prometheus;

use crate::error::{CriError, Result};
use crate::health::Condition;
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default queue capacity in points
const DEFAULT_CAPACITY: usize = 10_000;

/// Default number of points handed to the exporter at once
const DEFAULT_BATCH_SIZE: usize = 500;

/// One sample of a named metric
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub timestamp_ms: i64,
    pub value: f64,
}

#[async_trait]
pub trait PointExporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, batch: Vec<MetricPoint>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub capacity: usize,
    pub batch_size: usize,
    /// Upper bound on how long queued points wait without a wakeup
    pub flush_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Bounded FIFO of points; a full queue rejects instead of evicting
#[derive(Debug)]
pub struct PointQueue {
    points: VecDeque<MetricPoint>,
    capacity: usize,
}

impl PointQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append the whole batch or nothing
    pub fn push_batch(&mut self, batch: Vec<MetricPoint>) -> Result<()> {
        if self.points.len() + batch.len() > self.capacity {
            return Err(CriError::QueueFull);
        }
        self.points.extend(batch);
        Ok(())
    }

    pub fn drain_batch(&mut self, limit: usize) -> Vec<MetricPoint> {
        let count = limit.min(self.points.len());
        self.points.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterState {
    New,
    Running,
    Stopped,
}

struct Inner {
    config: GatewayConfig,
    exporter: Arc<dyn PointExporter>,
    queue: Mutex<PointQueue>,
    wakeup: Notify,
    stop_tx: watch::Sender<bool>,
    state: Mutex<WriterState>,
    holders: Mutex<usize>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    condition: Condition,
    metrics: AgentMetrics,
}

#[derive(Clone)]
pub struct GatewayWriter {
    inner: Arc<Inner>,
}

impl GatewayWriter {
    pub fn new(config: GatewayConfig, exporter: Arc<dyn PointExporter>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(PointQueue::new(config.capacity)),
                config,
                exporter,
                wakeup: Notify::new(),
                stop_tx,
                state: Mutex::new(WriterState::New),
                holders: Mutex::new(0),
                consumer: Mutex::new(None),
                condition: Condition::new(),
                metrics: AgentMetrics::new(),
            }),
        }
    }

    pub fn state(&self) -> WriterState {
        *self.inner.state.lock()
    }

    /// Degraded while batches are rejected or exports fail
    pub fn condition(&self) -> &Condition {
        &self.inner.condition
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Spawn the consumer; later calls are no-ops
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if *state != WriterState::New {
            return;
        }
        *state = WriterState::Running;
        let inner = self.inner.clone();
        let stop_rx = self.inner.stop_tx.subscribe();
        *self.inner.consumer.lock() = Some(tokio::spawn(consume(inner, stop_rx)));
        info!(exporter = %self.inner.exporter.name(), "Gateway writer started");
    }

    /// Ask the consumer to drain the queue and exit
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if *state == WriterState::Stopped {
            return;
        }
        *state = WriterState::Stopped;
        let _ = self.inner.stop_tx.send(true);
        info!("Gateway writer stopping");
    }

    /// Wait for the consumer to finish its final drain
    pub async fn join(&self) {
        let handle = self.inner.consumer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Gateway consumer task failed");
            }
        }
    }

    /// Register a holder, starting the writer on first use
    pub fn acquire(&self) -> Self {
        *self.inner.holders.lock() += 1;
        self.start();
        self.clone()
    }

    /// Drop a holder; the last one stops the writer. Returns true when stopped.
    pub fn release(&self) -> bool {
        let last = {
            let mut holders = self.inner.holders.lock();
            *holders = holders.saturating_sub(1);
            *holders == 0
        };
        if last {
            self.stop();
        }
        last
    }

    /// Queue a batch without waiting; a full queue rejects the whole batch
    pub fn try_write(&self, batch: Vec<MetricPoint>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.state() != WriterState::Running {
            return Err(CriError::Unsupported("gateway writer is not running".into()));
        }
        let queued = {
            let mut queue = self.inner.queue.lock();
            if let Err(e) = queue.push_batch(batch) {
                self.inner.metrics.inc_gateway_dropped();
                self.inner
                    .condition
                    .degraded(format!("queue full at {} points, batch dropped", queue.len()));
                return Err(e);
            }
            queue.len()
        };
        self.inner.metrics.set_gateway_queue(queued);
        self.inner.wakeup.notify_one();
        Ok(())
    }
}

async fn export_pending(inner: &Inner, all: bool) {
    loop {
        let (batch, left) = {
            let mut queue = inner.queue.lock();
            let batch = queue.drain_batch(inner.config.batch_size);
            (batch, queue.len())
        };
        inner.metrics.set_gateway_queue(left);
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        if let Err(e) = inner.exporter.export(batch).await {
            warn!(exporter = %inner.exporter.name(), points = size, error = %e, "Gateway export failed");
            inner.condition.degraded(format!("export to {} failed: {e}", inner.exporter.name()));
        } else {
            debug!(exporter = %inner.exporter.name(), points = size, "Gateway batch exported");
            inner.condition.ok();
        }
        if !all && left == 0 {
            return;
        }
    }
}

async fn consume(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.flush_interval);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                export_pending(&inner, true).await;
                info!("Gateway writer stopped");
                return;
            }
            _ = inner.wakeup.notified() => export_pending(&inner, false).await,
            _ = ticker.tick() => export_pending(&inner, false).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;

    #[derive(Default)]
    struct Collecting {
        batches: Mutex<Vec<Vec<MetricPoint>>>,
    }

    #[async_trait]
    impl PointExporter for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn export(&self, batch: Vec<MetricPoint>) -> Result<()> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn point(value: f64) -> MetricPoint {
        MetricPoint {
            name: "k8s_pod_oom".into(),
            tags: BTreeMap::new(),
            timestamp_ms: 0,
            value,
        }
    }

    #[test]
    fn test_queue_rejects_when_full() {
        let mut queue = PointQueue::new(3);
        queue.push_batch(vec![point(1.0), point(2.0)]).unwrap();
        assert!(matches!(
            queue.push_batch(vec![point(3.0), point(4.0)]),
            Err(CriError::QueueFull)
        ));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain_batch(1);
        assert_eq!(drained[0].value, 1.0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_write_requires_start() {
        let writer = GatewayWriter::new(GatewayConfig::default(), Arc::new(Collecting::default()));
        assert!(writer.try_write(vec![point(1.0)]).is_err());
    }

    #[tokio::test]
    async fn test_last_release_stops_and_drains() {
        let exporter = Arc::new(Collecting::default());
        let writer = GatewayWriter::new(GatewayConfig::default(), exporter.clone());

        let a = writer.acquire();
        let b = writer.acquire();
        assert_eq!(writer.state(), WriterState::Running);

        a.try_write(vec![point(1.0), point(2.0)]).unwrap();
        assert!(!a.release());
        assert_eq!(writer.state(), WriterState::Running);
        assert!(b.release());
        writer.join().await;

        assert_eq!(writer.state(), WriterState::Stopped);
        let total: usize = exporter.batches.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 2);
        assert!(writer.try_write(vec![point(3.0)]).is_err());
    }

    #[tokio::test]
    async fn test_full_queue_returns_queue_full() {
        let config = GatewayConfig {
            capacity: 1,
            ..Default::default()
        };
        let writer = GatewayWriter::new(config, Arc::new(Collecting::default()));
        writer.start();

        let err = writer.try_write(vec![point(1.0), point(2.0)]).unwrap_err();
        assert!(matches!(err, CriError::QueueFull));
        let health = writer.condition().get();
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.message.unwrap().contains("queue full"));

        writer.try_write(vec![point(1.0)]).unwrap();
        for _ in 0..100 {
            if writer.condition().status() == ComponentStatus::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(writer.condition().status(), ComponentStatus::Healthy);
        writer.stop();
        writer.join().await;
    }
}
