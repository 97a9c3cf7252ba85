//! Exporter publishing gateway points as gauges on the agent's /metrics

use super::{MetricPoint, PointExporter};
use crate::error::{CriError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{GaugeVec, Opts, Registry};
use std::collections::HashMap;
use tracing::warn;

struct Family {
    labels: Vec<String>,
    gauge: GaugeVec,
}

/// Each metric name becomes a gauge family labelled by its tag keys.
/// A family's label set is fixed by the first point seen for that name.
pub struct PrometheusExporter {
    registry: Registry,
    families: Mutex<HashMap<String, Family>>,
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new(prometheus::default_registry().clone())
    }
}

impl PrometheusExporter {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            families: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, point: &MetricPoint) -> Result<Family> {
        let labels: Vec<String> = point.tags.keys().cloned().collect();
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        let opts = Opts::new(point.name.clone(), format!("Gateway metric {}", point.name));
        let gauge = GaugeVec::new(opts, &refs).map_err(|e| CriError::Unsupported(e.to_string()))?;
        self.registry
            .register(Box::new(gauge.clone()))
            .map_err(|e| CriError::Unsupported(e.to_string()))?;
        Ok(Family { labels, gauge })
    }

    fn set(&self, point: &MetricPoint) -> Result<()> {
        let mut families = self.families.lock();
        if !families.contains_key(&point.name) {
            let family = self.register(point)?;
            families.insert(point.name.clone(), family);
        }
        let Some(family) = families.get(&point.name) else {
            return Ok(());
        };
        if !family.labels.iter().eq(point.tags.keys()) {
            return Err(CriError::Unsupported(format!(
                "tag keys of {} differ from {:?}",
                point.name, family.labels
            )));
        }
        let values: Vec<&str> = point.tags.values().map(String::as_str).collect();
        family
            .gauge
            .get_metric_with_label_values(&values)
            .map_err(|e| CriError::Unsupported(e.to_string()))?
            .set(point.value);
        Ok(())
    }
}

#[async_trait]
impl PointExporter for PrometheusExporter {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn export(&self, batch: Vec<MetricPoint>) -> Result<()> {
        for point in &batch {
            if let Err(e) = self.set(point) {
                warn!(metric = %point.name, error = %e, "Skipping gateway point");
            }
        }
        Ok(())
    }
}
