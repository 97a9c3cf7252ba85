//! Pod source polling the kubelet's `/pods` endpoint

use super::source::{pod_uid, ChangeNotifier, PodSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<K8sPod>,
}

/// Identity of one container incarnation as reported by the kubelet
///
/// A restart changes the container id and its start time, so the pair is a
/// stable change signal where start time alone is not.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Signature {
    uid: String,
    phase: String,
    container_id: String,
    started_at: String,
}

fn signatures(pods: &[K8sPod]) -> BTreeSet<Signature> {
    let mut set = BTreeSet::new();
    for pod in pods {
        let uid = pod_uid(pod);
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.clone()).unwrap_or_default();
        let statuses = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        set.insert(Signature {
            uid: uid.clone(),
            phase: phase.clone(),
            container_id: String::new(),
            started_at: String::new(),
        });
        for cs in statuses {
            let started_at = cs
                .state
                .as_ref()
                .and_then(|s| s.running.as_ref())
                .and_then(|r| r.started_at.as_ref())
                .map(|t| t.0.to_rfc3339())
                .unwrap_or_default();
            set.insert(Signature {
                uid: uid.clone(),
                phase: phase.clone(),
                container_id: cs.container_id.clone().unwrap_or_default(),
                started_at,
            });
        }
    }
    set
}

pub struct KubeletPodSource {
    client: reqwest::Client,
    url: String,
    token_path: PathBuf,
    period: Duration,
    pods: RwLock<Vec<Arc<K8sPod>>>,
    last_signatures: RwLock<BTreeSet<Signature>>,
    synced: AtomicBool,
    notifier: ChangeNotifier,
}

impl KubeletPodSource {
    pub fn new(node_ip: &str, port: u16) -> Result<Self> {
        // The kubelet serves a self-signed certificate
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build kubelet client")?;

        Ok(Self {
            client,
            url: format!("https://{node_ip}:{port}/pods"),
            token_path: PathBuf::from(DEFAULT_TOKEN_PATH),
            period: DEFAULT_POLL_PERIOD,
            pods: RwLock::new(Vec::new()),
            last_signatures: RwLock::new(BTreeSet::new()),
            synced: AtomicBool::new(false),
            notifier: ChangeNotifier::default(),
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = path.into();
        self
    }

    async fn fetch(&self) -> Result<Vec<K8sPod>> {
        let mut req = self.client.get(&self.url);
        if let Ok(token) = tokio::fs::read_to_string(&self.token_path).await {
            req = req.bearer_auth(token.trim());
        }
        let list: PodList = req
            .send()
            .await
            .context("kubelet request failed")?
            .error_for_status()
            .context("kubelet returned an error")?
            .json()
            .await
            .context("decode kubelet pod list")?;
        Ok(list.items)
    }

    /// Install a polled pod list; returns true when listeners were notified
    pub fn apply_poll(&self, pods: Vec<K8sPod>) -> bool {
        let sigs = signatures(&pods);
        *self.pods.write() = pods.into_iter().map(Arc::new).collect();
        let first = !self.synced.swap(true, Ordering::SeqCst);

        let changed = {
            let mut last = self.last_signatures.write();
            let changed = *last != sigs;
            *last = sigs;
            changed
        };
        if first || changed {
            self.notifier.notify();
        }
        first || changed
    }

    pub async fn poll_once(&self) -> Result<bool> {
        let pods = self.fetch().await?;
        Ok(self.apply_poll(pods))
    }
}

#[async_trait]
impl PodSource for KubeletPodSource {
    fn name(&self) -> &str {
        "kubelet"
    }

    fn list_pods(&self) -> Vec<Arc<K8sPod>> {
        self.pods.read().clone()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(url = %self.url, period_secs = self.period.as_secs(), "Kubelet pod polling started");
        let mut ticker = tokio::time::interval(self.period);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Kubelet pod polling shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(changed) => debug!(changed, "kubelet poll"),
                        Err(e) => warn!(error = %e, "kubelet poll failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{k8s_pod, with_container_status};

    #[test]
    fn test_notifies_on_first_poll_and_changes_only() {
        let source = KubeletPodSource::new("127.0.0.1", 10250).unwrap();
        let pod = with_container_status(k8s_pod("app", "web-1", "U1", "Running"), "docker://c1", "2024-01-01T00:00:00Z");

        assert!(source.apply_poll(vec![pod.clone()]));
        assert!(source.has_synced());
        assert!(!source.apply_poll(vec![pod.clone()]));

        // Restart: new container id and start time
        let restarted = with_container_status(k8s_pod("app", "web-1", "U1", "Running"), "docker://c2", "2024-01-01T00:05:00Z");
        assert!(source.apply_poll(vec![restarted]));

        assert!(source.apply_poll(Vec::new()));
        assert!(source.list_pods().is_empty());
    }

    #[test]
    fn test_phase_change_is_a_change() {
        let source = KubeletPodSource::new("127.0.0.1", 10250).unwrap();
        source.apply_poll(vec![k8s_pod("app", "job", "U9", "Running")]);

        assert!(source.apply_poll(vec![k8s_pod("app", "job", "U9", "Succeeded")]));
    }
}
