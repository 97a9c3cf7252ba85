//! Sources of the local node's pods
//!
//! The meta store only needs a snapshot, a sync flag and a change signal;
//! [`InformerPodSource`] watches the API server and
//! [`super::kubelet::KubeletPodSource`] polls the kubelet when the API server
//! is not an option.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PodSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current pods of the local node
    fn list_pods(&self) -> Vec<Arc<K8sPod>>;

    /// The initial listing has completed
    fn has_synced(&self) -> bool;

    /// Receiver whose value changes whenever the pod set changes
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Keep the source up to date until shutdown
    async fn run(&self, shutdown: broadcast::Receiver<()>);
}

/// Monotonic change counter behind [`PodSource::subscribe`]
#[derive(Debug)]
pub struct ChangeNotifier {
    tx: watch::Sender<u64>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }
}

impl ChangeNotifier {
    pub fn notify(&self) {
        self.tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

pub fn pod_uid(pod: &K8sPod) -> String {
    pod.metadata.uid.clone().unwrap_or_default()
}

/// Field selector restricting a pod watch to one node
pub fn node_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name}")
}

/// Pod source backed by an API server watch on `spec.nodeName`
pub struct InformerPodSource {
    client: Option<Client>,
    node_name: String,
    pods: RwLock<HashMap<String, Arc<K8sPod>>>,
    synced: AtomicBool,
    notifier: ChangeNotifier,
}

impl InformerPodSource {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self::with_client(Some(client), node_name.into())
    }

    fn with_client(client: Option<Client>, node_name: String) -> Self {
        Self {
            client,
            node_name,
            pods: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
            notifier: ChangeNotifier::default(),
        }
    }

    /// Apply one watch event; `relist` collects pods between Init and InitDone
    pub fn handle_event(&self, event: Event<K8sPod>, relist: &mut Option<HashMap<String, Arc<K8sPod>>>) {
        match event {
            Event::Init => {
                debug!(node = %self.node_name, "pod watch init");
                *relist = Some(HashMap::new());
            }
            Event::InitApply(pod) => {
                let buffer = relist.get_or_insert_with(HashMap::new);
                buffer.insert(pod_uid(&pod), Arc::new(pod));
            }
            Event::InitDone => {
                let pods = relist.take().unwrap_or_default();
                info!(node = %self.node_name, pods = pods.len(), "pod watch synced");
                *self.pods.write() = pods;
                self.synced.store(true, Ordering::SeqCst);
                self.notifier.notify();
            }
            Event::Apply(pod) => {
                self.pods.write().insert(pod_uid(&pod), Arc::new(pod));
                self.notifier.notify();
            }
            Event::Delete(pod) => {
                self.pods.write().remove(&pod_uid(&pod));
                self.notifier.notify();
            }
        }
    }
}

#[async_trait]
impl PodSource for InformerPodSource {
    fn name(&self) -> &str {
        "informer"
    }

    fn list_pods(&self) -> Vec<Arc<K8sPod>> {
        self.pods.read().values().cloned().collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let api: Api<K8sPod> = Api::all(client);

        loop {
            let config = watcher::Config::default().fields(&node_selector(&self.node_name));
            let stream = watcher::watcher(api.clone(), config);
            tokio::pin!(stream);
            let mut relist = None;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Pod informer shutting down");
                        return;
                    }
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.handle_event(event, &mut relist),
                        Some(Err(e)) => {
                            warn!(error = %e, "Pod watch error, reconnecting");
                            break;
                        }
                        None => {
                            info!("Pod watch stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::k8s_pod;

    fn source() -> InformerPodSource {
        InformerPodSource::with_client(None, "node-1".to_string())
    }

    #[test]
    fn test_synced_after_init_done() {
        let source = source();
        let mut rx = source.subscribe();
        let mut relist = None;

        source.handle_event(Event::Init, &mut relist);
        source.handle_event(Event::InitApply(k8s_pod("app", "web-1", "U1", "Running")), &mut relist);
        assert!(!source.has_synced());
        assert!(source.list_pods().is_empty());

        source.handle_event(Event::InitDone, &mut relist);
        assert!(source.has_synced());
        assert_eq!(source.list_pods().len(), 1);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        source.handle_event(Event::Delete(k8s_pod("app", "web-1", "U1", "Running")), &mut relist);
        assert!(source.list_pods().is_empty());
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_relist_replaces_stale_pods() {
        let source = source();
        let mut relist = None;
        source.handle_event(Event::Apply(k8s_pod("app", "old", "U0", "Running")), &mut relist);

        source.handle_event(Event::Init, &mut relist);
        source.handle_event(Event::InitApply(k8s_pod("app", "new", "U1", "Running")), &mut relist);
        source.handle_event(Event::InitDone, &mut relist);

        let names: Vec<String> = source
            .list_pods()
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["new"]);
    }

    #[test]
    fn test_node_selector() {
        assert_eq!(node_selector("node-1"), "spec.nodeName=node-1");
    }
}
