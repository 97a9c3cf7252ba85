//! Meta store: the reconciled pod/container graph of the local node
//!
//! Readers get lock-free snapshots; a single reconciler rebuilds the graph
//! from the pod source and the container engine and swaps it in whole.

pub mod classify;
pub mod graph;
pub mod kubelet;
pub mod source;

use crate::engine::wrap::is_zombie_reaper;
use crate::engine::{ContainerEngine, EngineDetailContainer};
use crate::error::{CriError, Result};
use crate::health::Condition;
use crate::helper::HelperInjector;
use crate::models::{
    is_active_phase, short_id, sort_mounts, Container, ContainerRole, Pod,
};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::path;
use crate::timezone::resolve_timezone;
use crate::util::backoff::Backoff;
use crate::util::timer::{AlignedTicker, ThrottleFirst};
use classify::{init_container_names, RoleClassifier};
use futures::StreamExt;
use graph::PodGraph;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use parking_lot::{Mutex, RwLock};
use source::PodSource;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const DETAIL_CONCURRENCY: usize = 16;

#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub hostfs: PathBuf,
    /// Per-call deadline of container detail lookups
    pub detail_timeout: Duration,
    pub period: Duration,
    pub offset: Duration,
    /// Minimum spacing of event-triggered reconciles
    pub throttle: Duration,
    pub classifier: RoleClassifier,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            hostfs: PathBuf::from("/"),
            detail_timeout: Duration::from_secs(3),
            period: Duration::from_secs(60),
            offset: Duration::from_secs(40),
            throttle: Duration::from_secs(1),
            classifier: RoleClassifier::default(),
        }
    }
}

/// Pod keys touched by one reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl MetaChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    fn between(prior: &PodGraph, next: &PodGraph) -> Self {
        let mut change = MetaChange::default();
        for pod in next.pods() {
            match prior.get_pod_by_uid(&pod.uid) {
                None => change.added.push(pod.key()),
                Some(old) if !Arc::ptr_eq(old, pod) => change.updated.push(pod.key()),
                Some(_) => {}
            }
        }
        for pod in prior.pods() {
            if next.get_pod_by_uid(&pod.uid).is_none() {
                change.removed.push(pod.key());
            }
        }
        change.added.sort();
        change.removed.sort();
        change.updated.sort();
        change
    }
}

/// Notified after each reconcile that changed the graph
pub trait MetaListener: Send + Sync {
    fn on_change(&self, change: &MetaChange, graph: &Arc<PodGraph>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Namespaces whose containers never get the helper
fn needs_helper(namespace: &str) -> bool {
    !namespace.starts_with("kube-")
}

/// A cached record may be kept when the process and its placement are unchanged
fn reusable(old: &Container, detail: &EngineDetailContainer, role: ContainerRole) -> bool {
    old.state.pid == detail.state.pid
        && old.state.started_at == detail.state.started_at
        && old.sandbox_id == detail.sandbox_id
        && old.role == role
        && (old.hacked || role != ContainerRole::Biz || !needs_helper(&old.namespace))
}

struct Inner {
    config: MetaConfig,
    source: Arc<dyn PodSource>,
    engine: Arc<dyn ContainerEngine>,
    injector: Arc<dyn HelperInjector>,
    graph: RwLock<Arc<PodGraph>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn MetaListener>)>>,
    next_listener: AtomicU64,
    ready: AtomicBool,
    condition: Condition,
    engine_condition: Condition,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

#[derive(Clone)]
pub struct MetaStore {
    inner: Arc<Inner>,
}

impl MetaStore {
    pub fn new(
        config: MetaConfig,
        source: Arc<dyn PodSource>,
        engine: Arc<dyn ContainerEngine>,
        injector: Arc<dyn HelperInjector>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                engine,
                injector,
                graph: RwLock::new(Arc::new(PodGraph::default())),
                reconcile_lock: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                ready: AtomicBool::new(false),
                condition: Condition::new(),
                engine_condition: Condition::new(),
                logger,
                metrics: AgentMetrics::new(),
            }),
        }
    }

    /// Current graph; stays valid while the caller holds it
    pub fn snapshot(&self) -> Arc<PodGraph> {
        self.inner.graph.read().clone()
    }

    /// A graph has been installed at least once
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Reconcile outcome; unhealthy after repeated failures
    pub fn condition(&self) -> &Condition {
        &self.inner.condition
    }

    /// Container listing outcome
    pub fn engine_condition(&self) -> &Condition {
        &self.inner.engine_condition
    }

    pub fn source_name(&self) -> &str {
        self.inner.source.name()
    }

    pub fn get_all_pods(&self) -> Vec<Arc<Pod>> {
        self.snapshot().pods().to_vec()
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.snapshot().get_pod(namespace, name).cloned()
    }

    pub fn get_pod_by_sandbox_id(&self, sandbox_id: &str) -> Option<Arc<Pod>> {
        self.snapshot().get_pod_by_sandbox_id(sandbox_id).cloned()
    }

    pub fn get_pod_by_hostname(&self, hostname: &str) -> Option<Arc<Pod>> {
        self.snapshot().get_pod_by_hostname(hostname).cloned()
    }

    pub fn get_pod_by_ip(&self, ip: &str) -> Option<Arc<Pod>> {
        self.snapshot().get_pod_by_ip(ip).cloned()
    }

    /// Look up a container by full or short id
    pub fn get_container_by_cid(&self, cid: &str) -> Option<Arc<Container>> {
        self.snapshot().get_container_by_cid(cid).cloned()
    }

    pub fn pod_of(&self, container: &Container) -> Option<Arc<Pod>> {
        self.snapshot().pod_of(container).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn MetaListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Rebuild the graph and install it
    ///
    /// On error the previous graph stays in place.
    pub async fn reconcile(&self) -> Result<MetaChange> {
        let _guard = self.inner.reconcile_lock.lock().await;
        let start = Instant::now();

        let result = self.build_graph().await;
        let next = match result {
            Ok(next) => Arc::new(next),
            Err(e) => {
                self.inner.metrics.inc_reconcile_errors();
                self.inner
                    .condition
                    .failure(format!("reconcile failed, keeping previous graph: {e}"));
                return Err(e);
            }
        };
        self.inner.condition.ok();

        let prior = self.snapshot();
        let change = MetaChange::between(&prior, &next);
        *self.inner.graph.write() = next.clone();
        self.inner.ready.store(true, Ordering::SeqCst);

        let elapsed = start.elapsed();
        self.inner
            .metrics
            .observe_reconcile(elapsed, next.len(), next.container_count());
        self.inner.logger.log_reconcile(
            next.len(),
            next.container_count(),
            change.added.len(),
            change.removed.len(),
            change.updated.len(),
            elapsed,
        );

        if !change.is_empty() {
            let listeners: Vec<_> = self
                .inner
                .listeners
                .lock()
                .iter()
                .map(|(_, l)| l.clone())
                .collect();
            for listener in listeners {
                listener.on_change(&change, &next);
            }
        }
        Ok(change)
    }

    async fn fetch_details(&self) -> Result<HashMap<String, Vec<EngineDetailContainer>>> {
        let engine = &self.inner.engine;
        let timeout = self.inner.config.detail_timeout;
        let listed = match engine.list_all_containers().await {
            Ok(listed) => {
                self.inner.engine_condition.ok();
                listed
            }
            Err(e) => {
                self.inner
                    .engine_condition
                    .failure(format!("list containers: {e}"));
                return Err(e);
            }
        };

        let mut details = futures::stream::iter(
            listed.into_iter().filter(|c| c.pod_uid().is_some()),
        )
        .map(|c| async move {
            let detail = match tokio::time::timeout(timeout, engine.get_container_detail(&c.id)).await {
                Ok(result) => result,
                Err(_) => Err(CriError::Timeout(timeout)),
            };
            (c.id, detail)
        })
        .buffer_unordered(DETAIL_CONCURRENCY);

        let mut by_pod: HashMap<String, Vec<EngineDetailContainer>> = HashMap::new();
        while let Some((id, detail)) = details.next().await {
            match detail {
                Ok(detail) => {
                    if let Some(uid) = detail.pod_uid() {
                        by_pod.entry(uid.to_string()).or_default().push(detail);
                    }
                }
                Err(e) => warn!(cid = %short_id(&id), error = %e, "skip container, detail lookup failed"),
            }
        }
        Ok(by_pod)
    }

    async fn build_graph(&self) -> Result<PodGraph> {
        let mut by_pod = self.fetch_details().await?;
        let prior = self.snapshot();

        let mut builds = Vec::new();
        for raw in self.inner.source.list_pods() {
            let phase = raw
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("Unknown");
            if !is_active_phase(phase) {
                continue;
            }
            let uid = raw.metadata.uid.clone().unwrap_or_default();
            let details = by_pod.remove(&uid).unwrap_or_default();
            builds.push(self.build_pod(raw, details, &prior));
        }

        let pods = futures::future::join_all(builds).await;
        Ok(PodGraph::build(pods))
    }

    async fn build_pod(
        &self,
        raw: Arc<K8sPod>,
        details: Vec<EngineDetailContainer>,
        prior: &PodGraph,
    ) -> Arc<Pod> {
        let bare = Pod::from_k8s(raw.clone());
        let prior_pod = prior.get_pod_by_uid(&bare.uid);

        let sandboxes: Vec<&EngineDetailContainer> = details
            .iter()
            .filter(|d| d.is_sandbox && d.state.is_running())
            .collect();
        let sandbox = match sandboxes.as_slice() {
            [only] => *only,
            other => {
                warn!(pod = %bare.key(), sandboxes = other.len(), "expected exactly one running sandbox");
                return match prior_pod {
                    Some(pod) => pod.clone(),
                    None => Arc::new(bare),
                };
            }
        };

        let init_names = init_container_names(&raw);
        let mut members: Vec<&EngineDetailContainer> = details
            .iter()
            .filter(|d| !d.is_sandbox && d.state.is_running())
            .filter(|d| d.sandbox_id.is_empty() || d.sandbox_id == sandbox.id)
            .filter(|d| !init_names.contains(d.k8s_container_name()))
            .collect();
        // Details arrive in completion order
        members.sort_by(|a, b| a.id.cmp(&b.id));

        let classifier = &self.inner.config.classifier;
        let biz_count = members
            .iter()
            .filter(|d| classifier.classify(d) == ContainerRole::Biz)
            .count();

        let sandbox_record = self
            .container_record(&bare, sandbox, ContainerRole::Sandbox, false, &sandbox.network_mode, prior)
            .await;

        let mut pod = bare;
        pod.all.push(sandbox_record.clone());
        for detail in members {
            let role = classifier.classify(detail);
            let main_biz = role == ContainerRole::Biz && biz_count == 1;
            let record = self
                .container_record(&pod, detail, role, main_biz, &sandbox_record.network_mode, prior)
                .await;
            match role {
                ContainerRole::Biz => pod.biz.push(record.clone()),
                ContainerRole::Sidecar => pod.sidecar.push(record.clone()),
                ContainerRole::Sandbox => {}
            }
            pod.all.push(record);
        }
        pod.sandbox = Some(sandbox_record);

        // Keep the previous pod object when nothing about it moved
        if let Some(old) = prior_pod {
            let same_raw = Arc::ptr_eq(&old.raw, &pod.raw)
                || (old.raw.metadata.resource_version.is_some()
                    && old.raw.metadata.resource_version == pod.raw.metadata.resource_version);
            let same_containers = old.all.len() == pod.all.len()
                && old.all.iter().zip(&pod.all).all(|(a, b)| Arc::ptr_eq(a, b));
            if same_raw && same_containers {
                return old.clone();
            }
        }
        Arc::new(pod)
    }

    async fn container_record(
        &self,
        pod: &Pod,
        detail: &EngineDetailContainer,
        role: ContainerRole,
        main_biz: bool,
        network_mode: &str,
        prior: &PodGraph,
    ) -> Arc<Container> {
        if let Some(old) = prior
            .get_container_by_cid(&detail.id)
            .filter(|old| reusable(old, detail, role))
        {
            if old.main_biz == main_biz && old.network_mode == network_mode {
                return old.clone();
            }
            let mut updated = Container::clone(old);
            updated.main_biz = main_biz;
            updated.network_mode = network_mode.to_string();
            return Arc::new(updated);
        }

        let mut container = self.fresh_container(pod, detail, role, main_biz, network_mode).await;
        if role == ContainerRole::Biz && needs_helper(&container.namespace) {
            // Failure leaves the record unhacked; the next reconcile retries
            if self.inner.injector.inject(&container).await.is_ok() {
                container.hacked = true;
            }
        }
        Arc::new(container)
    }

    async fn fresh_container(
        &self,
        pod: &Pod,
        detail: &EngineDetailContainer,
        role: ContainerRole,
        main_biz: bool,
        network_mode: &str,
    ) -> Container {
        let mut mounts = detail.mounts.clone();
        sort_mounts(&mut mounts);

        let hostname = if detail.hostname.is_empty() {
            pod.hostname().unwrap_or_default().to_string()
        } else {
            detail.hostname.clone()
        };

        let mut container = Container {
            id: detail.id.clone(),
            short_id: short_id(&detail.id).to_string(),
            name: detail.k8s_container_name().to_string(),
            pod_uid: pod.uid.clone(),
            namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            state: detail.state.clone(),
            runtime: detail.runtime.clone(),
            log_path: detail.log_path.clone(),
            env: detail.env.clone(),
            labels: detail.labels.clone(),
            hostname,
            merged_dir: detail.merged_dir.clone(),
            mounts,
            sandbox_id: detail.sandbox_id.clone(),
            network_mode: network_mode.to_string(),
            role,
            main_biz,
            timezone: Default::default(),
            hacked: false,
            reaps_zombies: false,
        };

        if role != ContainerRole::Sandbox {
            let now = chrono::Utc::now().timestamp();
            let timezone = resolve_timezone(
                container.env.get("TZ").map(String::as_str),
                now,
                |p, follow| path::translate(&container, p, follow).ok(),
            );
            container.timezone = timezone;
            container.reaps_zombies = self.pid1_reaps_zombies(detail.state.pid).await;
        }
        debug!(cid = %container.short_id, pod = %container.pod_key(), role = ?role, "built container record");
        container
    }

    async fn pid1_reaps_zombies(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        let comm = self
            .inner
            .config
            .hostfs
            .join("proc")
            .join(pid.to_string())
            .join("comm");
        tokio::fs::read_to_string(comm)
            .await
            .map(|c| is_zombie_reaper(&c))
            .unwrap_or(false)
    }

    /// Wait until the pod source finished its initial listing
    pub async fn wait_for_sync(&self) {
        let mut backoff = Backoff::sync_wait();
        while !self.inner.source.has_synced() {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Reconcile on pod source changes and on an aligned timer until shutdown
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = self.wait_for_sync() => {}
        }
        info!(source = %self.inner.source.name(), "Pod source synced, starting meta store");
        self.reconcile_logged().await;

        let mut changes = self.inner.source.subscribe();
        let mut source_open = true;
        let mut throttle = ThrottleFirst::new(self.inner.config.throttle);
        let mut ticker = AlignedTicker::new(self.inner.config.period, self.inner.config.offset);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Meta store shutting down");
                    return;
                }
                changed = changes.changed(), if source_open => {
                    if changed.is_err() {
                        warn!("Pod source closed its change channel");
                        source_open = false;
                        continue;
                    }
                    if throttle.allow() {
                        self.reconcile_logged().await;
                    }
                }
                _ = ticker.tick() => {
                    self.reconcile_logged().await;
                }
            }
        }
    }

    async fn reconcile_logged(&self) {
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "Reconcile failed, keeping previous graph");
        }
    }
}

/// Keys of every pod in the graph
pub fn pod_keys(graph: &PodGraph) -> BTreeSet<String> {
    graph.pods().iter().map(|p| p.key()).collect()
}
