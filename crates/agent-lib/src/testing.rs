//! Builders and in-memory fakes for tests
//!
//! Enabled for this crate's unit tests and, through the `testing` feature,
//! for the agent's integration tests.

use crate::engine::{
    labels, AsyncExec, BoxReader, BoxWriter, ContainerEngine, EngineDetailContainer,
    EngineEvent, EngineSimpleContainer, EventFilter, EventStream, Feature,
};
use crate::error::{CriError, Result};
use crate::helper::HelperInjector;
use crate::meta::source::{ChangeNotifier, PodSource};
use crate::models::{
    short_id, sort_mounts, Container, ContainerRole, ContainerState, ExecRequest, ExecResult,
    MountPoint, Pod, RUNTIME_RUNC,
};
use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{
    ContainerState as K8sContainerState, ContainerStateRunning, ContainerStatus,
    Pod as K8sPod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub const STARTED_AT: &str = "2024-01-01T00:00:00Z";

/// Builds a [`Container`] with running state and runc runtime by default
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    container: Container,
}

impl ContainerBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            container: Container {
                id: id.to_string(),
                short_id: short_id(id).to_string(),
                name: id.to_string(),
                pod_uid: String::new(),
                namespace: "default".to_string(),
                pod_name: String::new(),
                state: ContainerState {
                    pid: 1,
                    started_at: STARTED_AT.to_string(),
                    status: "running".to_string(),
                },
                runtime: RUNTIME_RUNC.to_string(),
                log_path: String::new(),
                env: BTreeMap::new(),
                labels: BTreeMap::new(),
                hostname: String::new(),
                merged_dir: String::new(),
                mounts: Vec::new(),
                sandbox_id: String::new(),
                network_mode: String::new(),
                role: ContainerRole::Biz,
                main_biz: false,
                timezone: Default::default(),
                hacked: false,
                reaps_zombies: false,
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.container.name = name.to_string();
        self
    }

    pub fn sandbox(mut self) -> Self {
        self.container.role = ContainerRole::Sandbox;
        self
    }

    pub fn sidecar(mut self) -> Self {
        self.container.role = ContainerRole::Sidecar;
        self
    }

    pub fn pod(mut self, namespace: &str, name: &str, uid: &str) -> Self {
        self.container.namespace = namespace.to_string();
        self.container.pod_name = name.to_string();
        self.container.pod_uid = uid.to_string();
        self
    }

    pub fn merged_dir(mut self, dir: &str) -> Self {
        self.container.merged_dir = dir.to_string();
        self
    }

    pub fn mount(mut self, source: &str, destination: &str, rw: bool) -> Self {
        self.container.mounts.push(MountPoint {
            source: source.to_string(),
            destination: destination.to_string(),
            rw,
        });
        sort_mounts(&mut self.container.mounts);
        self
    }

    pub fn hacked(mut self, hacked: bool) -> Self {
        self.container.hacked = hacked;
        self
    }

    pub fn reaps_zombies(mut self, reaps: bool) -> Self {
        self.container.reaps_zombies = reaps;
        self
    }

    pub fn pid(mut self, pid: i32) -> Self {
        self.container.state.pid = pid;
        self
    }

    pub fn started_at(mut self, started_at: &str) -> Self {
        self.container.state.started_at = started_at.to_string();
        self
    }

    pub fn runtime(mut self, runtime: &str) -> Self {
        self.container.runtime = runtime.to_string();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.container.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Container {
        self.container
    }
}

/// A Kubernetes pod with the given identity and phase
pub fn k8s_pod(namespace: &str, name: &str, uid: &str, phase: &str) -> K8sPod {
    K8sPod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-1".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Append a running container status to `pod`
pub fn with_container_status(mut pod: K8sPod, container_id: &str, started_at: &str) -> K8sPod {
    let started = chrono::DateTime::parse_from_rfc3339(started_at)
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_default();
    let status = pod.status.get_or_insert_with(Default::default);
    let statuses = status.container_statuses.get_or_insert_with(Vec::new);
    statuses.push(ContainerStatus {
        name: format!("c{}", statuses.len()),
        container_id: Some(container_id.to_string()),
        ready: true,
        state: Some(K8sContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(Time(started)),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
    pod
}

/// Builds a [`Pod`] around [`k8s_pod`]
#[derive(Debug, Clone)]
pub struct PodBuilder {
    raw: K8sPod,
    containers: Vec<Container>,
}

impl PodBuilder {
    pub fn new(namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            raw: k8s_pod(namespace, name, uid, "Pending"),
            containers: Vec::new(),
        }
    }

    fn status(&mut self) -> &mut PodStatus {
        self.raw.status.get_or_insert_with(Default::default)
    }

    fn spec(&mut self) -> &mut PodSpec {
        self.raw.spec.get_or_insert_with(Default::default)
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.status().pod_ip = Some(ip.to_string());
        self
    }

    pub fn host_ip(mut self, ip: &str) -> Self {
        self.status().host_ip = Some(ip.to_string());
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.status().phase = Some(phase.to_string());
        self
    }

    pub fn running(self) -> Self {
        self.phase("Running")
    }

    pub fn host_network(mut self) -> Self {
        self.spec().host_network = Some(true);
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.spec().hostname = Some(hostname.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.raw
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn sandbox(mut self, mut c: Container) -> Self {
        c.role = ContainerRole::Sandbox;
        self.containers.push(c);
        self
    }

    pub fn biz(mut self, mut c: Container) -> Self {
        c.role = ContainerRole::Biz;
        self.containers.push(c);
        self
    }

    pub fn sidecar(mut self, mut c: Container) -> Self {
        c.role = ContainerRole::Sidecar;
        self.containers.push(c);
        self
    }

    pub fn build(self) -> Pod {
        let mut pod = Pod::from_k8s(Arc::new(self.raw));
        let biz_count = self
            .containers
            .iter()
            .filter(|c| c.role == ContainerRole::Biz)
            .count();
        for mut c in self.containers {
            c.pod_uid = pod.uid.clone();
            c.namespace = pod.namespace.clone();
            c.pod_name = pod.name.clone();
            c.main_biz = c.role == ContainerRole::Biz && biz_count == 1;
            let c = Arc::new(c);
            match c.role {
                ContainerRole::Sandbox => pod.sandbox = Some(c.clone()),
                ContainerRole::Biz => pod.biz.push(c.clone()),
                ContainerRole::Sidecar => pod.sidecar.push(c.clone()),
            }
            pod.all.push(c);
        }
        pod
    }
}

/// Builds an engine-side container detail
#[derive(Debug, Clone)]
pub struct DetailBuilder {
    detail: EngineDetailContainer,
}

/// Running container of pod `uid`; `sandbox_id` empty for a sandbox itself
pub fn detail(id: &str, name: &str, uid: &str, sandbox_id: &str) -> DetailBuilder {
    let mut labels_map = BTreeMap::new();
    labels_map.insert(labels::POD_UID.to_string(), uid.to_string());
    labels_map.insert(labels::CONTAINER_NAME.to_string(), name.to_string());
    DetailBuilder {
        detail: EngineDetailContainer {
            id: id.to_string(),
            name: format!("k8s_{name}_{uid}"),
            labels: labels_map,
            sandbox_id: sandbox_id.to_string(),
            runtime: RUNTIME_RUNC.to_string(),
            network_mode: "bridge".to_string(),
            state: ContainerState {
                pid: 1,
                started_at: STARTED_AT.to_string(),
                status: "running".to_string(),
            },
            ..Default::default()
        },
    }
}

impl DetailBuilder {
    pub fn sandbox(mut self) -> Self {
        self.detail.is_sandbox = true;
        self.detail.labels.insert(
            labels::CONTAINER_TYPE.to_string(),
            labels::TYPE_SANDBOX.to_string(),
        );
        self
    }

    pub fn pid(mut self, pid: i32) -> Self {
        self.detail.state.pid = pid;
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.detail.state.status = status.to_string();
        self
    }

    pub fn runtime(mut self, runtime: &str) -> Self {
        self.detail.runtime = runtime.to_string();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.detail.env.insert(key.to_string(), value.to_string());
        self
    }
}

impl From<DetailBuilder> for EngineDetailContainer {
    fn from(b: DetailBuilder) -> Self {
        b.detail
    }
}

type ExecHandler = dyn Fn(&str, &ExecRequest) -> ExecResult + Send + Sync;

/// Copies observed by [`FakeEngine`]: container id, in-container path, local path
pub type CopyLog = Arc<Mutex<Vec<(String, String, PathBuf)>>>;

/// In-memory container engine
///
/// Without an exec handler, `exec_async` behaves as an echo: whatever is
/// written to stdin comes back on stdout. With a relay address it instead
/// pipes stdio to that TCP endpoint, like the helper's proxy commands do.
pub struct FakeEngine {
    containers: RwLock<Vec<EngineDetailContainer>>,
    copy: bool,
    copies: CopyLog,
    exec: Option<Box<ExecHandler>>,
    exec_delay: Option<std::time::Duration>,
    exec_relay: Option<std::net::SocketAddr>,
    fail_list: AtomicBool,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            containers: RwLock::new(Vec::new()),
            copy: false,
            copies: Arc::new(Mutex::new(Vec::new())),
            exec: None,
            exec_delay: None,
            exec_relay: None,
            fail_list: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    pub fn on_exec<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &ExecRequest) -> ExecResult + Send + Sync + 'static,
    {
        self.exec = Some(Box::new(handler));
        self
    }

    /// Make every buffered exec take `delay` before answering
    pub fn with_exec_delay(mut self, delay: std::time::Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Make every streaming exec a byte relay to `addr`
    pub fn with_exec_relay(mut self, addr: std::net::SocketAddr) -> Self {
        self.exec_relay = Some(addr);
        self
    }

    pub fn copies(&self) -> CopyLog {
        self.copies.clone()
    }

    pub fn set<I, D>(&self, containers: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<EngineDetailContainer>,
    {
        *self.containers.write() = containers.into_iter().map(Into::into).collect();
    }

    pub fn push(&self, container: impl Into<EngineDetailContainer>) {
        self.containers.write().push(container.into());
    }

    pub fn remove(&self, id: &str) {
        self.containers.write().retain(|c| c.id != id);
    }

    pub fn update(&self, id: &str, f: impl FnOnce(&mut EngineDetailContainer)) {
        if let Some(c) = self.containers.write().iter_mut().find(|c| c.id == id) {
            f(c);
        }
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event to current subscribers; returns how many received it
    pub fn emit(&self, id: &str, action: &str) -> usize {
        let event = EngineEvent {
            id: id.to_string(),
            action: action.to_string(),
            raw: serde_json::Value::Null,
        };
        self.events.send(event).unwrap_or(0)
    }

    pub fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    fn echo() -> AsyncExec {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, client_w) = tokio::io::split(client);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        AsyncExec::new(
            Some(Box::new(client_w) as BoxWriter),
            Box::new(client_r) as BoxReader,
            None,
            async { Ok(0) }.boxed(),
        )
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn engine_type(&self) -> &str {
        "fake"
    }

    async fn list_all_containers(&self) -> Result<Vec<EngineSimpleContainer>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(CriError::Transient("engine unavailable".into()));
        }
        Ok(self
            .containers
            .read()
            .iter()
            .map(|c| EngineSimpleContainer {
                id: c.id.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn get_container_detail(&self, id: &str) -> Result<EngineDetailContainer> {
        self.containers
            .read()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| CriError::NotFound(format!("container {id}")))
    }

    async fn exec(&self, id: &str, req: &ExecRequest) -> Result<ExecResult> {
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.exec {
            Some(handler) => Ok(handler(id, req)),
            None => Ok(ExecResult::default()),
        }
    }

    async fn exec_async(&self, id: &str, req: &ExecRequest) -> Result<AsyncExec> {
        if let Some(addr) = self.exec_relay {
            let (r, w) = tokio::net::TcpStream::connect(addr).await?.into_split();
            return Ok(AsyncExec::new(
                Some(Box::new(w) as BoxWriter),
                Box::new(r) as BoxReader,
                None,
                async { Ok(0) }.boxed(),
            ));
        }
        let Some(handler) = &self.exec else {
            return Ok(Self::echo());
        };
        let result = handler(id, req);
        let code = result.exit_code;
        Ok(AsyncExec::new(
            Some(Box::new(tokio::io::sink()) as BoxWriter),
            Box::new(Cursor::new(result.stdout)) as BoxReader,
            Some(Box::new(Cursor::new(result.stderr)) as BoxReader),
            async move { Ok(code) }.boxed(),
        ))
    }

    async fn copy_to_container(&self, id: &str, src: &Path, dst: &str) -> Result<()> {
        self.copies
            .lock()
            .push((id.to_string(), dst.to_string(), src.to_path_buf()));
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, src: &str, dst: &Path) -> Result<()> {
        self.copies
            .lock()
            .push((id.to_string(), src.to_string(), dst.to_path_buf()));
        tokio::fs::write(dst, src.as_bytes()).await?;
        Ok(())
    }

    async fn events(&self, filter: &EventFilter) -> Result<EventStream> {
        let rx = self.events.subscribe();
        let filter = filter.clone();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let filter = filter.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if filter.matches(&event.action) => return Some((Ok(event), rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Copy => self.copy,
        }
    }
}

/// Pod source holding a fixed list
pub struct StaticPodSource {
    pods: RwLock<Vec<Arc<K8sPod>>>,
    synced: AtomicBool,
    notifier: ChangeNotifier,
}

impl Default for StaticPodSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticPodSource {
    pub fn new() -> Self {
        Self {
            pods: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
            notifier: ChangeNotifier::default(),
        }
    }

    pub fn set(&self, pods: Vec<K8sPod>) {
        *self.pods.write() = pods.into_iter().map(Arc::new).collect();
        self.notifier.notify();
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
        self.notifier.notify();
    }
}

#[async_trait]
impl PodSource for StaticPodSource {
    fn name(&self) -> &str {
        "static"
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
        let _ = shutdown.recv().await;
    }
}

/// Injector that records targets instead of copying
#[derive(Default)]
pub struct FakeInjector {
    injected: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeInjector {
    pub fn injected(&self) -> Vec<String> {
        self.injected.lock().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HelperInjector for FakeInjector {
    async fn inject(&self, container: &Container) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CriError::Transient("copy failed".into()));
        }
        self.injected.lock().push(container.short_id.clone());
        Ok(())
    }
}
