//! Core data models: the pod/container graph and exec payloads

use crate::error::{CriError, Result};
use crate::timezone::TimezoneDescriptor;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runtime name of the OCI runtime whose rootfs is visible from the host
pub const RUNTIME_RUNC: &str = "runc";

/// Length of the short container id
pub const SHORT_ID_LEN: usize = 12;

pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

/// Runtime state of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub pid: i32,
    pub started_at: String,
    pub status: String,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// A read-write mount of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    /// Host path, already prefixed by hostfs
    pub source: String,
    /// Path inside the container
    pub destination: String,
    pub rw: bool,
}

/// Sort mounts so prefix searches see the most specific destination first
pub fn sort_mounts(mounts: &mut [MountPoint]) {
    mounts.sort_by(|a, b| {
        b.destination
            .len()
            .cmp(&a.destination.len())
            .then_with(|| a.destination.cmp(&b.destination))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRole {
    Sandbox,
    Sidecar,
    Biz,
}

/// A container as seen by the meta store
///
/// Records are immutable once installed in a snapshot; a changed container
/// is replaced by a new record. The owning pod is referenced by uid and
/// resolved through the snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub short_id: String,
    /// Kubernetes container name
    pub name: String,
    pub pod_uid: String,
    pub namespace: String,
    pub pod_name: String,
    pub state: ContainerState,
    pub runtime: String,
    pub log_path: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub hostname: String,
    pub merged_dir: String,
    pub mounts: Vec<MountPoint>,
    pub sandbox_id: String,
    pub network_mode: String,
    pub role: ContainerRole,
    pub main_biz: bool,
    pub timezone: TimezoneDescriptor,
    /// Helper binary has been copied into the container
    pub hacked: bool,
    /// `comm` of pid 1 reaps zombie children
    pub reaps_zombies: bool,
}

impl Container {
    pub fn is_sandbox(&self) -> bool {
        self.role == ContainerRole::Sandbox
    }

    pub fn is_runc(&self) -> bool {
        self.runtime == RUNTIME_RUNC
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn pod_key(&self) -> String {
        format!("{}/{}", self.namespace, self.pod_name)
    }

    /// Common tags attached to per-container metrics
    pub fn common_tags(&self, pod: Option<&Pod>) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("namespace".to_string(), self.namespace.clone());
        tags.insert("pod".to_string(), self.pod_name.clone());
        tags.insert("container".to_string(), self.name.clone());
        tags.insert("hostname".to_string(), self.hostname.clone());
        if let Some(pod) = pod {
            tags.insert("app".to_string(), pod.app().unwrap_or_default().to_string());
            tags.insert("ip".to_string(), pod.ip().unwrap_or_default().to_string());
            tags.insert(
                "hostIP".to_string(),
                pod.host_ip().unwrap_or_default().to_string(),
            );
        }
        tags
    }
}

/// A local pod with its containers grouped by role
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    #[serde(rename = "pod")]
    pub raw: Arc<K8sPod>,
    pub all: Vec<Arc<Container>>,
    pub biz: Vec<Arc<Container>>,
    pub sidecar: Vec<Arc<Container>>,
    pub sandbox: Option<Arc<Container>>,
}

impl Pod {
    /// Wrap a Kubernetes pod with no containers attached yet
    pub fn from_k8s(raw: Arc<K8sPod>) -> Self {
        let meta = &raw.metadata;
        Self {
            uid: meta.uid.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            raw,
            all: Vec::new(),
            biz: Vec::new(),
            sidecar: Vec::new(),
            sandbox: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn app(&self) -> Option<&str> {
        self.raw
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("app").or_else(|| l.get("app.kubernetes.io/name")))
            .map(String::as_str)
    }

    pub fn ip(&self) -> Option<&str> {
        self.raw.status.as_ref().and_then(|s| s.pod_ip.as_deref())
    }

    pub fn host_ip(&self) -> Option<&str> {
        self.raw.status.as_ref().and_then(|s| s.host_ip.as_deref())
    }

    pub fn hostname(&self) -> Option<&str> {
        if let Some(h) = self.raw.spec.as_ref().and_then(|s| s.hostname.as_deref()) {
            return Some(h);
        }
        self.sandbox
            .as_ref()
            .map(|s| s.hostname.as_str())
            .filter(|h| !h.is_empty())
            .or(Some(self.name.as_str()))
    }

    pub fn phase(&self) -> &str {
        self.raw
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown")
    }

    pub fn is_running(&self) -> bool {
        self.phase() == "Running"
    }

    pub fn uses_host_network(&self) -> bool {
        self.raw
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false)
    }

    /// The single biz container
    pub fn main_biz(&self) -> Result<&Arc<Container>> {
        match self.biz.as_slice() {
            [only] => Ok(only),
            [] => Err(CriError::NotFound(format!("biz container of pod {}", self.key()))),
            many => Err(CriError::AmbiguousTarget(format!(
                "pod {} has {} biz containers",
                self.key(),
                many.len()
            ))),
        }
    }

    pub fn container_by_name(&self, name: &str) -> Option<&Arc<Container>> {
        self.all.iter().find(|c| c.name == name)
    }
}

/// Phases whose pods take part in reconciliation
pub fn is_active_phase(phase: &str) -> bool {
    matches!(phase, "Running" | "Pending" | "Unknown")
}

/// A command to run inside a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(skip)]
    pub input: Option<Vec<u8>>,
    /// Overrides the service default
    #[serde(skip)]
    pub timeout: Option<std::time::Duration>,
}

impl ExecRequest {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
