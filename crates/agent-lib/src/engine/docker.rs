//! Docker Engine API adapter built on bollard
//!
//! Pouch exposes the same API surface, so one client serves both flavors;
//! only the socket and the copy capability differ.

use super::{
    labels, AsyncExec, BoxReader, BoxWriter, ContainerEngine, EngineDetailContainer, EngineEvent,
    EngineSimpleContainer, EventFilter, EventStream, Feature,
};
use crate::error::{CriError, Result};
use crate::models::{sort_mounts, ContainerState, ExecRequest, MountPoint};
use async_trait::async_trait;
use bollard::container::{
    DownloadFromContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const STREAM_BUFFER: usize = 64 * 1024;

/// Seconds bollard waits on a single engine request
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFlavor {
    Docker,
    Pouch,
}

impl EngineFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            EngineFlavor::Docker => "docker",
            EngineFlavor::Pouch => "pouch",
        }
    }

    /// Socket path relative to the host root
    pub fn default_socket(&self) -> &'static str {
        match self {
            EngineFlavor::Docker => "/var/run/docker.sock",
            EngineFlavor::Pouch => "/var/run/pouchd.sock",
        }
    }
}

impl std::str::FromStr for EngineFlavor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "docker" => Ok(EngineFlavor::Docker),
            "pouch" => Ok(EngineFlavor::Pouch),
            other => Err(format!("unknown engine flavor: {other}")),
        }
    }
}

/// Prefix a host path with the hostfs mount point
pub fn with_hostfs(hostfs: &Path, path: &str) -> String {
    if path.is_empty() || hostfs == Path::new("/") || hostfs.as_os_str().is_empty() {
        return path.to_string();
    }
    format!(
        "{}/{}",
        hostfs.to_string_lossy().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug)]
struct Inner {
    flavor: EngineFlavor,
    docker: Docker,
    hostfs: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DockerEngine {
    inner: Arc<Inner>,
}

impl DockerEngine {
    /// Client for the engine listening on `socket`; nothing is dialed until the first call
    pub fn new(
        flavor: EngineFlavor,
        socket: impl AsRef<Path>,
        hostfs: impl Into<PathBuf>,
    ) -> Result<Self> {
        let socket = socket.as_ref().to_string_lossy().into_owned();
        let docker = connect(&socket)?;
        Ok(Self {
            inner: Arc::new(Inner {
                flavor,
                docker,
                hostfs: hostfs.into(),
            }),
        })
    }

    /// Engine at its default socket under `hostfs`
    pub fn with_default_socket(flavor: EngineFlavor, hostfs: impl Into<PathBuf>) -> Result<Self> {
        let hostfs = hostfs.into();
        let socket = with_hostfs(&hostfs, flavor.default_socket());
        Self::new(flavor, socket, hostfs)
    }

    pub fn flavor(&self) -> EngineFlavor {
        self.inner.flavor
    }

    fn docker(&self) -> &Docker {
        &self.inner.docker
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i32> {
        let inspect = self.docker().inspect_exec(exec_id).await?;
        Ok(inspect.exit_code.map(|c| c as i32).unwrap_or(-1))
    }

    fn to_detail(&self, c: ContainerInspectResponse) -> EngineDetailContainer {
        let hostfs = &self.inner.hostfs;
        let config = c.config.unwrap_or_default();
        let labels: BTreeMap<String, String> = config.labels.unwrap_or_default().into_iter().collect();
        let env = parse_env(config.env.as_deref().unwrap_or_default());
        let id = c.id.unwrap_or_default();
        let is_sandbox =
            labels.get(labels::CONTAINER_TYPE).map(String::as_str) == Some(labels::TYPE_SANDBOX);
        let sandbox_id = if is_sandbox {
            id.clone()
        } else {
            labels.get(labels::SANDBOX_ID).cloned().unwrap_or_default()
        };
        let merged_dir = c
            .graph_driver
            .as_ref()
            .and_then(|d| d.data.get("MergedDir"))
            .map(|d| with_hostfs(hostfs, d))
            .unwrap_or_default();
        let mut mounts: Vec<MountPoint> = c
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let source = m.source.filter(|s| !s.is_empty())?;
                Some(MountPoint {
                    source: with_hostfs(hostfs, &source),
                    destination: m.destination.unwrap_or_default(),
                    rw: m.rw.unwrap_or(false),
                })
            })
            .collect();
        sort_mounts(&mut mounts);
        let host_config = c.host_config.unwrap_or_default();
        let state = c.state.unwrap_or_default();

        EngineDetailContainer {
            name: c.name.unwrap_or_default().trim_start_matches('/').to_string(),
            id,
            labels,
            env,
            hostname: config.hostname.unwrap_or_default(),
            is_sandbox,
            sandbox_id,
            runtime: host_config.runtime.unwrap_or_default(),
            network_mode: host_config.network_mode.unwrap_or_default(),
            state: ContainerState {
                pid: state.pid.unwrap_or_default() as i32,
                started_at: state.started_at.unwrap_or_default(),
                status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            },
            merged_dir,
            mounts,
            log_path: with_hostfs(hostfs, c.log_path.as_deref().unwrap_or_default()),
        }
    }
}

#[cfg(unix)]
fn connect(socket: &str) -> Result<Docker> {
    Ok(Docker::connect_with_unix(
        socket,
        REQUEST_TIMEOUT_SECS,
        bollard::API_DEFAULT_VERSION,
    )?)
}

#[cfg(not(unix))]
fn connect(_socket: &str) -> Result<Docker> {
    Err(CriError::Unsupported("engine socket requires unix".into()))
}

fn parse_env(raw: &[String]) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Copy a multiplexed exec output stream into separate stdout and stderr pipes
///
/// A closed stderr is ignored; a closed stdout ends the copy.
async fn pump_output<S, O, E>(mut output: S, mut stdout: O, mut stderr: E) -> Result<()>
where
    S: futures::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Unpin,
    O: tokio::io::AsyncWrite + Unpin,
    E: tokio::io::AsyncWrite + Unpin,
{
    let mut stderr_open = true;
    while let Some(chunk) = output.next().await {
        match chunk? {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                stdout.write_all(&message).await?
            }
            LogOutput::StdErr { message } if stderr_open => {
                if stderr.write_all(&message).await.is_err() {
                    stderr_open = false;
                }
            }
            _ => {}
        }
    }
    stdout.shutdown().await?;
    if stderr_open {
        let _ = stderr.shutdown().await;
    }
    Ok(())
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn engine_type(&self) -> &str {
        self.inner.flavor.name()
    }

    async fn list_all_containers(&self) -> Result<Vec<EngineSimpleContainer>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let list = self.docker().list_containers(Some(options)).await?;
        Ok(list
            .into_iter()
            .map(|c| EngineSimpleContainer {
                id: c.id.unwrap_or_default(),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    async fn get_container_detail(&self, id: &str) -> Result<EngineDetailContainer> {
        let inspect = self
            .docker()
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(self.to_detail(inspect))
    }

    async fn exec_async(&self, id: &str, req: &ExecRequest) -> Result<AsyncExec> {
        let env: Vec<String> = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let created = self
            .docker()
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(req.cmd.clone()),
                    env: Some(env),
                    working_dir: req.working_dir.clone(),
                    user: req.user.clone(),
                    ..Default::default()
                },
            )
            .await?;
        let exec_id = created.id;

        let started = self
            .docker()
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;
        let (output, input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(CriError::Transient(format!(
                    "exec {exec_id} started detached"
                )))
            }
        };

        let (stdout_w, stdout_r) = tokio::io::duplex(STREAM_BUFFER);
        let (stderr_w, stderr_r) = tokio::io::duplex(STREAM_BUFFER);
        let pump = tokio::spawn(pump_output(output, stdout_w, stderr_w));

        let engine = self.clone();
        let wait = async move {
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(exec_id = %exec_id, error = %e, "exec stream ended with error"),
                Err(e) => return Err(CriError::Transient(e.to_string())),
            }
            engine.exec_exit_code(&exec_id).await
        }
        .boxed();

        Ok(AsyncExec::new(
            Some(Box::new(input) as BoxWriter),
            Box::new(stdout_r) as BoxReader,
            Some(Box::new(stderr_r) as BoxReader),
            wait,
        ))
    }

    async fn copy_to_container(&self, id: &str, src: &Path, dst: &str) -> Result<()> {
        let dst_path = Path::new(dst);
        let name = dst_path
            .file_name()
            .ok_or_else(|| CriError::NotFound(format!("file name in {dst}")))?
            .to_owned();
        let parent = dst_path
            .parent()
            .and_then(Path::to_str)
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();

        let src = src.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_path_with_name(&src, &name)?;
            builder.into_inner()
        })
        .await
        .map_err(CriError::transient)??;

        let options = UploadToContainerOptions {
            path: parent,
            ..Default::default()
        };
        self.docker()
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await?;
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, src: &str, dst: &Path) -> Result<()> {
        let options = DownloadFromContainerOptions {
            path: src.to_string(),
        };
        let mut chunks = Box::pin(self.docker().download_from_container(id, Some(options)));
        let mut body = Vec::new();
        while let Some(chunk) = chunks.next().await {
            body.extend_from_slice(&chunk?);
        }

        let dst = dst.to_path_buf();
        let src = src.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut archive = tar::Archive::new(Cursor::new(body));
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.header().entry_type().is_file() {
                    entry.unpack(&dst)?;
                    return Ok(());
                }
            }
            Err(CriError::NotFound(format!("regular file {src} in archive")))
        })
        .await
        .map_err(CriError::transient)?
    }

    async fn events(&self, filter: &EventFilter) -> Result<EventStream> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        if !filter.actions.is_empty() {
            filters.insert("event".to_string(), filter.actions.clone());
        }
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let filter = filter.clone();
        let stream = self
            .docker()
            .events(Some(options))
            .filter_map(move |message| {
                let event = match message {
                    Ok(message) => Some(to_event(message)).filter(|e| filter.matches(&e.action)).map(Ok),
                    Err(e) => Some(Err(CriError::from(e))),
                };
                futures::future::ready(event)
            });
        Ok(Box::pin(stream))
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Copy => self.inner.flavor == EngineFlavor::Docker,
        }
    }
}

fn to_event(message: EventMessage) -> EngineEvent {
    // "exec_start: sh" style actions carry arguments after the colon
    let action = message
        .action
        .as_deref()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    let id = message
        .actor
        .as_ref()
        .and_then(|a| a.id.clone())
        .unwrap_or_default();
    let raw = serde_json::to_value(&message).unwrap_or_default();
    EngineEvent { id, action, raw }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT: &str = r#"{
        "Id": "abcdef0123456789abcdef",
        "Name": "/k8s_web_web-1_app_U1_0",
        "Config": {
            "Hostname": "web-1",
            "Env": ["PATH=/usr/bin", "TZ=Asia/Shanghai", "BROKEN"],
            "Labels": {
                "io.kubernetes.pod.uid": "U1",
                "io.kubernetes.container.name": "web",
                "io.kubernetes.sandbox.id": "sandbox0001"
            }
        },
        "State": {"Status": "running", "Pid": 4242, "StartedAt": "2024-01-01T00:00:00Z"},
        "HostConfig": {"Runtime": "runc", "NetworkMode": "container:sandbox0001"},
        "GraphDriver": {"Name": "overlay2", "Data": {"MergedDir": "/var/lib/docker/overlay2/x/merged"}},
        "Mounts": [
            {"Type": "bind", "Source": "/data/logs", "Destination": "/home/admin/logs", "RW": true},
            {"Type": "bind", "Source": "/data/logs/app/special", "Destination": "/special", "RW": false},
            {"Type": "tmpfs", "Source": "", "Destination": "/run", "RW": true}
        ],
        "LogPath": "/var/lib/docker/containers/abc/abc-json.log"
    }"#;

    fn engine(flavor: EngineFlavor, hostfs: &str) -> DockerEngine {
        DockerEngine::new(flavor, "/nonexistent/docker.sock", hostfs).unwrap()
    }

    #[test]
    fn test_inspect_to_detail() {
        let engine = engine(EngineFlavor::Docker, "/hostfs");
        let inspect: ContainerInspectResponse = serde_json::from_str(INSPECT).unwrap();
        let detail = engine.to_detail(inspect);

        assert_eq!(detail.name, "k8s_web_web-1_app_U1_0");
        assert_eq!(detail.k8s_container_name(), "web");
        assert_eq!(detail.pod_uid(), Some("U1"));
        assert!(!detail.is_sandbox);
        assert_eq!(detail.sandbox_id, "sandbox0001");
        assert_eq!(detail.state.pid, 4242);
        assert_eq!(detail.state.status, "running");
        assert_eq!(detail.env.get("TZ").map(String::as_str), Some("Asia/Shanghai"));
        assert!(!detail.env.contains_key("BROKEN"));
        assert_eq!(detail.merged_dir, "/hostfs/var/lib/docker/overlay2/x/merged");
        assert_eq!(detail.mounts.len(), 2);
        assert_eq!(detail.mounts[0].destination, "/home/admin/logs");
        assert_eq!(detail.mounts[0].source, "/hostfs/data/logs");
        assert_eq!(detail.mounts[1].destination, "/special");
        assert_eq!(detail.log_path, "/hostfs/var/lib/docker/containers/abc/abc-json.log");
    }

    #[test]
    fn test_sandbox_detection() {
        let engine = engine(EngineFlavor::Pouch, "/");
        let inspect: ContainerInspectResponse = serde_json::from_str(
            r#"{"Id":"sb1","Config":{"Labels":{"io.kubernetes.docker.type":"podsandbox"}}}"#,
        )
        .unwrap();
        let detail = engine.to_detail(inspect);

        assert!(detail.is_sandbox);
        assert_eq!(detail.sandbox_id, "sb1");
        assert!(!engine.supports(Feature::Copy));
        assert_eq!(engine.engine_type(), "pouch");
    }

    #[test]
    fn test_to_event_strips_action_arguments() {
        let message: EventMessage = serde_json::from_str(
            r#"{"Type":"container","Action":"oom","Actor":{"ID":"c1","Attributes":{}}}"#,
        )
        .unwrap();
        let event = to_event(message);
        assert_eq!(event.id, "c1");
        assert_eq!(event.action, "oom");

        let message: EventMessage =
            serde_json::from_str(r#"{"Action":"exec_start: sh -c true","Actor":{"ID":"c2"}}"#).unwrap();
        assert_eq!(to_event(message).action, "exec_start");
    }

    #[tokio::test]
    async fn test_pump_output_splits_streams() {
        let chunks = vec![
            Ok(LogOutput::StdOut {
                message: Bytes::from_static(b"hello "),
            }),
            Ok(LogOutput::StdErr {
                message: Bytes::from_static(b"warn"),
            }),
            Ok(LogOutput::StdOut {
                message: Bytes::from_static(b"world"),
            }),
        ];
        let mut out = Vec::new();
        let mut err = Vec::new();
        pump_output(futures::stream::iter(chunks), &mut out, &mut err)
            .await
            .unwrap();

        assert_eq!(out, b"hello world");
        assert_eq!(err, b"warn");
    }

    #[test]
    fn test_with_hostfs() {
        assert_eq!(with_hostfs(Path::new("/"), "/var/run/docker.sock"), "/var/run/docker.sock");
        assert_eq!(
            with_hostfs(Path::new("/hostfs/"), "/var/run/docker.sock"),
            "/hostfs/var/run/docker.sock"
        );
        assert_eq!(with_hostfs(Path::new("/hostfs"), ""), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_over_unix_socket() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = conn.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("GET /"));
            assert!(request.contains("/containers/json?"));
            assert!(request.contains("all=true"));

            let body = r#"[{"Id":"c1","Labels":{"io.kubernetes.pod.uid":"U1"}},{"Id":"c2","Labels":null}]"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            conn.write_all(resp.as_bytes()).await.unwrap();
        });

        let engine = DockerEngine::new(EngineFlavor::Docker, &socket, "/").unwrap();
        let list = engine.list_all_containers().await.unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].pod_uid(), Some("U1"));
        assert!(list[1].labels.is_empty());
    }
}
