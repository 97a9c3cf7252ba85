//! Container engine adapter
//!
//! [`ContainerEngine`] is the capability set the rest of the crate needs from
//! a container runtime. [`docker::DockerEngine`] implements it with bollard
//! against the Docker Engine API, which pouch also speaks.

pub mod docker;
pub mod wrap;

use crate::error::{CriError, Result};
use crate::models::{ContainerState, ExecRequest, ExecResult, MountPoint};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::Command;

pub use docker::{DockerEngine, EngineFlavor};

/// Kubernetes labels set by the kubelet on every container it creates
pub mod labels {
    pub const POD_UID: &str = "io.kubernetes.pod.uid";
    pub const POD_NAME: &str = "io.kubernetes.pod.name";
    pub const POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
    pub const CONTAINER_NAME: &str = "io.kubernetes.container.name";
    pub const CONTAINER_TYPE: &str = "io.kubernetes.docker.type";
    pub const SANDBOX_ID: &str = "io.kubernetes.sandbox.id";

    pub const TYPE_SANDBOX: &str = "podsandbox";
}

/// Event actions the agent subscribes to
pub mod actions {
    pub const START: &str = "start";
    pub const DIE: &str = "die";
    pub const OOM: &str = "oom";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSimpleContainer {
    pub id: String,
    pub labels: BTreeMap<String, String>,
}

impl EngineSimpleContainer {
    pub fn pod_uid(&self) -> Option<&str> {
        self.labels.get(labels::POD_UID).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDetailContainer {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub hostname: String,
    pub is_sandbox: bool,
    pub sandbox_id: String,
    pub runtime: String,
    pub network_mode: String,
    pub state: ContainerState,
    pub merged_dir: String,
    pub mounts: Vec<MountPoint>,
    pub log_path: String,
}

impl EngineDetailContainer {
    pub fn pod_uid(&self) -> Option<&str> {
        self.labels.get(labels::POD_UID).map(String::as_str)
    }

    pub fn k8s_container_name(&self) -> &str {
        self.labels
            .get(labels::CONTAINER_NAME)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: String,
    pub action: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Actions to receive; empty means all
    pub actions: Vec<String>,
}

impl EventFilter {
    pub fn actions<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, action: &str) -> bool {
        self.actions.is_empty() || self.actions.iter().any(|a| a == action)
    }
}

pub type EventStream = BoxStream<'static, Result<EngineEvent>>;

/// Optional engine capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Copy,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn engine_type(&self) -> &str;

    /// All containers, sandboxes included
    async fn list_all_containers(&self) -> Result<Vec<EngineSimpleContainer>>;

    async fn get_container_detail(&self, id: &str) -> Result<EngineDetailContainer>;

    async fn exec(&self, id: &str, req: &ExecRequest) -> Result<ExecResult> {
        self.exec_async(id, req)
            .await?
            .collect_with_input(req.input.clone())
            .await
    }

    async fn exec_async(&self, id: &str, req: &ExecRequest) -> Result<AsyncExec>;

    async fn copy_to_container(&self, id: &str, src: &Path, dst: &str) -> Result<()>;

    async fn copy_from_container(&self, id: &str, src: &str, dst: &Path) -> Result<()>;

    async fn events(&self, filter: &EventFilter) -> Result<EventStream>;

    fn supports(&self, feature: Feature) -> bool;
}

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running command with its stdio pipes
///
/// Dropping it closes the pipes; for local processes it also kills the
/// process.
pub struct AsyncExec {
    pub stdin: Option<BoxWriter>,
    pub stdout: BoxReader,
    pub stderr: Option<BoxReader>,
    wait: BoxFuture<'static, Result<i32>>,
    guards: Vec<Box<dyn Any + Send>>,
}

impl AsyncExec {
    pub fn new(
        stdin: Option<BoxWriter>,
        stdout: BoxReader,
        stderr: Option<BoxReader>,
        wait: BoxFuture<'static, Result<i32>>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            wait,
            guards: Vec::new(),
        }
    }

    /// Spawn a local command with piped stdio
    pub fn from_command(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().map(|s| Box::new(s) as BoxWriter);
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as BoxReader)
            .ok_or_else(|| CriError::Transient("child stdout not captured".into()))?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxReader);
        let wait = async move {
            let status = child.wait().await?;
            Ok(status.code().unwrap_or(-1))
        }
        .boxed();

        Ok(Self::new(stdin, stdout, stderr, wait))
    }

    /// Keep `guard` alive as long as the exec
    pub fn hold<G: Send + 'static>(mut self, guard: G) -> Self {
        self.guards.push(Box::new(guard));
        self
    }

    /// Wait for the exit code; pipes left unread are closed first
    pub async fn wait(self) -> Result<i32> {
        let AsyncExec {
            stdin,
            stdout,
            stderr,
            wait,
            guards,
        } = self;
        drop((stdin, stdout, stderr));
        let code = wait.await;
        drop(guards);
        code
    }

    /// Feed the input, read both outputs to the end, then wait
    pub async fn collect_with_input(mut self, input: Option<Vec<u8>>) -> Result<ExecResult> {
        if let Some(mut stdin) = self.stdin.take() {
            let input = input.unwrap_or_default();
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let stderr_pipe = self.stderr.take();
        let read_err = async {
            if let Some(mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut stderr).await?;
            }
            Ok::<_, io::Error>(())
        };
        let (out, err) = tokio::join!(self.stdout.read_to_end(&mut stdout), read_err);
        out?;
        err?;

        let exit_code = (self.wait).await?;
        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    pub async fn collect(self) -> Result<ExecResult> {
        self.collect_with_input(None).await
    }

    /// Merge stdin and stdout into one duplex stream
    ///
    /// Stderr is drained into the debug log so the command never blocks on
    /// it. The exec lives as long as the stream.
    pub fn into_stream(self) -> ExecStream {
        if let Some(mut stderr) = self.stderr {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if stderr.read_to_end(&mut buf).await.is_ok() && !buf.is_empty() {
                    tracing::debug!(stderr = %String::from_utf8_lossy(&buf), "exec stream stderr");
                }
            });
        }
        ExecStream {
            reader: self.stdout,
            writer: self.stdin,
            _wait: self.wait,
            _guards: self.guards,
        }
    }
}

impl std::fmt::Debug for AsyncExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExec")
            .field("stdin", &self.stdin.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("guards", &self.guards.len())
            .finish()
    }
}

/// Bidirectional byte stream over an exec's stdin/stdout
pub struct ExecStream {
    reader: BoxReader,
    writer: Option<BoxWriter>,
    _wait: BoxFuture<'static, Result<i32>>,
    _guards: Vec<Box<dyn Any + Send>>,
}

impl AsyncRead for ExecStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ExecStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writer.as_mut() {
            Some(w) => Pin::new(w).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            Some(w) => Pin::new(w).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            Some(w) => Pin::new(w).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[cfg(unix)]
    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_collect_with_input() {
        let exec = AsyncExec::from_command(sh("cat; echo err >&2; exit 2")).unwrap();
        let result = exec.collect_with_input(Some(b"abc".to_vec())).await.unwrap();

        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, b"abc");
        assert_eq!(result.stderr, b"err\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_into_stream_round_trip() {
        let exec = AsyncExec::from_command(sh("read line; echo \"got $line\"")).unwrap();
        let mut stream = exec.into_stream();

        stream.write_all(b"ping\n").await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "got ping\n");
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::actions([actions::OOM, actions::DIE]);
        assert!(filter.matches("oom"));
        assert!(!filter.matches("start"));
        assert!(EventFilter::default().matches("anything"));
    }
}
