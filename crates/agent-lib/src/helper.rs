//! Client side of the in-container helper binary
//!
//! The helper is copied into biz containers and invoked through nsenter for
//! runc containers or through engine exec for everything else. JSON commands
//! answer with an [`Envelope`]; the proxy commands speak raw bytes over stdio.

use crate::copy::CopyService;
use crate::engine::AsyncExec;
use crate::error::{CriError, Result};
use crate::exec::ExecService;
use crate::models::{Container, ExecRequest, ExecResult};
use crate::observability::{AgentMetrics, StructuredLogger};
use async_trait::async_trait;
use cric_helper::protocol::{
    commands, CollectInputRequest, CountThreadResponse, CountZombiesResponse, FileNode,
    InspectResponse, ListFilesRequest, PreviewLogRequest, PreviewLogResponse, ProcessInfo,
    ENV_TCPPROXY_ADDR, ENV_TCPPROXY_TIMEOUT,
};
use cric_helper::Envelope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Locations of the helper files inside a container
pub mod paths {
    pub const DIR: &str = "/tmp/.holoinsight-helper";
    pub const HELPER_NAME: &str = "helper";
    pub const BUSYBOX_NAME: &str = "busybox";

    pub fn helper() -> String {
        format!("{DIR}/{HELPER_NAME}")
    }

    pub fn busybox() -> String {
        format!("{DIR}/{BUSYBOX_NAME}")
    }
}

pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(30);

/// Decode a helper response, turning failures into protocol errors
pub fn decode_envelope<T: DeserializeOwned>(result: &ExecResult) -> Result<T> {
    let envelope: Envelope<T> = serde_json::from_slice(&result.stdout).map_err(|e| {
        CriError::Protocol(format!(
            "exit code {}: {e}; stderr: {}",
            result.exit_code,
            result.stderr_str().trim()
        ))
    })?;
    if !envelope.success {
        return Err(CriError::Protocol(envelope.message));
    }
    envelope
        .data
        .ok_or_else(|| CriError::Protocol("helper returned no data".into()))
}

/// Typed calls into the helper, issued through the exec service wrappers
#[derive(Clone)]
pub struct HelperClient {
    exec: ExecService,
    timeout: Duration,
}

impl HelperClient {
    pub fn new(exec: ExecService) -> Self {
        Self {
            exec,
            timeout: DEFAULT_HELPER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(args: &[&str], env: BTreeMap<String, String>, cwd: Option<&str>) -> ExecRequest {
        let mut req = ExecRequest::new(std::iter::once(paths::helper()).chain(args.iter().map(|a| a.to_string())));
        req.env = env;
        req.working_dir = cwd.map(str::to_string);
        req
    }

    /// Run the helper and return its raw output
    pub async fn exec(
        &self,
        container: &Container,
        args: &[&str],
        env: BTreeMap<String, String>,
        cwd: Option<&str>,
        input: Option<Vec<u8>>,
    ) -> Result<ExecResult> {
        let mut req = Self::request(args, env, cwd).timeout(self.timeout);
        req.input = input;
        debug!(cid = %container.short_id, args = ?args, "helper exec");

        if container.is_runc() {
            self.exec.nsenter_exec(container, &[], &req).await
        } else {
            self.exec.exec(container, &req).await
        }
    }

    /// Run a JSON command and decode the `data` of its envelope
    pub async fn nsenter_helper_exec<T: DeserializeOwned>(
        &self,
        container: &Container,
        args: &[&str],
        env: BTreeMap<String, String>,
        cwd: Option<&str>,
        input: Option<Vec<u8>>,
    ) -> Result<T> {
        let result = self.exec(container, args, env, cwd, input).await?;
        decode_envelope(&result)
    }

    async fn call<Req: Serialize, T: DeserializeOwned>(
        &self,
        container: &Container,
        args: &[&str],
        request: Option<&Req>,
    ) -> Result<T> {
        let input = request.map(serde_json::to_vec).transpose()?;
        self.nsenter_helper_exec(container, args, BTreeMap::new(), None, input)
            .await
    }

    /// Start the helper with piped stdio
    pub async fn spawn(
        &self,
        container: &Container,
        args: &[&str],
        env: BTreeMap<String, String>,
    ) -> Result<AsyncExec> {
        let req = Self::request(args, env, None);
        if container.is_runc() {
            self.exec.nsenter_spawn(container, &[], &req).await
        } else {
            self.exec.exec_async(container, &req).await
        }
    }

    pub async fn inspect(&self, container: &Container) -> Result<InspectResponse> {
        self.call::<(), _>(container, &[commands::INSPECT], None).await
    }

    pub async fn list_files(&self, container: &Container, req: &ListFilesRequest) -> Result<Vec<FileNode>> {
        self.call(container, &[commands::LIST_FILES], Some(req)).await
    }

    pub async fn preview_log(
        &self,
        container: &Container,
        req: &PreviewLogRequest,
    ) -> Result<PreviewLogResponse> {
        self.call(container, &[commands::PREVIEW_LOG], Some(req)).await
    }

    pub async fn processes(&self, container: &Container, pid: i32) -> Result<Vec<ProcessInfo>> {
        let pid = pid.to_string();
        self.call::<(), _>(container, &[commands::PROCESSES, &pid], None)
            .await
    }

    pub async fn count_zombies(&self, container: &Container) -> Result<usize> {
        let resp: CountZombiesResponse = self
            .call::<(), _>(container, &[commands::COUNT_ZOMBIES], None)
            .await?;
        Ok(resp.zombies)
    }

    pub async fn glob(&self, container: &Container, pattern: &str) -> Result<Vec<String>> {
        self.call::<(), _>(container, &[commands::GLOB, pattern], None)
            .await
    }

    pub async fn count_thread(&self, container: &Container) -> Result<usize> {
        let resp: CountThreadResponse = self
            .call::<(), _>(container, &[commands::COUNT_THREAD], None)
            .await?;
        Ok(resp.threads)
    }

    pub async fn collect_input(
        &self,
        container: &Container,
        req: &CollectInputRequest,
    ) -> Result<serde_json::Value> {
        self.call(container, &[commands::COLLECT_INPUT], Some(req))
            .await
    }

    /// Send `value` through the helper and get it back unchanged
    pub async fn echo(&self, container: &Container, value: &serde_json::Value) -> Result<serde_json::Value> {
        self.call(container, &[commands::ECHO], Some(value)).await
    }

    /// Start `httpProxy`; HTTP/1.1 is spoken over the exec's stdio
    pub async fn http_proxy(&self, container: &Container) -> Result<AsyncExec> {
        self.spawn(container, &[commands::HTTP_PROXY], BTreeMap::new())
            .await
    }

    /// Start `tcpProxy` towards `addr` as seen from the container
    pub async fn tcp_proxy(&self, container: &Container, addr: &str, timeout: Duration) -> Result<AsyncExec> {
        let mut env = BTreeMap::new();
        env.insert(ENV_TCPPROXY_ADDR.to_string(), addr.to_string());
        env.insert(
            ENV_TCPPROXY_TIMEOUT.to_string(),
            timeout.as_secs().max(1).to_string(),
        );
        self.spawn(container, &[commands::TCP_PROXY], env).await
    }
}

/// Puts the helper files into a freshly discovered container
#[async_trait]
pub trait HelperInjector: Send + Sync {
    async fn inject(&self, container: &Container) -> Result<()>;
}

/// Injector copying `helper` and `busybox` from a local directory
pub struct CopyHelperInjector {
    copy: CopyService,
    local_dir: PathBuf,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

impl CopyHelperInjector {
    pub fn new(copy: CopyService, local_dir: impl Into<PathBuf>, logger: StructuredLogger) -> Self {
        Self {
            copy,
            local_dir: local_dir.into(),
            logger,
            metrics: AgentMetrics::new(),
        }
    }

    async fn copy_all(&self, container: &Container) -> Result<()> {
        for name in [paths::HELPER_NAME, paths::BUSYBOX_NAME] {
            let src = self.local_dir.join(name);
            let dst = format!("{}/{name}", paths::DIR);
            self.copy.copy_to_container(container, &src, &dst).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl HelperInjector for CopyHelperInjector {
    async fn inject(&self, container: &Container) -> Result<()> {
        let result = self.copy_all(container).await;
        let pod = container.pod_key();
        match &result {
            Ok(()) => self.logger.log_helper_injection(&container.short_id, &pod, None),
            Err(e) => {
                self.metrics.inc_helper_injection_failures();
                self.logger
                    .log_helper_injection(&container.short_id, &pod, Some(&e.to_string()));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::wrap::{ENV_FROM, ENV_TS, FROM_AGENT};
    use crate::exec::DEFAULT_USER;
    use crate::nsenter::NsEnter;
    use crate::testing::{ContainerBuilder, FakeEngine};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn client(engine: FakeEngine) -> HelperClient {
        HelperClient::new(ExecService::new(Arc::new(engine), NsEnter::new("/")))
    }

    fn exec_result(stdout: &str) -> ExecResult {
        ExecResult {
            exit_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn test_decode_envelope() {
        let ok: CountZombiesResponse =
            decode_envelope(&exec_result(r#"{"success":true,"message":"","data":{"zombies":3}}"#)).unwrap();
        assert_eq!(ok.zombies, 3);

        let err = decode_envelope::<CountZombiesResponse>(&exec_result(
            r#"{"success":false,"message":"no proc"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, CriError::Protocol(m) if m == "no proc"));

        let garbage = decode_envelope::<CountZombiesResponse>(&exec_result("sh: not found"));
        assert!(matches!(garbage, Err(CriError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_echo_through_engine_exec() {
        let engine = FakeEngine::new().on_exec(|_, req| {
            assert_eq!(req.cmd, vec![paths::helper(), "echo".to_string()]);
            assert_eq!(req.env.get(ENV_FROM).map(String::as_str), Some(FROM_AGENT));
            let data: serde_json::Value = serde_json::from_slice(req.input.as_deref().unwrap_or_default()).unwrap();
            let body = serde_json::to_vec(&Envelope::ok(data)).unwrap();
            ExecResult {
                exit_code: 0,
                stdout: body,
                stderr: Vec::new(),
            }
        });
        let client = client(engine);
        let container = ContainerBuilder::new("c1").runtime("runsc").build();

        let value = json!({"a": [1, 2, {"b": "c"}]});
        assert_eq!(client.echo(&container, &value).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_helper_requests_are_wrapped() {
        let seen = Arc::new(Mutex::new(Vec::<ExecRequest>::new()));
        let captured = seen.clone();
        let engine = FakeEngine::new().on_exec(move |_, req| {
            captured.lock().push(req.clone());
            ExecResult {
                exit_code: 0,
                stdout: serde_json::to_vec(&Envelope::ok(json!({}))).unwrap(),
                stderr: Vec::new(),
            }
        });
        let client = client(engine);
        let container = ContainerBuilder::new("c1")
            .runtime("runsc")
            .hacked(true)
            .reaps_zombies(true)
            .build();

        client.echo(&container, &json!({})).await.unwrap();
        client.http_proxy(&container).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        for req in seen.iter() {
            assert_eq!(req.env.get(ENV_FROM).map(String::as_str), Some(FROM_AGENT));
            assert!(req.env.contains_key(ENV_TS));
            assert_eq!(req.user.as_deref(), Some(DEFAULT_USER));
            assert_eq!(req.cmd[0], paths::busybox());
            assert_eq!(req.cmd[1], "timeout");
        }
        assert_eq!(seen[0].cmd[5..], [paths::helper(), "echo".to_string()]);
        assert_eq!(seen[0].cmd[4], DEFAULT_HELPER_TIMEOUT.as_secs().to_string());
    }

    #[tokio::test]
    async fn test_injector_copies_both_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("helper"), b"h").unwrap();
        std::fs::write(dir.path().join("busybox"), b"b").unwrap();

        let engine = FakeEngine::new().with_copy(true);
        let copies = engine.copies();
        let logger = StructuredLogger::new("test-node");
        let copy = CopyService::new(Arc::new(engine), logger.clone());
        let injector = CopyHelperInjector::new(copy, dir.path(), logger);

        let container = ContainerBuilder::new("c1").runtime("runsc").build();
        injector.inject(&container).await.unwrap();

        let dsts: Vec<String> = copies.lock().iter().map(|c| c.1.clone()).collect();
        assert_eq!(dsts, vec![paths::helper(), paths::busybox()]);
    }
}
