//! Command execution in containers
//!
//! Every request is wrapped (timeout prefix, env tags) and holds a permit of
//! a per-engine semaphore for as long as it runs.

use crate::engine::wrap;
use crate::engine::{AsyncExec, ContainerEngine};
use crate::error::{CriError, Result};
use crate::models::{Container, ExecRequest, ExecResult};
use crate::nsenter::{NsEnter, NsType};
use crate::observability::AgentMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;
pub const DEFAULT_USER: &str = "root";

const PATH_ENGINE: &str = "engine";
const PATH_NSENTER: &str = "nsenter";

#[derive(Clone)]
pub struct ExecService {
    engine: Arc<dyn ContainerEngine>,
    nsenter: NsEnter,
    permits: Arc<Semaphore>,
    default_timeout: Duration,
    metrics: AgentMetrics,
}

impl ExecService {
    pub fn new(engine: Arc<dyn ContainerEngine>, nsenter: NsEnter) -> Self {
        Self {
            engine,
            nsenter,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            default_timeout: DEFAULT_EXEC_TIMEOUT,
            metrics: AgentMetrics::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn timeout_of(&self, req: &ExecRequest) -> Duration {
        req.timeout.unwrap_or(self.default_timeout)
    }

    async fn acquire(&self, timeout: Duration) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CriError::ResourceExhausted("exec semaphore closed".into())),
            Err(_) => Err(CriError::ResourceExhausted(format!(
                "no exec slot within {timeout:?}"
            ))),
        }
    }

    fn prepare(&self, container: &Container, req: &ExecRequest, timeout: Duration) -> ExecRequest {
        let mut wrapped = wrap::wrap(container, req, timeout);
        if wrapped.user.is_none() {
            wrapped.user = Some(DEFAULT_USER.to_string());
        }
        wrapped
    }

    fn record<T>(&self, path: &str, result: &Result<T>) {
        self.metrics.inc_exec(path);
        if result.is_err() {
            self.metrics.inc_exec_errors(path);
        }
    }

    /// Run a command through the engine and buffer its output
    ///
    /// A timeout yields `CriError::Timeout`, whose exit code is -1.
    pub async fn exec(&self, container: &Container, req: &ExecRequest) -> Result<ExecResult> {
        let timeout = self.timeout_of(req);
        let _permit = self.acquire(timeout).await?;
        let wrapped = self.prepare(container, req, timeout);
        debug!(cid = %container.short_id, cmd = ?req.cmd, "exec");

        let result = match tokio::time::timeout(timeout, self.engine.exec(&container.id, &wrapped)).await {
            Ok(result) => result,
            Err(_) => Err(CriError::Timeout(timeout)),
        };
        self.record(PATH_ENGINE, &result);
        result
    }

    /// Start a command through the engine with streaming stdio
    ///
    /// The permit is released when the returned exec is dropped or waited.
    pub async fn exec_async(&self, container: &Container, req: &ExecRequest) -> Result<AsyncExec> {
        let timeout = self.timeout_of(req);
        let permit = self.acquire(timeout).await?;
        let wrapped = self.prepare(container, req, timeout);

        let result = self
            .engine
            .exec_async(&container.id, &wrapped)
            .await
            .map(|exec| exec.hold(permit));
        self.record(PATH_ENGINE, &result);
        result
    }

    /// Run a command in the namespaces of the container's pid 1
    ///
    /// `types` empty means mount, net and uts.
    pub async fn nsenter_exec(
        &self,
        container: &Container,
        types: &[NsType],
        req: &ExecRequest,
    ) -> Result<ExecResult> {
        let timeout = self.timeout_of(req);
        let _permit = self.acquire(timeout).await?;
        let mut wrapped = wrap::wrap(container, req, timeout);
        // nsenter runs as the agent; user switching is not available there
        wrapped.user = None;

        let result = self
            .nsenter
            .run(types, container.state.pid, &wrapped, timeout)
            .await;
        self.record(PATH_NSENTER, &result);
        result
    }

    /// Start a command in the container's namespaces with streaming stdio
    pub async fn nsenter_spawn(
        &self,
        container: &Container,
        types: &[NsType],
        req: &ExecRequest,
    ) -> Result<AsyncExec> {
        let timeout = self.timeout_of(req);
        let permit = self.acquire(timeout).await?;
        let mut wrapped = wrap::wrap(container, req, timeout);
        wrapped.user = None;

        let result = self
            .nsenter
            .spawn(types, container.state.pid, &wrapped)
            .map(|exec| exec.hold(permit));
        self.record(PATH_NSENTER, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::wrap::{ENV_FROM, FROM_AGENT};
    use crate::testing::{ContainerBuilder, FakeEngine};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_exec_wraps_request() {
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let engine = FakeEngine::new().on_exec(move |_, req| {
            *captured.lock() = Some(req.clone());
            ExecResult {
                exit_code: 0,
                stdout: b"ok".to_vec(),
                stderr: Vec::new(),
            }
        });
        let service = ExecService::new(Arc::new(engine), NsEnter::new("/"));
        let container = ContainerBuilder::new("c1").build();

        let result = service
            .exec(&container, &ExecRequest::new(["ls"]))
            .await
            .unwrap();
        assert_eq!(result.stdout, b"ok");

        let req = seen.lock().clone().unwrap();
        assert_eq!(req.env.get(ENV_FROM).map(String::as_str), Some(FROM_AGENT));
        assert_eq!(req.user.as_deref(), Some(DEFAULT_USER));
        assert_eq!(service.available_permits(), DEFAULT_MAX_IN_FLIGHT);
    }

    #[tokio::test]
    async fn test_exec_timeout_has_exit_code_minus_one() {
        let engine = FakeEngine::new().with_exec_delay(Duration::from_secs(5));
        let service = ExecService::new(Arc::new(engine), NsEnter::new("/"));
        let container = ContainerBuilder::new("c1").build();

        let req = ExecRequest::new(["sleep", "5"]).timeout(Duration::from_millis(50));
        let err = service.exec(&container, &req).await.unwrap_err();

        assert!(matches!(err, CriError::Timeout(_)));
        assert_eq!(err.exit_code(), Some(-1));
        assert_eq!(service.available_permits(), DEFAULT_MAX_IN_FLIGHT);
    }

    #[tokio::test]
    async fn test_semaphore_exhaustion() {
        let service = ExecService::new(Arc::new(FakeEngine::new()), NsEnter::new("/"))
            .with_max_in_flight(1);
        let container = ContainerBuilder::new("c1").build();

        let held = service
            .exec_async(&container, &ExecRequest::new(["sleep"]))
            .await
            .unwrap();
        assert_eq!(service.available_permits(), 0);

        let req = ExecRequest::new(["ls"]).timeout(Duration::from_millis(20));
        let err = service.exec(&container, &req).await.unwrap_err();
        assert!(matches!(err, CriError::ResourceExhausted(_)));

        drop(held);
        assert_eq!(service.available_permits(), 1);
    }
}
