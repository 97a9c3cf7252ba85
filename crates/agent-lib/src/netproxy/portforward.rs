//! Temporary local listeners forwarding to a pod address

use super::{relay, Dialer, ACCEPT_BACKOFF, DEFAULT_IDLE_TIMEOUT};
use crate::error::{CriError, Result};
use crate::observability::{AgentMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_SURVIVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardInfo {
    pub id: u64,
    pub target: String,
    pub listen: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub connections: u64,
}

struct Task {
    info: PortForwardInfo,
    connections: AtomicU64,
}

impl Task {
    fn snapshot(&self) -> PortForwardInfo {
        PortForwardInfo {
            connections: self.connections.load(Ordering::Relaxed),
            ..self.info.clone()
        }
    }
}

/// Wait [`ACCEPT_BACKOFF`] or until `deadline`; true when the deadline was reached
async fn backoff_until(deadline: Instant) -> bool {
    let resume = Instant::now() + ACCEPT_BACKOFF;
    tokio::time::sleep_until(resume.min(deadline)).await;
    resume >= deadline
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn parse_target(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| CriError::NotFound(format!("port in {addr}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| CriError::NotFound(format!("port in {addr}: {e}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CriError::NotFound(format!("host in {addr}")));
    }
    Ok((host.to_string(), port))
}

#[derive(Clone)]
pub struct PortForwardManager {
    dialer: Arc<dyn Dialer>,
    tasks: Arc<DashMap<u64, Arc<Task>>>,
    next_id: Arc<AtomicU64>,
    survival: Duration,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

impl PortForwardManager {
    pub fn new(dialer: Arc<dyn Dialer>, logger: StructuredLogger) -> Self {
        Self {
            dialer,
            tasks: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            survival: DEFAULT_SURVIVAL,
            logger,
            metrics: AgentMetrics::new(),
        }
    }

    pub fn with_survival(mut self, survival: Duration) -> Self {
        self.survival = survival;
        self
    }

    pub fn survival(&self) -> Duration {
        self.survival
    }

    /// Active tasks, oldest first
    pub fn list(&self) -> Vec<PortForwardInfo> {
        let mut infos: Vec<_> = self.tasks.iter().map(|t| t.value().snapshot()).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Bind `127.0.0.1:0` and forward every accepted connection to `target`
    /// until the survival window ends
    pub async fn start(&self, target: &str) -> Result<PortForwardInfo> {
        let (host, port) = parse_target(target)?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let listen = listener.local_addr()?.to_string();

        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(self.survival).unwrap_or(chrono::Duration::zero());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(Task {
            info: PortForwardInfo {
                id,
                target: target.to_string(),
                listen: listen.clone(),
                created_at: now,
                expires_at: expires,
                connections: 0,
            },
            connections: AtomicU64::new(0),
        });
        self.tasks.insert(id, task.clone());
        self.metrics.set_portforward_tasks(self.tasks.len());
        self.logger
            .log_portforward_opened(target, &listen, self.survival);

        let info = task.snapshot();
        let manager = self.clone();
        let deadline = Instant::now() + self.survival;
        tokio::spawn(async move {
            manager.accept_loop(listener, task.clone(), host, port, deadline).await;
            manager.tasks.remove(&id);
            manager.metrics.set_portforward_tasks(manager.tasks.len());
            manager.logger.log_portforward_closed(
                &task.info.target,
                &task.info.listen,
                task.connections.load(Ordering::Relaxed),
            );
        });

        Ok(info)
    }

    async fn accept_loop(&self, listener: TcpListener, task: Arc<Task>, host: String, port: u16, deadline: Instant) {
        loop {
            let accepted = match tokio::time::timeout_at(deadline, listener.accept()).await {
                Err(_) => return,
                Ok(accepted) => accepted,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(listen = %task.info.listen, error = %e, "port-forward accept failed");
                    if backoff_until(deadline).await {
                        return;
                    }
                    continue;
                }
            };
            task.connections.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_proxy_connections("portforward");

            let dialer = self.dialer.clone();
            let host = host.clone();
            tokio::spawn(async move {
                let upstream = match dialer.dial(&host, port).await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        warn!(host = %host, port, error = %e, "port-forward dial failed");
                        return;
                    }
                };
                match relay(stream, upstream, DEFAULT_IDLE_TIMEOUT).await {
                    Ok((up, down)) => debug!(host = %host, port, up, down, "port-forward connection closed"),
                    Err(e) => debug!(host = %host, port, error = %e, "port-forward connection ended"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netproxy::tests::{echo_server, LocalDialer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn manager(survival: Duration, dialer: LocalDialer) -> PortForwardManager {
        PortForwardManager::new(Arc::new(dialer), StructuredLogger::new("test-node"))
            .with_survival(survival)
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("10.0.0.5:8080").unwrap(), ("10.0.0.5".to_string(), 8080));
        assert_eq!(parse_target("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(parse_target("10.0.0.5").is_err());
        assert!(parse_target(":80").is_err());
    }

    #[tokio::test]
    async fn test_accept_backoff_respects_deadline() {
        let start = Instant::now();
        assert!(backoff_until(start + Duration::from_millis(50)).await);
        assert!(start.elapsed() < ACCEPT_BACKOFF);

        let start = Instant::now();
        assert!(!backoff_until(start + Duration::from_secs(30)).await);
        assert!(start.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_forward_and_list() {
        let pf = manager(Duration::from_secs(30), LocalDialer { addr: echo_server().await });
        let info = pf.start("10.0.0.5:8080").await.unwrap();
        assert!(info.listen.starts_with("127.0.0.1:"));

        let mut conn = TcpStream::connect(info.listen.as_str()).await.unwrap();
        conn.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        let listed = pf.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target, "10.0.0.5:8080");
        assert_eq!(listed[0].connections, 1);
    }

    #[tokio::test]
    async fn test_listener_closes_after_survival() {
        let pf = manager(Duration::from_millis(100), LocalDialer { addr: echo_server().await });
        let info = pf.start("10.0.0.5:8080").await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pf.list().is_empty());
        assert!(TcpStream::connect(info.listen.as_str()).await.is_err());
    }
}
