//! Network access into pods
//!
//! runc pods are reached with sockets opened inside their network namespace.
//! For other runtimes the helper in the main biz container relays the bytes
//! over its stdio.

pub mod http;
pub mod portforward;
pub mod socks5;

use crate::engine::ExecStream;
use crate::error::{CriError, Result};
use crate::helper::HelperClient;
use crate::meta::MetaStore;
use crate::models::Pod;
use crate::nsenter::NsEnter;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
/// Idle limit of a relayed connection, refreshed by every read
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub const HACKED_BY_HEADER: &str = "X-Hacked-By";

/// Pause after a failed accept before listening again
pub const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// How a connection reached the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HackedBy {
    Nsenter,
    Exec,
}

impl HackedBy {
    pub fn header_value(&self) -> &'static str {
        match self {
            HackedBy::Nsenter => "holoinsight-agent nsenter",
            HackedBy::Exec => "holoinsight-agent exec",
        }
    }
}

/// A failed HTTP dial and the path it was attempted on, when one was chosen
#[derive(Debug)]
pub struct DialFailure {
    pub error: CriError,
    pub via: Option<HackedBy>,
}

impl DialFailure {
    pub fn via(error: CriError, via: HackedBy) -> Self {
        Self {
            error,
            via: Some(via),
        }
    }
}

impl From<CriError> for DialFailure {
    fn from(error: CriError) -> Self {
        Self { error, via: None }
    }
}

/// A byte stream into a pod
pub enum PodStream {
    Tcp(TcpStream),
    Exec(ExecStream),
}

impl AsyncRead for PodStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PodStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            PodStream::Exec(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PodStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PodStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            PodStream::Exec(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PodStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            PodStream::Exec(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PodStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            PodStream::Exec(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Opens connections to `host:port` where host names a local pod
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Raw TCP relay
    async fn dial(&self, host: &str, port: u16) -> Result<PodStream>;

    /// Stream that speaks HTTP/1.1 to the pod's `port`
    async fn dial_http(&self, host: &str, port: u16) -> std::result::Result<(PodStream, HackedBy), DialFailure>;
}

/// [`Dialer`] resolving hosts through the meta store
#[derive(Clone)]
pub struct PodDialer {
    meta: MetaStore,
    nsenter: NsEnter,
    helper: HelperClient,
    timeout: Duration,
}

impl PodDialer {
    pub fn new(meta: MetaStore, nsenter: NsEnter, helper: HelperClient) -> Self {
        Self {
            meta,
            nsenter,
            helper,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pod owning `host`, matched by IP first and hostname second
    pub fn resolve(&self, host: &str) -> Result<Arc<Pod>> {
        self.meta
            .get_pod_by_ip(host)
            .or_else(|| self.meta.get_pod_by_hostname(host))
            .ok_or_else(|| CriError::NotFound(format!("pod for host {host}")))
    }

    /// Pid whose network namespace the pod uses, when it can be entered from the host
    fn ns_pid(pod: &Pod) -> Option<i32> {
        pod.sandbox
            .as_ref()
            .filter(|s| s.is_runc() && s.state.pid > 0)
            .map(|s| s.state.pid)
    }

    fn target(pod: &Pod, host: &str, port: u16) -> Result<SocketAddr> {
        let ip = pod.ip().unwrap_or(host);
        format!("{ip}:{port}")
            .parse()
            .map_err(|e| CriError::NotFound(format!("address of pod {}: {e}", pod.key())))
    }

    async fn ns_dial(&self, pid: i32, addr: SocketAddr) -> Result<PodStream> {
        let stream = self.nsenter.dial(pid, addr, self.timeout).await?;
        Ok(PodStream::Tcp(stream))
    }
}

#[async_trait]
impl Dialer for PodDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<PodStream> {
        let pod = self.resolve(host)?;
        let addr = Self::target(&pod, host, port)?;
        if let Some(pid) = Self::ns_pid(&pod) {
            return self.ns_dial(pid, addr).await;
        }
        let biz = pod.main_biz()?;
        let exec = self
            .helper
            .tcp_proxy(biz, &addr.to_string(), self.timeout)
            .await?;
        Ok(PodStream::Exec(exec.into_stream()))
    }

    async fn dial_http(&self, host: &str, port: u16) -> std::result::Result<(PodStream, HackedBy), DialFailure> {
        let pod = self.resolve(host)?;
        if let Some(pid) = Self::ns_pid(&pod) {
            let via = |e| DialFailure::via(e, HackedBy::Nsenter);
            let addr = Self::target(&pod, host, port).map_err(via)?;
            let stream = self.ns_dial(pid, addr).await.map_err(via)?;
            return Ok((stream, HackedBy::Nsenter));
        }
        let via = |e| DialFailure::via(e, HackedBy::Exec);
        let biz = pod.main_biz().map_err(via)?;
        let exec = self.helper.http_proxy(biz).await.map_err(via)?;
        Ok((PodStream::Exec(exec.into_stream()), HackedBy::Exec))
    }
}

/// Copy both directions until either side finishes or stays silent too long
///
/// The idle deadline restarts before every read. Returns the bytes moved
/// client→pod and pod→client.
pub async fn relay<A, B>(a: A, b: B, idle: Duration) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);
    let up = pump(&mut ar, &mut bw, idle);
    let down = pump(&mut br, &mut aw, idle);
    tokio::select! {
        r = up => r.map(|n| (n, 0)),
        r = down => r.map(|n| (0, n)),
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(r) => r?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout")),
        };
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Dialer connecting to a local listener regardless of the host asked for
    pub(crate) struct LocalDialer {
        pub addr: SocketAddr,
    }

    #[async_trait]
    impl Dialer for LocalDialer {
        async fn dial(&self, host: &str, _port: u16) -> Result<PodStream> {
            if host == "unknown" {
                return Err(CriError::NotFound(format!("pod for host {host}")));
            }
            Ok(PodStream::Tcp(TcpStream::connect(self.addr).await?))
        }

        async fn dial_http(
            &self,
            host: &str,
            port: u16,
        ) -> std::result::Result<(PodStream, HackedBy), DialFailure> {
            Ok((self.dial(host, port).await?, HackedBy::Nsenter))
        }
    }

    /// Echo server on an ephemeral port
    pub(crate) async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_until_close() {
        let addr = echo_server().await;
        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let upstream = TcpStream::connect(addr).await.unwrap();
        let task = tokio::spawn(relay(proxy_side, upstream, Duration::from_secs(5)));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        let (up, _) = task.await.unwrap().unwrap();
        assert_eq!(up, 4);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client, proxy_side) = tokio::io::duplex(1024);
        let (_pod, pod_side) = tokio::io::duplex(1024);
        let err = relay(proxy_side, pod_side, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_exec_stream_as_pod_stream() {
        use crate::engine::ContainerEngine;
        use crate::models::ExecRequest;
        use crate::testing::FakeEngine;

        let engine = FakeEngine::new();
        let exec = engine.exec_async("c1", &ExecRequest::new(["tcpProxy"])).await.unwrap();
        let mut stream = PodStream::Exec(exec.into_stream());

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_hacked_by_values() {
        assert_eq!(HackedBy::Nsenter.header_value(), "holoinsight-agent nsenter");
        assert_eq!(HackedBy::Exec.header_value(), "holoinsight-agent exec");
    }
}
