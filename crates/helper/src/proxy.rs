//! Streaming commands: `httpProxy` and `tcpProxy`
//!
//! Both commands treat the helper's stdin/stdout pair as one bidirectional
//! byte stream owned by the agent.

use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A reader and a writer glued into a single duplex stream
#[derive(Debug)]
pub struct Duplex<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Duplex<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl Duplex<tokio::io::Stdin, tokio::io::Stdout> {
    /// The process stdio pair
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for Duplex<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for Duplex<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Connect to `addr` within `timeout` and splice `io` with the socket
pub async fn tcp_proxy<S>(io: &mut S, addr: &str, timeout: Duration) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("connect {} timed out after {:?}", addr, timeout))?
        .with_context(|| format!("connect {addr}"))?;
    conn.set_nodelay(true).ok();

    let copied = tokio::io::copy_bidirectional(io, &mut conn).await?;
    Ok(copied)
}

/// Port the request targets, taken from its Host header or URI
pub fn target_port<B>(req: &Request<B>) -> u16 {
    if let Some(port) = req.uri().port_u16() {
        return port;
    }
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(80)
}

async fn forward(mut req: Request<Incoming>) -> Result<Response<Incoming>> {
    let port = target_port(&req);

    // Forward-proxy requests carry an absolute URI; loopback wants origin form
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    *req.uri_mut() = path.parse()?;

    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("connect 127.0.0.1:{port}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("upstream connection error: {e}");
        }
    });

    Ok(sender.send_request(req).await?)
}

/// Serve HTTP/1.1 over `io`, forwarding every request to loopback
pub async fn http_proxy<S>(io: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    hyper::server::conn::http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(io), service_fn(forward))
        .await
        .context("serve http over stdio")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_target_port_from_host_header() {
        let req = Request::builder()
            .uri("/healthz")
            .header("host", "10.0.0.5:8080")
            .body(())
            .unwrap();
        assert_eq!(target_port(&req), 8080);

        let req = Request::builder()
            .uri("/")
            .header("host", "web")
            .body(())
            .unwrap();
        assert_eq!(target_port(&req), 80);

        let req = Request::builder()
            .uri("http://10.0.0.5:9090/metrics")
            .body(())
            .unwrap();
        assert_eq!(target_port(&req), 9090);
    }

    #[tokio::test]
    async fn test_tcp_proxy_splices_duplex() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
        });

        let (agent_side, helper_side) = tokio::io::duplex(64);
        let (helper_read, helper_write) = tokio::io::split(helper_side);
        let mut stdio = Duplex::new(helper_read, helper_write);
        let proxy =
            tokio::spawn(async move { tcp_proxy(&mut stdio, &addr, Duration::from_secs(3)).await });

        let (mut agent_read, mut agent_write) = tokio::io::split(agent_side);
        agent_write.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        agent_read.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        agent_write.shutdown().await.unwrap();
        drop(agent_write);
        drop(agent_read);
        let _ = proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_proxy_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (_agent_side, helper_side) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(helper_side);
        let mut stdio = Duplex::new(r, w);

        let result = tcp_proxy(&mut stdio, &addr, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
