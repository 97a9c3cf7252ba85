//! SOCKS5 proxy into pods (no authentication, CONNECT only)

use super::{relay, Dialer, ACCEPT_BACKOFF, DEFAULT_IDLE_TIMEOUT};
use crate::observability::AgentMetrics;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const DEFAULT_SOCKS5_ADDR: &str = "127.0.0.1:9119";

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes
const REP_SUCCEEDED: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Destination of a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8) -> io::Result<()> {
    stream
        .write_all(&[VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Method negotiation; only "no authentication" is accepted
pub async fn negotiate<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(invalid("not a SOCKS5 greeting"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(invalid("client offers no acceptable auth method"));
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await
}

/// Read the request; unsupported commands and address types are answered and rejected
pub async fn read_request<S>(stream: &mut S) -> io::Result<ConnectTarget>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(invalid("bad request version"));
    }
    if head[1] != CMD_CONNECT {
        reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(invalid("only CONNECT is supported"));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| invalid("domain is not utf-8"))?
        }
        _ => {
            reply(stream, REP_ADDRESS_NOT_SUPPORTED).await?;
            return Err(invalid("unsupported address type"));
        }
    };
    let port = stream.read_u16().await?;
    Ok(ConnectTarget { host, port })
}

/// Serve one client connection
pub async fn handle<S>(mut stream: S, dialer: &dyn Dialer, idle: Duration) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(&mut stream).await?;
    let target = read_request(&mut stream).await?;

    let upstream = match dialer.dial(&target.host, target.port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(host = %target.host, port = target.port, error = %e, "SOCKS5 dial failed");
            reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };
    reply(&mut stream, REP_SUCCEEDED).await?;
    debug!(host = %target.host, port = target.port, "SOCKS5 connected");

    let (up, down) = relay(stream, upstream, idle).await?;
    debug!(host = %target.host, up, down, "SOCKS5 connection closed");
    Ok(())
}

pub async fn serve(listener: TcpListener, dialer: Arc<dyn Dialer>, mut shutdown: broadcast::Receiver<()>) {
    let metrics = AgentMetrics::new();
    info!(addr = ?listener.local_addr().ok(), "SOCKS5 proxy listening");
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.recv() => {
                info!("SOCKS5 proxy shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "SOCKS5 accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            }
        };
        metrics.inc_proxy_connections("socks5");
        let dialer = dialer.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, dialer.as_ref(), DEFAULT_IDLE_TIMEOUT).await {
                debug!(peer = %peer, error = %e, "SOCKS5 session ended with error");
            }
        });
    }
}
