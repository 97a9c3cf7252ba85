//! Forward HTTP proxy into pods
//!
//! Clients send absolute-form requests (`GET http://<pod-ip>:<port>/path`).
//! Each request is relayed over a fresh connection obtained from the
//! [`Dialer`]; the response carries `X-Hacked-By` naming the path taken.

use super::{DialFailure, Dialer, HackedBy, ACCEPT_BACKOFF, HACKED_BY_HEADER};
use crate::error::{CriError, Result};
use crate::observability::AgentMetrics;
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const DEFAULT_HTTP_PROXY_ADDR: &str = "127.0.0.1:9118";

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn full(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

/// 500 with the cause; `X-Hacked-By` only once a path into the pod was chosen
fn failure(failure: &DialFailure) -> Response<ProxyBody> {
    let mut resp = Response::new(full(failure.error.to_string()));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    if let Some(via) = failure.via {
        resp.headers_mut()
            .insert(HACKED_BY_HEADER, HeaderValue::from_static(via.header_value()));
    }
    resp
}

/// Host and port of an absolute-form request, falling back to the Host header
pub fn target_of<B>(req: &Request<B>) -> Result<(String, u16)> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| CriError::NotFound("target host in request".into()))?;

    let uri: Uri = format!("http://{authority}")
        .parse()
        .map_err(|e| CriError::NotFound(format!("target host {authority}: {e}")))?;
    let host = uri.host().unwrap_or_default().trim_matches(&['[', ']'][..]).to_string();
    Ok((host, uri.port_u16().unwrap_or(80)))
}

/// Rewrite to origin-form and make sure Host names the target
fn to_origin_form(mut req: Request<Incoming>, host: &str, port: u16) -> Result<Request<Incoming>> {
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    *req.uri_mut() = path
        .parse()
        .map_err(|e| CriError::protocol(format!("request path {path}: {e}")))?;
    if !req.headers().contains_key(HOST) {
        let value = HeaderValue::from_str(&format!("{host}:{port}"))
            .map_err(|e| CriError::protocol(format!("host header: {e}")))?;
        req.headers_mut().insert(HOST, value);
    }
    Ok(req)
}

async fn forward(
    dialer: &dyn Dialer,
    req: Request<Incoming>,
) -> std::result::Result<(Response<Incoming>, HackedBy), DialFailure> {
    let (host, port) = target_of(&req)?;
    let (stream, hacked_by) = dialer.dial_http(&host, port).await?;
    debug!(host = %host, port, via = hacked_by.header_value(), "http proxy request");

    let exchange = async {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "http proxy upstream connection ended");
            }
        });
        let req = to_origin_form(req, &host, port)?;
        Ok::<_, CriError>(sender.send_request(req).await?)
    };
    exchange
        .await
        .map(|resp| (resp, hacked_by))
        .map_err(|e| DialFailure::via(e, hacked_by))
}

pub async fn handle(dialer: Arc<dyn Dialer>, req: Request<Incoming>) -> Response<ProxyBody> {
    match forward(dialer.as_ref(), req).await {
        Ok((resp, hacked_by)) => {
            let mut resp = resp.map(|b| b.boxed());
            resp.headers_mut().insert(
                HACKED_BY_HEADER,
                HeaderValue::from_static(hacked_by.header_value()),
            );
            resp
        }
        Err(e) => {
            warn!(error = %e.error, via = ?e.via, "http proxy request failed");
            failure(&e)
        }
    }
}

/// Serve the proxy on `listener` until shutdown
pub async fn serve(listener: TcpListener, dialer: Arc<dyn Dialer>, mut shutdown: broadcast::Receiver<()>) {
    let metrics = AgentMetrics::new();
    info!(addr = ?listener.local_addr().ok(), "HTTP proxy listening");
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.recv() => {
                info!("HTTP proxy shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "HTTP proxy accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            }
        };
        metrics.inc_proxy_connections("http");
        let dialer = dialer.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let dialer = dialer.clone();
                async move { Ok::<_, hyper::Error>(handle(dialer, req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "HTTP proxy connection ended");
            }
        });
    }
}
