//! Admin HTTP API: local meta queries, port-forward control, health and Prometheus metrics

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cric_core::{
    health::HealthRegistry,
    meta::MetaStore,
    netproxy::portforward::PortForwardManager,
    observability,
    Container, ContainerRole, Cri, CriError, ErrorKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub meta: MetaStore,
    pub portforward: PortForwardManager,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, cri: &Cri) -> Self {
        Self {
            health_registry,
            meta: cri.meta.clone(),
            portforward: cri.portforward.clone(),
        }
    }
}

/// A [`CriError`] rendered with the status code of its kind
pub struct ApiError(CriError);

impl From<CriError> for ApiError {
    fn from(e: CriError) -> Self {
        Self(e)
    }
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AmbiguousTarget => StatusCode::CONFLICT,
        ErrorKind::InvalidPath => StatusCode::BAD_REQUEST,
        ErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Transient | ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status_of(self.0.kind()), Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct PodQuery {
    pub ns: String,
    pub pod: String,
}

#[derive(Debug, Deserialize)]
pub struct CidQuery {
    pub cid: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddrQuery {
    pub addr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub role: ContainerRole,
    pub running: bool,
    pub hacked: bool,
}

impl From<&Container> for ContainerSummary {
    fn from(c: &Container) -> Self {
        Self {
            id: c.short_id.clone(),
            name: c.name.clone(),
            role: c.role,
            running: c.is_running(),
            hacked: c.hacked,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub ip: String,
    pub phase: String,
    pub app: String,
    pub containers: Vec<ContainerSummary>,
}

async fn get_pod(State(state): State<Arc<AppState>>, Query(q): Query<PodQuery>) -> ApiResult<Response> {
    let pod = state
        .meta
        .get_pod(&q.ns, &q.pod)
        .ok_or_else(|| CriError::NotFound(format!("pod {}/{}", q.ns, q.pod)))?;
    Ok(Json(pod).into_response())
}

async fn get_by_cid(State(state): State<Arc<AppState>>, Query(q): Query<CidQuery>) -> ApiResult<Response> {
    let container = state
        .meta
        .get_container_by_cid(&q.cid)
        .ok_or_else(|| CriError::NotFound(format!("container {}", q.cid)))?;
    Ok(Json(container).into_response())
}

async fn list(State(state): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> ApiResult<Response> {
    let pods = state.meta.get_all_pods();
    match q.kind.as_deref() {
        Some("detail") => Ok(Json(pods).into_response()),
        None | Some("summary") => {
            let summaries: Vec<PodSummary> = pods
                .iter()
                .map(|p| PodSummary {
                    namespace: p.namespace.clone(),
                    name: p.name.clone(),
                    uid: p.uid.clone(),
                    ip: p.ip().unwrap_or_default().to_string(),
                    phase: p.phase().to_string(),
                    app: p.app().unwrap_or_default().to_string(),
                    containers: p.all.iter().map(|c| ContainerSummary::from(c.as_ref())).collect(),
                })
                .collect();
            Ok(Json(summaries).into_response())
        }
        Some(other) => Err(CriError::Unsupported(format!("list type {other}")).into()),
    }
}

/// Open a port-forward and describe it as plain text
async fn portforward(State(state): State<Arc<AppState>>, Query(q): Query<AddrQuery>) -> ApiResult<String> {
    let info = state.portforward.start(&q.addr).await?;
    Ok(format!(
        "Listen on {}\nForwarding to {} for {}s, until {}\n",
        info.listen,
        info.target,
        state.portforward.survival().as_secs(),
        info.expires_at.to_rfc3339()
    ))
}

async fn portforward_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.portforward.list())
}

/// 503 once any component is unhealthy; degraded still answers 200
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health();
    let code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness();
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness))
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Ok(text) => ([("content-type", "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/meta/local/get", get(get_pod))
        .route("/api/meta/local/getByCid", get(get_by_cid))
        .route("/api/meta/local/list", get(list))
        .route("/api/cri/netproxy/portforward", get(portforward))
        .route("/api/cri/netproxy/portforward/list", get(portforward_list))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
