//! Container runtime interaction agent
//!
//! This binary runs as a DaemonSet on each Kubernetes node, keeping a graph
//! of the node's pods and serving exec, copy and proxy access to them.

use anyhow::{Context, Result};
use cric_agent::{
    api,
    config::{AgentConfig, PodSourceMode},
};
use cric_core::{
    engine::{docker::DockerEngine, ContainerEngine},
    gateway::{prometheus::PrometheusExporter, GatewayConfig},
    health::{components, Condition, HealthRegistry},
    lifecycle::LifecycleWatcher,
    meta::{kubelet::KubeletPodSource, source::InformerPodSource, source::PodSource, MetaConfig},
    netproxy::{http, socks5},
    observability::StructuredLogger,
    Cri, CriOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const READINESS_POLL: Duration = Duration::from_secs(1);

fn build_engine(config: &AgentConfig) -> Result<Arc<dyn ContainerEngine>> {
    let engine = match &config.engine_socket {
        Some(socket) => DockerEngine::new(config.engine, socket, config.hostfs.clone()),
        None => DockerEngine::with_default_socket(config.engine, config.hostfs.clone()),
    }
    .context("Failed to create engine client")?;
    Ok(Arc::new(engine))
}

/// The informer source cannot run without a client; elsewhere it is optional
async fn build_kube_client(config: &AgentConfig) -> Result<Option<kube::Client>> {
    match kube::Client::try_default().await {
        Ok(client) => Ok(Some(client)),
        Err(e) if config.pod_source == PodSourceMode::Informer => {
            Err(e).context("Failed to create Kubernetes client")
        }
        Err(e) => {
            info!(error = %e, "No Kubernetes client");
            Ok(None)
        }
    }
}

fn build_pod_source(config: &AgentConfig, client: Option<kube::Client>) -> Result<Arc<dyn PodSource>> {
    let source: Arc<dyn PodSource> = match (config.pod_source, client) {
        (PodSourceMode::Informer, Some(client)) => {
            Arc::new(InformerPodSource::new(client, config.node_name.clone()))
        }
        (PodSourceMode::Informer, None) => anyhow::bail!("Informer pod source needs a Kubernetes client"),
        (PodSourceMode::Kubelet, _) => Arc::new(
            KubeletPodSource::new(&config.node_ip, config.kubelet_port)
                .context("Failed to create kubelet pod source")?,
        ),
    };
    Ok(source)
}

/// Bind both pod proxies; a failed bind marks the netproxy component unhealthy
async fn start_netproxy(
    config: &AgentConfig,
    cri: &Cri,
    condition: &Condition,
    shutdown: &broadcast::Sender<()>,
) {
    match TcpListener::bind(&config.http_proxy_addr).await {
        Ok(listener) => {
            tokio::spawn(http::serve(listener, cri.dialer.clone(), shutdown.subscribe()));
        }
        Err(e) => {
            warn!(addr = %config.http_proxy_addr, error = %e, "Failed to bind HTTP proxy");
            condition.unhealthy(format!("HTTP proxy bind failed: {e}"));
        }
    }
    match TcpListener::bind(&config.socks5_addr).await {
        Ok(listener) => {
            tokio::spawn(socks5::serve(listener, cri.dialer.clone(), shutdown.subscribe()));
        }
        Err(e) => {
            warn!(addr = %config.socks5_addr, error = %e, "Failed to bind SOCKS5 proxy");
            condition.unhealthy(format!("SOCKS5 proxy bind failed: {e}"));
        }
    }
}

/// Flip readiness once the first pod graph is installed
async fn track_readiness(cri: Cri, health: HealthRegistry, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(READINESS_POLL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                if cri.meta.is_ready() {
                    health.set_ready(true);
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT received").context("Failed to wait for SIGINT"),
        _ = term.recv() => Ok("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("SIGINT received")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cric-agent");

    let config = AgentConfig::load()?;
    info!(node_name = %config.node_name, hostfs = %config.hostfs.display(), "Agent configured");

    let logger = StructuredLogger::new(&config.node_name);

    let engine = build_engine(&config)?;
    let kube_client = build_kube_client(&config).await?;
    let source = build_pod_source(&config, kube_client.clone())?;
    logger.log_startup(AGENT_VERSION, engine.engine_type(), source.name());

    let options = CriOptions {
        helper_dir: config.helper_dir.clone(),
        exec_timeout: config.exec_timeout(),
        exec_max_in_flight: config.exec_max_in_flight,
        portforward_survival: config.portforward_survival(),
        meta: MetaConfig {
            hostfs: config.hostfs.clone(),
            period: config.reconcile_period(),
            offset: config.reconcile_offset(),
            ..Default::default()
        },
        gateway: GatewayConfig {
            capacity: config.gateway_capacity,
            batch_size: config.gateway_batch_size,
            ..Default::default()
        },
        ..Default::default()
    };
    let cri = Cri::new(
        options,
        engine,
        source.clone(),
        Arc::new(PrometheusExporter::default()),
        logger.clone(),
    );

    let health_registry = HealthRegistry::new();
    cri.register_health(&health_registry);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let source = source.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { source.run(rx).await });
    }
    let mut tasks = cri.spawn(&shutdown_tx);

    // Lifecycle events need the cluster-wide pod watch
    if let Some(client) = kube_client {
        let lifecycle = Arc::new(LifecycleWatcher::new(Some(client)));
        let rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { lifecycle.run(rx).await }));
    } else {
        info!("No Kubernetes client, lifecycle watcher disabled");
    }

    if config.netproxy_enabled {
        let condition = Condition::new();
        health_registry.register(components::NETPROXY, condition.clone());
        start_netproxy(&config, &cri, &condition, &shutdown_tx).await;
    }

    tokio::spawn(track_readiness(
        cri.clone(),
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    // Start admin, health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), &cri));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown_tx.subscribe()));

    let reason = wait_for_signal().await?;
    logger.log_shutdown(reason);
    info!("Shutting down");

    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task failed");
        }
    }
    cri.gateway.join().await;
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    Ok(())
}
