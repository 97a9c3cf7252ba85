//! Process-wide bundle of the runtime interaction services
//!
//! Built once at startup and handed to every consumer by reference.

use crate::copy::CopyService;
use crate::engine::ContainerEngine;
use crate::exec::{ExecService, DEFAULT_EXEC_TIMEOUT, DEFAULT_MAX_IN_FLIGHT};
use crate::gateway::{GatewayConfig, GatewayWriter, PointExporter};
use crate::health::{components, HealthRegistry};
use crate::helper::{CopyHelperInjector, HelperClient};
use crate::meta::source::PodSource;
use crate::meta::{MetaConfig, MetaStore};
use crate::netproxy::portforward::{PortForwardManager, DEFAULT_SURVIVAL};
use crate::netproxy::{Dialer, PodDialer, DEFAULT_DIAL_TIMEOUT};
use crate::nsenter::NsEnter;
use crate::observability::StructuredLogger;
use crate::oom::OomRecorder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CriOptions {
    /// Directory holding the helper and busybox binaries to inject
    pub helper_dir: PathBuf,
    pub exec_timeout: Duration,
    pub exec_max_in_flight: usize,
    pub dial_timeout: Duration,
    pub portforward_survival: Duration,
    pub meta: MetaConfig,
    pub gateway: GatewayConfig,
}

impl Default for CriOptions {
    fn default() -> Self {
        Self {
            helper_dir: PathBuf::from("/usr/local/holoinsight/agent/bin"),
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            exec_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            portforward_survival: DEFAULT_SURVIVAL,
            meta: MetaConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct Cri {
    pub engine: Arc<dyn ContainerEngine>,
    pub nsenter: NsEnter,
    pub meta: MetaStore,
    pub exec: ExecService,
    pub copy: CopyService,
    pub helper: HelperClient,
    pub dialer: Arc<dyn Dialer>,
    pub portforward: PortForwardManager,
    pub oom: Arc<OomRecorder>,
    pub gateway: GatewayWriter,
}

impl Cri {
    pub fn new(
        options: CriOptions,
        engine: Arc<dyn ContainerEngine>,
        source: Arc<dyn PodSource>,
        exporter: Arc<dyn PointExporter>,
        logger: StructuredLogger,
    ) -> Self {
        let nsenter = NsEnter::new(options.meta.hostfs.clone());
        let copy = CopyService::new(engine.clone(), logger.clone());
        let injector = Arc::new(CopyHelperInjector::new(
            copy.clone(),
            options.helper_dir.clone(),
            logger.clone(),
        ));
        let meta = MetaStore::new(options.meta, source, engine.clone(), injector, logger.clone());
        let exec = ExecService::new(engine.clone(), nsenter.clone())
            .with_timeout(options.exec_timeout)
            .with_max_in_flight(options.exec_max_in_flight);
        let helper = HelperClient::new(exec.clone());
        let dialer: Arc<dyn Dialer> = Arc::new(
            PodDialer::new(meta.clone(), nsenter.clone(), helper.clone())
                .with_timeout(options.dial_timeout),
        );
        let portforward = PortForwardManager::new(dialer.clone(), logger.clone())
            .with_survival(options.portforward_survival);
        let gateway = GatewayWriter::new(options.gateway, exporter);
        let oom = Arc::new(OomRecorder::new(
            engine.clone(),
            meta.clone(),
            gateway.clone(),
            logger,
        ));

        Self {
            engine,
            nsenter,
            meta,
            exec,
            copy,
            helper,
            dialer,
            portforward,
            oom,
            gateway,
        }
    }

    /// Expose the services' own conditions under their component names
    pub fn register_health(&self, registry: &HealthRegistry) {
        registry.register(components::META_STORE, self.meta.condition().clone());
        registry.register(components::ENGINE, self.meta.engine_condition().clone());
        registry.register(components::OOM_RECORDER, self.oom.condition().clone());
        registry.register(components::GATEWAY, self.gateway.condition().clone());
    }

    /// Spawn the meta store and OOM recorder loops
    pub fn spawn(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let meta = self.meta.clone();
        let meta_rx = shutdown.subscribe();
        let oom = self.oom.clone();
        let oom_rx = shutdown.subscribe();
        vec![
            tokio::spawn(async move { meta.run(meta_rx).await }),
            tokio::spawn(oom.run(oom_rx)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::prometheus::PrometheusExporter;
    use crate::testing::{detail, k8s_pod, FakeEngine, StaticPodSource};

    #[tokio::test]
    async fn test_wires_meta_and_background_loops() {
        let engine = Arc::new(FakeEngine::new());
        let source = Arc::new(StaticPodSource::new());
        source.set(vec![k8s_pod("kube-system", "proxy-1", "U1", "Running")]);
        engine.set(vec![
            detail("sandbox0000000000000001", "POD", "U1", "").sandbox(),
            detail("biz00000000000000000001", "proxy", "U1", "sandbox0000000000000001").pid(100),
        ]);
        source.mark_synced();

        let options = CriOptions {
            meta: MetaConfig {
                hostfs: PathBuf::from("/nonexistent-hostfs"),
                ..Default::default()
            },
            ..Default::default()
        };
        let cri = Cri::new(
            options,
            engine.clone(),
            source,
            Arc::new(PrometheusExporter::new(prometheus::Registry::new())),
            StructuredLogger::new("test-node"),
        );

        let (tx, _) = broadcast::channel(1);
        let handles = cri.spawn(&tx);
        for _ in 0..100 {
            if cri.meta.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cri.meta.get_pod("kube-system", "proxy-1").is_some());
        assert!(cri.portforward.list().is_empty());

        let registry = HealthRegistry::new();
        cri.register_health(&registry);
        let health = registry.health();
        assert_eq!(health.components.len(), 4);
        assert!(health.components.contains_key(components::ENGINE));
        engine.fail_list(true);
        cri.meta.reconcile().await.unwrap_err();
        assert_eq!(
            registry.health().components[components::ENGINE].status,
            crate::health::ComponentStatus::Degraded
        );

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
