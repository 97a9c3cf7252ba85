//! File copies between the agent and containers
//!
//! runc containers are reached through the host view of their rootfs. Other
//! runtimes go through the engine when it can copy, or through a mount that
//! exposes the target directory on the host.

use crate::engine::{ContainerEngine, Feature};
use crate::error::{CriError, Result};
use crate::models::{Container, MountPoint};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::path::{self, has_path_prefix};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    HostFs,
    Engine,
    Mount,
}

impl CopyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStrategy::HostFs => "hostfs",
            CopyStrategy::Engine => "engine",
            CopyStrategy::Mount => "mount",
        }
    }
}

/// Innermost mount enclosing `path`, optionally restricted to writable ones
fn enclosing_mount<'a>(mounts: &'a [MountPoint], path: &str, writable: bool) -> Option<&'a MountPoint> {
    mounts
        .iter()
        .filter(|m| !writable || m.rw)
        .filter(|m| has_path_prefix(path, &m.destination))
        .max_by_key(|m| m.destination.trim_end_matches('/').len())
}

fn via_mount(mount: &MountPoint, path: &str) -> PathBuf {
    let rest = &path[mount.destination.trim_end_matches('/').len()..];
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        PathBuf::from(&mount.source)
    } else {
        Path::new(&mount.source).join(rest)
    }
}

async fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(src, dst).await?;
    Ok(())
}

#[derive(Clone)]
pub struct CopyService {
    engine: Arc<dyn ContainerEngine>,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

impl CopyService {
    pub fn new(engine: Arc<dyn ContainerEngine>, logger: StructuredLogger) -> Self {
        Self {
            engine,
            logger,
            metrics: AgentMetrics::new(),
        }
    }

    pub fn strategy(&self, container: &Container) -> CopyStrategy {
        if container.is_runc() {
            CopyStrategy::HostFs
        } else if self.engine.supports(Feature::Copy) {
            CopyStrategy::Engine
        } else {
            CopyStrategy::Mount
        }
    }

    /// Copy the local file `src` to `dst` inside the container
    pub async fn copy_to_container(&self, container: &Container, src: &Path, dst: &str) -> Result<()> {
        let strategy = self.strategy(container);
        let start = Instant::now();
        let result = match strategy {
            CopyStrategy::HostFs => match path::translate(container, dst, true) {
                Ok(host) => copy_file(src, &host).await,
                Err(e) => Err(e),
            },
            CopyStrategy::Engine => self.engine.copy_to_container(&container.id, src, dst).await,
            CopyStrategy::Mount => match enclosing_mount(&container.mounts, &path::clean(dst), true) {
                Some(mount) => copy_file(src, &via_mount(mount, &path::clean(dst))).await,
                None => Err(CriError::NoWritableMount(dst.to_string())),
            },
        };
        self.digest(container, strategy, &src.to_string_lossy(), dst, start, &result);
        result
    }

    /// Copy `src` inside the container to the local file `dst`
    pub async fn copy_from_container(&self, container: &Container, src: &str, dst: &Path) -> Result<()> {
        let strategy = self.strategy(container);
        let start = Instant::now();
        let result = match strategy {
            CopyStrategy::HostFs => match path::translate(container, src, true) {
                Ok(host) => copy_file(&host, dst).await,
                Err(e) => Err(e),
            },
            CopyStrategy::Engine => self.engine.copy_from_container(&container.id, src, dst).await,
            CopyStrategy::Mount => match enclosing_mount(&container.mounts, &path::clean(src), false) {
                Some(mount) => copy_file(&via_mount(mount, &path::clean(src)), dst).await,
                None => Err(CriError::NotFound(format!("mount enclosing {src}"))),
            },
        };
        self.digest(container, strategy, src, &dst.to_string_lossy(), start, &result);
        result
    }

    /// Copy `src` out of the container into a fresh temp file
    ///
    /// The file is deleted when the returned path is dropped.
    pub async fn copy_from_container_to_temp_file(&self, container: &Container, src: &str) -> Result<TempPath> {
        let temp = tempfile::Builder::new()
            .prefix("cric-copy-")
            .tempfile()?
            .into_temp_path();
        self.copy_from_container(container, src, &temp).await?;
        Ok(temp)
    }

    fn digest(
        &self,
        container: &Container,
        strategy: CopyStrategy,
        src: &str,
        dst: &str,
        start: Instant,
        result: &Result<()>,
    ) {
        let error = result.as_ref().err().map(ToString::to_string);
        self.metrics.inc_copy(strategy.as_str(), result.is_ok());
        self.logger.log_copy(
            self.engine.engine_type(),
            &container.short_id,
            &container.runtime,
            strategy.as_str(),
            src,
            dst,
            start.elapsed(),
            error.as_deref(),
        );
    }
}
