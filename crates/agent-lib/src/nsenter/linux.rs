use super::NsType;
use crate::error::{CriError, Result};
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tokio::sync::oneshot;

fn clone_flag(ns: NsType) -> CloneFlags {
    match ns {
        NsType::Mnt => CloneFlags::CLONE_NEWNS,
        NsType::Net => CloneFlags::CLONE_NEWNET,
        NsType::Uts => CloneFlags::CLONE_NEWUTS,
    }
}

fn enter(paths: &[(NsType, PathBuf)]) -> io::Result<()> {
    // Open everything first so a missing pid fails before any setns
    let files = paths
        .iter()
        .map(|(ns, path)| File::open(path).map(|f| (*ns, f)))
        .collect::<io::Result<Vec<_>>>()?;
    for (ns, file) in &files {
        setns(file, clone_flag(*ns)).map_err(io::Error::from)?;
    }
    Ok(())
}

pub(super) async fn run_in_namespaces<F, T>(paths: Vec<(NsType, PathBuf)>, f: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("cric-setns".to_string())
        .spawn(move || {
            let result = enter(&paths).and_then(|_| f());
            let _ = tx.send(result);
        })?;

    rx.await
        .map_err(|_| CriError::Transient("namespace thread exited without a result".into()))?
        .map_err(CriError::from)
}
