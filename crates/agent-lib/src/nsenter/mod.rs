//! Namespace executor
//!
//! Two ways into a container's namespaces given its host pid:
//! - spawning the `nsenter` tool, which works for every namespace type
//! - [`NsEnter::run_in_namespaces`], which joins NET/UTS from a throwaway OS
//!   thread and runs a closure there
//!
//! Both are Linux-only; other hosts get [`CriError::Unsupported`].

#[cfg(target_os = "linux")]
mod linux;

use crate::engine::AsyncExec;
use crate::error::{CriError, Result};
use crate::models::{ExecRequest, ExecResult};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// `PATH` given to commands run through nsenter
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsType {
    Mnt,
    Net,
    Uts,
}

impl NsType {
    pub const ALL: [NsType; 3] = [NsType::Mnt, NsType::Net, NsType::Uts];

    /// File name under `/proc/<pid>/ns`
    pub fn file_name(&self) -> &'static str {
        match self {
            NsType::Mnt => "mnt",
            NsType::Net => "net",
            NsType::Uts => "uts",
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            NsType::Mnt => "--mount",
            NsType::Net => "--net",
            NsType::Uts => "--uts",
        }
    }
}

/// Namespace executor bound to a host filesystem prefix
#[derive(Debug, Clone)]
pub struct NsEnter {
    hostfs: PathBuf,
    binary: String,
}

impl NsEnter {
    pub fn new(hostfs: impl Into<PathBuf>) -> Self {
        Self {
            hostfs: hostfs.into(),
            binary: "nsenter".to_string(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn hostfs(&self) -> &Path {
        &self.hostfs
    }

    pub fn ns_path(&self, pid: i32, ns: NsType) -> PathBuf {
        self.hostfs
            .join("proc")
            .join(pid.to_string())
            .join("ns")
            .join(ns.file_name())
    }

    /// Arguments passed to the `nsenter` tool; empty `types` means all
    pub fn build_args(
        &self,
        types: &[NsType],
        pid: i32,
        cmd: &[String],
        cwd: Option<&str>,
    ) -> Vec<String> {
        let types = if types.is_empty() { &NsType::ALL[..] } else { types };
        let mut args: Vec<String> = types
            .iter()
            .map(|t| format!("{}={}", t.flag(), self.ns_path(pid, *t).display()))
            .collect();
        if let Some(cwd) = cwd.filter(|c| !c.is_empty()) {
            args.push(format!("--wd={cwd}"));
        }
        args.push("--".to_string());
        args.extend(cmd.iter().cloned());
        args
    }

    fn command(&self, types: &[NsType], pid: i32, req: &ExecRequest) -> Result<Command> {
        if !cfg!(target_os = "linux") {
            return Err(CriError::Unsupported("nsenter requires linux".into()));
        }
        if req.cmd.is_empty() {
            return Err(CriError::Unsupported("empty command".into()));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.build_args(types, pid, &req.cmd, req.working_dir.as_deref()))
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .envs(&req.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }

    /// Run a command in the namespaces of `pid` and buffer its output
    pub async fn run(
        &self,
        types: &[NsType],
        pid: i32,
        req: &ExecRequest,
        timeout: Duration,
    ) -> Result<ExecResult> {
        let cmd = self.command(types, pid, req)?;
        debug!(pid, cmd = ?req.cmd, "nsenter exec");
        run_with_timeout(cmd, req.input.clone(), timeout).await
    }

    /// Start a command in the namespaces of `pid` with piped stdio
    pub fn spawn(&self, types: &[NsType], pid: i32, req: &ExecRequest) -> Result<AsyncExec> {
        let cmd = self.command(types, pid, req)?;
        AsyncExec::from_command(cmd)
    }

    /// Run `f` on a dedicated OS thread that joined the namespaces of `pid`
    ///
    /// Empty `types` means all three, like the `nsenter` tool. The thread exits with `f`, so no other work ever runs in the joined
    /// namespaces. Joining MNT is refused: a thread that shares filesystem
    /// attributes with its process cannot switch mount namespaces.
    pub async fn run_in_namespaces<F, T>(&self, pid: i32, types: &[NsType], f: F) -> Result<T>
    where
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let types = if types.is_empty() { &NsType::ALL[..] } else { types };
        if types.contains(&NsType::Mnt) {
            return Err(CriError::Unsupported(
                "mount namespace cannot be joined in-process".into(),
            ));
        }

        #[cfg(target_os = "linux")]
        {
            let paths = types.iter().map(|t| (*t, self.ns_path(pid, *t))).collect();
            linux::run_in_namespaces(paths, f).await
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (pid, f);
            Err(CriError::Unsupported("setns requires linux".into()))
        }
    }

    /// TCP connect from inside the network namespace of `pid`
    ///
    /// The returned socket stays in that namespace for its whole life.
    pub async fn dial(&self, pid: i32, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let std_stream = self
            .run_in_namespaces(pid, &[NsType::Net], move || {
                std::net::TcpStream::connect_timeout(&addr, timeout)
            })
            .await?;
        std_stream.set_nonblocking(true)?;
        Ok(TcpStream::from_std(std_stream)?)
    }
}

/// Run `cmd`, feeding `input` to its stdin, and kill its process group on timeout
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    input: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ExecResult> {
    let mut child = cmd.spawn()?;
    let pid = child.id();

    if let Some(mut stdin) = child.stdin.take() {
        let input = input.unwrap_or_default();
        tokio::spawn(async move {
            // The child may exit without reading its input
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            Err(CriError::Timeout(timeout))
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        debug!(pgid, error = %e, "killpg after timeout");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
