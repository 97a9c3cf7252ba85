//! Wrappers applied to every exec request

use crate::helper::paths;
use crate::models::{Container, ExecRequest};
use std::time::Duration;

/// Init processes known to reap orphaned children
pub const ZOMBIE_REAPERS: &[&str] = &[
    "tini",
    "dumb-init",
    "init",
    "systemd",
    "s6-svscan",
    "supervisord",
    "runsvdir",
];

pub const ENV_FROM: &str = "_FROM";
pub const ENV_TS: &str = "_TS";
pub const FROM_AGENT: &str = "holoinsight-agent";

pub fn is_zombie_reaper(comm: &str) -> bool {
    ZOMBIE_REAPERS.contains(&comm.trim())
}

/// Prefix the command with busybox `timeout`
///
/// Only applied when the helper is in place and pid 1 will reap the killed
/// process; elsewhere the timeout would leave a zombie behind.
pub fn wrap_timeout(container: &Container, req: &mut ExecRequest, timeout: Duration) {
    if !container.hacked || !container.reaps_zombies || req.cmd.is_empty() {
        return;
    }
    let secs = timeout.as_secs().max(1) + u64::from(timeout.subsec_nanos() > 0);
    let mut cmd = vec![
        paths::busybox(),
        "timeout".to_string(),
        "-s".to_string(),
        "SIGKILL".to_string(),
        secs.to_string(),
    ];
    cmd.append(&mut req.cmd);
    req.cmd = cmd;
}

/// Tag the process environment so agent-started commands are recognizable
pub fn wrap_env(req: &mut ExecRequest, now_ms: i64) {
    req.env.insert(ENV_FROM.to_string(), FROM_AGENT.to_string());
    req.env.insert(ENV_TS.to_string(), now_ms.to_string());
}

/// Apply both wrappers to a copy of `req`
pub fn wrap(container: &Container, req: &ExecRequest, timeout: Duration) -> ExecRequest {
    let mut wrapped = req.clone();
    wrap_timeout(container, &mut wrapped, timeout);
    wrap_env(&mut wrapped, chrono::Utc::now().timestamp_millis());
    wrapped
}
