//! Wire protocol spoken between the agent and the helper binary
//!
//! The agent runs `<helper> <command> [args…]` inside a biz container. An
//! optional JSON request is written to stdin; the helper answers on stdout with
//! an [`Envelope`]. Free-form diagnostics go to stderr.

use serde::{Deserialize, Serialize};

/// Command names understood by the helper binary
pub mod commands {
    pub const INSPECT: &str = "inspect";
    pub const LIST_FILES: &str = "listFiles";
    pub const PREVIEW_LOG: &str = "previewLog";
    pub const PROCESSES: &str = "processes";
    pub const COUNT_ZOMBIES: &str = "countZombies";
    pub const GLOB: &str = "glob";
    pub const COLLECT_INPUT: &str = "collectInput";
    pub const COUNT_THREAD: &str = "countThread";
    pub const HTTP_PROXY: &str = "httpProxy";
    pub const TCP_PROXY: &str = "tcpProxy";
    pub const ECHO: &str = "echo";
}

/// Target address of the `tcpProxy` command
pub const ENV_TCPPROXY_ADDR: &str = "TCPPROXY_ADDR";
/// Connect timeout of the `tcpProxy` command, in seconds
pub const ENV_TCPPROXY_TIMEOUT: &str = "TCPPROXY_TIMEOUT";

/// Default connect timeout used by `tcpProxy` when the env var is absent
pub const DEFAULT_TCPPROXY_TIMEOUT_SECS: u64 = 3;

/// Response envelope written to stdout by every JSON command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResponse {
    pub hostname: String,
    /// `comm` of pid 1 inside the container
    pub pid1_comm: String,
    pub uid: u32,
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesRequest {
    pub name: String,
    #[serde(default)]
    pub include_dirs: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub dir: bool,
    pub size: u64,
    /// Modification time in unix milliseconds
    pub mod_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewLogRequest {
    pub path: String,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

fn default_max_bytes() -> u64 {
    4096
}

fn default_max_lines() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewLogResponse {
    pub path: String,
    pub file_size: u64,
    pub lines: Vec<String>,
    /// True when the preview does not start at the beginning of the file
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub comm: String,
    pub state: String,
    pub threads: u32,
    pub cmdline: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountZombiesResponse {
    pub zombies: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountThreadResponse {
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectInputRequest {
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}
