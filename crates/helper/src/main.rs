//! cric-helper - runs inside biz containers on behalf of the node agent

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cric_helper::commands;
use cric_helper::protocol::{
    CollectInputRequest, Envelope, ListFilesRequest, PreviewLogRequest,
    DEFAULT_TCPPROXY_TIMEOUT_SECS, ENV_TCPPROXY_ADDR, ENV_TCPPROXY_TIMEOUT,
};
use cric_helper::proxy::{self, Duplex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cric-helper")]
#[command(about = "In-container helper for the node agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe the container from the inside
    Inspect,
    /// List a directory tree; request on stdin
    #[command(name = "listFiles")]
    ListFiles,
    /// Tail a log file; request on stdin
    #[command(name = "previewLog")]
    PreviewLog,
    /// Processes rooted at a pid
    Processes { pid: i32 },
    #[command(name = "countZombies")]
    CountZombies,
    /// Expand a glob pattern
    Glob { pattern: String },
    #[command(name = "collectInput")]
    CollectInput,
    #[command(name = "countThread")]
    CountThread,
    /// Serve one HTTP/1.1 exchange over stdio
    #[command(name = "httpProxy")]
    HttpProxy,
    /// Splice stdio with $TCPPROXY_ADDR
    #[command(name = "tcpProxy")]
    TcpProxy,
    /// Write the stdin request back
    Echo,
}

fn read_request<T: DeserializeOwned>() -> Result<T> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("read request from stdin")?;
    serde_json::from_str(&raw).context("decode request")
}

fn respond<T: Serialize>(result: Result<T>) -> Result<()> {
    let envelope = match result {
        Ok(data) => Envelope::ok(data),
        Err(e) => Envelope::fail(format!("{e:#}")),
    };
    println!("{}", serde_json::to_string(&envelope)?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let proc_root = Path::new("/proc");

    match cli.command {
        Commands::Inspect => respond(commands::inspect(Path::new("/"), proc_root)),
        Commands::ListFiles => respond(
            read_request::<ListFilesRequest>().and_then(|req| commands::list_files(&req)),
        ),
        Commands::PreviewLog => respond(
            read_request::<PreviewLogRequest>().and_then(|req| commands::preview_log(&req)),
        ),
        Commands::Processes { pid } => respond(commands::processes(proc_root, pid)),
        Commands::CountZombies => respond(commands::count_zombies(proc_root)),
        Commands::Glob { pattern } => respond(commands::glob_paths(&pattern)),
        Commands::CollectInput => respond(
            read_request::<CollectInputRequest>().and_then(|req| commands::collect_input(&req)),
        ),
        Commands::CountThread => respond(commands::count_thread(proc_root)),
        Commands::Echo => respond(read_request::<serde_json::Value>()),
        Commands::HttpProxy => proxy::http_proxy(Duplex::stdio()).await,
        Commands::TcpProxy => {
            let addr = std::env::var(ENV_TCPPROXY_ADDR)
                .with_context(|| format!("{ENV_TCPPROXY_ADDR} is not set"))?;
            let secs = std::env::var(ENV_TCPPROXY_TIMEOUT)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TCPPROXY_TIMEOUT_SECS);
            let mut stdio = Duplex::stdio();
            proxy::tcp_proxy(&mut stdio, &addr, Duration::from_secs(secs)).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_command_names() {
        let cli = Cli::try_parse_from(["cric-helper", "listFiles"]).unwrap();
        assert!(matches!(cli.command, Commands::ListFiles));

        let cli = Cli::try_parse_from(["cric-helper", "processes", "42"]).unwrap();
        assert!(matches!(cli.command, Commands::Processes { pid: 42 }));

        let cli = Cli::try_parse_from(["cric-helper", "glob", "/var/log/*.log"]).unwrap();
        assert!(matches!(cli.command, Commands::Glob { .. }));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(Cli::try_parse_from(["cric-helper", "list-files"]).is_err());
        assert!(Cli::try_parse_from(["cric-helper", "processes"]).is_err());
    }
}
