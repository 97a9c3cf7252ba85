use crate::output::OutputFormat;
use clap::{Args, Parser, Subcommand};

/// Inspect pods, containers and port-forwards on a node agent
#[derive(Parser, Debug)]
#[command(name = "cricctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Agent API URL
    #[arg(long, env = "CRIC_API_URL", default_value = "http://localhost:9117")]
    pub api_url: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pods known to the agent's meta store
    #[command(subcommand)]
    Pods(PodsCommands),

    /// Containers known to the agent's meta store
    #[command(subcommand)]
    Containers(ContainersCommands),

    /// Open or list port-forwards into pod networks
    Portforward(PortforwardArgs),

    /// Show agent health and readiness
    Health,
}

#[derive(Subcommand, Debug)]
pub enum PodsCommands {
    /// List local pods
    List {
        /// Print the full pod records
        #[arg(long)]
        detail: bool,
    },

    /// Show one pod
    Get {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ContainersCommands {
    /// Show one container by full or short id
    Get {
        /// Container id
        cid: String,
    },
}

#[derive(Args, Debug)]
#[command(args_conflicts_with_subcommands = true)]
pub struct PortforwardArgs {
    #[command(subcommand)]
    pub command: Option<PortforwardCommands>,

    /// Target address inside a pod, as ip:port
    pub addr: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum PortforwardCommands {
    /// List active port-forwards
    List,
}
