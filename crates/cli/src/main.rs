//! Operator CLI for the container runtime interaction agent
//!
//! Talks to one node agent's admin API to inspect its pod graph and
//! manage port-forwards.

use anyhow::Result;
use clap::Parser;
use cricctl::cli::{Cli, Commands, ContainersCommands, PodsCommands, PortforwardCommands};
use cricctl::client::ApiClient;
use cricctl::commands::{containers, health, pods, portforward};
use cricctl::output::print_error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = ApiClient::new(&cli.api_url)?;
    let format = cli.format;

    match cli.command {
        Commands::Pods(cmd) => match cmd {
            PodsCommands::List { detail } => pods::list(&client, detail, format).await,
            PodsCommands::Get { namespace, name } => pods::get(&client, &namespace, &name, format).await,
        },
        Commands::Containers(ContainersCommands::Get { cid }) => containers::get(&client, &cid, format).await,
        Commands::Portforward(args) => match (args.command, args.addr) {
            (Some(PortforwardCommands::List), _) => portforward::list(&client, format).await,
            (None, Some(addr)) => portforward::start(&client, &addr).await,
            (None, None) => anyhow::bail!("portforward needs a target address (ip:port) or `list`"),
        },
        Commands::Health => health::show(&client, format).await,
    }
}
