//! Port-forward commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, PortForwardTask};
use crate::output::{print_json, print_success, print_warning, table, OutputFormat};

/// Row for port-forward table
#[derive(Tabled)]
struct PortForwardRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Listen")]
    listen: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Expires")]
    expires_at: String,
    #[tabled(rename = "Conns")]
    connections: u64,
}

impl From<&PortForwardTask> for PortForwardRow {
    fn from(t: &PortForwardTask) -> Self {
        Self {
            id: t.id,
            listen: t.listen.clone(),
            target: t.target.clone(),
            expires_at: t.expires_at.clone(),
            connections: t.connections,
        }
    }
}

/// Open a port-forward to `addr` and print where it listens
pub async fn start(client: &ApiClient, addr: &str) -> Result<()> {
    let text = client.portforward(addr).await?;
    print_success(&format!("Port-forward to {} opened", addr));
    print!("{}", text);
    Ok(())
}

/// List active port-forwards
pub async fn list(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let tasks = client.portforward_list().await?;

    match format {
        OutputFormat::Json => print_json(&tasks)?,
        OutputFormat::Table => {
            if tasks.is_empty() {
                print_warning("No active port-forwards");
                return Ok(());
            }
            let rows: Vec<PortForwardRow> = tasks.iter().map(PortForwardRow::from).collect();
            println!("{}", table(rows));
        }
    }
    Ok(())
}
