//! Agent health command

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, table, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

pub async fn show(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;
    let readiness = client.readiness().await?;

    match format {
        OutputFormat::Json => print_json(&json!({ "health": health, "readiness": readiness }))?,
        OutputFormat::Table => {
            println!("Status: {}", color_status(&health.status));
            if readiness.ready {
                println!("Ready:  {}", "yes".green());
            } else {
                let reason = readiness.reason.as_deref().unwrap_or("unknown");
                println!("Ready:  {} ({})", "no".red(), reason);
            }
            println!();

            let mut components: Vec<_> = health.components.iter().collect();
            components.sort_by(|a, b| a.0.cmp(b.0));
            let rows: Vec<ComponentRow> = components
                .into_iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&c.status),
                    message: c.message.clone().unwrap_or_default(),
                })
                .collect();
            println!("{}", table(rows));
        }
    }
    Ok(())
}
