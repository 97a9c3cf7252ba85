//! Container inspection commands

use anyhow::Result;
use colored::Colorize;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, OutputFormat};

/// Show one container by full or short id
pub async fn get(client: &ApiClient, cid: &str, format: OutputFormat) -> Result<()> {
    let c = client.get_container(cid).await?;

    match format {
        OutputFormat::Json => print_json(&c)?,
        OutputFormat::Table => {
            println!("{}", "Container".bold());
            println!("{}", "=".repeat(60));
            println!("ID:       {}", c.id.cyan());
            println!("Name:     {}", c.name);
            println!("Pod:      {}/{}", c.namespace, c.pod_name);
            println!("Role:     {}", c.role);
            println!("Status:   {}", color_status(&c.state.status));
            println!("PID:      {}", c.state.pid);
            if !c.state.started_at.is_empty() {
                println!("Started:  {}", c.state.started_at);
            }
            if !c.runtime.is_empty() {
                println!("Runtime:  {}", c.runtime);
            }
            if !c.sandbox_id.is_empty() {
                println!("Sandbox:  {}", c.sandbox_id);
            }
            println!("Helper:   {}", if c.hacked { "installed" } else { "absent" });
        }
    }
    Ok(())
}
