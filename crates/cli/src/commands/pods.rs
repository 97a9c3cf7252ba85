//! Pod inspection commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, ContainerDetail, PodSummary};
use crate::output::{color_status, print_json, print_warning, short_id, table, yes_no, OutputFormat};

/// Row for pod list table
#[derive(Tabled)]
struct PodRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "App")]
    app: String,
    #[tabled(rename = "Containers")]
    containers: String,
}

impl From<&PodSummary> for PodRow {
    fn from(p: &PodSummary) -> Self {
        let running = p.containers.iter().filter(|c| c.running).count();
        Self {
            namespace: p.namespace.clone(),
            name: p.name.clone(),
            ip: p.ip.clone(),
            phase: color_status(&p.phase),
            app: p.app.clone(),
            containers: format!("{}/{}", running, p.containers.len()),
        }
    }
}

/// Row for a pod's container table
#[derive(Tabled)]
pub(crate) struct ContainerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "PID")]
    pid: i32,
    #[tabled(rename = "Helper")]
    hacked: String,
}

impl From<&ContainerDetail> for ContainerRow {
    fn from(c: &ContainerDetail) -> Self {
        Self {
            id: short_id(&c.id).to_string(),
            name: c.name.clone(),
            role: c.role.clone(),
            status: color_status(&c.state.status),
            pid: c.state.pid,
            hacked: yes_no(c.hacked),
        }
    }
}

/// List pods on the node
pub async fn list(client: &ApiClient, detail: bool, format: OutputFormat) -> Result<()> {
    if detail {
        // Detail records only make sense as JSON
        return print_json(&client.list_pods_detail().await?);
    }

    let pods = client.list_pods().await?;
    match format {
        OutputFormat::Json => print_json(&pods)?,
        OutputFormat::Table => {
            if pods.is_empty() {
                print_warning("No pods found on this node");
                return Ok(());
            }
            let rows: Vec<PodRow> = pods.iter().map(PodRow::from).collect();
            println!("{}", table(rows));
            println!("\nTotal: {} pods", pods.len());
        }
    }
    Ok(())
}

/// Show one pod and its containers
pub async fn get(client: &ApiClient, namespace: &str, name: &str, format: OutputFormat) -> Result<()> {
    let pod = client.get_pod(namespace, name).await?;

    match format {
        OutputFormat::Json => print_json(&pod)?,
        OutputFormat::Table => {
            println!("{}", "Pod".bold());
            println!("{}", "=".repeat(60));
            println!("Namespace: {}", pod.namespace.cyan());
            println!("Name:      {}", pod.name.cyan());
            println!("UID:       {}", pod.uid);
            println!();

            if pod.all.is_empty() {
                print_warning("No containers attached to this pod");
                return Ok(());
            }
            let rows: Vec<ContainerRow> = pod.all.iter().map(ContainerRow::from).collect();
            println!("{}", table(rows));
        }
    }
    Ok(())
}
