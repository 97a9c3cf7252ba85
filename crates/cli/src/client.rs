//! API client for the agent's admin endpoints

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// API client for one node agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base_url.join(path).context("Invalid path")?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send(&self, path: &str, query: &[(&str, &str)], accept: &[StatusCode]) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(self.url(path, query)?)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && !accept.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }
        Ok(response)
    }

    /// Make a GET request returning JSON
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        self.send(path, query, &[])
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    /// Make a GET request returning plain text
    pub async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String> {
        self.send(path, query, &[])
            .await?
            .text()
            .await
            .context("Failed to read response")
    }

    pub async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        self.get("api/meta/local/list", &[("type", "summary")]).await
    }

    pub async fn list_pods_detail(&self) -> Result<Vec<PodDetail>> {
        self.get("api/meta/local/list", &[("type", "detail")]).await
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodDetail> {
        self.get("api/meta/local/get", &[("ns", namespace), ("pod", name)])
            .await
    }

    pub async fn get_container(&self, cid: &str) -> Result<ContainerDetail> {
        self.get("api/meta/local/getByCid", &[("cid", cid)]).await
    }

    pub async fn portforward(&self, addr: &str) -> Result<String> {
        self.get_text("api/cri/netproxy/portforward", &[("addr", addr)])
            .await
    }

    pub async fn portforward_list(&self) -> Result<Vec<PortForwardTask>> {
        self.get("api/cri/netproxy/portforward/list", &[]).await
    }

    /// Agent health; an unhealthy agent answers 503 with the same body
    pub async fn health(&self) -> Result<HealthReport> {
        self.send("healthz", &[], &[StatusCode::SERVICE_UNAVAILABLE])
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    pub async fn readiness(&self) -> Result<Readiness> {
        self.send("readyz", &[], &[StatusCode::SERVICE_UNAVAILABLE])
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub role: String,
    pub running: bool,
    pub hacked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub containers: Vec<ContainerSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub pid: i32,
    pub started_at: String,
    pub status: String,
}

/// Full container record; fields the CLI does not render pass through untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDetail {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub namespace: String,
    pub pod_name: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub runtime: String,
    pub role: String,
    #[serde(default)]
    pub hacked: bool,
    #[serde(default)]
    pub sandbox_id: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodDetail {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub all: Vec<ContainerDetail>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardTask {
    pub id: u64,
    pub target: String,
    pub listen: String,
    pub created_at: String,
    pub expires_at: String,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
