//! Vercel deployment adapter.
//!
//! Uses the Vercel REST API. The token comes from `VERCEL_TOKEN` and never
//! leaves this module.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use super::{
    DeployError, DeployPlatform, DeploymentStatus, PlatformKind, StatusReport,
    TriggeredDeployment,
};

pub struct VercelPlatform {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl VercelPlatform {
    pub fn new(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            token: std::env::var("VERCEL_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    fn token(&self) -> Result<&str, DeployError> {
        self.token
            .as_deref()
            .ok_or_else(|| DeployError::NotConfigured("VERCEL_TOKEN is not set".to_string()))
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, DeployError> {
        let token = self.token()?;
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(DeployError::Api(format!("Vercel returned {status}: {body}")));
        }
        Ok(body)
    }

    async fn post(&self, path: &str, payload: serde_json::Value) -> Result<serde_json::Value, DeployError> {
        let token = self.token()?;
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(DeployError::Api(format!("Vercel returned {status}: {body}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl DeployPlatform for VercelPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Vercel
    }

    async fn probe(&self) -> bool {
        if self.token.is_none() {
            return false;
        }
        self.get("/v2/user").await.is_ok()
    }

    async fn run_migrations(&self, project_id: &str) -> Result<(), DeployError> {
        // Vercel runs migrations as part of the build step; nothing to do
        // ahead of the deployment itself.
        debug!(project_id = %project_id, "Vercel migrations run inside the build");
        Ok(())
    }

    async fn trigger_deployment(
        &self,
        project_id: &str,
    ) -> Result<TriggeredDeployment, DeployError> {
        let body = self
            .post(
                "/v13/deployments",
                json!({
                    "name": project_id,
                    "target": "production",
                    "gitSource": { "type": "github", "ref": "main" },
                }),
            )
            .await?;
        let deployment_id = body["id"]
            .as_str()
            .ok_or_else(|| DeployError::Protocol("missing deployment id".to_string()))?
            .to_string();
        let deployment_url = body["url"]
            .as_str()
            .map(|u| {
                if u.starts_with("http") {
                    u.to_string()
                } else {
                    format!("https://{u}")
                }
            })
            .ok_or_else(|| DeployError::Protocol("missing deployment url".to_string()))?;
        Ok(TriggeredDeployment {
            deployment_id,
            deployment_url,
        })
    }

    async fn deployment_status(&self, deployment_id: &str) -> Result<StatusReport, DeployError> {
        let body = self.get(&format!("/v13/deployments/{deployment_id}")).await?;
        let raw = body["readyState"]
            .as_str()
            .or_else(|| body["status"].as_str())
            .ok_or_else(|| DeployError::Protocol("missing readyState".to_string()))?;
        let status = DeploymentStatus::parse(raw)
            .ok_or_else(|| DeployError::Protocol(format!("unknown Vercel status '{raw}'")))?;
        let logs = body["errorMessage"].as_str().map(|s| s.to_string());
        Ok(StatusReport { status, logs })
    }

    async fn rollback(&self, deployment_id: &str) -> Result<(), DeployError> {
        // Vercel rolls back by promoting the previous successful
        // deployment; the API call is keyed by the failing deployment.
        self.post(
            &format!("/v9/deployments/{deployment_id}/rollback"),
            json!({}),
        )
        .await?;
        Ok(())
    }
}
