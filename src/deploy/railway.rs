//! Railway deployment adapter.
//!
//! Talks to Railway's GraphQL API through a handful of fixed operations.
//! The API token comes from `RAILWAY_TOKEN` and never leaves this module.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use super::{
    DeployError, DeployPlatform, DeploymentStatus, PlatformKind, StatusReport,
    TriggeredDeployment,
};

pub struct RailwayPlatform {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl RailwayPlatform {
    pub fn new(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            token: std::env::var("RAILWAY_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    fn token(&self) -> Result<&str, DeployError> {
        self.token
            .as_deref()
            .ok_or_else(|| DeployError::NotConfigured("RAILWAY_TOKEN is not set".to_string()))
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value, DeployError> {
        let token = self.token()?;
        let response = self
            .http
            .post(format!("{}/graphql/v2", self.base_url))
            .bearer_auth(token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(DeployError::Api(format!(
                "Railway returned {status}: {}",
                body["errors"]
            )));
        }
        if body.get("errors").is_some_and(|e| !e.is_null()) {
            return Err(DeployError::Api(format!("Railway errors: {}", body["errors"])));
        }
        Ok(body["data"].clone())
    }
}

#[async_trait]
impl DeployPlatform for RailwayPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Railway
    }

    async fn probe(&self) -> bool {
        if self.token.is_none() {
            return false;
        }
        self.graphql("query { me { id } }", json!({})).await.is_ok()
    }

    async fn run_migrations(&self, project_id: &str) -> Result<(), DeployError> {
        // Migrations on Railway run as a one-off command against the
        // service environment.
        let data = self
            .graphql(
                "mutation($projectId: String!) { serviceInstanceRun(projectId: $projectId, command: \"npm run migrate\") { id } }",
                json!({ "projectId": project_id }),
            )
            .await?;
        debug!(project_id = %project_id, result = %data, "Triggered Railway migrations");
        Ok(())
    }

    async fn trigger_deployment(
        &self,
        project_id: &str,
    ) -> Result<TriggeredDeployment, DeployError> {
        let data = self
            .graphql(
                "mutation($projectId: String!) { serviceInstanceDeploy(projectId: $projectId) { id staticUrl } }",
                json!({ "projectId": project_id }),
            )
            .await?;
        let deployment = &data["serviceInstanceDeploy"];
        let deployment_id = deployment["id"]
            .as_str()
            .ok_or_else(|| DeployError::Protocol("missing deployment id".to_string()))?
            .to_string();
        let deployment_url = deployment["staticUrl"]
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
        let data = self
            .graphql(
                "query($id: String!) { deployment(id: $id) { status deploymentStopped } }",
                json!({ "id": deployment_id }),
            )
            .await?;
        let raw = data["deployment"]["status"]
            .as_str()
            .ok_or_else(|| DeployError::Protocol("missing deployment status".to_string()))?;
        let status = DeploymentStatus::parse(raw)
            .ok_or_else(|| DeployError::Protocol(format!("unknown Railway status '{raw}'")))?;

        let logs = if status.is_terminal() && status != DeploymentStatus::Success {
            let logs = self
                .graphql(
                    "query($id: String!) { buildLogs(deploymentId: $id, limit: 50) { message } }",
                    json!({ "id": deployment_id }),
                )
                .await
                .ok()
                .and_then(|data| {
                    data["buildLogs"].as_array().map(|lines| {
                        lines
                            .iter()
                            .filter_map(|l| l["message"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                });
            logs
        } else {
            None
        };

        Ok(StatusReport { status, logs })
    }

    async fn rollback(&self, deployment_id: &str) -> Result<(), DeployError> {
        self.graphql(
            "mutation($id: String!) { deploymentRollback(id: $id) }",
            json!({ "id": deployment_id }),
        )
        .await?;
        Ok(())
    }
}
