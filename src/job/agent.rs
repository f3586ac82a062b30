use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::backoff::{with_backoff, Backoff};
use crate::state::models::{DeploymentVersion, Job, JobVariable, ReleaseTarget};

/// What an adapter receives for one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub job: Job,
    pub release_id: String,
    pub release_target: ReleaseTarget,
    pub version: DeploymentVersion,
    pub variables: Vec<JobVariable>,
}

/// An external execution agent. Returns the agent's own id for the run, if it
/// has one; any error marks the job `invalid_integration`.
#[async_trait]
pub trait JobAgentAdapter: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Option<String>>;
}

/// Adapters keyed by job-agent type.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    adapters: HashMap<String, Arc<dyn JobAgentAdapter>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `webhook` adapter.
    pub fn with_builtin(backoff: Backoff) -> Self {
        let mut registry = Self::new();
        registry.register("webhook", Arc::new(WebhookAgent::new(backoff)));
        registry
    }

    pub fn register(&mut self, agent_type: &str, adapter: Arc<dyn JobAgentAdapter>) {
        self.adapters.insert(agent_type.to_string(), adapter);
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn JobAgentAdapter>> {
        self.adapters.get(agent_type).cloned()
    }
}

// ─── Webhook ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    job_id: &'a str,
    release_id: &'a str,
    release_target_id: &'a str,
    resource_id: &'a str,
    environment_id: &'a str,
    deployment_id: &'a str,
    version_id: &'a str,
    version_tag: &'a str,
    config: &'a serde_json::Value,
    /// Sensitive values are never sent.
    variables: BTreeMap<&'a str, &'a serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    #[serde(default)]
    external_id: Option<String>,
}

/// POSTs the job to `config.url`.
pub struct WebhookAgent {
    client: reqwest::Client,
    backoff: Backoff,
}

impl WebhookAgent {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            client: reqwest::Client::new(),
            backoff,
        }
    }

    async fn post_once(&self, url: &str, payload: &WebhookPayload<'_>) -> Result<Option<String>> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?
            .error_for_status()
            .with_context(|| format!("POST {} was rejected", url))?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let parsed: WebhookResponse = serde_json::from_str(&body).unwrap_or_default();
        Ok(parsed.external_id)
    }
}

#[async_trait]
impl JobAgentAdapter for WebhookAgent {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Option<String>> {
        let url = request
            .job
            .job_agent_config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("webhook job agent config has no 'url'"))?;

        let payload = WebhookPayload {
            job_id: &request.job.id,
            release_id: &request.release_id,
            release_target_id: &request.release_target.id,
            resource_id: &request.release_target.resource_id,
            environment_id: &request.release_target.environment_id,
            deployment_id: &request.release_target.deployment_id,
            version_id: &request.version.id,
            version_tag: &request.version.tag,
            config: &request.job.job_agent_config,
            variables: request
                .variables
                .iter()
                .filter(|v| !v.sensitive)
                .map(|v| (v.key.as_str(), &v.value))
                .collect(),
        };

        with_backoff(self.backoff, "webhook dispatch", || self.post_once(url, &payload)).await
    }
}
