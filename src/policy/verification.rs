use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::rules::{FailurePolicy, VerificationRule};
use super::{RuleContext, RuleOutcome, VersionRule};
use crate::state::models::DeploymentVersion;

/// Payload posted to an external verification endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub release_target_id: String,
    pub resource_id: String,
    pub environment_id: String,
    pub deployment_id: String,
    pub version_id: String,
    pub version_tag: String,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    #[serde(default = "default_allowed")]
    allowed: bool,
}

fn default_allowed() -> bool {
    true
}

/// External check consulted by the verification rule. Timeouts are applied by
/// the caller, so implementations may block for as long as their transport does.
#[async_trait]
pub trait VerificationClient: Send + Sync {
    /// `Ok(true)` admits the version, `Ok(false)` rejects it, `Err` falls back
    /// to the rule's failure policy.
    async fn verify(&self, url: &str, request: &VerificationRequest) -> Result<bool>;
}

/// Posts the request as JSON; a 2xx response with `{"allowed": false}` rejects.
pub struct HttpVerificationClient {
    client: reqwest::Client,
}

impl HttpVerificationClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpVerificationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationClient for HttpVerificationClient {
    async fn verify(&self, url: &str, request: &VerificationRequest) -> Result<bool> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("verification request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("verification endpoint {} returned an error", url))?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(true);
        }
        let parsed: VerificationResponse = serde_json::from_str(&body)
            .with_context(|| format!("verification endpoint {} returned invalid JSON", url))?;
        Ok(parsed.allowed)
    }
}

// ─── Rule ───────────────────────────────────────────────────────────────────

/// Asks an external endpoint about each candidate. A timeout or transport
/// error is decided by the rule's `on_failure` policy.
pub struct VerificationGate {
    rule: VerificationRule,
    client: Arc<dyn VerificationClient>,
    timeout: Duration,
}

impl VerificationGate {
    /// `ceiling` caps whatever timeout the rule asks for.
    pub fn new(rule: VerificationRule, client: Arc<dyn VerificationClient>, ceiling: Duration) -> Self {
        let timeout = rule
            .timeout_seconds
            .map(Duration::from_secs)
            .map_or(ceiling, |own| own.min(ceiling));
        Self {
            rule,
            client,
            timeout,
        }
    }

    async fn check(&self, ctx: &RuleContext<'_>, version: &DeploymentVersion) -> Option<String> {
        let request = VerificationRequest {
            release_target_id: ctx.target.id.clone(),
            resource_id: ctx.resource.id.clone(),
            environment_id: ctx.environment.id.clone(),
            deployment_id: ctx.deployment.id.clone(),
            version_id: version.id.clone(),
            version_tag: version.tag.clone(),
        };
        let failure = match tokio::time::timeout(self.timeout, self.client.verify(&self.rule.url, &request)).await {
            Ok(Ok(true)) => return None,
            Ok(Ok(false)) => return Some("verification rejected".into()),
            Ok(Err(e)) => format!("verification failed: {:#}", e),
            Err(_) => format!("verification timed out after {:?}", self.timeout),
        };
        tracing::warn!(
            release_target = %ctx.target.key(),
            version = version.tag.as_str(),
            on_failure = ?self.rule.on_failure,
            "{}",
            failure
        );
        match self.rule.on_failure {
            FailurePolicy::Allow => None,
            FailurePolicy::Block => Some(failure),
        }
    }
}

#[async_trait]
impl VersionRule for VerificationGate {
    fn name(&self) -> &'static str {
        "verification"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        let verdicts = join_all(candidates.iter().map(|version| self.check(ctx, version))).await;
        let mut verdicts = verdicts.into_iter();
        Ok(RuleOutcome::retain(candidates, |_| verdicts.next().flatten()))
    }
}
