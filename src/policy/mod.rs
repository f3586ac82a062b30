pub mod progression;
pub mod rules;
pub mod verification;
pub mod version_rules;
pub mod window;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::selector::kinds::PolicyTargetIndex;
use crate::state::backend::StateBackend;
use crate::state::models::{Deployment, DeploymentVersion, Environment, Policy, ReleaseTarget, Resource};
use progression::EnvironmentProgressionGate;
use rules::DeploymentWindowRule;
use verification::{VerificationClient, VerificationGate};
use version_rules::{
    ApprovalGate, CooldownGate, DependencyGate, RollbackFilter, RolloutGate, SelectorFilter,
    WindowGate,
};

/// Everything a rule may look at while judging one release target.
pub struct RuleContext<'a> {
    pub backend: &'a dyn StateBackend,
    pub target: &'a ReleaseTarget,
    pub resource: &'a Resource,
    pub environment: &'a Environment,
    pub deployment: &'a Deployment,
    pub now: DateTime<Utc>,
}

/// What a rule left of the candidates it was given.
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub allowed: Vec<DeploymentVersion>,
    pub reason: Option<String>,
}

impl RuleOutcome {
    pub fn pass(allowed: Vec<DeploymentVersion>) -> Self {
        Self {
            allowed,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: vec![],
            reason: Some(reason.into()),
        }
    }

    /// Keep only candidates accepted by `keep`, collecting a reason for the rest.
    pub fn retain(
        candidates: Vec<DeploymentVersion>,
        mut keep: impl FnMut(&DeploymentVersion) -> Option<String>,
    ) -> Self {
        let mut allowed = Vec::new();
        let mut reasons = Vec::new();
        for version in candidates {
            match keep(&version) {
                None => allowed.push(version),
                Some(reason) => reasons.push(format!("{}: {}", version.tag, reason)),
            }
        }
        Self {
            allowed,
            reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        }
    }
}

/// Enabled policies with at least one target selecting the release target,
/// highest priority first.
pub async fn matched_policies(
    backend: &dyn StateBackend,
    index: &PolicyTargetIndex,
    target: &ReleaseTarget,
) -> Result<Vec<Policy>> {
    let policy_ids: BTreeSet<String> = index
        .selectors_for_entity(&target.id)
        .await
        .into_iter()
        .map(|t| t.policy_id)
        .collect();
    if policy_ids.is_empty() {
        return Ok(vec![]);
    }

    let mut policies: Vec<Policy> = backend
        .list_policies(&target.workspace_id)
        .await?
        .into_iter()
        .filter(|p| p.enabled && policy_ids.contains(&p.id))
        .collect();
    policies.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(policies)
}

/// Narrows the version candidate set.
#[async_trait]
pub trait VersionRule: Send + Sync {
    fn name(&self) -> &'static str;

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome>;
}

/// Why a rule removed candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub policy: String,
    pub rule: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub allowed: Vec<DeploymentVersion>,
    pub rejections: Vec<Rejection>,
}

/// Rules of every matched, enabled policy, applied in descending priority.
pub struct RulePipeline {
    version_rules: Vec<(String, Box<dyn VersionRule>)>,
    windows: Vec<(String, DeploymentWindowRule)>,
}

impl RulePipeline {
    /// `policies` must already be the matched set; disabled ones are skipped
    /// and the rest ordered by priority, highest first.
    pub fn from_policies(
        policies: &[Policy],
        verifier: Arc<dyn VerificationClient>,
        verification_timeout: Duration,
    ) -> Self {
        let mut ordered: Vec<&Policy> = policies.iter().filter(|p| p.enabled).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut version_rules: Vec<(String, Box<dyn VersionRule>)> = Vec::new();
        let mut windows = Vec::new();
        for policy in ordered {
            let rules = &policy.rules;
            let mut push = |rule: Box<dyn VersionRule>| {
                version_rules.push((policy.name.clone(), rule));
            };
            if let Some(rule) = &rules.version_selector {
                push(Box::new(SelectorFilter(rule.clone())));
            }
            if let Some(rule) = &rules.deployment_dependency {
                push(Box::new(DependencyGate(rule.clone())));
            }
            if let Some(rule) = &rules.deployment_window {
                push(Box::new(WindowGate(rule.clone())));
                windows.push((policy.name.clone(), rule.clone()));
            }
            if let Some(rule) = &rules.environment_progression {
                push(Box::new(EnvironmentProgressionGate(rule.clone())));
            }
            if let Some(rule) = &rules.version_cooldown {
                push(Box::new(CooldownGate(rule.clone())));
            }
            if let Some(rule) = &rules.gradual_rollout {
                push(Box::new(RolloutGate(rule.clone())));
            }
            if let Some(rule) = &rules.any_approval {
                push(Box::new(ApprovalGate(rule.clone())));
            }
            if let Some(rule) = &rules.rollback {
                push(Box::new(RollbackFilter(rule.clone())));
            }
            if let Some(rule) = &rules.verification {
                push(Box::new(VerificationGate::new(
                    rule.clone(),
                    verifier.clone(),
                    verification_timeout,
                )));
            }
        }

        Self {
            version_rules,
            windows,
        }
    }

    /// Run every version rule in order, stopping once nothing is left.
    pub async fn filter_versions(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<PipelineResult> {
        let mut allowed = candidates;
        let mut rejections = Vec::new();

        for (policy, rule) in &self.version_rules {
            if allowed.is_empty() {
                break;
            }
            let before = allowed.len();
            let outcome = rule
                .filter(ctx, allowed)
                .await
                .with_context(|| format!("rule {} of policy '{}' failed", rule.name(), policy))?;
            allowed = outcome.allowed;

            if let Some(reason) = outcome.reason {
                tracing::debug!(
                    release_target = %ctx.target.key(),
                    policy = policy.as_str(),
                    rule = rule.name(),
                    before,
                    after = allowed.len(),
                    reason = reason.as_str(),
                    "rule narrowed candidates"
                );
                rejections.push(Rejection {
                    policy: policy.clone(),
                    rule: rule.name(),
                    reason,
                });
            }
        }

        Ok(PipelineResult {
            allowed,
            rejections,
        })
    }

    /// The first deployment window that currently blocks variable changes.
    /// A window that cannot be evaluated blocks.
    pub fn variable_block(&self, now: DateTime<Utc>) -> Option<String> {
        for (policy, window) in &self.windows {
            match window.blocks(now) {
                Ok(false) => {}
                Ok(true) => return Some(policy.clone()),
                Err(e) => {
                    tracing::warn!(policy = policy.as_str(), error = %e, "bad deployment window");
                    return Some(policy.clone());
                }
            }
        }
        None
    }
}
