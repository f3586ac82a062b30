use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::job::status::JobStatus;
use crate::selector::condition::Condition;

/// The fixed set of rule types a policy row may carry, at most one each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_dependency: Option<DeploymentDependencyRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_window: Option<DeploymentWindowRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_progression: Option<EnvironmentProgressionRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradual_rollout: Option<GradualRolloutRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_selector: Option<VersionSelectorRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_cooldown: Option<VersionCooldownRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_approval: Option<AnyApprovalRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Retry,
    DeploymentDependency,
    DeploymentWindow,
    EnvironmentProgression,
    GradualRollout,
    VersionSelector,
    VersionCooldown,
    AnyApproval,
    Rollback,
    Verification,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Retry => "retry",
            RuleType::DeploymentDependency => "deployment_dependency",
            RuleType::DeploymentWindow => "deployment_window",
            RuleType::EnvironmentProgression => "environment_progression",
            RuleType::GradualRollout => "gradual_rollout",
            RuleType::VersionSelector => "version_selector",
            RuleType::VersionCooldown => "version_cooldown",
            RuleType::AnyApproval => "any_approval",
            RuleType::Rollback => "rollback",
            RuleType::Verification => "verification",
        }
    }
}

impl PolicyRules {
    /// Serialize each configured rule as a `(type, config)` row.
    pub fn to_rows(&self) -> anyhow::Result<Vec<(RuleType, String)>> {
        let mut rows = Vec::new();
        macro_rules! push {
            ($field:ident, $ty:expr) => {
                if let Some(rule) = &self.$field {
                    rows.push(($ty, serde_json::to_string(rule)?));
                }
            };
        }
        push!(retry, RuleType::Retry);
        push!(deployment_dependency, RuleType::DeploymentDependency);
        push!(deployment_window, RuleType::DeploymentWindow);
        push!(environment_progression, RuleType::EnvironmentProgression);
        push!(gradual_rollout, RuleType::GradualRollout);
        push!(version_selector, RuleType::VersionSelector);
        push!(version_cooldown, RuleType::VersionCooldown);
        push!(any_approval, RuleType::AnyApproval);
        push!(rollback, RuleType::Rollback);
        push!(verification, RuleType::Verification);
        Ok(rows)
    }

    /// Load one stored rule row into its slot. Unknown types are ignored.
    pub fn apply_row(&mut self, rule_type: &str, config: &str) -> anyhow::Result<()> {
        match rule_type {
            "retry" => self.retry = Some(serde_json::from_str(config)?),
            "deployment_dependency" => self.deployment_dependency = Some(serde_json::from_str(config)?),
            "deployment_window" => self.deployment_window = Some(serde_json::from_str(config)?),
            "environment_progression" => {
                self.environment_progression = Some(serde_json::from_str(config)?)
            }
            "gradual_rollout" => self.gradual_rollout = Some(serde_json::from_str(config)?),
            "version_selector" => self.version_selector = Some(serde_json::from_str(config)?),
            "version_cooldown" => self.version_cooldown = Some(serde_json::from_str(config)?),
            "any_approval" => self.any_approval = Some(serde_json::from_str(config)?),
            "rollback" => self.rollback = Some(serde_json::from_str(config)?),
            "verification" => self.verification = Some(serde_json::from_str(config)?),
            other => tracing::warn!(rule_type = other, "Ignoring unknown policy rule type"),
        }
        Ok(())
    }
}

// ─── Rule Records ───────────────────────────────────────────────────────────

/// Consulted by the job manager only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRule {
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDependencyRule {
    pub depends_on_deployment_id: String,
    /// Which upstream versions qualify; absent means any successful one.
    #[serde(default)]
    pub version_selector: Option<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Releases only happen inside the window.
    Allow,
    /// Releases never happen inside the window.
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentWindowRule {
    /// RFC 5545 subset: FREQ=HOURLY|DAILY|WEEKLY, INTERVAL, BYDAY, UNTIL.
    pub rrule: String,
    /// Local wall-clock start of the first occurrence.
    pub dtstart: NaiveDateTime,
    /// `UTC`, a fixed offset such as `+02:00`, or an IANA zone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub duration_minutes: i64,
    pub kind: WindowKind,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentProgressionRule {
    pub depends_on_environment_id: String,
    #[serde(default = "default_success_percentage")]
    pub minimum_success_percentage: f64,
    #[serde(default)]
    pub minimum_soak_minutes: i64,
    /// Only successes newer than this many hours count.
    #[serde(default)]
    pub maximum_age_hours: Option<i64>,
    #[serde(default = "default_success_statuses")]
    pub success_statuses: Vec<JobStatus>,
}

fn default_success_percentage() -> f64 {
    100.0
}

fn default_success_statuses() -> Vec<JobStatus> {
    vec![JobStatus::Completed]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradualRolloutRule {
    /// Delay between consecutive targets being admitted.
    pub time_scale_interval_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSelectorRule {
    pub selector: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCooldownRule {
    pub interval_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyApprovalRule {
    pub min_approvals: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRule {
    pub rollback_on_job_statuses: Vec<JobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Block,
    Allow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRule {
    pub url: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    pub on_failure: FailurePolicy,
}
