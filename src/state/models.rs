use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::job::status::JobStatus;
use crate::policy::rules::PolicyRules;
use crate::selector::condition::{Condition, ConditionSubject};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Workspace ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ─── Resources ──────────────────────────────────────────────────────────────

/// A piece of infrastructure tracked by the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub workspace_id: String,
    pub kind: String,
    pub version: String,
    pub name: String,
    /// Unique per workspace.
    pub identifier: String,
    pub provider_id: Option<String>,
    pub config: serde_json::Value,
    pub metadata: BTreeMap<String, String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(workspace_id: &str, kind: &str, identifier: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            workspace_id: workspace_id.to_string(),
            kind: kind.to_string(),
            version: "v1".to_string(),
            name: identifier.to_string(),
            identifier: identifier.to_string(),
            provider_id: None,
            config: serde_json::json!({}),
            metadata: BTreeMap::new(),
            locked_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl ConditionSubject for Resource {
    fn subject_id(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn kind(&self) -> Option<&str> {
        Some(&self.kind)
    }
    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }
    fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
    fn identifier(&self) -> Option<&str> {
        Some(&self.identifier)
    }
    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }
    fn last_sync(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

/// A value that is either literal or looked up through a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "valueType", rename_all = "camelCase")]
pub enum VariableValueKind {
    Direct {
        value: serde_json::Value,
        #[serde(default)]
        sensitive: bool,
    },
    Reference {
        /// Name of the relationship rule to follow.
        reference: String,
        /// Dotted path into the related resource's attributes.
        path: Vec<String>,
        #[serde(default, rename = "defaultValue")]
        default_value: Option<serde_json::Value>,
    },
}

/// A variable attached directly to a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceVariable {
    pub id: String,
    pub resource_id: String,
    pub key: String,
    pub value: VariableValueKind,
}

/// Describes how a target resource finds its related source resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipRule {
    pub id: String,
    pub workspace_id: String,
    /// Name that reference variables use.
    pub reference: String,
    pub source_kind: String,
    pub source_version: String,
    pub target_kind: Option<String>,
    pub target_version: Option<String>,
    pub source_metadata_equals: BTreeMap<String, String>,
    pub target_metadata_equals: BTreeMap<String, String>,
    /// Pairs of (source key, target key) whose metadata values must agree.
    pub metadata_keys_match: Vec<(String, String)>,
}

// ─── Systems, Environments, Deployments ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    pub resource_selector: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    pub slug: String,
    pub job_agent_id: Option<String>,
    pub job_agent_config: serde_json::Value,
    pub resource_selector: Option<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Ready,
    Building,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Ready => "ready",
            VersionStatus::Building => "building",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "building" => VersionStatus::Building,
            "failed" => VersionStatus::Failed,
            _ => VersionStatus::Ready,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub id: String,
    pub deployment_id: String,
    pub tag: String,
    pub name: String,
    pub config: serde_json::Value,
    pub metadata: BTreeMap<String, String>,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
}

impl DeploymentVersion {
    pub fn new(deployment_id: &str, tag: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            deployment_id: deployment_id.to_string(),
            tag: tag.to_string(),
            name: tag.to_string(),
            config: serde_json::json!({}),
            metadata: BTreeMap::new(),
            status: VersionStatus::Ready,
            created_at,
        }
    }
}

impl ConditionSubject for DeploymentVersion {
    fn subject_id(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
    fn tag(&self) -> Option<&str> {
        Some(&self.tag)
    }
    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAgent {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// Selects the adapter used for dispatch.
    pub agent_type: String,
    pub config: serde_json::Value,
}

// ─── Deployment Variables ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentVariable {
    pub id: String,
    pub deployment_id: String,
    pub key: String,
    pub description: String,
    pub default_value_id: Option<String>,
    pub values: Vec<DeploymentVariableValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVariableValue {
    pub id: String,
    pub variable_id: String,
    pub priority: i64,
    pub resource_selector: Option<Condition>,
    pub value: VariableValueKind,
}

// ─── Release Targets ────────────────────────────────────────────────────────

/// The identity of a release target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseTargetKey {
    pub resource_id: String,
    pub environment_id: String,
    pub deployment_id: String,
}

impl ReleaseTargetKey {
    pub fn new(resource_id: &str, environment_id: &str, deployment_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            environment_id: environment_id.to_string(),
            deployment_id: deployment_id.to_string(),
        }
    }

    /// Key used for the per-target lease.
    pub fn lock_key(&self) -> String {
        format!(
            "release-target:{}:{}:{}",
            self.resource_id, self.environment_id, self.deployment_id
        )
    }
}

impl fmt::Display for ReleaseTargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.resource_id, self.environment_id, self.deployment_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseTarget {
    pub id: String,
    pub workspace_id: String,
    pub resource_id: String,
    pub environment_id: String,
    pub deployment_id: String,
    pub desired_release_id: Option<String>,
    pub desired_version_id: Option<String>,
}

impl ReleaseTarget {
    pub fn new(workspace_id: &str, key: &ReleaseTargetKey) -> Self {
        Self {
            id: new_id(),
            workspace_id: workspace_id.to_string(),
            resource_id: key.resource_id.clone(),
            environment_id: key.environment_id.clone(),
            deployment_id: key.deployment_id.clone(),
            desired_release_id: None,
            desired_version_id: None,
        }
    }

    pub fn key(&self) -> ReleaseTargetKey {
        ReleaseTargetKey::new(&self.resource_id, &self.environment_id, &self.deployment_id)
    }
}

// ─── Releases ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRelease {
    pub id: String,
    pub release_target_id: String,
    pub version_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSetRelease {
    pub id: String,
    pub release_target_id: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable resolved key/value. Sensitive values hold ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValueSnapshot {
    pub id: String,
    pub workspace_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub version_release_id: String,
    pub variable_release_id: String,
    pub created_at: DateTime<Utc>,
}

// ─── Jobs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobReason {
    PolicyPassing,
    Retry,
}

impl JobReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobReason::PolicyPassing => "policy_passing",
            JobReason::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "retry" => JobReason::Retry,
            _ => JobReason::PolicyPassing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_agent_id: Option<String>,
    pub job_agent_config: serde_json::Value,
    pub status: JobStatus,
    pub reason: JobReason,
    pub message: Option<String>,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn pending(
        job_agent_id: Option<String>,
        job_agent_config: serde_json::Value,
        reason: JobReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            job_agent_id,
            job_agent_config,
            status: JobStatus::Pending,
            reason,
            message: None,
            external_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// What was actually sent with a job, copied from the variable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobVariable {
    pub job_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub sensitive: bool,
}

/// Latest job outcome for one release target, used by progression checks.
#[derive(Debug, Clone)]
pub struct TargetJobOutcome {
    pub release_target_id: String,
    pub status: JobStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

// ─── Policies ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub priority: i64,
    pub enabled: bool,
    pub targets: Vec<PolicyTarget>,
    pub rules: PolicyRules,
    pub created_at: DateTime<Utc>,
}

/// Scopes a policy to release targets. Absent sub-selectors do not constrain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTarget {
    pub id: String,
    pub policy_id: String,
    pub deployment_selector: Option<Condition>,
    pub environment_selector: Option<Condition>,
    pub resource_selector: Option<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub version_id: String,
    pub environment_id: String,
    pub user_id: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

// ─── Leases ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ─── Computed Matches ───────────────────────────────────────────────────────

/// Durable mirror tables of the selector indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchTable {
    EnvironmentResource,
    DeploymentResource,
    VariableValueResource,
    PolicyTargetReleaseTarget,
}

impl MatchTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            MatchTable::EnvironmentResource => "computed_environment_resource",
            MatchTable::DeploymentResource => "computed_deployment_resource",
            MatchTable::VariableValueResource => "computed_variable_value_resource",
            MatchTable::PolicyTargetReleaseTarget => "computed_policy_target_release_target",
        }
    }
}

/// One `(selector, entity)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchRow {
    pub selector_id: String,
    pub entity_id: String,
}
