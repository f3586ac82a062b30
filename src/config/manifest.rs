use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::policy::rules::PolicyRules;
use crate::selector::condition::Condition;
use crate::state::backend::StateBackend;
use crate::state::models::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, Environment,
    JobAgent, Policy, PolicyTarget, RelationshipRule, Resource, ResourceVariable, System,
    VariableValueKind, VersionStatus, Workspace,
};

// ─── Manifest Types ─────────────────────────────────────────────────────────

/// Declarative description of a workspace's inventory, applied by `sync`.
///
/// Ids are optional everywhere; when absent they are derived from the
/// workspace and the entity's natural key, so re-applying a manifest updates
/// the same rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Manifest {
    pub resources: Vec<ResourceManifest>,
    pub relationships: Vec<RelationshipManifest>,
    pub job_agents: Vec<JobAgentManifest>,
    pub systems: Vec<SystemManifest>,
    pub policies: Vec<PolicyManifest>,
}

impl Manifest {
    /// Append another file's contents.
    pub fn extend(&mut self, other: Manifest) {
        self.resources.extend(other.resources);
        self.relationships.extend(other.relationships);
        self.job_agents.extend(other.job_agents);
        self.systems.extend(other.systems);
        self.policies.extend(other.policies);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResourceManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub identifier: String,
    pub kind: String,
    #[serde(default = "default_resource_version")]
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableValueKind>,
    /// Soft-delete the resource.
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RelationshipManifest {
    pub reference: String,
    pub source_kind: String,
    pub source_version: String,
    #[serde(default)]
    pub target_kind: Option<String>,
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub source_metadata_equals: BTreeMap<String, String>,
    #[serde(default)]
    pub target_metadata_equals: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata_keys_match: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct JobAgentManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SystemManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub environments: Vec<EnvironmentManifest>,
    #[serde(default)]
    pub deployments: Vec<DeploymentManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EnvironmentManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub resource_selector: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DeploymentManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    /// Name of a job agent declared in the same manifest set.
    #[serde(default)]
    pub job_agent: Option<String>,
    #[serde(default = "empty_object")]
    pub job_agent_config: serde_json::Value,
    #[serde(default)]
    pub resource_selector: Option<Condition>,
    #[serde(default)]
    pub versions: Vec<VersionManifest>,
    #[serde(default)]
    pub variables: Vec<VariableManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct VersionManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub tag: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_version_status")]
    pub status: VersionStatus,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Defaults to the first time the version is applied.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct VariableManifest {
    pub key: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<VariableValueKind>,
    #[serde(default)]
    pub values: Vec<VariableValueManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct VariableValueManifest {
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub resource_selector: Option<Condition>,
    pub value: VariableValueKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PolicyManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<PolicyTargetManifest>,
    #[serde(default)]
    pub rules: PolicyRules,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct PolicyTargetManifest {
    pub deployment_selector: Option<Condition>,
    pub environment_selector: Option<Condition>,
    pub resource_selector: Option<Condition>,
}

fn default_resource_version() -> String {
    "v1".to_string()
}

fn default_version_status() -> VersionStatus {
    VersionStatus::Ready
}

fn default_true() -> bool {
    true
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

// ─── Ids ────────────────────────────────────────────────────────────────────

/// Deterministic id for a manifest entity without an explicit one.
pub fn stable_id(workspace_id: &str, kind: &str, natural_key: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}/{}", workspace_id, kind, natural_key).as_bytes());
    hex::encode(&digest[..16])
}

fn id_or(explicit: &Option<String>, workspace_id: &str, kind: &str, natural_key: &str) -> String {
    explicit
        .clone()
        .unwrap_or_else(|| stable_id(workspace_id, kind, natural_key))
}

// ─── Apply ──────────────────────────────────────────────────────────────────

/// How many rows of each kind a manifest wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub resources: usize,
    pub deleted_resources: usize,
    pub job_agents: usize,
    pub environments: usize,
    pub deployments: usize,
    pub versions: usize,
    pub variables: usize,
    pub policies: usize,
}

/// Upsert everything the manifest declares. Nothing absent from the manifest
/// is removed, except resources explicitly marked `deleted`.
pub async fn apply_manifest(
    backend: &dyn StateBackend,
    workspace: &Workspace,
    manifest: &Manifest,
    now: DateTime<Utc>,
) -> Result<ApplySummary> {
    let ws = workspace.id.as_str();
    let mut summary = ApplySummary::default();

    for item in &manifest.resources {
        let id = id_or(&item.id, ws, "resource", &item.identifier);
        let existing = backend.get_resource(&id).await?;
        let resource = Resource {
            id: id.clone(),
            workspace_id: ws.to_string(),
            kind: item.kind.clone(),
            version: item.version.clone(),
            name: item.name.clone().unwrap_or_else(|| item.identifier.clone()),
            identifier: item.identifier.clone(),
            provider_id: item.provider_id.clone(),
            config: item.config.clone(),
            metadata: item.metadata.clone(),
            locked_at: existing.as_ref().and_then(|r| r.locked_at),
            created_at: existing.as_ref().map_or(now, |r| r.created_at),
            updated_at: now,
            deleted_at: item.deleted.then_some(now),
        };
        backend
            .upsert_resource(&resource)
            .await
            .with_context(|| format!("Failed to write resource '{}'", item.identifier))?;
        for (key, value) in &item.variables {
            backend
                .upsert_resource_variable(&ResourceVariable {
                    id: stable_id(&id, "resource-variable", key),
                    resource_id: id.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
                .await?;
        }
        if item.deleted {
            summary.deleted_resources += 1;
        } else {
            summary.resources += 1;
        }
    }

    for item in &manifest.relationships {
        backend
            .upsert_relationship_rule(&RelationshipRule {
                id: stable_id(ws, "relationship", &item.reference),
                workspace_id: ws.to_string(),
                reference: item.reference.clone(),
                source_kind: item.source_kind.clone(),
                source_version: item.source_version.clone(),
                target_kind: item.target_kind.clone(),
                target_version: item.target_version.clone(),
                source_metadata_equals: item.source_metadata_equals.clone(),
                target_metadata_equals: item.target_metadata_equals.clone(),
                metadata_keys_match: item.metadata_keys_match.clone(),
            })
            .await?;
    }

    let mut agent_ids = HashMap::new();
    for item in &manifest.job_agents {
        let id = id_or(&item.id, ws, "job-agent", &item.name);
        backend
            .upsert_job_agent(&JobAgent {
                id: id.clone(),
                workspace_id: ws.to_string(),
                name: item.name.clone(),
                agent_type: item.agent_type.clone(),
                config: item.config.clone(),
            })
            .await?;
        agent_ids.insert(item.name.clone(), id);
        summary.job_agents += 1;
    }

    for system in &manifest.systems {
        let system_id = id_or(&system.id, ws, "system", &system.name);
        backend
            .upsert_system(&System {
                id: system_id.clone(),
                workspace_id: ws.to_string(),
                name: system.name.clone(),
            })
            .await?;

        for env in &system.environments {
            let key = format!("{}/{}", system.name, env.name);
            backend
                .upsert_environment(&Environment {
                    id: id_or(&env.id, ws, "environment", &key),
                    system_id: system_id.clone(),
                    name: env.name.clone(),
                    resource_selector: env.resource_selector.clone(),
                })
                .await
                .with_context(|| format!("Failed to write environment '{}'", key))?;
            summary.environments += 1;
        }

        for dep in &system.deployments {
            let slug = dep.slug.clone().unwrap_or_else(|| dep.name.clone());
            let key = format!("{}/{}", system.name, slug);
            let deployment_id = id_or(&dep.id, ws, "deployment", &key);
            let job_agent_id = match &dep.job_agent {
                Some(name) => Some(
                    agent_ids
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| stable_id(ws, "job-agent", name)),
                ),
                None => None,
            };
            backend
                .upsert_deployment(&Deployment {
                    id: deployment_id.clone(),
                    system_id: system_id.clone(),
                    name: dep.name.clone(),
                    slug,
                    job_agent_id,
                    job_agent_config: dep.job_agent_config.clone(),
                    resource_selector: dep.resource_selector.clone(),
                })
                .await
                .with_context(|| format!("Failed to write deployment '{}'", key))?;
            summary.deployments += 1;

            for version in &dep.versions {
                let id = id_or(&version.id, &deployment_id, "version", &version.tag);
                let existing = backend.get_version(&id).await?;
                let created_at = version
                    .created_at
                    .or_else(|| existing.map(|v| v.created_at))
                    .unwrap_or(now);
                backend
                    .upsert_version(&DeploymentVersion {
                        id,
                        deployment_id: deployment_id.clone(),
                        tag: version.tag.clone(),
                        name: version.name.clone().unwrap_or_else(|| version.tag.clone()),
                        config: version.config.clone(),
                        metadata: version.metadata.clone(),
                        status: version.status,
                        created_at,
                    })
                    .await?;
                summary.versions += 1;
            }

            for variable in &dep.variables {
                backend
                    .upsert_deployment_variable(&deployment_variable(&deployment_id, variable))
                    .await
                    .with_context(|| format!("Failed to write variable '{}'", variable.key))?;
                summary.variables += 1;
            }
        }
    }

    for item in &manifest.policies {
        let policy_id = id_or(&item.id, ws, "policy", &item.name);
        let targets = item
            .targets
            .iter()
            .enumerate()
            .map(|(i, t)| PolicyTarget {
                id: stable_id(&policy_id, "policy-target", &i.to_string()),
                policy_id: policy_id.clone(),
                deployment_selector: t.deployment_selector.clone(),
                environment_selector: t.environment_selector.clone(),
                resource_selector: t.resource_selector.clone(),
            })
            .collect();
        backend
            .upsert_policy(&Policy {
                id: policy_id.clone(),
                workspace_id: ws.to_string(),
                name: item.name.clone(),
                priority: item.priority,
                enabled: item.enabled,
                targets,
                rules: item.rules.clone(),
                created_at: now,
            })
            .await
            .with_context(|| format!("Failed to write policy '{}'", item.name))?;
        summary.policies += 1;
    }

    tracing::info!(
        workspace = workspace.name.as_str(),
        resources = summary.resources,
        deployments = summary.deployments,
        versions = summary.versions,
        policies = summary.policies,
        "manifest applied"
    );
    Ok(summary)
}

fn deployment_variable(deployment_id: &str, item: &VariableManifest) -> DeploymentVariable {
    let variable_id = stable_id(deployment_id, "variable", &item.key);
    let mut values: Vec<DeploymentVariableValue> = item
        .values
        .iter()
        .enumerate()
        .map(|(i, v)| DeploymentVariableValue {
            id: stable_id(&variable_id, "value", &i.to_string()),
            variable_id: variable_id.clone(),
            priority: v.priority,
            resource_selector: v.resource_selector.clone(),
            value: v.value.clone(),
        })
        .collect();

    let default_value_id = item.default.as_ref().map(|value| {
        let id = stable_id(&variable_id, "value", "default");
        values.push(DeploymentVariableValue {
            id: id.clone(),
            variable_id: variable_id.clone(),
            priority: 0,
            resource_selector: None,
            value: value.clone(),
        });
        id
    });

    DeploymentVariable {
        id: variable_id,
        deployment_id: deployment_id.to_string(),
        key: item.key.clone(),
        description: item.description.clone(),
        default_value_id,
        values,
    }
}
