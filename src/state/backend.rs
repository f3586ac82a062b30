use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use super::models::{
    ApprovalRecord, Deployment, DeploymentVariable, DeploymentVersion, Environment, Job, JobAgent,
    JobVariable, Lease, MatchRow, MatchTable, Policy, RelationshipRule, Release, ReleaseTarget,
    ReleaseTargetKey, Resource, ResourceVariable, System, TargetJobOutcome, VariableSetRelease,
    VariableValueSnapshot, VersionRelease, Workspace,
};
use crate::job::status::JobStatus;

/// Pluggable persistence for the engine.
///
/// Every multi-row write is transactional. Inserts that may race (release
/// targets, release jobs, match rows) are conflict-safe.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // ─── Initialization ─────────────────────────────────────────────────────

    /// Create tables and run migrations.
    async fn initialize(&self) -> Result<()>;

    // ─── Workspaces ─────────────────────────────────────────────────────────

    async fn create_workspace(&self, name: &str) -> Result<Workspace>;

    async fn get_workspace(&self, name: &str) -> Result<Option<Workspace>>;

    // ─── Resources ──────────────────────────────────────────────────────────

    async fn upsert_resource(&self, resource: &Resource) -> Result<()>;

    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>>;

    /// Live (not soft-deleted) resources of a workspace.
    async fn list_resources(&self, workspace_id: &str) -> Result<Vec<Resource>>;

    /// Live resources of one kind/version, for relationship lookups.
    async fn list_resources_by_kind(
        &self,
        workspace_id: &str,
        kind: &str,
        version: &str,
    ) -> Result<Vec<Resource>>;

    /// Soft delete.
    async fn delete_resource(&self, resource_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn upsert_resource_variable(&self, variable: &ResourceVariable) -> Result<()>;

    async fn list_resource_variables(&self, resource_id: &str) -> Result<Vec<ResourceVariable>>;

    async fn upsert_relationship_rule(&self, rule: &RelationshipRule) -> Result<()>;

    async fn get_relationship_rule(
        &self,
        workspace_id: &str,
        reference: &str,
    ) -> Result<Option<RelationshipRule>>;

    // ─── Systems, Environments, Deployments ─────────────────────────────────

    async fn upsert_system(&self, system: &System) -> Result<()>;

    async fn upsert_environment(&self, environment: &Environment) -> Result<()>;

    async fn get_environment(&self, environment_id: &str) -> Result<Option<Environment>>;

    async fn list_environments(&self, workspace_id: &str) -> Result<Vec<Environment>>;

    async fn delete_environment(&self, environment_id: &str) -> Result<()>;

    async fn upsert_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn get_deployment(&self, deployment_id: &str) -> Result<Option<Deployment>>;

    async fn list_deployments(&self, workspace_id: &str) -> Result<Vec<Deployment>>;

    async fn delete_deployment(&self, deployment_id: &str) -> Result<()>;

    // ─── Versions & Job Agents ──────────────────────────────────────────────

    async fn upsert_version(&self, version: &DeploymentVersion) -> Result<()>;

    async fn get_version(&self, version_id: &str) -> Result<Option<DeploymentVersion>>;

    /// Versions of a deployment, newest first.
    async fn list_versions(&self, deployment_id: &str) -> Result<Vec<DeploymentVersion>>;

    async fn upsert_job_agent(&self, agent: &JobAgent) -> Result<()>;

    async fn get_job_agent(&self, job_agent_id: &str) -> Result<Option<JobAgent>>;

    // ─── Deployment Variables ───────────────────────────────────────────────

    /// Insert or replace a variable together with all of its values.
    async fn upsert_deployment_variable(&self, variable: &DeploymentVariable) -> Result<()>;

    async fn list_deployment_variables(&self, deployment_id: &str)
        -> Result<Vec<DeploymentVariable>>;

    /// Every variable of every deployment in the workspace.
    async fn list_workspace_deployment_variables(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<DeploymentVariable>>;

    // ─── Policies ───────────────────────────────────────────────────────────

    /// Insert or replace a policy with its targets and rule rows.
    async fn upsert_policy(&self, policy: &Policy) -> Result<()>;

    async fn list_policies(&self, workspace_id: &str) -> Result<Vec<Policy>>;

    async fn delete_policy(&self, policy_id: &str) -> Result<()>;

    async fn record_approval(&self, approval: &ApprovalRecord) -> Result<()>;

    async fn list_approvals(
        &self,
        version_id: &str,
        environment_id: &str,
    ) -> Result<Vec<ApprovalRecord>>;

    // ─── Computed Matches ───────────────────────────────────────────────────

    /// Replace every mirror row touching the given entities or selectors.
    /// Rows belonging to other workspaces are left alone.
    async fn replace_matches(
        &self,
        table: MatchTable,
        entity_ids: &[String],
        selector_ids: &[String],
        rows: &[MatchRow],
    ) -> Result<()>;

    /// Apply exactly the given inserts and deletes in one transaction.
    async fn apply_match_delta(
        &self,
        table: MatchTable,
        inserts: &[MatchRow],
        deletes: &[MatchRow],
    ) -> Result<()>;

    async fn list_matches(&self, table: MatchTable) -> Result<Vec<MatchRow>>;

    // ─── Release Targets ────────────────────────────────────────────────────

    async fn list_release_targets(&self, workspace_id: &str) -> Result<Vec<ReleaseTarget>>;

    async fn list_release_targets_for(
        &self,
        environment_id: &str,
        deployment_id: &str,
    ) -> Result<Vec<ReleaseTarget>>;

    async fn get_release_target(&self, key: &ReleaseTargetKey) -> Result<Option<ReleaseTarget>>;

    /// Conflict-safe insert; returns how many rows were new.
    async fn insert_release_targets(&self, targets: &[ReleaseTarget]) -> Result<usize>;

    /// Cancel the targets' in-flight jobs, then delete them with their dependents.
    async fn delete_release_targets(&self, ids: &[String], at: DateTime<Utc>) -> Result<()>;

    async fn set_desired_release(
        &self,
        release_target_id: &str,
        desired_version_id: Option<&str>,
        desired_release_id: Option<&str>,
    ) -> Result<()>;

    // ─── Releases ───────────────────────────────────────────────────────────

    async fn latest_version_release(&self, release_target_id: &str)
        -> Result<Option<VersionRelease>>;

    async fn insert_version_release(&self, release: &VersionRelease) -> Result<()>;

    async fn get_version_release(&self, id: &str) -> Result<Option<VersionRelease>>;

    async fn latest_variable_set_release(
        &self,
        release_target_id: &str,
    ) -> Result<Option<(VariableSetRelease, Vec<VariableValueSnapshot>)>>;

    /// Insert the release, its snapshots and their join rows atomically.
    async fn insert_variable_set_release(
        &self,
        release: &VariableSetRelease,
        snapshots: &[VariableValueSnapshot],
    ) -> Result<()>;

    async fn list_variable_snapshots(
        &self,
        variable_release_id: &str,
    ) -> Result<Vec<VariableValueSnapshot>>;

    /// Newest release whose version and variable releases both belong to the target.
    async fn current_release(&self, release_target_id: &str) -> Result<Option<Release>>;

    async fn insert_release(&self, release: &Release) -> Result<()>;

    async fn get_release(&self, release_id: &str) -> Result<Option<Release>>;

    async fn list_releases(&self, release_target_id: &str) -> Result<Vec<Release>>;

    // ─── Jobs ───────────────────────────────────────────────────────────────

    /// Insert a job, its release link and its variables in one transaction.
    /// A non-retry job is skipped (returns `false`) when the release already
    /// has a job.
    async fn insert_job(
        &self,
        release_id: &str,
        job: &Job,
        variables: &[JobVariable],
    ) -> Result<bool>;

    async fn release_job_exists(&self, release_id: &str) -> Result<bool>;

    async fn count_jobs_for_release(&self, release_id: &str) -> Result<usize>;

    async fn list_jobs_for_release(&self, release_id: &str) -> Result<Vec<Job>>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn update_job(&self, job: &Job) -> Result<()>;

    async fn list_job_variables(&self, job_id: &str) -> Result<Vec<JobVariable>>;

    /// The release a job was created for and that release's target, if both survive.
    async fn find_job_release(&self, job_id: &str) -> Result<Option<(Release, ReleaseTarget)>>;

    // ─── Rule Queries ───────────────────────────────────────────────────────

    /// Newest version successfully deployed to the resource under a deployment.
    async fn latest_successful_version(
        &self,
        resource_id: &str,
        deployment_id: &str,
    ) -> Result<Option<DeploymentVersion>>;

    /// Latest job per release target of `(environment, deployment)` for a version.
    async fn version_job_outcomes(
        &self,
        environment_id: &str,
        deployment_id: &str,
        version_id: &str,
    ) -> Result<Vec<TargetJobOutcome>>;

    /// Status of the most recent job per version on one release target.
    async fn latest_job_status_by_version(
        &self,
        release_target_id: &str,
    ) -> Result<HashMap<String, JobStatus>>;

    // ─── Leases ─────────────────────────────────────────────────────────────

    /// Take the lease if free or expired. `None` means someone else holds it.
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Extend a held lease; `false` if it is no longer ours.
    async fn renew_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()>;

    // ─── Query ──────────────────────────────────────────────────────────────

    /// Execute a raw SQL query and return rows as JSON values.
    async fn query_raw(&self, sql: &str) -> Result<Vec<serde_json::Value>>;
}
