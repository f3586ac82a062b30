use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use super::variable_manager::VariableReleaseManager;
use super::version_manager::VersionReleaseManager;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::job::JobManager;
use crate::policy::verification::VerificationClient;
use crate::policy::{matched_policies, Rejection, RuleContext, RulePipeline};
use crate::selector::WorkspaceIndexes;
use crate::state::backend::StateBackend;
use crate::state::models::{Job, JobReason, Release, ReleaseTarget, ReleaseTargetKey};
use crate::variables::ValueResolver;

/// Result of diffing computed release targets against persisted ones.
#[derive(Debug, Clone, Default)]
pub struct ReleaseTargetChanges {
    pub added: Vec<ReleaseTarget>,
    pub removed: Vec<ReleaseTarget>,
}

impl ReleaseTargetChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// What one evaluation of a release target did.
#[derive(Debug, Clone)]
pub enum Evaluation {
    /// The target no longer exists, or its selectors stopped matching and
    /// the next diff will remove it.
    Missing,
    /// No version survived the policy rules.
    NoVersion { rejections: Vec<Rejection> },
    /// The current release already matches and has a job.
    Unchanged { release: Release },
    /// A release was created, or an existing one was missing its job.
    Released {
        release: Release,
        created: bool,
        job: Option<Job>,
    },
}

impl Evaluation {
    /// The job to dispatch, if the evaluation produced one.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Evaluation::Released { job, .. } => job.as_ref(),
            _ => None,
        }
    }
}

/// Keeps the release-target set in line with selector memberships and turns
/// policy decisions into releases and jobs.
pub struct ReleaseTargetManager {
    workspace_id: String,
    backend: Arc<dyn StateBackend>,
    indexes: Arc<WorkspaceIndexes>,
    jobs: Arc<JobManager>,
    resolver: ValueResolver,
    verifier: Arc<dyn VerificationClient>,
    verification_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ReleaseTargetManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspace_id: &str,
        backend: Arc<dyn StateBackend>,
        indexes: Arc<WorkspaceIndexes>,
        jobs: Arc<JobManager>,
        resolver: ValueResolver,
        verifier: Arc<dyn VerificationClient>,
        verification_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            backend,
            indexes,
            jobs,
            resolver,
            verifier,
            verification_timeout,
            clock,
        }
    }

    // ─── Membership ─────────────────────────────────────────────────────────

    /// Every `(resource, environment, deployment)` whose environment and
    /// deployment share a system and both select the resource.
    pub async fn desired_keys(&self) -> BTreeSet<ReleaseTargetKey> {
        let environments = self.indexes.environments.all_selectors().await;
        let deployments = self.indexes.deployments.all_selectors().await;

        let mut deployment_members = BTreeMap::new();
        for deployment in &deployments {
            let members = self
                .indexes
                .deployments
                .entity_ids_for_selector(&deployment.id)
                .await;
            deployment_members.insert(deployment.id.clone(), members);
        }

        let mut keys = BTreeSet::new();
        for environment in &environments {
            let members = self
                .indexes
                .environments
                .entity_ids_for_selector(&environment.id)
                .await;
            if members.is_empty() {
                continue;
            }
            for deployment in deployments.iter().filter(|d| d.system_id == environment.system_id) {
                let Some(deployed) = deployment_members.get(&deployment.id) else {
                    continue;
                };
                for resource_id in members.intersection(deployed) {
                    keys.insert(ReleaseTargetKey::new(resource_id, &environment.id, &deployment.id));
                }
            }
        }
        keys
    }

    /// Diff the computed set against the store without writing anything.
    pub async fn compute_changes(&self) -> Result<ReleaseTargetChanges> {
        let desired = self.desired_keys().await;
        let existing: BTreeMap<ReleaseTargetKey, ReleaseTarget> = self
            .backend
            .list_release_targets(&self.workspace_id)
            .await?
            .into_iter()
            .map(|t| (t.key(), t))
            .collect();

        let added = desired
            .iter()
            .filter(|key| !existing.contains_key(key))
            .map(|key| ReleaseTarget::new(&self.workspace_id, key))
            .collect();
        let removed = existing
            .into_iter()
            .filter(|(key, _)| !desired.contains(key))
            .map(|(_, target)| target)
            .collect();
        Ok(ReleaseTargetChanges { added, removed })
    }

    /// Persist a diff and keep the policy-target index in step. The returned
    /// additions carry the ids the store actually holds.
    pub async fn apply_changes(&self, changes: ReleaseTargetChanges) -> Result<ReleaseTargetChanges> {
        if changes.is_empty() {
            return Ok(changes);
        }

        let removed_ids: Vec<String> = changes.removed.iter().map(|t| t.id.clone()).collect();
        self.backend
            .delete_release_targets(&removed_ids, self.clock.now())
            .await
            .context("Failed to remove release targets")?;
        for id in &removed_ids {
            self.indexes.policy_targets.remove_entity(id).await?;
        }

        self.backend
            .insert_release_targets(&changes.added)
            .await
            .context("Failed to insert release targets")?;
        let mut added = Vec::with_capacity(changes.added.len());
        for target in &changes.added {
            // Another writer may have inserted the same key first.
            let Some(stored) = self.backend.get_release_target(&target.key()).await? else {
                continue;
            };
            if let Some(subject) = self.indexes.subject(&stored).await {
                self.indexes.policy_targets.upsert_entity(subject).await?;
            }
            added.push(stored);
        }

        tracing::info!(
            workspace = self.workspace_id.as_str(),
            added = added.len(),
            removed = changes.removed.len(),
            "release targets changed"
        );
        Ok(ReleaseTargetChanges {
            added,
            removed: changes.removed,
        })
    }

    /// Compute and apply in one step.
    pub async fn sync(&self) -> Result<ReleaseTargetChanges> {
        let changes = self.compute_changes().await?;
        self.apply_changes(changes).await
    }

    // ─── Evaluation ─────────────────────────────────────────────────────────

    /// Decide the target's version and variables and materialize a release
    /// and job when either changed. The caller holds the target's lease.
    pub async fn evaluate(&self, key: &ReleaseTargetKey) -> Result<Evaluation> {
        let Some(target) = self.backend.get_release_target(key).await? else {
            tracing::debug!(release_target = %key, "release target is gone");
            return Ok(Evaluation::Missing);
        };
        if !self.indexes.is_member(key).await {
            tracing::debug!(release_target = %key, "release target no longer selected");
            return Ok(Evaluation::Missing);
        }

        let resource = self
            .backend
            .get_resource(&target.resource_id)
            .await?
            .ok_or_else(|| EngineError::not_found("resource", &target.resource_id))?;
        let environment = self
            .backend
            .get_environment(&target.environment_id)
            .await?
            .ok_or_else(|| EngineError::not_found("environment", &target.environment_id))?;
        let deployment = self
            .backend
            .get_deployment(&target.deployment_id)
            .await?
            .ok_or_else(|| EngineError::not_found("deployment", &target.deployment_id))?;

        let policies =
            matched_policies(self.backend.as_ref(), &self.indexes.policy_targets, &target).await?;
        let pipeline = RulePipeline::from_policies(
            &policies,
            self.verifier.clone(),
            self.verification_timeout,
        );
        let matched_values: BTreeSet<String> = self
            .indexes
            .variable_values
            .selectors_for_entity(&resource.id)
            .await
            .into_iter()
            .map(|v| v.id)
            .collect();

        let ctx = RuleContext {
            backend: self.backend.as_ref(),
            target: &target,
            resource: &resource,
            environment: &environment,
            deployment: &deployment,
            now: self.clock.now(),
        };
        let versions = VersionReleaseManager::new(&ctx, &pipeline);
        let variables =
            VariableReleaseManager::new(&ctx, &pipeline, self.resolver.clone(), matched_values);

        let (decision, resolved) = tokio::try_join!(versions.evaluate(), variables.evaluate())?;
        let Some(version) = decision.chosen else {
            tracing::debug!(
                release_target = %key,
                policies = policies.len(),
                rejections = decision.rejections.len(),
                "no deployable version"
            );
            return Ok(Evaluation::NoVersion {
                rejections: decision.rejections,
            });
        };

        let (version_release, _) = versions.upsert_release(&version).await?;
        let (variable_release, _) = variables.upsert_release(&resolved).await?;

        if let Some(current) = self.backend.current_release(&target.id).await? {
            if current.version_release_id == version_release.id
                && current.variable_release_id == variable_release.id
            {
                if self.backend.release_job_exists(&current.id).await? {
                    return Ok(Evaluation::Unchanged { release: current });
                }
                tracing::warn!(
                    release_target = %key,
                    release_id = current.id.as_str(),
                    "release has no job, creating it"
                );
                let job = self
                    .jobs
                    .create_release_job(&current, &target, JobReason::PolicyPassing)
                    .await?;
                return Ok(Evaluation::Released {
                    release: current,
                    created: false,
                    job,
                });
            }
        }

        let release = Release {
            id: uuid::Uuid::new_v4().to_string(),
            version_release_id: version_release.id,
            variable_release_id: variable_release.id,
            created_at: ctx.now,
        };
        self.backend.insert_release(&release).await?;
        tracing::info!(
            release_target = %key,
            release_id = release.id.as_str(),
            version = version.tag.as_str(),
            "created release"
        );

        let job = self
            .jobs
            .create_release_job(&release, &target, JobReason::PolicyPassing)
            .await?;
        Ok(Evaluation::Released {
            release,
            created: true,
            job,
        })
    }
}
