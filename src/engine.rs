use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::job::{AgentRegistry, JobExit, JobManager, JobStatus};
use crate::policy::matched_policies;
use crate::policy::verification::{HttpVerificationClient, VerificationClient};
use crate::release::{Evaluation, ReleaseTargetChanges, ReleaseTargetManager};
use crate::selector::WorkspaceIndexes;
use crate::state::backend::StateBackend;
use crate::state::lock::ReleaseTargetMutex;
use crate::state::models::{
    ApprovalRecord, ApprovalStatus, Job, ReleaseTarget, ReleaseTargetKey, Workspace,
};
use crate::variables::{PlaintextEncryption, ValueResolver, VariableEncryption};
use crate::worker::{EntityKind, Task};

// ─── Services ───────────────────────────────────────────────────────────────

/// Everything an engine needs from the outside world.
#[derive(Clone)]
pub struct EngineServices {
    pub backend: Arc<dyn StateBackend>,
    pub clock: Arc<dyn Clock>,
    pub encryption: Arc<dyn VariableEncryption>,
    pub agents: AgentRegistry,
    pub verifier: Arc<dyn VerificationClient>,
    pub lock_ttl: Duration,
    pub lock_poll_interval: Duration,
    pub verification_timeout: Duration,
}

impl EngineServices {
    /// System clock, plaintext secrets, the built-in webhook agent and
    /// default timings.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self::from_config(backend, &EngineConfig::default())
    }

    pub fn from_config(backend: Arc<dyn StateBackend>, config: &EngineConfig) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            encryption: Arc::new(PlaintextEncryption),
            agents: AgentRegistry::with_builtin(config.dispatch.backoff()),
            verifier: Arc::new(HttpVerificationClient::new()),
            lock_ttl: config.lock.ttl(),
            lock_poll_interval: config.lock.poll_interval(),
            verification_timeout: config.verification.timeout(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn VariableEncryption>) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn VerificationClient>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Agents without the built-in webhook, for callers that register their own.
    pub fn without_builtin_agents(mut self) -> Self {
        self.agents = AgentRegistry::new();
        self
    }
}

// ─── Workspace Engine ───────────────────────────────────────────────────────

/// The loaded state of one workspace: its selector indexes plus the managers
/// that act on them. Passed explicitly; nothing here is global.
pub struct WorkspaceEngine {
    workspace: Workspace,
    services: EngineServices,
    indexes: Arc<WorkspaceIndexes>,
    mutex: ReleaseTargetMutex,
    targets: ReleaseTargetManager,
    jobs: Arc<JobManager>,
}

impl std::fmt::Debug for WorkspaceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceEngine")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl WorkspaceEngine {
    pub async fn load(services: EngineServices, workspace: Workspace) -> Result<Self> {
        let backend = services.backend.clone();
        let indexes = Arc::new(
            WorkspaceIndexes::load(backend.clone(), &workspace.id)
                .await
                .with_context(|| format!("Failed to load workspace '{}'", workspace.name))?,
        );
        let jobs = Arc::new(JobManager::new(
            backend.clone(),
            services.agents.clone(),
            services.clock.clone(),
        ));
        let targets = ReleaseTargetManager::new(
            &workspace.id,
            backend.clone(),
            indexes.clone(),
            jobs.clone(),
            ValueResolver::new(backend.clone(), services.encryption.clone()),
            services.verifier.clone(),
            services.verification_timeout,
            services.clock.clone(),
        );
        let mutex = ReleaseTargetMutex::new(
            backend,
            services.lock_ttl,
            services.lock_poll_interval,
        );

        tracing::info!(workspace = workspace.name.as_str(), "workspace loaded");
        Ok(Self {
            workspace,
            services,
            indexes,
            mutex,
            targets,
            jobs,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn backend(&self) -> &dyn StateBackend {
        self.services.backend.as_ref()
    }

    pub fn indexes(&self) -> &WorkspaceIndexes {
        &self.indexes
    }

    pub fn targets(&self) -> &ReleaseTargetManager {
        &self.targets
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// Run one task and return the tasks it gives rise to.
    pub async fn handle(&self, task: &Task) -> Result<Vec<Task>> {
        match task {
            Task::EvaluateReleaseTarget(key) => {
                let (_, follow_ups) = self.evaluate(key).await?;
                Ok(follow_ups)
            }
            Task::EntityChanged { id, kind } => self.entity_changed(*kind, id).await,
            Task::SyncReleaseTargets => {
                let (_, follow_ups) = self.sync_release_targets().await?;
                Ok(follow_ups)
            }
        }
    }

    /// An evaluation task for every release target of the workspace.
    pub async fn evaluate_all(&self) -> Result<Vec<Task>> {
        Ok(self
            .backend()
            .list_release_targets(&self.workspace.id)
            .await?
            .into_iter()
            .map(|t| Task::EvaluateReleaseTarget(t.key()))
            .collect())
    }

    // ─── Release Targets ────────────────────────────────────────────────────

    /// Bring the persisted release targets in line with selector memberships.
    /// New targets come back as evaluation tasks.
    pub async fn sync_release_targets(&self) -> Result<(ReleaseTargetChanges, Vec<Task>)> {
        let changes = self.targets.sync().await?;
        let follow_ups = changes
            .added
            .iter()
            .map(|t| Task::EvaluateReleaseTarget(t.key()))
            .collect();
        Ok((changes, follow_ups))
    }

    /// Evaluate under the target's lease, then dispatch whatever job came out
    /// of it once the lease is released.
    pub async fn evaluate(&self, key: &ReleaseTargetKey) -> Result<(Evaluation, Vec<Task>)> {
        let evaluation = self
            .mutex
            .run_exclusive(key, || self.targets.evaluate(key))
            .await
            .with_context(|| format!("Failed to evaluate {}", key))?;

        let follow_ups = match evaluation.job() {
            Some(job) => self.dispatch(job.clone()).await?,
            None => vec![],
        };
        Ok((evaluation, follow_ups))
    }

    /// Pin a release target to a version, or clear the pin with `None`.
    pub async fn set_desired_version(
        &self,
        key: &ReleaseTargetKey,
        version_id: Option<&str>,
    ) -> Result<Vec<Task>> {
        let target = self.require_target(key).await?;
        self.backend()
            .set_desired_release(&target.id, version_id, None)
            .await?;
        Ok(vec![Task::EvaluateReleaseTarget(target.key())])
    }

    /// Record a user's decision on a version for an environment.
    pub async fn record_approval(
        &self,
        version_id: &str,
        environment_id: &str,
        user_id: &str,
        status: ApprovalStatus,
    ) -> Result<Vec<Task>> {
        self.backend()
            .get_version(version_id)
            .await?
            .ok_or_else(|| EngineError::not_found("version", version_id))?;
        let approval = ApprovalRecord {
            id: uuid::Uuid::new_v4().to_string(),
            version_id: version_id.to_string(),
            environment_id: environment_id.to_string(),
            user_id: user_id.to_string(),
            status,
            created_at: self.services.clock.now(),
        };
        self.backend().record_approval(&approval).await?;
        Ok(vec![Task::EntityChanged {
            id: version_id.to_string(),
            kind: EntityKind::Version,
        }])
    }

    async fn require_target(&self, key: &ReleaseTargetKey) -> Result<ReleaseTarget> {
        self.backend()
            .get_release_target(key)
            .await?
            .ok_or_else(|| EngineError::not_found("release target", key.to_string()).into())
    }

    // ─── Jobs ───────────────────────────────────────────────────────────────

    /// Dispatch `job`, following failed dispatches through retries. An exit
    /// without a retry asks for the target to be evaluated again.
    async fn dispatch(&self, job: Job) -> Result<Vec<Task>> {
        let mut next = Some(job);
        while let Some(job) = next.take() {
            let Some(exit) = self.jobs.dispatch_job(&job).await? else {
                break;
            };
            match self.retry(&exit).await? {
                Some(retry) => next = Some(retry),
                None => return Ok(vec![Task::EvaluateReleaseTarget(exit.target.key())]),
            }
        }
        Ok(vec![])
    }

    async fn retry(&self, exit: &JobExit) -> Result<Option<Job>> {
        let key = exit.target.key();
        let backend = self.backend();
        let index = &self.indexes.policy_targets;
        let jobs = &self.jobs;
        self.mutex
            .run_exclusive(&key, move || async move {
                let policies = matched_policies(backend, index, &exit.target).await?;
                jobs.try_retry(exit, &policies).await
            })
            .await
    }

    /// Record a status reported for a job, as an agent callback would.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<Vec<Task>> {
        let Some(exit) = self.jobs.set_status(job_id, status, message).await? else {
            return Ok(vec![]);
        };
        match self.retry(&exit).await? {
            Some(retry) => self.dispatch(retry).await,
            None => Ok(vec![Task::EvaluateReleaseTarget(exit.target.key())]),
        }
    }

    // ─── Entity Changes ─────────────────────────────────────────────────────

    /// Refresh the indexes from the stored row and name the targets to
    /// re-evaluate.
    pub async fn entity_changed(&self, kind: EntityKind, id: &str) -> Result<Vec<Task>> {
        let backend = self.backend();
        let indexes = &self.indexes;

        let mut follow_ups = Vec::new();
        let affected: Vec<ReleaseTarget> = match kind {
            EntityKind::Resource => {
                match backend.get_resource(id).await? {
                    Some(resource) if !resource.is_deleted() => {
                        indexes.environments.upsert_entity(resource.clone()).await?;
                        indexes.deployments.upsert_entity(resource.clone()).await?;
                        indexes.variable_values.upsert_entity(resource).await?;
                    }
                    _ => {
                        indexes.environments.remove_entity(id).await?;
                        indexes.deployments.remove_entity(id).await?;
                        indexes.variable_values.remove_entity(id).await?;
                    }
                }
                follow_ups.push(Task::SyncReleaseTargets);
                self.targets_where(|t| t.resource_id == id).await?
            }
            EntityKind::Environment => {
                match backend.get_environment(id).await? {
                    Some(env) => indexes.environments.upsert_selector(env).await?,
                    None => indexes.environments.remove_selector(id).await?,
                };
                follow_ups.push(Task::SyncReleaseTargets);
                self.targets_where(|t| t.environment_id == id).await?
            }
            EntityKind::Deployment => {
                match backend.get_deployment(id).await? {
                    Some(deployment) => indexes.deployments.upsert_selector(deployment).await?,
                    None => indexes.deployments.remove_selector(id).await?,
                };
                follow_ups.push(Task::SyncReleaseTargets);
                self.targets_where(|t| t.deployment_id == id).await?
            }
            EntityKind::Version => match backend.get_version(id).await? {
                Some(version) => {
                    self.targets_where(|t| t.deployment_id == version.deployment_id)
                        .await?
                }
                None => vec![],
            },
            EntityKind::DeploymentVariables => {
                self.reload_variable_values().await?;
                self.targets_where(|t| t.deployment_id == id).await?
            }
            EntityKind::Policy => {
                let ids = self.reload_policy(id).await?;
                self.targets_where(|t| ids.contains(&t.id)).await?
            }
            EntityKind::RelationshipRule => self.targets_where(|_| true).await?,
        };

        // Selector inputs of policy targets may have changed with the row.
        if matches!(
            kind,
            EntityKind::Resource | EntityKind::Environment | EntityKind::Deployment
        ) {
            for target in &affected {
                if let Some(subject) = indexes.subject(target).await {
                    indexes.policy_targets.upsert_entity(subject).await?;
                }
            }
        }

        // Targets this change unmatched are left to the diff.
        for target in &affected {
            let key = target.key();
            if indexes.is_member(&key).await {
                follow_ups.push(Task::EvaluateReleaseTarget(key));
            }
        }
        tracing::debug!(
            kind = %kind,
            id,
            follow_ups = follow_ups.len(),
            "entity change indexed"
        );
        Ok(follow_ups)
    }

    async fn targets_where(&self, keep: impl Fn(&ReleaseTarget) -> bool) -> Result<Vec<ReleaseTarget>> {
        Ok(self
            .backend()
            .list_release_targets(&self.workspace.id)
            .await?
            .into_iter()
            .filter(|t| keep(t))
            .collect())
    }

    async fn reload_variable_values(&self) -> Result<()> {
        let index = &self.indexes.variable_values;
        let current: Vec<_> = self
            .backend()
            .list_workspace_deployment_variables(&self.workspace.id)
            .await?
            .into_iter()
            .flat_map(|v| v.values)
            .collect();
        let keep: BTreeSet<&str> = current.iter().map(|v| v.id.as_str()).collect();

        for stale in index.all_selectors().await {
            if !keep.contains(stale.id.as_str()) {
                index.remove_selector(&stale.id).await?;
            }
        }
        for value in current {
            index.upsert_selector(value).await?;
        }
        Ok(())
    }

    /// Re-index one policy's targets. Returns the release-target ids matched
    /// before or after.
    async fn reload_policy(&self, policy_id: &str) -> Result<BTreeSet<String>> {
        let index = &self.indexes.policy_targets;
        let policy = self
            .backend()
            .list_policies(&self.workspace.id)
            .await?
            .into_iter()
            .find(|p| p.id == policy_id);
        let new_targets = policy.map(|p| p.targets).unwrap_or_default();
        let new_ids: BTreeSet<String> = new_targets.iter().map(|t| t.id.clone()).collect();

        let mut affected = BTreeSet::new();
        for old in index.all_selectors().await {
            if old.policy_id != policy_id {
                continue;
            }
            affected.extend(index.entity_ids_for_selector(&old.id).await);
            if !new_ids.contains(&old.id) {
                index.remove_selector(&old.id).await?;
            }
        }
        for target in new_targets {
            let id = target.id.clone();
            index.upsert_selector(target).await?;
            affected.extend(index.entity_ids_for_selector(&id).await);
        }
        Ok(affected)
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

struct RegistryEntry {
    engine: Arc<WorkspaceEngine>,
    last_used: Instant,
}

/// Loaded engines keyed by workspace name. Owned by the caller: engines are
/// built on first use and dropped by [`WorkspaceRegistry::evict`] or
/// [`WorkspaceRegistry::evict_idle`].
pub struct WorkspaceRegistry {
    services: EngineServices,
    engines: DashMap<String, RegistryEntry>,
}

impl WorkspaceRegistry {
    pub fn new(services: EngineServices) -> Self {
        Self {
            services,
            engines: DashMap::new(),
        }
    }

    pub async fn get_or_load(&self, workspace_name: &str) -> Result<Arc<WorkspaceEngine>> {
        if let Some(mut entry) = self.engines.get_mut(workspace_name) {
            entry.last_used = Instant::now();
            return Ok(entry.engine.clone());
        }

        let workspace = self
            .services
            .backend
            .get_workspace(workspace_name)
            .await?
            .ok_or_else(|| EngineError::not_found("workspace", workspace_name))?;
        let engine = Arc::new(WorkspaceEngine::load(self.services.clone(), workspace).await?);

        // Someone else may have loaded it meanwhile; keep theirs.
        let entry = self
            .engines
            .entry(workspace_name.to_string())
            .or_insert(RegistryEntry {
                engine,
                last_used: Instant::now(),
            });
        Ok(entry.engine.clone())
    }

    pub fn evict(&self, workspace_name: &str) -> bool {
        self.engines.remove(workspace_name).is_some()
    }

    /// Drop engines unused for longer than `max_idle`; returns how many.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.engines.len();
        self.engines
            .retain(|_, entry| entry.last_used.elapsed() <= max_idle);
        let evicted = before - self.engines.len();
        if evicted > 0 {
            tracing::info!(evicted, "evicted idle workspaces");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
