use anyhow::{Context, Result};
use std::sync::Arc;

use super::agent::{AgentRegistry, DispatchRequest};
use super::merge::merge_config;
use super::status::JobStatus;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::state::backend::StateBackend;
use crate::state::models::{Job, JobReason, JobVariable, Policy, Release, ReleaseTarget};

/// A job that has just moved into an exited status, with what it belonged to.
#[derive(Debug, Clone)]
pub struct JobExit {
    pub job: Job,
    pub release: Release,
    pub target: ReleaseTarget,
}

/// Creates, dispatches and tracks jobs.
pub struct JobManager {
    backend: Arc<dyn StateBackend>,
    agents: AgentRegistry,
    clock: Arc<dyn Clock>,
}

impl JobManager {
    pub fn new(backend: Arc<dyn StateBackend>, agents: AgentRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            agents,
            clock,
        }
    }

    // ─── Creation ───────────────────────────────────────────────────────────

    /// Persist a pending job for `release`. Returns `None` when a non-retry
    /// job already exists for it.
    pub async fn create_release_job(
        &self,
        release: &Release,
        target: &ReleaseTarget,
        reason: JobReason,
    ) -> Result<Option<Job>> {
        let deployment = self
            .backend
            .get_deployment(&target.deployment_id)
            .await?
            .ok_or_else(|| EngineError::not_found("deployment", &target.deployment_id))?;

        let agent = match &deployment.job_agent_id {
            Some(id) => self.backend.get_job_agent(id).await?,
            None => None,
        };
        let defaults = agent
            .as_ref()
            .map(|a| a.config.clone())
            .unwrap_or_else(|| serde_json::json!({}));
        let config = merge_config(&defaults, &deployment.job_agent_config);

        let job = Job::pending(deployment.job_agent_id.clone(), config, reason, self.clock.now());
        let snapshots = self
            .backend
            .list_variable_snapshots(&release.variable_release_id)
            .await?;
        let variables: Vec<JobVariable> = snapshots
            .into_iter()
            .map(|s| JobVariable {
                job_id: job.id.clone(),
                key: s.key,
                value: s.value,
                sensitive: s.sensitive,
            })
            .collect();

        if !self.backend.insert_job(&release.id, &job, &variables).await? {
            tracing::debug!(release_id = release.id.as_str(), "release already has a job");
            return Ok(None);
        }
        tracing::info!(
            job_id = job.id.as_str(),
            release_id = release.id.as_str(),
            release_target = %target.key(),
            reason = job.reason.as_str(),
            "created job"
        );
        Ok(Some(job))
    }

    // ─── Dispatch ───────────────────────────────────────────────────────────

    /// Hand a pending job to its agent. A missing agent or a failed dispatch
    /// moves the job to an exited status, which is returned for follow-up.
    pub async fn dispatch_job(&self, job: &Job) -> Result<Option<JobExit>> {
        let Some((release, target)) = self.backend.find_job_release(&job.id).await? else {
            return Err(EngineError::not_found("release for job", &job.id).into());
        };

        let agent = match &job.job_agent_id {
            Some(id) => self.backend.get_job_agent(id).await?,
            None => None,
        };
        let Some(agent) = agent else {
            return self
                .fail(job, JobStatus::InvalidJobAgent, "deployment has no usable job agent")
                .await;
        };
        let Some(adapter) = self.agents.get(&agent.agent_type) else {
            let message = format!("no adapter for job agent type '{}'", agent.agent_type);
            return self.fail(job, JobStatus::InvalidJobAgent, &message).await;
        };

        let version_release = self
            .backend
            .get_version_release(&release.version_release_id)
            .await?
            .ok_or_else(|| EngineError::not_found("version release", &release.version_release_id))?;
        let version = self
            .backend
            .get_version(&version_release.version_id)
            .await?
            .ok_or_else(|| EngineError::not_found("version", &version_release.version_id))?;
        let variables = self.backend.list_job_variables(&job.id).await?;

        let request = DispatchRequest {
            job: job.clone(),
            release_id: release.id.clone(),
            release_target: target,
            version,
            variables,
        };

        match adapter.dispatch(&request).await {
            Ok(external_id) => {
                let mut current = job.clone();
                current.status = JobStatus::InProgress;
                current.external_id = external_id;
                tracing::info!(
                    job_id = job.id.as_str(),
                    agent = agent.name.as_str(),
                    external_id = ?current.external_id,
                    "dispatched job"
                );
                self.update_job(job, current).await
            }
            Err(e) => {
                let message = EngineError::Integration(format!("{:#}", e)).to_string();
                tracing::warn!(job_id = job.id.as_str(), error = %e, "job dispatch failed");
                self.fail(job, JobStatus::InvalidIntegration, &message).await
            }
        }
    }

    async fn fail(&self, job: &Job, status: JobStatus, message: &str) -> Result<Option<JobExit>> {
        let mut current = job.clone();
        current.status = status;
        current.message = Some(message.to_string());
        self.update_job(job, current).await
    }

    // ─── Updates ────────────────────────────────────────────────────────────

    /// Persist `current`. Returns the exit when the job has just left the
    /// in-flight states and its release target still exists.
    pub async fn update_job(&self, previous: &Job, mut current: Job) -> Result<Option<JobExit>> {
        previous.status.check_transition(current.status)?;

        let now = self.clock.now();
        current.updated_at = now;
        if current.status == JobStatus::InProgress && current.started_at.is_none() {
            current.started_at = Some(now);
        }
        if current.status.is_exited() && current.completed_at.is_none() {
            current.completed_at = Some(now);
        }
        self.backend
            .update_job(&current)
            .await
            .with_context(|| format!("Failed to update job {}", current.id))?;

        if previous.status.is_exited() || !current.status.is_exited() {
            return Ok(None);
        }

        tracing::info!(
            job_id = current.id.as_str(),
            status = %current.status,
            "job exited"
        );
        let Some((release, target)) = self.backend.find_job_release(&current.id).await? else {
            tracing::debug!(job_id = current.id.as_str(), "job's release target is gone");
            return Ok(None);
        };
        Ok(Some(JobExit {
            job: current,
            release,
            target,
        }))
    }

    /// Update a job by id, as an agent callback would.
    pub async fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<Option<JobExit>> {
        let previous = self
            .backend
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", job_id))?;
        let mut current = previous.clone();
        current.status = status;
        if message.is_some() {
            current.message = message;
        }
        self.update_job(&previous, current).await
    }

    // ─── Retry ──────────────────────────────────────────────────────────────

    /// Create a retry job for a failed exit if the first policy (by priority)
    /// carrying a retry rule still allows one. Attempts are counted from
    /// persisted jobs.
    pub async fn try_retry(&self, exit: &JobExit, policies: &[Policy]) -> Result<Option<Job>> {
        if !exit.job.status.is_failed() {
            return Ok(None);
        }

        let mut ordered: Vec<&Policy> = policies.iter().filter(|p| p.enabled).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        let Some((policy, rule)) = ordered
            .into_iter()
            .find_map(|p| p.rules.retry.as_ref().map(|r| (p, r)))
        else {
            return Ok(None);
        };

        let jobs = self.backend.count_jobs_for_release(&exit.release.id).await?;
        let retries = jobs.saturating_sub(1);
        if retries >= rule.max_retries as usize {
            tracing::info!(
                release_id = exit.release.id.as_str(),
                policy = policy.name.as_str(),
                retries,
                "retry limit reached"
            );
            return Ok(None);
        }

        tracing::info!(
            release_id = exit.release.id.as_str(),
            policy = policy.name.as_str(),
            attempt = retries + 1,
            max_retries = rule.max_retries,
            "retrying failed job"
        );
        self.create_release_job(&exit.release, &exit.target, JobReason::Retry)
            .await
    }
}
