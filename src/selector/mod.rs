pub mod condition;
pub mod index;
pub mod kinds;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub use condition::{Condition, ConditionSubject};
pub use index::{MatchDelta, SelectorIndex, SelectorKind};
use kinds::{DeploymentIndex, EnvironmentIndex, PolicyTargetIndex, TargetSubject, VariableValueIndex};

use crate::state::backend::StateBackend;
use crate::state::models::{ReleaseTarget, ReleaseTargetKey};

/// The four match matrices of one workspace.
pub struct WorkspaceIndexes {
    pub environments: EnvironmentIndex,
    pub deployments: DeploymentIndex,
    pub variable_values: VariableValueIndex,
    pub policy_targets: PolicyTargetIndex,
}

impl WorkspaceIndexes {
    pub async fn load(backend: Arc<dyn StateBackend>, workspace_id: &str) -> Result<Self> {
        let resources = backend.list_resources(workspace_id).await?;
        let environments = backend.list_environments(workspace_id).await?;
        let deployments = backend.list_deployments(workspace_id).await?;
        let values = backend
            .list_workspace_deployment_variables(workspace_id)
            .await?
            .into_iter()
            .flat_map(|v| v.values)
            .collect();
        let policy_targets = backend
            .list_policies(workspace_id)
            .await?
            .into_iter()
            .flat_map(|p| p.targets)
            .collect();

        let resource_by_id: HashMap<_, _> = resources.iter().map(|r| (r.id.clone(), r.clone())).collect();
        let environment_by_id: HashMap<_, _> =
            environments.iter().map(|e| (e.id.clone(), e.clone())).collect();
        let deployment_by_id: HashMap<_, _> =
            deployments.iter().map(|d| (d.id.clone(), d.clone())).collect();
        let subjects: Vec<TargetSubject> = backend
            .list_release_targets(workspace_id)
            .await?
            .into_iter()
            .filter_map(|target| {
                Some(TargetSubject {
                    resource: resource_by_id.get(&target.resource_id)?.clone(),
                    environment: environment_by_id.get(&target.environment_id)?.clone(),
                    deployment: deployment_by_id.get(&target.deployment_id)?.clone(),
                    target,
                })
            })
            .collect();

        let load_err = |what: &str| format!("Failed to load {} index", what);
        Ok(Self {
            environments: SelectorIndex::load(backend.clone(), resources.clone(), environments)
                .await
                .with_context(|| load_err("environment"))?,
            deployments: SelectorIndex::load(backend.clone(), resources.clone(), deployments)
                .await
                .with_context(|| load_err("deployment"))?,
            variable_values: SelectorIndex::load(backend.clone(), resources, values)
                .await
                .with_context(|| load_err("variable value"))?,
            policy_targets: SelectorIndex::load(backend, subjects, policy_targets)
                .await
                .with_context(|| load_err("policy target"))?,
        })
    }

    /// Whether the environment and deployment of `key` share a system and
    /// both currently select its resource.
    pub async fn is_member(&self, key: &ReleaseTargetKey) -> bool {
        let (Some(environment), Some(deployment)) = (
            self.environments.get_selector(&key.environment_id).await,
            self.deployments.get_selector(&key.deployment_id).await,
        ) else {
            return false;
        };
        environment.system_id == deployment.system_id
            && self
                .environments
                .is_match(&key.resource_id, &key.environment_id)
                .await
            && self
                .deployments
                .is_match(&key.resource_id, &key.deployment_id)
                .await
    }

    /// The policy-target subject for a release target, built from the rows
    /// the other indexes hold.
    pub async fn subject(&self, target: &ReleaseTarget) -> Option<TargetSubject> {
        Some(TargetSubject {
            resource: self.environments.get_entity(&target.resource_id).await?,
            environment: self.environments.get_selector(&target.environment_id).await?,
            deployment: self.deployments.get_selector(&target.deployment_id).await?,
            target: target.clone(),
        })
    }
}
