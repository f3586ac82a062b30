use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};

use crate::policy::{RuleContext, RulePipeline};
use crate::state::models::{VariableSetRelease, VariableValueSnapshot};
use crate::variables::encryption::{open, seal};
use crate::variables::{
    DeploymentVariableProvider, ResolvedVariable, ResourceVariableProvider, ValueResolver,
    VariableProvider, VariableResolver,
};

/// Resolves the deployment's variables for one release target and records
/// them as a variable-set release.
pub struct VariableReleaseManager<'a> {
    ctx: &'a RuleContext<'a>,
    pipeline: &'a RulePipeline,
    resolver: ValueResolver,
    /// Deployment-variable value ids whose selector matches the resource.
    matched_values: BTreeSet<String>,
}

impl<'a> VariableReleaseManager<'a> {
    pub fn new(
        ctx: &'a RuleContext<'a>,
        pipeline: &'a RulePipeline,
        resolver: ValueResolver,
        matched_values: BTreeSet<String>,
    ) -> Self {
        Self {
            ctx,
            pipeline,
            resolver,
            matched_values,
        }
    }

    /// Resolve every key the deployment declares, in key order.
    pub async fn evaluate(&self) -> Result<Vec<ResolvedVariable>> {
        let declared = self
            .ctx
            .backend
            .list_deployment_variables(&self.ctx.deployment.id)
            .await?;
        let keys: BTreeSet<String> = declared.iter().map(|v| v.key.clone()).collect();

        let providers: Vec<Box<dyn VariableProvider>> = vec![
            Box::new(
                ResourceVariableProvider::load(self.resolver.clone(), self.ctx.resource.clone())
                    .await?,
            ),
            Box::new(DeploymentVariableProvider::new(
                self.resolver.clone(),
                self.ctx.resource.clone(),
                declared,
                self.matched_values.clone(),
            )),
        ];
        let chain = VariableResolver::new(providers);

        let mut resolved = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(variable) = chain
                .get_variable(key)
                .await
                .with_context(|| format!("Failed to resolve variable '{}'", key))?
            {
                resolved.push(variable);
            }
        }
        Ok(resolved)
    }

    /// Record `variables` unless they equal the latest persisted set. While a
    /// deployment window blocks, the latest set is kept as is.
    pub async fn upsert_release(
        &self,
        variables: &[ResolvedVariable],
    ) -> Result<(VariableSetRelease, bool)> {
        let backend = self.ctx.backend;
        let target = self.ctx.target;
        let latest = backend.latest_variable_set_release(&target.id).await?;

        if let Some((release, snapshots)) = &latest {
            if let Some(policy) = self.pipeline.variable_block(self.ctx.now) {
                tracing::debug!(
                    release_target = %target.key(),
                    policy = policy.as_str(),
                    "deployment window holds variables"
                );
                return Ok((release.clone(), false));
            }
            if self.plaintext(snapshots)? == as_map(variables) {
                return Ok((release.clone(), false));
            }
        }

        let encryption = self.resolver.encryption();
        let snapshots = variables
            .iter()
            .map(|v| {
                let value = if v.sensitive {
                    seal(encryption, &v.value)?
                } else {
                    v.value.clone()
                };
                Ok(VariableValueSnapshot {
                    id: uuid::Uuid::new_v4().to_string(),
                    workspace_id: target.workspace_id.clone(),
                    key: v.key.clone(),
                    value,
                    sensitive: v.sensitive,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let release = VariableSetRelease {
            id: uuid::Uuid::new_v4().to_string(),
            release_target_id: target.id.clone(),
            created_at: self.ctx.now,
        };
        backend
            .insert_variable_set_release(&release, &snapshots)
            .await?;
        tracing::info!(
            release_target = %target.key(),
            variables = snapshots.len(),
            "new variable release"
        );
        Ok((release, true))
    }

    fn plaintext(
        &self,
        snapshots: &[VariableValueSnapshot],
    ) -> Result<BTreeMap<String, (serde_json::Value, bool)>> {
        snapshots
            .iter()
            .map(|s| {
                let value = if s.sensitive {
                    open(self.resolver.encryption(), &s.value)?
                } else {
                    s.value.clone()
                };
                Ok((s.key.clone(), (value, s.sensitive)))
            })
            .collect()
    }
}

fn as_map(variables: &[ResolvedVariable]) -> BTreeMap<String, (serde_json::Value, bool)> {
    variables
        .iter()
        .map(|v| (v.key.clone(), (v.value.clone(), v.sensitive)))
        .collect()
}
