use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

use super::{ResolvedVariable, ValueResolver, VariableProvider};
use crate::state::models::{DeploymentVariable, DeploymentVariableValue, Resource};

/// Deployment-declared variables with prioritized, selector-scoped values.
pub struct DeploymentVariableProvider {
    resolver: ValueResolver,
    resource: Resource,
    variables: Vec<DeploymentVariable>,
    /// Value ids whose resource selector matches `resource`.
    matched_values: BTreeSet<String>,
}

impl DeploymentVariableProvider {
    pub fn new(
        resolver: ValueResolver,
        resource: Resource,
        variables: Vec<DeploymentVariable>,
        matched_values: BTreeSet<String>,
    ) -> Self {
        Self {
            resolver,
            resource,
            variables,
            matched_values,
        }
    }

    /// Highest-priority matching value, else the variable's default.
    pub fn select_value<'a>(
        &self,
        variable: &'a DeploymentVariable,
    ) -> Option<&'a DeploymentVariableValue> {
        let mut ordered: Vec<&DeploymentVariableValue> = variable.values.iter().collect();
        // Stable, so equal priorities keep their stored order.
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        ordered
            .into_iter()
            .find(|value| self.matched_values.contains(&value.id))
            .or_else(|| {
                let default_id = variable.default_value_id.as_deref()?;
                variable.values.iter().find(|value| value.id == default_id)
            })
    }
}

#[async_trait]
impl VariableProvider for DeploymentVariableProvider {
    async fn get_variable(&self, key: &str) -> Result<Option<ResolvedVariable>> {
        let Some(variable) = self.variables.iter().find(|v| v.key == key) else {
            return Ok(None);
        };

        let Some(chosen) = self.select_value(variable) else {
            tracing::debug!(
                key,
                resource = self.resource.identifier.as_str(),
                "no value or default matched, variable resolves to null"
            );
            return Ok(Some(ResolvedVariable {
                id: variable.id.clone(),
                key: variable.key.clone(),
                value: serde_json::Value::Null,
                sensitive: false,
            }));
        };

        let concrete = self.resolver.resolve(&chosen.value, &self.resource).await?;
        Ok(Some(ResolvedVariable {
            id: variable.id.clone(),
            key: variable.key.clone(),
            value: concrete.value,
            sensitive: concrete.sensitive,
        }))
    }
}
