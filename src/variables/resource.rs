use anyhow::Result;
use async_trait::async_trait;

use super::{ResolvedVariable, ValueResolver, VariableProvider};
use crate::state::models::{Resource, ResourceVariable};

/// Variables set directly on the target's resource. These take precedence
/// over anything the deployment declares.
pub struct ResourceVariableProvider {
    resolver: ValueResolver,
    resource: Resource,
    variables: Vec<ResourceVariable>,
}

impl ResourceVariableProvider {
    pub async fn load(resolver: ValueResolver, resource: Resource) -> Result<Self> {
        let variables = resolver
            .backend()
            .list_resource_variables(&resource.id)
            .await?;
        Ok(Self {
            resolver,
            resource,
            variables,
        })
    }
}

#[async_trait]
impl VariableProvider for ResourceVariableProvider {
    async fn get_variable(&self, key: &str) -> Result<Option<ResolvedVariable>> {
        let Some(variable) = self.variables.iter().find(|v| v.key == key) else {
            return Ok(None);
        };
        let concrete = self.resolver.resolve(&variable.value, &self.resource).await?;
        Ok(Some(ResolvedVariable {
            id: variable.id.clone(),
            key: variable.key.clone(),
            value: concrete.value,
            sensitive: concrete.sensitive,
        }))
    }
}
