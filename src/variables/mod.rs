pub mod deployment;
pub mod encryption;
pub mod reference;
pub mod resource;

use anyhow::Result;
use async_trait::async_trait;

pub use deployment::DeploymentVariableProvider;
pub use encryption::{PlaintextEncryption, VariableEncryption};
pub use reference::{ValueResolver, MAX_REFERENCE_DEPTH};
pub use resource::ResourceVariableProvider;

/// A variable resolved for one release target. A `Null` value means the key
/// exists but nothing resolved; an unknown key is `None` at the provider level.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVariable {
    pub id: String,
    pub key: String,
    /// Plaintext, even for sensitive variables.
    pub value: serde_json::Value,
    pub sensitive: bool,
}

#[async_trait]
pub trait VariableProvider: Send + Sync {
    async fn get_variable(&self, key: &str) -> Result<Option<ResolvedVariable>>;
}

/// Providers consulted in order; the first one that knows the key wins.
pub struct VariableResolver {
    providers: Vec<Box<dyn VariableProvider>>,
}

impl VariableResolver {
    pub fn new(providers: Vec<Box<dyn VariableProvider>>) -> Self {
        Self { providers }
    }

    pub async fn get_variable(&self, key: &str) -> Result<Option<ResolvedVariable>> {
        for provider in &self.providers {
            if let Some(variable) = provider.get_variable(key).await? {
                return Ok(Some(variable));
            }
        }
        Ok(None)
    }
}
