use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;

use super::encryption::{self, VariableEncryption};
use crate::state::backend::StateBackend;
use crate::state::models::{RelationshipRule, Resource, VariableValueKind};

/// Reference chains longer than this resolve to their default.
pub const MAX_REFERENCE_DEPTH: usize = 5;

/// Turns a stored variable value into a concrete one for a given resource.
#[derive(Clone)]
pub struct ValueResolver {
    backend: Arc<dyn StateBackend>,
    encryption: Arc<dyn VariableEncryption>,
}

/// A concrete value and whether it came from a sensitive source.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteValue {
    pub value: Value,
    pub sensitive: bool,
}

impl ValueResolver {
    pub fn new(backend: Arc<dyn StateBackend>, encryption: Arc<dyn VariableEncryption>) -> Self {
        Self {
            backend,
            encryption,
        }
    }

    pub fn backend(&self) -> &dyn StateBackend {
        self.backend.as_ref()
    }

    pub fn encryption(&self) -> &dyn VariableEncryption {
        self.encryption.as_ref()
    }

    /// Resolve `value` as seen from `resource`.
    pub async fn resolve(&self, value: &VariableValueKind, resource: &Resource) -> Result<ConcreteValue> {
        self.resolve_at(value, resource, 0).await
    }

    fn resolve_at<'a>(
        &'a self,
        value: &'a VariableValueKind,
        resource: &'a Resource,
        depth: usize,
    ) -> BoxFuture<'a, Result<ConcreteValue>> {
        async move {
            match value {
                VariableValueKind::Direct { value, sensitive } => {
                    let value = if *sensitive {
                        encryption::open(self.encryption.as_ref(), value)?
                    } else {
                        value.clone()
                    };
                    Ok(ConcreteValue {
                        value,
                        sensitive: *sensitive,
                    })
                }
                VariableValueKind::Reference {
                    reference,
                    path,
                    default_value,
                } => {
                    let fallback = default_value.clone().unwrap_or(Value::Null);
                    if depth >= MAX_REFERENCE_DEPTH {
                        tracing::warn!(
                            reference = reference.as_str(),
                            resource = resource.identifier.as_str(),
                            "reference chain too deep, using default"
                        );
                        return Ok(ConcreteValue {
                            value: fallback,
                            sensitive: false,
                        });
                    }
                    let found = self.follow(resource, reference, path, depth).await?;
                    if found.is_none() {
                        tracing::debug!(
                            reference = reference.as_str(),
                            path = %path.join("."),
                            "reference did not resolve, using default"
                        );
                    }
                    Ok(found.unwrap_or(ConcreteValue {
                        value: fallback,
                        sensitive: false,
                    }))
                }
            }
        }
        .boxed()
    }

    /// Find the related source resource and read `path` out of it.
    async fn follow(
        &self,
        target: &Resource,
        reference: &str,
        path: &[String],
        depth: usize,
    ) -> Result<Option<ConcreteValue>> {
        let Some(rule) = self
            .backend
            .get_relationship_rule(&target.workspace_id, reference)
            .await?
        else {
            return Ok(None);
        };
        if !rule.accepts_target(target) {
            return Ok(None);
        }

        let candidates = self
            .backend
            .list_resources_by_kind(&target.workspace_id, &rule.source_kind, &rule.source_version)
            .await?;
        let Some(source) = candidates
            .into_iter()
            .find(|source| source.id != target.id && rule.accepts_pair(source, target))
        else {
            return Ok(None);
        };

        self.read_path(&source, path, depth).await
    }

    async fn read_path(
        &self,
        source: &Resource,
        path: &[String],
        depth: usize,
    ) -> Result<Option<ConcreteValue>> {
        let Some((head, rest)) = path.split_first() else {
            return Ok(None);
        };

        if head == "variables" {
            let Some((key, rest)) = rest.split_first() else {
                return Ok(None);
            };
            let variables = self.backend.list_resource_variables(&source.id).await?;
            let Some(variable) = variables.iter().find(|v| &v.key == key) else {
                return Ok(None);
            };
            let resolved = self.resolve_at(&variable.value, source, depth + 1).await?;
            return Ok(walk(&resolved.value, rest).map(|value| ConcreteValue {
                value,
                sensitive: resolved.sensitive,
            }));
        }

        let attributes = json!({
            "id": source.id,
            "name": source.name,
            "kind": source.kind,
            "version": source.version,
            "identifier": source.identifier,
            "config": source.config,
            "metadata": source.metadata,
        });
        Ok(walk(&attributes, path).map(|value| ConcreteValue {
            value,
            sensitive: false,
        }))
    }
}

/// Follow a dotted path through objects (and arrays by index).
fn walk(root: &Value, path: &[String]) -> Option<Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

impl RelationshipRule {
    /// Target-side constraints.
    pub fn accepts_target(&self, target: &Resource) -> bool {
        if self.target_kind.as_deref().is_some_and(|k| k != target.kind) {
            return false;
        }
        if self
            .target_version
            .as_deref()
            .is_some_and(|v| v != target.version)
        {
            return false;
        }
        self.target_metadata_equals
            .iter()
            .all(|(k, v)| target.metadata.get(k) == Some(v))
    }

    /// Source-side constraints plus the source/target key pairings.
    pub fn accepts_pair(&self, source: &Resource, target: &Resource) -> bool {
        if source.kind != self.source_kind || source.version != self.source_version {
            return false;
        }
        let source_ok = self
            .source_metadata_equals
            .iter()
            .all(|(k, v)| source.metadata.get(k) == Some(v));
        source_ok
            && self.metadata_keys_match.iter().all(|(source_key, target_key)| {
                match (source.metadata.get(source_key), target.metadata.get(target_key)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_reads_nested_objects_and_arrays() {
        let doc = json!({"config": {"ports": [80, 443]}});
        let path = |s: &str| s.split('.').map(String::from).collect::<Vec<_>>();
        assert_eq!(walk(&doc, &path("config.ports.1")), Some(json!(443)));
        assert_eq!(walk(&doc, &path("config.missing")), None);
        assert_eq!(walk(&doc, &path("config.ports.x")), None);
    }

    #[test]
    fn pairing_requires_both_keys() {
        let rule = RelationshipRule {
            source_kind: "vpc".into(),
            source_version: "v1".into(),
            metadata_keys_match: vec![("region".into(), "region".into())],
            ..Default::default()
        };
        let mut source = Resource::new("ws", "vpc", "vpc-1");
        let target = Resource::new("ws", "cluster", "c-1").with_metadata("region", "eu");
        assert!(!rule.accepts_pair(&source, &target));
        source.metadata.insert("region".into(), "eu".into());
        assert!(rule.accepts_pair(&source, &target));
    }
}
