use super::condition::{Condition, ConditionSubject};
use super::index::{SelectorIndex, SelectorKind};
use crate::state::models::{
    Deployment, DeploymentVariableValue, Environment, MatchTable, PolicyTarget, ReleaseTarget,
    Resource,
};

fn selects(selector: &Option<Condition>, resource: &Resource) -> bool {
    !resource.is_deleted() && selector.as_ref().is_some_and(|c| c.matches(resource))
}

// ─── Resource ↔ Environment ─────────────────────────────────────────────────

pub struct EnvironmentResources;

impl SelectorKind for EnvironmentResources {
    type Entity = Resource;
    type Selector = Environment;
    const TABLE: MatchTable = MatchTable::EnvironmentResource;

    fn entity_id(entity: &Resource) -> &str {
        &entity.id
    }
    fn selector_id(selector: &Environment) -> &str {
        &selector.id
    }
    fn matches(selector: &Environment, entity: &Resource) -> bool {
        selects(&selector.resource_selector, entity)
    }
}

// ─── Resource ↔ Deployment ──────────────────────────────────────────────────

pub struct DeploymentResources;

impl SelectorKind for DeploymentResources {
    type Entity = Resource;
    type Selector = Deployment;
    const TABLE: MatchTable = MatchTable::DeploymentResource;

    fn entity_id(entity: &Resource) -> &str {
        &entity.id
    }
    fn selector_id(selector: &Deployment) -> &str {
        &selector.id
    }
    fn matches(selector: &Deployment, entity: &Resource) -> bool {
        selects(&selector.resource_selector, entity)
    }
}

// ─── Resource ↔ Deployment Variable Value ───────────────────────────────────

pub struct VariableValueResources;

impl SelectorKind for VariableValueResources {
    type Entity = Resource;
    type Selector = DeploymentVariableValue;
    const TABLE: MatchTable = MatchTable::VariableValueResource;

    fn entity_id(entity: &Resource) -> &str {
        &entity.id
    }
    fn selector_id(selector: &DeploymentVariableValue) -> &str {
        &selector.id
    }
    fn matches(selector: &DeploymentVariableValue, entity: &Resource) -> bool {
        selects(&selector.resource_selector, entity)
    }
}

// ─── Release Target ↔ Policy Target ─────────────────────────────────────────

/// A release target with the three rows a policy target can select on.
#[derive(Debug, Clone)]
pub struct TargetSubject {
    pub target: ReleaseTarget,
    pub resource: Resource,
    pub environment: Environment,
    pub deployment: Deployment,
}

impl ConditionSubject for Environment {
    fn subject_id(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl ConditionSubject for Deployment {
    fn subject_id(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
    fn identifier(&self) -> Option<&str> {
        Some(&self.slug)
    }
}

impl PolicyTarget {
    /// Every present sub-selector must match and at least one must be present.
    pub fn selects(&self, subject: &TargetSubject) -> bool {
        let checks = [
            self.deployment_selector
                .as_ref()
                .map(|c| c.matches(&subject.deployment)),
            self.environment_selector
                .as_ref()
                .map(|c| c.matches(&subject.environment)),
            self.resource_selector
                .as_ref()
                .map(|c| c.matches(&subject.resource)),
        ];
        let present: Vec<bool> = checks.into_iter().flatten().collect();
        !present.is_empty() && present.into_iter().all(|ok| ok)
    }
}

pub struct PolicyTargetReleaseTargets;

impl SelectorKind for PolicyTargetReleaseTargets {
    type Entity = TargetSubject;
    type Selector = PolicyTarget;
    const TABLE: MatchTable = MatchTable::PolicyTargetReleaseTarget;

    fn entity_id(entity: &TargetSubject) -> &str {
        &entity.target.id
    }
    fn selector_id(selector: &PolicyTarget) -> &str {
        &selector.id
    }
    fn matches(selector: &PolicyTarget, entity: &TargetSubject) -> bool {
        selector.selects(entity)
    }
}

pub type EnvironmentIndex = SelectorIndex<EnvironmentResources>;
pub type DeploymentIndex = SelectorIndex<DeploymentResources>;
pub type VariableValueIndex = SelectorIndex<VariableValueResources>;
pub type PolicyTargetIndex = SelectorIndex<PolicyTargetReleaseTargets>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::condition::StringOperator;

    fn subject() -> TargetSubject {
        let resource = Resource::new("ws", "cluster", "prod-eu-1").with_metadata("zone", "eu");
        let environment = Environment {
            id: "env".into(),
            system_id: "sys".into(),
            name: "production".into(),
            resource_selector: None,
        };
        let deployment = Deployment {
            id: "dep".into(),
            system_id: "sys".into(),
            name: "API".into(),
            slug: "api".into(),
            job_agent_id: None,
            job_agent_config: serde_json::json!({}),
            resource_selector: None,
        };
        let target = ReleaseTarget::new(
            "ws",
            &crate::state::models::ReleaseTargetKey::new(&resource.id, "env", "dep"),
        );
        TargetSubject {
            target,
            resource,
            environment,
            deployment,
        }
    }

    fn policy_target(
        deployment: Option<Condition>,
        environment: Option<Condition>,
        resource: Option<Condition>,
    ) -> PolicyTarget {
        PolicyTarget {
            id: "pt".into(),
            policy_id: "p".into(),
            deployment_selector: deployment,
            environment_selector: environment,
            resource_selector: resource,
        }
    }

    #[test]
    fn empty_policy_target_matches_nothing() {
        assert!(!policy_target(None, None, None).selects(&subject()));
    }

    #[test]
    fn all_present_selectors_must_match() {
        let env = Condition::Name {
            operator: StringOperator::Equals,
            value: "production".into(),
        };
        let zone = Condition::metadata_equals("zone", "eu");
        assert!(policy_target(None, Some(env.clone()), Some(zone)).selects(&subject()));

        let us = Condition::metadata_equals("zone", "us");
        assert!(!policy_target(None, Some(env), Some(us)).selects(&subject()));
    }

    #[test]
    fn deployment_selector_sees_slug_as_identifier() {
        let slug = Condition::Identifier {
            operator: StringOperator::Equals,
            value: "api".into(),
        };
        assert!(policy_target(Some(slug), None, None).selects(&subject()));
    }

    #[test]
    fn missing_selector_never_matches_resources() {
        let mut env = subject().environment;
        let resource = subject().resource;
        assert!(!EnvironmentResources::matches(&env, &resource));
        env.resource_selector = Some(Condition::everything());
        assert!(EnvironmentResources::matches(&env, &resource));
    }
}
