mod common;

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use common::{direct, id, secret, Fixture};
use stagehand::engine::WorkspaceEngine;
use stagehand::selector::Condition;
use stagehand::state::models::{
    JobVariable, RelationshipRule, Resource, ResourceVariable, VariableValueKind,
};
use stagehand::variables::{PlaintextEncryption, ValueResolver, VariableEncryption};
use stagehand::worker::{EntityKind, Task, WorkerPool};

struct Reverse;

impl VariableEncryption for Reverse {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.chars().rev().collect())
    }
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.chars().rev().collect())
    }
}

fn sent<'a>(variables: &'a [JobVariable], key: &str) -> &'a JobVariable {
    variables
        .iter()
        .find(|v| v.key == key)
        .unwrap_or_else(|| panic!("variable {} was not sent", key))
}

async fn prod_target(fx: &Fixture) -> stagehand::state::models::Deployment {
    fx.resource("prod-eu", &[("env", "prod"), ("region", "eu")]).await;
    fx.environment("production", Some(Condition::everything())).await;
    let dep = fx.deployment("api", Some(Condition::everything())).await;
    fx.version(&dep, "v1", 0).await;
    dep
}

// ─── Deployment variables ───────────────────────────────────────────────────

#[tokio::test]
async fn test_highest_priority_matching_value_wins() {
    let fx = Fixture::new().await;
    let dep = prod_target(&fx).await;
    fx.variable(
        &dep,
        "replicas",
        Some(json!(1)),
        vec![
            (5, Condition::metadata_equals("env", "prod"), json!(3)),
            (9, Condition::metadata_equals("region", "eu"), json!(4)),
            (20, Condition::metadata_equals("region", "us"), json!(8)),
        ],
    )
    .await;

    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let request = fx.agent.last().unwrap();
    assert_eq!(sent(&request.variables, "replicas").value, json!(4));
}

#[tokio::test]
async fn test_default_applies_when_nothing_matches() {
    let fx = Fixture::new().await;
    let dep = prod_target(&fx).await;
    fx.variable(
        &dep,
        "replicas",
        Some(json!(1)),
        vec![(5, Condition::metadata_equals("env", "dev"), json!(3))],
    )
    .await;

    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let request = fx.agent.last().unwrap();
    assert_eq!(sent(&request.variables, "replicas").value, json!(1));
}

#[tokio::test]
async fn test_no_default_and_no_match_resolves_to_null() {
    let fx = Fixture::new().await;
    let dep = prod_target(&fx).await;
    fx.variable(
        &dep,
        "image_pull_secret",
        None,
        vec![(5, Condition::metadata_equals("env", "dev"), json!("dev-pull"))],
    )
    .await;

    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let request = fx.agent.last().unwrap();
    assert_eq!(sent(&request.variables, "image_pull_secret").value, json!(null));
}

#[tokio::test]
async fn test_resource_variable_overrides_deployment_value() {
    let fx = Fixture::new().await;
    let dep = prod_target(&fx).await;
    fx.variable(&dep, "replicas", Some(json!(1)), vec![]).await;
    let resource = fx
        .backend
        .list_resources(&fx.workspace.id)
        .await
        .unwrap()
        .remove(0);
    fx.backend
        .upsert_resource_variable(&ResourceVariable {
            id: id("rv"),
            resource_id: resource.id.clone(),
            key: "replicas".to_string(),
            value: direct(json!(7)),
        })
        .await
        .unwrap();
    // Keys the deployment does not declare are never sent.
    fx.backend
        .upsert_resource_variable(&ResourceVariable {
            id: id("rv"),
            resource_id: resource.id.clone(),
            key: "undeclared".to_string(),
            value: direct(json!("x")),
        })
        .await
        .unwrap();

    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let request = fx.agent.last().unwrap();
    assert_eq!(request.variables.len(), 1);
    assert_eq!(sent(&request.variables, "replicas").value, json!(7));
}

// ─── Sensitive values ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_sensitive_values_stay_sealed_at_rest() {
    let fx = Fixture::new().await;
    let dep = prod_target(&fx).await;
    let mut variable = fx.variable(&dep, "db_password", Some(json!("x")), vec![]).await;
    // Stored values are ciphertext under the engine's cipher.
    variable.values[0].value = secret(json!("2retnuh"));
    fx.backend.upsert_deployment_variable(&variable).await.unwrap();

    let services = fx.services().with_encryption(Arc::new(Reverse));
    let engine = Arc::new(
        WorkspaceEngine::load(services, fx.workspace.clone())
            .await
            .unwrap(),
    );
    fx.settle(&engine).await;

    let request = fx.agent.last().unwrap();
    let password = sent(&request.variables, "db_password");
    assert!(password.sensitive);
    assert_eq!(password.value, json!("2retnuh"));

    // Re-evaluating compares plaintext, so the sealed set is reused.
    let tasks = vec![Task::EntityChanged {
        id: dep.id.clone(),
        kind: EntityKind::DeploymentVariables,
    }];
    WorkerPool::new(engine.clone(), 2).run_until_idle(tasks).await;
    assert_eq!(fx.agent.count(), 1);
}

// ─── References ─────────────────────────────────────────────────────────────

fn vpc_rule(workspace_id: &str) -> RelationshipRule {
    RelationshipRule {
        id: id("rule"),
        workspace_id: workspace_id.to_string(),
        reference: "network".to_string(),
        source_kind: "AWS/VPC".to_string(),
        source_version: "v1".to_string(),
        target_kind: Some("Kubernetes/Cluster".to_string()),
        metadata_keys_match: vec![("region".to_string(), "region".to_string())],
        ..Default::default()
    }
}

fn reference(path: &str, default: Option<serde_json::Value>) -> VariableValueKind {
    VariableValueKind::Reference {
        reference: "network".to_string(),
        path: path.split('.').map(String::from).collect(),
        default_value: default,
    }
}

async fn with_vpc(fx: &Fixture) -> (ValueResolver, Resource) {
    let mut vpc = Resource::new(&fx.workspace.id, "AWS/VPC", "vpc-eu").with_metadata("region", "eu");
    vpc.config = json!({"cidr": "10.0.0.0/16", "subnets": ["a", "b"]});
    fx.backend.upsert_resource(&vpc).await.unwrap();
    fx.backend
        .upsert_resource_variable(&ResourceVariable {
            id: id("rv"),
            resource_id: vpc.id.clone(),
            key: "owner".to_string(),
            value: direct(json!({"team": "network"})),
        })
        .await
        .unwrap();
    fx.backend
        .upsert_relationship_rule(&vpc_rule(&fx.workspace.id))
        .await
        .unwrap();
    let cluster = fx.resource("cluster-eu", &[("region", "eu")]).await;
    (
        ValueResolver::new(fx.backend.clone(), Arc::new(PlaintextEncryption)),
        cluster,
    )
}

#[tokio::test]
async fn test_reference_reads_related_resource_attributes() {
    let fx = Fixture::new().await;
    let (resolver, cluster) = with_vpc(&fx).await;

    let cidr = resolver.resolve(&reference("config.cidr", None), &cluster).await.unwrap();
    assert_eq!(cidr.value, json!("10.0.0.0/16"));
    assert!(!cidr.sensitive);

    let subnet = resolver
        .resolve(&reference("config.subnets.1", None), &cluster)
        .await
        .unwrap();
    assert_eq!(subnet.value, json!("b"));

    let owner = resolver
        .resolve(&reference("variables.owner.team", None), &cluster)
        .await
        .unwrap();
    assert_eq!(owner.value, json!("network"));
}

#[tokio::test]
async fn test_unresolved_reference_uses_default() {
    let fx = Fixture::new().await;
    let (resolver, _) = with_vpc(&fx).await;
    let stray = fx.resource("cluster-us", &[("region", "us")]).await;

    let value = resolver
        .resolve(&reference("config.cidr", Some(json!("0.0.0.0/0"))), &stray)
        .await
        .unwrap();
    assert_eq!(value.value, json!("0.0.0.0/0"));

    let value = resolver.resolve(&reference("config.cidr", None), &stray).await.unwrap();
    assert_eq!(value.value, json!(null));
}

#[tokio::test]
async fn test_reference_cycle_stops_at_depth_limit() {
    let fx = Fixture::new().await;
    fx.backend
        .upsert_relationship_rule(&RelationshipRule {
            id: id("rule"),
            workspace_id: fx.workspace.id.clone(),
            reference: "peer".to_string(),
            source_kind: "Node".to_string(),
            source_version: "v1".to_string(),
            target_kind: Some("Node".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    // Each node reads `next` from the other, so following it never ends.
    let chained = VariableValueKind::Reference {
        reference: "peer".to_string(),
        path: vec!["variables".to_string(), "next".to_string()],
        default_value: Some(json!("loop-default")),
    };
    let mut nodes = Vec::new();
    for name in ["node-a", "node-b"] {
        let node = Resource::new(&fx.workspace.id, "Node", name);
        fx.backend.upsert_resource(&node).await.unwrap();
        fx.backend
            .upsert_resource_variable(&ResourceVariable {
                id: id("rv"),
                resource_id: node.id.clone(),
                key: "next".to_string(),
                value: chained.clone(),
            })
            .await
            .unwrap();
        nodes.push(node);
    }

    let resolver = ValueResolver::new(fx.backend.clone(), Arc::new(PlaintextEncryption));
    let resolved = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        resolver.resolve(&chained, &nodes[0]),
    )
    .await
    .expect("reference cycle did not terminate")
    .unwrap();
    assert_eq!(resolved.value, json!("loop-default"));
}
