use chrono::{TimeZone, Utc};
use std::fs;
use std::sync::Arc;

use stagehand::config::manifest::stable_id;
use stagehand::config::validator::{validate_config, validate_manifest};
use stagehand::config::{apply_manifest, load_config, load_manifests, parse_config, Manifest};
use stagehand::state::{SqliteBackend, StateBackend};

const MANIFEST: &str = r#"
resources:
  - identifier: prod-eu
    kind: Kubernetes/Cluster
    metadata:
      env: prod
    variables:
      replicas:
        valueType: direct
        value: 3
jobAgents:
  - name: runner
    type: webhook
    config:
      url: http://localhost:9/dispatch
systems:
  - name: platform
    environments:
      - name: production
        resourceSelector:
          type: metadata
          key: env
          operator: equals
          value: prod
    deployments:
      - name: API
        slug: api
        jobAgent: runner
        resourceSelector:
          type: and
        versions:
          - tag: v1
          - tag: v2
            status: building
        variables:
          - key: log_level
            default:
              valueType: direct
              value: info
            values:
              - priority: 10
                resourceSelector:
                  type: identifier
                  operator: starts-with
                  value: prod
                value:
                  valueType: direct
                  value: warn
policies:
  - name: retry-twice
    priority: 5
    targets:
      - deploymentSelector:
          type: and
    rules:
      retry:
        maxRetries: 2
"#;

// ─── Engine Config ──────────────────────────────────────────────────────────

#[test]
fn test_parse_empty_config_uses_defaults() {
    let config = parse_config("").expect("empty config should parse");
    assert_eq!(config.workspace, "default");
    assert_eq!(config.state.path, ".stagehand/state.db");
    assert_eq!(config.worker.parallelism, 10);
    assert_eq!(config.lock.ttl().as_secs(), 30);
    validate_config(&config).expect("defaults should be valid");
}

#[test]
fn test_parse_partial_config() {
    let yaml = r#"
workspace: staging
worker:
  parallelism: 3
lock:
  ttl_seconds: 10
"#;
    let config = parse_config(yaml).expect("Should parse partial config");
    assert_eq!(config.workspace, "staging");
    assert_eq!(config.worker.parallelism, 3);
    assert_eq!(config.lock.ttl_seconds, 10);
    // Untouched sections keep their defaults.
    assert_eq!(config.lock.poll_interval_ms, 50);
    assert_eq!(config.verification.timeout_seconds, 10);
}

#[test]
fn test_unknown_config_field_is_rejected() {
    let result = parse_config("worker:\n  threads: 4\n");
    assert!(result.is_err());
}

#[test]
fn test_validate_rejects_bad_settings() {
    let mut config = parse_config("").unwrap();
    config.worker.parallelism = 0;
    assert!(validate_config(&config).is_err());

    let mut config = parse_config("").unwrap();
    config.lock.ttl_seconds = 1;
    config.lock.poll_interval_ms = 5000;
    let err = validate_config(&config).unwrap_err();
    assert!(err.to_string().contains("poll_interval_ms"));
}

#[test]
fn test_load_config_missing_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config(Some(&dir.path().join("nope.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config not found"));
}

#[test]
fn test_load_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stagehand.yaml");
    fs::write(&path, "workspace: team-a\nstate:\n  path: /tmp/x.db\n").unwrap();
    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.workspace, "team-a");
    assert_eq!(config.state.path, "/tmp/x.db");
}

// ─── Manifests ──────────────────────────────────────────────────────────────

#[test]
fn test_manifest_directory_merges_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("b.yaml"),
        "resources:\n  - identifier: second\n    kind: Host\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("a.yml"),
        "resources:\n  - identifier: first\n    kind: Host\n",
    )
    .unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let manifest = load_manifests(dir.path()).unwrap();
    let identifiers: Vec<&str> = manifest
        .resources
        .iter()
        .map(|r| r.identifier.as_str())
        .collect();
    assert_eq!(identifiers, vec!["first", "second"]);
}

#[test]
fn test_duplicate_resources_across_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let doc = "resources:\n  - identifier: same\n    kind: Host\n";
    fs::write(dir.path().join("a.yaml"), doc).unwrap();
    fs::write(dir.path().join("b.yaml"), doc).unwrap();

    let err = load_manifests(dir.path()).unwrap_err();
    assert!(err.to_string().contains("Duplicate resource 'same'"));
}

#[test]
fn test_empty_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_manifests(dir.path()).is_err());
}

#[test]
fn test_unknown_job_agent_is_rejected() {
    let yaml = r#"
systems:
  - name: platform
    deployments:
      - name: api
        jobAgent: ghost
"#;
    let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
    let err = validate_manifest(&manifest).unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_over_deep_selector_is_rejected() {
    let yaml = r#"
systems:
  - name: platform
    environments:
      - name: deep
        resourceSelector:
          type: and
          conditions:
            - type: and
              conditions:
                - type: and
                  conditions:
                    - type: and
                      conditions:
                        - type: and
"#;
    let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
    let err = validate_manifest(&manifest).unwrap_err();
    assert!(err.to_string().contains("environment 'deep'"));
}

#[test]
fn test_policy_rule_values_are_checked() {
    let policy = |rules: &str| {
        let yaml = format!("policies:\n  - name: gate\n    rules:\n{}", rules);
        let manifest: Manifest = serde_yaml::from_str(&yaml).unwrap();
        validate_manifest(&manifest)
    };

    let named_zone = "      deploymentWindow:\n        rrule: FREQ=DAILY\n        dtstart: 2024-01-01T02:00:00\n        timezone: Europe/Berlin\n        durationMinutes: 60\n        kind: deny\n";
    policy(named_zone).expect("IANA zones are accepted");

    let bad_zone = named_zone.replace("Europe/Berlin", "Nowhere/Special");
    let err = policy(&bad_zone).unwrap_err();
    assert!(err.to_string().contains("Nowhere/Special"));

    let bad_rule = named_zone.replace("FREQ=DAILY", "FREQ=SOMETIMES");
    assert!(policy(&bad_rule).is_err());

    let endless = format!("      versionCooldown:\n        intervalSeconds: {}\n", i64::MAX);
    let err = policy(&endless).unwrap_err();
    assert!(err.to_string().contains("version cooldown interval"));

    let negative = "      gradualRollout:\n        timeScaleIntervalSeconds: -5\n";
    assert!(policy(negative).is_err());
}

#[test]
fn test_stable_ids_are_deterministic() {
    let a = stable_id("ws", "resource", "prod-eu");
    assert_eq!(a, stable_id("ws", "resource", "prod-eu"));
    assert_ne!(a, stable_id("other", "resource", "prod-eu"));
    assert_eq!(a.len(), 32);
}

#[tokio::test]
async fn test_apply_manifest_is_idempotent() {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    let backend: Arc<dyn StateBackend> = Arc::new(backend);
    let workspace = backend.create_workspace("default").await.unwrap();
    let manifest: Manifest = serde_yaml::from_str(MANIFEST).unwrap();
    validate_manifest(&manifest).unwrap();

    let first_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let summary = apply_manifest(backend.as_ref(), &workspace, &manifest, first_at)
        .await
        .unwrap();
    assert_eq!(summary.resources, 1);
    assert_eq!(summary.job_agents, 1);
    assert_eq!(summary.environments, 1);
    assert_eq!(summary.deployments, 1);
    assert_eq!(summary.versions, 2);
    assert_eq!(summary.variables, 1);
    assert_eq!(summary.policies, 1);

    let later = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
    apply_manifest(backend.as_ref(), &workspace, &manifest, later)
        .await
        .unwrap();

    let resources = backend.list_resources(&workspace.id).await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].id, stable_id(&workspace.id, "resource", "prod-eu"));
    // Creation time survives re-application.
    assert_eq!(resources[0].created_at, first_at);

    let deployments = backend.list_deployments(&workspace.id).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].slug, "api");
    assert!(deployments[0].job_agent_id.is_some());

    let versions = backend.list_versions(&deployments[0].id).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.created_at == first_at));

    let variables = backend
        .list_deployment_variables(&deployments[0].id)
        .await
        .unwrap();
    assert_eq!(variables.len(), 1);
    assert_eq!(variables[0].values.len(), 2);
    assert!(variables[0].default_value_id.is_some());

    let policies = backend.list_policies(&workspace.id).await.unwrap();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].rules.retry.as_ref().map(|r| r.max_retries), Some(2));
}

#[tokio::test]
async fn test_apply_marks_deleted_resources() {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    let workspace = backend.create_workspace("default").await.unwrap();
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    let live: Manifest =
        serde_yaml::from_str("resources:\n  - identifier: old-host\n    kind: Host\n").unwrap();
    apply_manifest(&backend, &workspace, &live, now).await.unwrap();

    let gone: Manifest = serde_yaml::from_str(
        "resources:\n  - identifier: old-host\n    kind: Host\n    deleted: true\n",
    )
    .unwrap();
    let summary = apply_manifest(&backend, &workspace, &gone, now).await.unwrap();
    assert_eq!(summary.deleted_resources, 1);
    assert_eq!(summary.resources, 0);

    let id = stable_id(&workspace.id, "resource", "old-host");
    let resource = backend.get_resource(&id).await.unwrap().unwrap();
    assert!(resource.is_deleted());
}
