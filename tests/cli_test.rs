use assert_cmd::assert::OutputAssertExt;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;

const MANIFEST: &str = r#"
resources:
  - identifier: prod-eu
    kind: Kubernetes/Cluster
    metadata:
      env: prod
  - identifier: dev-eu
    kind: Kubernetes/Cluster
    metadata:
      env: dev
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
      - name: api
        resourceSelector:
          type: and
        versions:
          - tag: v1
"#;

fn stagehand(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_stagehand"));
    cmd.current_dir(dir)
        .env("NO_COLOR", "1")
        .arg("--state")
        .arg(dir.join("state.db"));
    cmd
}

fn init(dir: &Path) {
    stagehand(dir).arg("init").assert().success();
}

#[test]
fn test_init_creates_workspace() {
    let dir = tempfile::tempdir().unwrap();
    stagehand(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized workspace 'default'"));
    assert!(dir.path().join("state.db").exists());

    // Running it again is fine.
    init(dir.path());
    stagehand(dir.path())
        .args(["query", "SELECT name FROM workspaces", "--format", "csv"])
        .assert()
        .success()
        .stdout(predicate::str::contains("default"));
}

#[test]
fn test_commands_require_init() {
    let dir = tempfile::tempdir().unwrap();
    stagehand(dir.path())
        .args(["evaluate", "--all"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("stagehand init"));
}

#[test]
fn test_sync_creates_targets() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("inventory.yaml");
    fs::write(&manifest, MANIFEST).unwrap();
    init(dir.path());

    stagehand(dir.path())
        .arg("sync")
        .arg("--file")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Release targets: 1 added, 0 removed."));

    stagehand(dir.path())
        .args([
            "query",
            "SELECT COUNT(*) AS n FROM release_targets",
            "--format",
            "csv",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("n\n1"));

    // No job agent is configured, so the job ends up invalid.
    stagehand(dir.path())
        .arg("targets")
        .assert()
        .success()
        .stdout(predicate::str::contains("v1"))
        .stdout(predicate::str::contains("invalid_job_agent"));
}

#[test]
fn test_validate_reports_manifest_errors() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.yaml");
    fs::write(&good, MANIFEST).unwrap();
    stagehand(dir.path())
        .arg("validate")
        .arg("--file")
        .arg(&good)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));

    let bad_dir = dir.path().join("bad");
    fs::create_dir(&bad_dir).unwrap();
    let doc = "resources:\n  - identifier: twin\n    kind: Host\n";
    fs::write(bad_dir.join("a.yaml"), doc).unwrap();
    fs::write(bad_dir.join("b.yaml"), doc).unwrap();
    stagehand(dir.path())
        .arg("validate")
        .arg("--file")
        .arg(&bad_dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Duplicate resource 'twin'"));
}

#[test]
fn test_query_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    stagehand(dir.path())
        .args(["query", "DROP TABLE jobs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("read-only"));
}

#[test]
fn test_unknown_job_fails() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    stagehand(dir.path())
        .args(["job", "nope", "--status", "completed"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("job 'nope' not found"));

    stagehand(dir.path())
        .args(["job", "nope", "--status", "exploded"])
        .assert()
        .failure();
}
