mod common;

use common::Fixture;
use stagehand::job::JobStatus;
use stagehand::selector::Condition;
use stagehand::state::models::{Job, JobReason, ReleaseTarget, ReleaseTargetKey};
use stagehand::state::query::{run_query, QueryFormat};
use stagehand::state::{SqliteBackend, StateBackend};

async fn released(fx: &Fixture) -> (ReleaseTargetKey, String) {
    let resource = fx.resource("cluster-a", &[]).await;
    let env = fx.environment("staging", Some(Condition::everything())).await;
    let dep = fx.deployment("api", Some(Condition::everything())).await;
    fx.version(&dep, "v1", 0).await;
    let engine = fx.engine().await;
    fx.settle(&engine).await;

    let key = ReleaseTargetKey::new(&resource.id, &env.id, &dep.id);
    let target = fx.backend.get_release_target(&key).await.unwrap().unwrap();
    let release = fx.backend.current_release(&target.id).await.unwrap().unwrap();
    (key, release.id)
}

#[tokio::test]
async fn test_open_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/state.db");
    let backend = SqliteBackend::open(path.to_str().unwrap()).unwrap();
    backend.initialize().await.unwrap();
    // Initializing twice is harmless.
    backend.initialize().await.unwrap();
    assert!(path.exists());

    backend.create_workspace("default").await.unwrap();
    let found = backend.get_workspace("default").await.unwrap();
    assert!(found.is_some());
    assert!(backend.get_workspace("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_soft_deleted_resources_are_hidden_from_listings() {
    let fx = Fixture::new().await;
    let kept = fx.resource("kept", &[]).await;
    let gone = fx.resource("gone", &[]).await;
    fx.backend.delete_resource(&gone.id, fx.now()).await.unwrap();

    let live = fx.backend.list_resources(&fx.workspace.id).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, kept.id);

    let row = fx.backend.get_resource(&gone.id).await.unwrap().unwrap();
    assert_eq!(row.deleted_at, Some(fx.now()));
}

#[tokio::test]
async fn test_release_target_inserts_are_conflict_safe() {
    let fx = Fixture::new().await;
    let key = ReleaseTargetKey::new("r", "e", "d");
    let target = ReleaseTarget::new(&fx.workspace.id, &key);

    assert_eq!(fx.backend.insert_release_targets(&[target.clone()]).await.unwrap(), 1);
    let duplicate = ReleaseTarget::new(&fx.workspace.id, &key);
    assert_eq!(fx.backend.insert_release_targets(&[duplicate]).await.unwrap(), 0);

    let stored = fx.backend.get_release_target(&key).await.unwrap().unwrap();
    assert_eq!(stored.id, target.id);
}

#[tokio::test]
async fn test_release_accepts_one_non_retry_job() {
    let fx = Fixture::new().await;
    let (_, release_id) = released(&fx).await;
    assert_eq!(fx.backend.count_jobs_for_release(&release_id).await.unwrap(), 1);

    let again = Job::pending(None, serde_json::json!({}), JobReason::PolicyPassing, fx.now());
    assert!(!fx.backend.insert_job(&release_id, &again, &[]).await.unwrap());

    let retry = Job::pending(None, serde_json::json!({}), JobReason::Retry, fx.now());
    assert!(fx.backend.insert_job(&release_id, &retry, &[]).await.unwrap());
    assert_eq!(fx.backend.count_jobs_for_release(&release_id).await.unwrap(), 2);

    let jobs = fx.backend.list_jobs_for_release(&release_id).await.unwrap();
    assert_eq!(jobs.last().map(|j| j.id.as_str()), Some(retry.id.as_str()));
}

#[tokio::test]
async fn test_deleting_targets_cancels_open_jobs() {
    let fx = Fixture::new().await;
    let (key, release_id) = released(&fx).await;
    let target = fx.backend.get_release_target(&key).await.unwrap().unwrap();
    let job_id = fx.backend.list_jobs_for_release(&release_id).await.unwrap()[0]
        .id
        .clone();

    fx.backend
        .delete_release_targets(&[target.id.clone()], fx.now())
        .await
        .unwrap();

    assert!(fx.backend.get_release_target(&key).await.unwrap().is_none());
    let job = fx.backend.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.message.as_deref(), Some("release target removed"));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_job_release_lookup() {
    let fx = Fixture::new().await;
    let (key, release_id) = released(&fx).await;
    let job_id = fx.agent.last().unwrap().job.id;

    let (release, target) = fx.backend.find_job_release(&job_id).await.unwrap().unwrap();
    assert_eq!(release.id, release_id);
    assert_eq!(target.key(), key);
    assert!(fx.backend.find_job_release("missing").await.unwrap().is_none());
}

// ─── Query ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_query_renders_rows() {
    let fx = Fixture::new().await;
    fx.resource("alpha", &[]).await;
    fx.resource("beta", &[]).await;

    let result = run_query(
        fx.backend.as_ref(),
        "SELECT identifier FROM resources ORDER BY identifier",
    )
    .await
    .unwrap();
    assert_eq!(result.columns, vec!["identifier"]);
    assert_eq!(result.rows.len(), 2);

    let csv = result.render(QueryFormat::Csv).unwrap();
    assert_eq!(csv.lines().collect::<Vec<_>>(), vec!["identifier", "alpha", "beta"]);

    let table = result.render(QueryFormat::Table).unwrap();
    assert!(table.contains("IDENTIFIER"));
    assert!(table.ends_with("(2 rows)"));
}

#[tokio::test]
async fn test_query_rejects_writes() {
    let fx = Fixture::new().await;
    let err = run_query(fx.backend.as_ref(), "DELETE FROM resources")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("read-only"));
}

#[tokio::test]
async fn test_query_format_parsing() {
    assert_eq!("JSON".parse::<QueryFormat>().unwrap(), QueryFormat::Json);
    assert!("xml".parse::<QueryFormat>().is_err());
}
