mod common;

use common::{Fixture, RecordingAgent};
use stagehand::job::JobStatus;
use stagehand::policy::rules::{PolicyRules, RetryRule};
use stagehand::release::Evaluation;
use stagehand::selector::Condition;
use stagehand::state::models::{JobReason, ReleaseTargetKey};
use stagehand::worker::Task;

fn retry(max_retries: u32) -> PolicyRules {
    PolicyRules {
        retry: Some(RetryRule { max_retries }),
        ..Default::default()
    }
}

async fn one_target(fx: &Fixture) -> ReleaseTargetKey {
    let resource = fx.resource("cluster-a", &[]).await;
    let env = fx.environment("staging", Some(Condition::everything())).await;
    let dep = fx.deployment("worker", Some(Condition::everything())).await;
    fx.version(&dep, "1.0.0", 0).await;
    ReleaseTargetKey::new(&resource.id, &env.id, &dep.id)
}

async fn release_jobs(fx: &Fixture, key: &ReleaseTargetKey) -> Vec<stagehand::state::models::Job> {
    let target = fx.backend.get_release_target(key).await.unwrap().unwrap();
    let release = fx.backend.current_release(&target.id).await.unwrap().unwrap();
    fx.backend.list_jobs_for_release(&release.id).await.unwrap()
}

#[tokio::test]
async fn test_failed_dispatch_retries_up_to_ceiling() {
    let fx = Fixture::with_agent(RecordingAgent::failing()).await;
    let key = one_target(&fx).await;
    fx.policy("retry-twice", 10, retry(2)).await;

    let engine = fx.engine().await;
    let report = fx.settle(&engine).await;
    assert_eq!(report.failed, 0);

    // The first attempt plus exactly two retries.
    assert_eq!(fx.agent.count(), 3);
    let jobs = release_jobs(&fx, &key).await;
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status == JobStatus::InvalidIntegration));
    assert_eq!(jobs[0].reason, JobReason::PolicyPassing);
    assert!(jobs[1..].iter().all(|j| j.reason == JobReason::Retry));
    assert!(jobs[0]
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("agent unreachable"));

    // The follow-up evaluation leaves the exhausted release alone.
    let (evaluation, follow_ups) = engine.evaluate(&key).await.unwrap();
    assert!(matches!(evaluation, Evaluation::Unchanged { .. }));
    assert!(follow_ups.is_empty());
    assert_eq!(fx.agent.count(), 3);
}

#[tokio::test]
async fn test_without_retry_rule_failure_is_final() {
    let fx = Fixture::with_agent(RecordingAgent::failing()).await;
    let key = one_target(&fx).await;

    let engine = fx.engine().await;
    fx.settle(&engine).await;

    assert_eq!(fx.agent.count(), 1);
    assert_eq!(release_jobs(&fx, &key).await.len(), 1);
}

#[tokio::test]
async fn test_highest_priority_retry_rule_wins() {
    let fx = Fixture::with_agent(RecordingAgent::failing()).await;
    one_target(&fx).await;
    fx.policy("generous", 1, retry(5)).await;
    fx.policy("strict", 50, retry(1)).await;

    let engine = fx.engine().await;
    fx.settle(&engine).await;
    assert_eq!(fx.agent.count(), 2);
}

#[tokio::test]
async fn test_missing_job_agent_marks_job_invalid() {
    let fx = Fixture::new().await;
    let key = one_target(&fx).await;
    let mut dep = fx
        .backend
        .get_deployment(&key.deployment_id)
        .await
        .unwrap()
        .unwrap();
    dep.job_agent_id = None;
    fx.backend.upsert_deployment(&dep).await.unwrap();

    let engine = fx.engine().await;
    fx.settle(&engine).await;

    assert_eq!(fx.agent.count(), 0);
    let jobs = release_jobs(&fx, &key).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::InvalidJobAgent);
    assert!(jobs[0].completed_at.is_some());
}

#[tokio::test]
async fn test_reported_failure_is_retried_then_reevaluated() {
    let fx = Fixture::new().await;
    let key = one_target(&fx).await;
    fx.policy("retry-once", 0, retry(1)).await;

    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let first = fx.agent.last().unwrap().job.id;

    let follow_ups = engine
        .update_job_status(&first, JobStatus::Failure, Some("exit code 1".into()))
        .await
        .unwrap();
    assert!(follow_ups.is_empty());
    assert_eq!(fx.agent.count(), 2);

    let second = fx.agent.last().unwrap().job.id;
    assert_ne!(first, second);
    let follow_ups = engine
        .update_job_status(&second, JobStatus::Failure, None)
        .await
        .unwrap();
    assert_eq!(follow_ups, vec![Task::EvaluateReleaseTarget(key.clone())]);
    assert_eq!(fx.agent.count(), 2);

    let failed = fx.backend.get_job(&first).await.unwrap().unwrap();
    assert_eq!(failed.message.as_deref(), Some("exit code 1"));
}

#[tokio::test]
async fn test_success_does_not_retry() {
    let fx = Fixture::new().await;
    let key = one_target(&fx).await;
    fx.policy("retry", 0, retry(3)).await;

    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let job_id = fx.agent.last().unwrap().job.id;

    let follow_ups = engine
        .update_job_status(&job_id, JobStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(follow_ups, vec![Task::EvaluateReleaseTarget(key)]);
    assert_eq!(fx.agent.count(), 1);

    let job = fx.backend.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_exited_job_rejects_further_transitions() {
    let fx = Fixture::new().await;
    one_target(&fx).await;
    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let job_id = fx.agent.last().unwrap().job.id;

    engine
        .update_job_status(&job_id, JobStatus::Completed, None)
        .await
        .unwrap();
    let err = engine
        .update_job_status(&job_id, JobStatus::InProgress, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("completed"));
}

#[tokio::test]
async fn test_action_required_is_not_an_exit() {
    let fx = Fixture::new().await;
    one_target(&fx).await;
    fx.policy("retry", 0, retry(3)).await;
    let engine = fx.engine().await;
    fx.settle(&engine).await;
    let job_id = fx.agent.last().unwrap().job.id;

    let follow_ups = engine
        .update_job_status(&job_id, JobStatus::ActionRequired, None)
        .await
        .unwrap();
    assert!(follow_ups.is_empty());
    let follow_ups = engine
        .update_job_status(&job_id, JobStatus::InProgress, None)
        .await
        .unwrap();
    assert!(follow_ups.is_empty());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let fx = Fixture::new().await;
    let engine = fx.engine().await;
    let err = engine
        .update_job_status("missing", JobStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(stagehand::error::is_not_found(&err));
}
