use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::engine::WorkspaceEngine;
use crate::state::models::ReleaseTargetKey;

// ─── Tasks ──────────────────────────────────────────────────────────────────

/// Which kind of row an [`Task::EntityChanged`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Resource,
    Environment,
    Deployment,
    /// A deployment version, or an approval recorded against one.
    Version,
    /// The id is the deployment whose variables changed.
    DeploymentVariables,
    Policy,
    RelationshipRule,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Resource => "resource",
            EntityKind::Environment => "environment",
            EntityKind::Deployment => "deployment",
            EntityKind::Version => "version",
            EntityKind::DeploymentVariables => "deployment_variables",
            EntityKind::Policy => "policy",
            EntityKind::RelationshipRule => "relationship_rule",
        };
        f.write_str(name)
    }
}

/// Unit of work. Delivery is at least once; every task is safe to repeat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Task {
    EvaluateReleaseTarget(ReleaseTargetKey),
    EntityChanged { id: String, kind: EntityKind },
    SyncReleaseTargets,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::EvaluateReleaseTarget(key) => write!(f, "evaluate {}", key),
            Task::EntityChanged { id, kind } => write!(f, "{} {} changed", kind, id),
            Task::SyncReleaseTargets => f.write_str("sync release targets"),
        }
    }
}

// ─── Pool ───────────────────────────────────────────────────────────────────

/// Counts from one drain of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
}

/// Runs tasks against one workspace with bounded concurrency. Follow-up tasks
/// go back on the queue; a task already waiting in the queue is not queued
/// twice.
pub struct WorkerPool {
    engine: Arc<WorkspaceEngine>,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(engine: Arc<WorkspaceEngine>, parallelism: usize) -> Self {
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
        }
    }

    /// Process `initial` and everything it leads to. Failed tasks are logged
    /// and counted; they never stop the pool.
    pub async fn run_until_idle(&self, initial: Vec<Task>) -> DrainReport {
        let mut queue: VecDeque<Task> = VecDeque::new();
        let mut queued: HashSet<Task> = HashSet::new();
        for task in initial {
            if queued.insert(task.clone()) {
                queue.push_back(task);
            }
        }

        let mut running = JoinSet::new();
        let mut report = DrainReport::default();

        loop {
            while let Some(task) = queue.pop_front() {
                queued.remove(&task);
                let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                    tracing::error!("worker semaphore closed");
                    return report;
                };
                let engine = self.engine.clone();
                running.spawn(async move {
                    let _permit = permit;
                    let result = engine.handle(&task).await;
                    (task, result)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((task, Ok(follow_ups))) => {
                    report.processed += 1;
                    tracing::debug!(task = %task, follow_ups = follow_ups.len(), "task done");
                    for next in follow_ups {
                        if queued.insert(next.clone()) {
                            queue.push_back(next);
                        }
                    }
                }
                Ok((task, Err(e))) => {
                    report.failed += 1;
                    tracing::error!(task = %task, error = %format!("{:#}", e), "task failed");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(error = %e, "task panicked");
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            "queue drained"
        );
        report
    }
}
