#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

use stagehand::clock::{Clock, FixedClock};
use stagehand::engine::{EngineServices, WorkspaceEngine};
use stagehand::job::{AgentRegistry, DispatchRequest, JobAgentAdapter};
use stagehand::policy::rules::PolicyRules;
use stagehand::selector::Condition;
use stagehand::state::models::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, Environment,
    JobAgent, Policy, PolicyTarget, Resource, System, VariableValueKind, Workspace,
};
use stagehand::state::{SqliteBackend, StateBackend};
use stagehand::worker::{DrainReport, Task, WorkerPool};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

// ─── Agents ─────────────────────────────────────────────────────────────────

/// Records every dispatch and answers with a fixed outcome.
#[derive(Default)]
pub struct RecordingAgent {
    pub requests: Mutex<Vec<DispatchRequest>>,
    pub fail: bool,
}

impl RecordingAgent {
    pub fn failing() -> Self {
        Self {
            requests: Mutex::new(vec![]),
            fail: true,
        }
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn tags(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.version.tag.clone())
            .collect()
    }

    pub fn last(&self) -> Option<DispatchRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl JobAgentAdapter for RecordingAgent {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Option<String>> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            bail!("agent unreachable");
        }
        Ok(Some(format!("run-{}", self.count())))
    }
}

// ─── Fixture ────────────────────────────────────────────────────────────────

/// An in-memory workspace with one system and one recording job agent.
pub struct Fixture {
    pub backend: Arc<dyn StateBackend>,
    pub clock: Arc<FixedClock>,
    pub workspace: Workspace,
    pub system: System,
    pub agent: Arc<RecordingAgent>,
    pub job_agent: JobAgent,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_agent(RecordingAgent::default()).await
    }

    pub async fn with_agent(agent: RecordingAgent) -> Self {
        let backend = SqliteBackend::open_memory().unwrap();
        backend.initialize().await.unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(backend);
        let workspace = backend.create_workspace("test").await.unwrap();
        Self::in_workspace(backend, workspace, agent).await
    }

    /// A second fixture sharing the same store under another workspace.
    pub async fn sibling(&self, name: &str) -> Self {
        let workspace = self.backend.create_workspace(name).await.unwrap();
        Self::in_workspace(self.backend.clone(), workspace, RecordingAgent::default()).await
    }

    async fn in_workspace(
        backend: Arc<dyn StateBackend>,
        workspace: Workspace,
        agent: RecordingAgent,
    ) -> Self {
        let system = System {
            id: id("sys"),
            workspace_id: workspace.id.clone(),
            name: "platform".to_string(),
        };
        backend.upsert_system(&system).await.unwrap();

        let job_agent = JobAgent {
            id: id("agent"),
            workspace_id: workspace.id.clone(),
            name: "recorder".to_string(),
            agent_type: "recording".to_string(),
            config: serde_json::json!({"queue": "default", "timeout": 60}),
        };
        backend.upsert_job_agent(&job_agent).await.unwrap();

        Self {
            backend,
            clock: Arc::new(FixedClock::new(t0())),
            workspace,
            system,
            agent: Arc::new(agent),
            job_agent,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn services(&self) -> EngineServices {
        let mut agents = AgentRegistry::new();
        agents.register("recording", self.agent.clone());
        EngineServices::new(self.backend.clone())
            .with_clock(self.clock.clone())
            .with_agents(agents)
    }

    pub async fn engine(&self) -> Arc<WorkspaceEngine> {
        Arc::new(
            WorkspaceEngine::load(self.services(), self.workspace.clone())
                .await
                .unwrap(),
        )
    }

    /// Reconcile targets and evaluate everything until the queue is empty.
    pub async fn settle(&self, engine: &Arc<WorkspaceEngine>) -> DrainReport {
        let mut tasks = vec![Task::SyncReleaseTargets];
        tasks.extend(engine.evaluate_all().await.unwrap());
        WorkerPool::new(engine.clone(), 4).run_until_idle(tasks).await
    }

    // ─── Builders ───────────────────────────────────────────────────────────

    pub async fn resource(&self, identifier: &str, metadata: &[(&str, &str)]) -> Resource {
        let mut resource = Resource::new(&self.workspace.id, "Kubernetes/Cluster", identifier);
        for (k, v) in metadata {
            resource = resource.with_metadata(k, v);
        }
        self.backend.upsert_resource(&resource).await.unwrap();
        resource
    }

    pub async fn environment(&self, name: &str, selector: Option<Condition>) -> Environment {
        let environment = Environment {
            id: id("env"),
            system_id: self.system.id.clone(),
            name: name.to_string(),
            resource_selector: selector,
        };
        self.backend.upsert_environment(&environment).await.unwrap();
        environment
    }

    pub async fn deployment(&self, slug: &str, selector: Option<Condition>) -> Deployment {
        let deployment = Deployment {
            id: id("dep"),
            system_id: self.system.id.clone(),
            name: slug.to_string(),
            slug: slug.to_string(),
            job_agent_id: Some(self.job_agent.id.clone()),
            job_agent_config: serde_json::json!({"timeout": 120}),
            resource_selector: selector,
        };
        self.backend.upsert_deployment(&deployment).await.unwrap();
        deployment
    }

    /// A ready version created `minutes` after the fixture's start time.
    pub async fn version(&self, deployment: &Deployment, tag: &str, minutes: i64) -> DeploymentVersion {
        let version =
            DeploymentVersion::new(&deployment.id, tag, t0() + Duration::minutes(minutes));
        self.backend.upsert_version(&version).await.unwrap();
        version
    }

    pub async fn variable(
        &self,
        deployment: &Deployment,
        key: &str,
        default: Option<serde_json::Value>,
        values: Vec<(i64, Condition, serde_json::Value)>,
    ) -> DeploymentVariable {
        let variable_id = id("var");
        let mut stored = Vec::new();
        let mut default_value_id = None;
        if let Some(value) = default {
            let value_id = id("val");
            default_value_id = Some(value_id.clone());
            stored.push(DeploymentVariableValue {
                id: value_id,
                variable_id: variable_id.clone(),
                priority: 0,
                resource_selector: None,
                value: direct(value),
            });
        }
        for (priority, selector, value) in values {
            stored.push(DeploymentVariableValue {
                id: id("val"),
                variable_id: variable_id.clone(),
                priority,
                resource_selector: Some(selector),
                value: direct(value),
            });
        }
        let variable = DeploymentVariable {
            id: variable_id,
            deployment_id: deployment.id.clone(),
            key: key.to_string(),
            description: String::new(),
            default_value_id,
            values: stored,
        };
        self.backend.upsert_deployment_variable(&variable).await.unwrap();
        variable
    }

    /// An enabled policy targeting every release target of the workspace.
    pub async fn policy(&self, name: &str, priority: i64, rules: PolicyRules) -> Policy {
        let policy_id = id("pol");
        let policy = Policy {
            id: policy_id.clone(),
            workspace_id: self.workspace.id.clone(),
            name: name.to_string(),
            priority,
            enabled: true,
            targets: vec![PolicyTarget {
                id: id("pt"),
                policy_id,
                deployment_selector: Some(Condition::everything()),
                environment_selector: None,
                resource_selector: None,
            }],
            rules,
            created_at: t0(),
        };
        self.backend.upsert_policy(&policy).await.unwrap();
        policy
    }
}

pub fn direct(value: serde_json::Value) -> VariableValueKind {
    VariableValueKind::Direct {
        value,
        sensitive: false,
    }
}

pub fn secret(value: serde_json::Value) -> VariableValueKind {
    VariableValueKind::Direct {
        value,
        sensitive: true,
    }
}
