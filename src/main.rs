use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Reset SIGPIPE to default behavior so piping (e.g. `stagehand query ... | head`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use stagehand::config::{self, apply_manifest, load_manifests, EngineConfig};
use stagehand::engine::{EngineServices, WorkspaceEngine};
use stagehand::job::JobStatus;
use stagehand::output::formatter::{self, TargetRow};
use stagehand::state::models::{ApprovalStatus, ReleaseTargetKey, Workspace};
use stagehand::state::query::{run_query, QueryFormat};
use stagehand::state::{SqliteBackend, StateBackend};
use stagehand::worker::{Task, WorkerPool};

/// stagehand - release-target evaluation engine
#[derive(Parser)]
#[command(name = "stagehand", version, about, long_about = None)]
struct Cli {
    /// Path to the engine config file (defaults to ./stagehand.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// State database path, overriding the config file
    #[arg(short, long)]
    state: Option<String>,

    /// Workspace to operate on, overriding the config file
    #[arg(short, long)]
    workspace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state database and the workspace
    Init,

    /// Apply manifests, then reconcile and evaluate every release target
    Sync {
        /// Manifest file or directory of .yaml files
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Evaluate release targets and dispatch the resulting jobs
    Evaluate {
        /// Evaluate every release target in the workspace
        #[arg(long, conflicts_with_all = ["resource", "environment", "deployment"])]
        all: bool,

        /// Resource identifier
        #[arg(long, requires_all = ["environment", "deployment"])]
        resource: Option<String>,

        /// Environment name
        #[arg(long)]
        environment: Option<String>,

        /// Deployment slug
        #[arg(long)]
        deployment: Option<String>,
    },

    /// List release targets with their current version and latest job
    Targets,

    /// Report a job status, as an agent callback would
    Job {
        /// Job id
        id: String,

        /// New status (e.g. in_progress, completed, failure)
        #[arg(long)]
        status: String,

        /// Message to attach to the job
        #[arg(long)]
        message: Option<String>,
    },

    /// Approve (or reject) a version for an environment
    Approve {
        /// Deployment slug
        #[arg(long)]
        deployment: String,

        /// Version tag
        #[arg(long)]
        version: String,

        /// Environment name
        #[arg(long)]
        environment: String,

        /// Approving user
        #[arg(long)]
        user: String,

        /// Record a rejection instead
        #[arg(long)]
        reject: bool,
    },

    /// Run a SQL query against the state database
    Query {
        /// SQL query to execute (SELECT only)
        sql: String,

        /// Output format: table, json, csv
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Check the config file and optionally a manifest without touching state
    Validate {
        /// Manifest file or directory to check as well
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let settings = settings(&cli)?;

    match cli.command {
        Commands::Init => cmd_init(&settings).await,
        Commands::Sync { ref file } => cmd_sync(&settings, file).await,
        Commands::Evaluate {
            all,
            ref resource,
            ref environment,
            ref deployment,
        } => {
            let selection = match (resource, environment, deployment) {
                (Some(r), Some(e), Some(d)) => Some((r.as_str(), e.as_str(), d.as_str())),
                _ if all => None,
                _ => bail!("Pass --all or --resource, --environment and --deployment."),
            };
            cmd_evaluate(&settings, selection).await
        }
        Commands::Targets => cmd_targets(&settings).await,
        Commands::Job {
            ref id,
            ref status,
            ref message,
        } => cmd_job(&settings, id, status, message.clone()).await,
        Commands::Approve {
            ref deployment,
            ref version,
            ref environment,
            ref user,
            reject,
        } => cmd_approve(&settings, deployment, version, environment, user, reject).await,
        Commands::Query {
            ref sql,
            ref format,
        } => cmd_query(&settings, sql, format).await,
        Commands::Validate { ref file } => cmd_validate(&settings, file.as_deref()),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn settings(cli: &Cli) -> Result<EngineConfig> {
    let mut settings = config::load_config(cli.config.as_deref())?;
    if let Some(ref state) = cli.state {
        settings.state.path = state.clone();
    }
    if let Some(ref workspace) = cli.workspace {
        settings.workspace = workspace.clone();
    }
    Ok(settings)
}

async fn open_backend(settings: &EngineConfig) -> Result<Arc<dyn StateBackend>> {
    let backend = SqliteBackend::open(&settings.state.path)?;
    backend.initialize().await?;
    Ok(Arc::new(backend))
}

async fn require_workspace(backend: &dyn StateBackend, name: &str) -> Result<Workspace> {
    backend
        .get_workspace(name)
        .await?
        .with_context(|| format!("No workspace '{}'. Run 'stagehand init' first.", name))
}

async fn load_engine(settings: &EngineConfig) -> Result<Arc<WorkspaceEngine>> {
    let backend = open_backend(settings).await?;
    let workspace = require_workspace(backend.as_ref(), &settings.workspace).await?;
    let services = EngineServices::from_config(backend, settings);
    Ok(Arc::new(WorkspaceEngine::load(services, workspace).await?))
}

async fn drain(settings: &EngineConfig, engine: Arc<WorkspaceEngine>, tasks: Vec<Task>) {
    let pool = WorkerPool::new(engine, settings.worker.parallelism);
    let report = pool.run_until_idle(tasks).await;
    formatter::print_drain_report(&report);
}

/// Resolve human names to a release-target key.
async fn resolve_key(
    engine: &WorkspaceEngine,
    resource: &str,
    environment: &str,
    deployment: &str,
) -> Result<ReleaseTargetKey> {
    let backend = engine.backend();
    let ws = engine.workspace().id.as_str();

    let resource = backend
        .list_resources(ws)
        .await?
        .into_iter()
        .find(|r| r.identifier == resource)
        .with_context(|| format!("No resource '{}'", resource))?;
    let environment = backend
        .list_environments(ws)
        .await?
        .into_iter()
        .find(|e| e.name == environment)
        .with_context(|| format!("No environment '{}'", environment))?;
    let deployment = backend
        .list_deployments(ws)
        .await?
        .into_iter()
        .find(|d| d.slug == deployment)
        .with_context(|| format!("No deployment '{}'", deployment))?;

    Ok(ReleaseTargetKey::new(
        &resource.id,
        &environment.id,
        &deployment.id,
    ))
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_init(settings: &EngineConfig) -> Result<()> {
    let backend = open_backend(settings).await?;
    if backend.get_workspace(&settings.workspace).await?.is_none() {
        backend.create_workspace(&settings.workspace).await?;
    }
    formatter::print_success(&format!(
        "Initialized workspace '{}' in {}.",
        settings.workspace, settings.state.path
    ));
    Ok(())
}

async fn cmd_sync(settings: &EngineConfig, file: &Path) -> Result<()> {
    let manifest = load_manifests(file)?;
    let backend = open_backend(settings).await?;
    let workspace = require_workspace(backend.as_ref(), &settings.workspace).await?;

    let summary = apply_manifest(
        backend.as_ref(),
        &workspace,
        &manifest,
        chrono::Utc::now(),
    )
    .await?;
    formatter::print_apply_summary(&summary);

    let services = EngineServices::from_config(backend, settings);
    let engine = Arc::new(WorkspaceEngine::load(services, workspace).await?);
    let (changes, mut tasks) = engine.sync_release_targets().await?;
    formatter::print_target_changes(&changes);

    tasks.extend(engine.evaluate_all().await?);
    drain(settings, engine, tasks).await;
    Ok(())
}

async fn cmd_evaluate(
    settings: &EngineConfig,
    selection: Option<(&str, &str, &str)>,
) -> Result<()> {
    let engine = load_engine(settings).await?;

    let Some((resource, environment, deployment)) = selection else {
        let tasks = engine.evaluate_all().await?;
        if tasks.is_empty() {
            println!("{}", "No release targets.".dimmed());
            return Ok(());
        }
        drain(settings, engine, tasks).await;
        return Ok(());
    };

    let key = resolve_key(&engine, resource, environment, deployment).await?;
    let (evaluation, follow_ups) = engine.evaluate(&key).await?;
    let label = format!("{}/{}/{}", resource, environment, deployment);
    formatter::print_evaluation(&label, &evaluation);
    if !follow_ups.is_empty() {
        drain(settings, engine, follow_ups).await;
    }
    Ok(())
}

async fn cmd_targets(settings: &EngineConfig) -> Result<()> {
    let engine = load_engine(settings).await?;
    let backend = engine.backend();
    let ws = engine.workspace().id.as_str();

    let mut rows = Vec::new();
    for target in backend.list_release_targets(ws).await? {
        let resource = backend.get_resource(&target.resource_id).await?;
        let environment = backend.get_environment(&target.environment_id).await?;
        let deployment = backend.get_deployment(&target.deployment_id).await?;

        let mut version = None;
        let mut job_status = None;
        if let Some(release) = backend.current_release(&target.id).await? {
            if let Some(vr) = backend.get_version_release(&release.version_release_id).await? {
                version = backend.get_version(&vr.version_id).await?.map(|v| v.tag);
            }
            job_status = backend
                .list_jobs_for_release(&release.id)
                .await?
                .last()
                .map(|j| j.status);
        }

        rows.push(TargetRow {
            resource: resource.map(|r| r.identifier).unwrap_or(target.resource_id),
            environment: environment.map(|e| e.name).unwrap_or(target.environment_id),
            deployment: deployment.map(|d| d.slug).unwrap_or(target.deployment_id),
            version,
            job_status,
        });
    }
    rows.sort_by(|a, b| {
        (&a.resource, &a.environment, &a.deployment).cmp(&(&b.resource, &b.environment, &b.deployment))
    });
    formatter::print_target_table(&rows);
    Ok(())
}

async fn cmd_job(
    settings: &EngineConfig,
    id: &str,
    status: &str,
    message: Option<String>,
) -> Result<()> {
    let status = JobStatus::from_str(status)?;
    let engine = load_engine(settings).await?;
    let follow_ups = engine.update_job_status(id, status, message).await?;
    formatter::print_success(&format!("Job {} is now {}.", id, status));
    if !follow_ups.is_empty() {
        drain(settings, engine, follow_ups).await;
    }
    Ok(())
}

async fn cmd_approve(
    settings: &EngineConfig,
    deployment: &str,
    version: &str,
    environment: &str,
    user: &str,
    reject: bool,
) -> Result<()> {
    let engine = load_engine(settings).await?;
    let backend = engine.backend();
    let ws = engine.workspace().id.as_str();

    let deployment = backend
        .list_deployments(ws)
        .await?
        .into_iter()
        .find(|d| d.slug == deployment)
        .with_context(|| format!("No deployment '{}'", deployment))?;
    let version = backend
        .list_versions(&deployment.id)
        .await?
        .into_iter()
        .find(|v| v.tag == version)
        .with_context(|| format!("No version '{}' of '{}'", version, deployment.slug))?;
    let environment = backend
        .list_environments(ws)
        .await?
        .into_iter()
        .find(|e| e.name == environment && e.system_id == deployment.system_id)
        .with_context(|| format!("No environment '{}'", environment))?;

    let status = if reject {
        ApprovalStatus::Rejected
    } else {
        ApprovalStatus::Approved
    };
    let tasks = engine
        .record_approval(&version.id, &environment.id, user, status)
        .await?;
    let verb = if reject { "Rejected" } else { "Approved" };
    formatter::print_success(&format!(
        "{} {} {} for {}.",
        verb, deployment.slug, version.tag, environment.name
    ));
    drain(settings, engine, tasks).await;
    Ok(())
}

async fn cmd_query(settings: &EngineConfig, sql: &str, format: &str) -> Result<()> {
    let format = QueryFormat::from_str(format)?;
    let backend = open_backend(settings).await?;
    let result = run_query(backend.as_ref(), sql).await?;
    println!("{}", result.render(format)?);
    Ok(())
}

fn cmd_validate(settings: &EngineConfig, file: Option<&Path>) -> Result<()> {
    if let Some(file) = file {
        let manifest = load_manifests(file)?;
        let deployments: usize = manifest.systems.iter().map(|s| s.deployments.len()).sum();
        println!(
            "  {} resource(s), {} system(s), {} deployment(s), {} polic(ies)",
            manifest.resources.len(),
            manifest.systems.len(),
            deployments,
            manifest.policies.len()
        );
    }
    formatter::print_success(&format!(
        "Configuration is valid (workspace '{}').",
        settings.workspace
    ));
    Ok(())
}
