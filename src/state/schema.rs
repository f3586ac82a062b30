/// SQL DDL for the stagehand state database.
///
/// Timestamps are fixed-width RFC 3339 TEXT (microseconds, `Z`) so that text
/// ordering is chronological. JSON documents are TEXT.

pub const SCHEMA_VERSION: i32 = 1;

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- Resources: the entities matched by selectors
CREATE TABLE IF NOT EXISTS resources (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    version TEXT NOT NULL,
    name TEXT NOT NULL,
    identifier TEXT NOT NULL,
    provider_id TEXT,
    config_json TEXT NOT NULL DEFAULT '{}',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    locked_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    UNIQUE(workspace_id, identifier),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS resource_variables (
    id TEXT PRIMARY KEY,
    resource_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    UNIQUE(resource_id, key),
    FOREIGN KEY (resource_id) REFERENCES resources(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS relationship_rules (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    reference TEXT NOT NULL,
    rule_json TEXT NOT NULL,
    UNIQUE(workspace_id, reference),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS systems (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS environments (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL,
    name TEXT NOT NULL,
    resource_selector TEXT,
    FOREIGN KEY (system_id) REFERENCES systems(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS job_agents (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    config_json TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS deployments (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL,
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    job_agent_id TEXT,
    job_agent_config TEXT NOT NULL DEFAULT '{}',
    resource_selector TEXT,
    FOREIGN KEY (system_id) REFERENCES systems(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS deployment_versions (
    id TEXT PRIMARY KEY,
    deployment_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    name TEXT NOT NULL,
    config_json TEXT NOT NULL DEFAULT '{}',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'ready',
    created_at TEXT NOT NULL,
    UNIQUE(deployment_id, tag),
    FOREIGN KEY (deployment_id) REFERENCES deployments(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS deployment_variables (
    id TEXT PRIMARY KEY,
    deployment_id TEXT NOT NULL,
    key TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    default_value_id TEXT,
    UNIQUE(deployment_id, key),
    FOREIGN KEY (deployment_id) REFERENCES deployments(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS deployment_variable_values (
    id TEXT PRIMARY KEY,
    variable_id TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    resource_selector TEXT,
    value_json TEXT NOT NULL,
    FOREIGN KEY (variable_id) REFERENCES deployment_variables(id) ON DELETE CASCADE
);

-- Policies and their rule sub-records (at most one per type)
CREATE TABLE IF NOT EXISTS policies (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS policy_targets (
    id TEXT PRIMARY KEY,
    policy_id TEXT NOT NULL,
    deployment_selector TEXT,
    environment_selector TEXT,
    resource_selector TEXT,
    FOREIGN KEY (policy_id) REFERENCES policies(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS policy_rules (
    policy_id TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    config_json TEXT NOT NULL,
    PRIMARY KEY (policy_id, rule_type),
    FOREIGN KEY (policy_id) REFERENCES policies(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    version_id TEXT NOT NULL,
    environment_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(version_id, environment_id, user_id)
);

-- Mirrors of the in-memory selector indexes
CREATE TABLE IF NOT EXISTS computed_environment_resource (
    selector_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (selector_id, entity_id)
);

CREATE TABLE IF NOT EXISTS computed_deployment_resource (
    selector_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (selector_id, entity_id)
);

CREATE TABLE IF NOT EXISTS computed_variable_value_resource (
    selector_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (selector_id, entity_id)
);

CREATE TABLE IF NOT EXISTS computed_policy_target_release_target (
    selector_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (selector_id, entity_id)
);

-- Release targets and their release history
CREATE TABLE IF NOT EXISTS release_targets (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    environment_id TEXT NOT NULL,
    deployment_id TEXT NOT NULL,
    desired_release_id TEXT,
    desired_version_id TEXT,
    UNIQUE(resource_id, environment_id, deployment_id),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS version_releases (
    id TEXT PRIMARY KEY,
    release_target_id TEXT NOT NULL,
    version_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (release_target_id) REFERENCES release_targets(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS variable_set_releases (
    id TEXT PRIMARY KEY,
    release_target_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (release_target_id) REFERENCES release_targets(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS variable_value_snapshots (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    sensitive INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS variable_set_release_values (
    variable_set_release_id TEXT NOT NULL,
    snapshot_id TEXT NOT NULL,
    PRIMARY KEY (variable_set_release_id, snapshot_id),
    FOREIGN KEY (variable_set_release_id) REFERENCES variable_set_releases(id) ON DELETE CASCADE,
    FOREIGN KEY (snapshot_id) REFERENCES variable_value_snapshots(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS releases (
    id TEXT PRIMARY KEY,
    version_release_id TEXT NOT NULL,
    variable_release_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (version_release_id) REFERENCES version_releases(id) ON DELETE CASCADE,
    FOREIGN KEY (variable_release_id) REFERENCES variable_set_releases(id) ON DELETE CASCADE
);

-- Jobs outlive their release targets as history
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    job_agent_id TEXT,
    job_agent_config TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending',
    reason TEXT NOT NULL DEFAULT 'policy_passing',
    message TEXT,
    external_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS release_jobs (
    release_id TEXT NOT NULL,
    job_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    PRIMARY KEY (release_id, job_id),
    UNIQUE(release_id, attempt),
    FOREIGN KEY (release_id) REFERENCES releases(id) ON DELETE CASCADE,
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS job_variables (
    job_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    sensitive INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, key),
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

-- Lease-style advisory locks
CREATE TABLE IF NOT EXISTS leases (
    lease_key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
";

pub const CREATE_INDEXES_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_resources_workspace ON resources(workspace_id);
CREATE INDEX IF NOT EXISTS idx_resources_kind ON resources(kind, version);
CREATE INDEX IF NOT EXISTS idx_environments_system ON environments(system_id);
CREATE INDEX IF NOT EXISTS idx_deployments_system ON deployments(system_id);
CREATE INDEX IF NOT EXISTS idx_versions_deployment ON deployment_versions(deployment_id, created_at);
CREATE INDEX IF NOT EXISTS idx_policies_workspace ON policies(workspace_id);
CREATE INDEX IF NOT EXISTS idx_policy_targets_policy ON policy_targets(policy_id);
CREATE INDEX IF NOT EXISTS idx_computed_env_entity ON computed_environment_resource(entity_id);
CREATE INDEX IF NOT EXISTS idx_computed_dep_entity ON computed_deployment_resource(entity_id);
CREATE INDEX IF NOT EXISTS idx_computed_var_entity ON computed_variable_value_resource(entity_id);
CREATE INDEX IF NOT EXISTS idx_computed_policy_entity ON computed_policy_target_release_target(entity_id);
CREATE INDEX IF NOT EXISTS idx_release_targets_env_dep ON release_targets(environment_id, deployment_id);
CREATE INDEX IF NOT EXISTS idx_version_releases_target ON version_releases(release_target_id, created_at);
CREATE INDEX IF NOT EXISTS idx_variable_releases_target ON variable_set_releases(release_target_id, created_at);
CREATE INDEX IF NOT EXISTS idx_releases_version ON releases(version_release_id);
CREATE INDEX IF NOT EXISTS idx_release_jobs_job ON release_jobs(job_id);
";
