use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::backend::StateBackend;
use super::migration;
use super::models::*;
use crate::job::status::JobStatus;
use crate::policy::rules::PolicyRules;
use crate::selector::condition::Condition;

/// SQLite-backed state store.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the SQLite state database.
    pub fn open(db_path: &str) -> Result<Self> {
        let parent = Path::new(db_path).parent();
        if let Some(dir) = parent {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state database at {}", db_path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database connection mutex poisoned"))
    }
}

// ─── Column helpers ─────────────────────────────────────────────────────────

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

/// Selectors are checked on write; stored trees are always within depth.
fn check_selectors<'a>(selectors: impl IntoIterator<Item = &'a Option<Condition>>) -> Result<()> {
    for condition in selectors.into_iter().flatten() {
        condition.validate()?;
    }
    Ok(())
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| serde_json::from_str(&r).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

fn status_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(idx)?;
    raw.parse::<JobStatus>().map_err(|e| {
        conversion_error(
            idx,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        )
    })
}

const RESOURCE_COLUMNS: &str = "id, workspace_id, kind, version, name, identifier, provider_id,
    config_json, metadata_json, locked_at, created_at, updated_at, deleted_at";

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        kind: row.get(2)?,
        version: row.get(3)?,
        name: row.get(4)?,
        identifier: row.get(5)?,
        provider_id: row.get(6)?,
        config: json_col(row, 7)?,
        metadata: json_col(row, 8)?,
        locked_at: opt_ts_col(row, 9)?,
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
        deleted_at: opt_ts_col(row, 12)?,
    })
}

const ENVIRONMENT_COLUMNS: &str = "e.id, e.system_id, e.name, e.resource_selector";

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: row.get(0)?,
        system_id: row.get(1)?,
        name: row.get(2)?,
        resource_selector: opt_json_col(row, 3)?,
    })
}

const DEPLOYMENT_COLUMNS: &str =
    "d.id, d.system_id, d.name, d.slug, d.job_agent_id, d.job_agent_config, d.resource_selector";

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    Ok(Deployment {
        id: row.get(0)?,
        system_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        job_agent_id: row.get(4)?,
        job_agent_config: json_col(row, 5)?,
        resource_selector: opt_json_col(row, 6)?,
    })
}

const VERSION_COLUMNS: &str =
    "v.id, v.deployment_id, v.tag, v.name, v.config_json, v.metadata_json, v.status, v.created_at";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<DeploymentVersion> {
    let status: String = row.get(6)?;
    Ok(DeploymentVersion {
        id: row.get(0)?,
        deployment_id: row.get(1)?,
        tag: row.get(2)?,
        name: row.get(3)?,
        config: json_col(row, 4)?,
        metadata: json_col(row, 5)?,
        status: VersionStatus::parse(&status),
        created_at: ts_col(row, 7)?,
    })
}

const RELEASE_TARGET_COLUMNS: &str = "id, workspace_id, resource_id, environment_id, deployment_id,
    desired_release_id, desired_version_id";

fn release_target_from_row(row: &Row<'_>) -> rusqlite::Result<ReleaseTarget> {
    Ok(ReleaseTarget {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        resource_id: row.get(2)?,
        environment_id: row.get(3)?,
        deployment_id: row.get(4)?,
        desired_release_id: row.get(5)?,
        desired_version_id: row.get(6)?,
    })
}

const JOB_COLUMNS: &str = "j.id, j.job_agent_id, j.job_agent_config, j.status, j.reason, j.message,
    j.external_id, j.created_at, j.updated_at, j.started_at, j.completed_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let reason: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        job_agent_id: row.get(1)?,
        job_agent_config: json_col(row, 2)?,
        status: status_col(row, 3)?,
        reason: JobReason::parse(&reason),
        message: row.get(5)?,
        external_id: row.get(6)?,
        created_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
        started_at: opt_ts_col(row, 9)?,
        completed_at: opt_ts_col(row, 10)?,
    })
}

fn release_from_row(row: &Row<'_>) -> rusqlite::Result<Release> {
    Ok(Release {
        id: row.get(0)?,
        version_release_id: row.get(1)?,
        variable_release_id: row.get(2)?,
        created_at: ts_col(row, 3)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<VariableValueSnapshot> {
    Ok(VariableValueSnapshot {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        key: row.get(2)?,
        value: json_col(row, 3)?,
        sensitive: row.get::<_, i32>(4)? != 0,
    })
}

fn load_variable_values(
    conn: &Connection,
    variable_id: &str,
) -> Result<Vec<DeploymentVariableValue>> {
    let mut stmt = conn.prepare(
        "SELECT id, variable_id, priority, resource_selector, value_json
         FROM deployment_variable_values WHERE variable_id = ?1 ORDER BY priority DESC, rowid",
    )?;
    let rows = stmt
        .query_map(params![variable_id], |row| {
            Ok(DeploymentVariableValue {
                id: row.get(0)?,
                variable_id: row.get(1)?,
                priority: row.get(2)?,
                resource_selector: opt_json_col(row, 3)?,
                value: json_col(row, 4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_deployment_variables(
    conn: &Connection,
    sql: &str,
    param: &str,
) -> Result<Vec<DeploymentVariable>> {
    let mut stmt = conn.prepare(sql)?;
    let mut variables = stmt
        .query_map(params![param], |row| {
            Ok(DeploymentVariable {
                id: row.get(0)?,
                deployment_id: row.get(1)?,
                key: row.get(2)?,
                description: row.get(3)?,
                default_value_id: row.get(4)?,
                values: vec![],
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for variable in &mut variables {
        variable.values = load_variable_values(conn, &variable.id)?;
    }
    Ok(variables)
}

#[async_trait]
impl StateBackend for SqliteBackend {
    // ─── Initialization ─────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        migration::check_and_migrate(&conn)
    }

    // ─── Workspaces ─────────────────────────────────────────────────────────

    async fn create_workspace(&self, name: &str) -> Result<Workspace> {
        let workspace = Workspace {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![workspace.id, workspace.name, ts(&workspace.created_at)],
        )
        .with_context(|| format!("Failed to create workspace '{}'", name))?;
        Ok(workspace)
    }

    async fn get_workspace(&self, name: &str) -> Result<Option<Workspace>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, name, created_at FROM workspaces WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Workspace {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: ts_col(row, 2)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ─── Resources ──────────────────────────────────────────────────────────

    async fn upsert_resource(&self, resource: &Resource) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO resources (id, workspace_id, kind, version, name, identifier, provider_id,
                config_json, metadata_json, locked_at, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                version = excluded.version,
                name = excluded.name,
                identifier = excluded.identifier,
                provider_id = excluded.provider_id,
                config_json = excluded.config_json,
                metadata_json = excluded.metadata_json,
                locked_at = excluded.locked_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at",
            params![
                resource.id,
                resource.workspace_id,
                resource.kind,
                resource.version,
                resource.name,
                resource.identifier,
                resource.provider_id,
                serde_json::to_string(&resource.config)?,
                serde_json::to_string(&resource.metadata)?,
                opt_ts(&resource.locked_at),
                ts(&resource.created_at),
                ts(&resource.updated_at),
                opt_ts(&resource.deleted_at),
            ],
        )
        .with_context(|| format!("Failed to upsert resource '{}'", resource.identifier))?;
        Ok(())
    }

    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM resources WHERE id = ?1", RESOURCE_COLUMNS);
        let result = conn
            .query_row(&sql, params![resource_id], resource_from_row)
            .optional()?;
        Ok(result)
    }

    async fn list_resources(&self, workspace_id: &str) -> Result<Vec<Resource>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM resources WHERE workspace_id = ?1 AND deleted_at IS NULL
             ORDER BY identifier",
            RESOURCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id], resource_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn list_resources_by_kind(
        &self,
        workspace_id: &str,
        kind: &str,
        version: &str,
    ) -> Result<Vec<Resource>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM resources
             WHERE workspace_id = ?1 AND kind = ?2 AND version = ?3 AND deleted_at IS NULL
             ORDER BY created_at, rowid",
            RESOURCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id, kind, version], resource_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn delete_resource(&self, resource_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE resources SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![resource_id, ts(&at)],
        )?;
        Ok(())
    }

    async fn upsert_resource_variable(&self, variable: &ResourceVariable) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO resource_variables (id, resource_id, key, value_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(resource_id, key) DO UPDATE SET value_json = excluded.value_json",
            params![
                variable.id,
                variable.resource_id,
                variable.key,
                serde_json::to_string(&variable.value)?,
            ],
        )?;
        Ok(())
    }

    async fn list_resource_variables(&self, resource_id: &str) -> Result<Vec<ResourceVariable>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, resource_id, key, value_json FROM resource_variables
             WHERE resource_id = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![resource_id], |row| {
                Ok(ResourceVariable {
                    id: row.get(0)?,
                    resource_id: row.get(1)?,
                    key: row.get(2)?,
                    value: json_col(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn upsert_relationship_rule(&self, rule: &RelationshipRule) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO relationship_rules (id, workspace_id, reference, rule_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(workspace_id, reference) DO UPDATE SET rule_json = excluded.rule_json",
            params![
                rule.id,
                rule.workspace_id,
                rule.reference,
                serde_json::to_string(rule)?,
            ],
        )?;
        Ok(())
    }

    async fn get_relationship_rule(
        &self,
        workspace_id: &str,
        reference: &str,
    ) -> Result<Option<RelationshipRule>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT rule_json FROM relationship_rules WHERE workspace_id = ?1 AND reference = ?2",
                params![workspace_id, reference],
                |row| json_col(row, 0),
            )
            .optional()?;
        Ok(result)
    }

    // ─── Systems, Environments, Deployments ─────────────────────────────────

    async fn upsert_system(&self, system: &System) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO systems (id, workspace_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![system.id, system.workspace_id, system.name],
        )?;
        Ok(())
    }

    async fn upsert_environment(&self, environment: &Environment) -> Result<()> {
        check_selectors([&environment.resource_selector])?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO environments (id, system_id, name, resource_selector)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, resource_selector = excluded.resource_selector",
            params![
                environment.id,
                environment.system_id,
                environment.name,
                opt_json(&environment.resource_selector)?,
            ],
        )?;
        Ok(())
    }

    async fn get_environment(&self, environment_id: &str) -> Result<Option<Environment>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM environments e WHERE e.id = ?1", ENVIRONMENT_COLUMNS);
        let result = conn
            .query_row(&sql, params![environment_id], environment_from_row)
            .optional()?;
        Ok(result)
    }

    async fn list_environments(&self, workspace_id: &str) -> Result<Vec<Environment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM environments e JOIN systems s ON s.id = e.system_id
             WHERE s.workspace_id = ?1 ORDER BY e.name",
            ENVIRONMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id], environment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn delete_environment(&self, environment_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM environments WHERE id = ?1", params![environment_id])?;
        Ok(())
    }

    async fn upsert_deployment(&self, deployment: &Deployment) -> Result<()> {
        check_selectors([&deployment.resource_selector])?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO deployments (id, system_id, name, slug, job_agent_id, job_agent_config,
                resource_selector)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                slug = excluded.slug,
                job_agent_id = excluded.job_agent_id,
                job_agent_config = excluded.job_agent_config,
                resource_selector = excluded.resource_selector",
            params![
                deployment.id,
                deployment.system_id,
                deployment.name,
                deployment.slug,
                deployment.job_agent_id,
                serde_json::to_string(&deployment.job_agent_config)?,
                opt_json(&deployment.resource_selector)?,
            ],
        )?;
        Ok(())
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM deployments d WHERE d.id = ?1", DEPLOYMENT_COLUMNS);
        let result = conn
            .query_row(&sql, params![deployment_id], deployment_from_row)
            .optional()?;
        Ok(result)
    }

    async fn list_deployments(&self, workspace_id: &str) -> Result<Vec<Deployment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM deployments d JOIN systems s ON s.id = d.system_id
             WHERE s.workspace_id = ?1 ORDER BY d.slug",
            DEPLOYMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id], deployment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn delete_deployment(&self, deployment_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM deployments WHERE id = ?1", params![deployment_id])?;
        Ok(())
    }

    // ─── Versions & Job Agents ──────────────────────────────────────────────

    async fn upsert_version(&self, version: &DeploymentVersion) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO deployment_versions (id, deployment_id, tag, name, config_json,
                metadata_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                config_json = excluded.config_json,
                metadata_json = excluded.metadata_json,
                status = excluded.status",
            params![
                version.id,
                version.deployment_id,
                version.tag,
                version.name,
                serde_json::to_string(&version.config)?,
                serde_json::to_string(&version.metadata)?,
                version.status.as_str(),
                ts(&version.created_at),
            ],
        )
        .with_context(|| format!("Failed to upsert version '{}'", version.tag))?;
        Ok(())
    }

    async fn get_version(&self, version_id: &str) -> Result<Option<DeploymentVersion>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM deployment_versions v WHERE v.id = ?1",
            VERSION_COLUMNS
        );
        let result = conn
            .query_row(&sql, params![version_id], version_from_row)
            .optional()?;
        Ok(result)
    }

    async fn list_versions(&self, deployment_id: &str) -> Result<Vec<DeploymentVersion>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM deployment_versions v WHERE v.deployment_id = ?1
             ORDER BY v.created_at DESC, v.rowid DESC",
            VERSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![deployment_id], version_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn upsert_job_agent(&self, agent: &JobAgent) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_agents (id, workspace_id, name, agent_type, config_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, agent_type = excluded.agent_type,
                config_json = excluded.config_json",
            params![
                agent.id,
                agent.workspace_id,
                agent.name,
                agent.agent_type,
                serde_json::to_string(&agent.config)?,
            ],
        )?;
        Ok(())
    }

    async fn get_job_agent(&self, job_agent_id: &str) -> Result<Option<JobAgent>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, workspace_id, name, agent_type, config_json FROM job_agents WHERE id = ?1",
                params![job_agent_id],
                |row| {
                    Ok(JobAgent {
                        id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        name: row.get(2)?,
                        agent_type: row.get(3)?,
                        config: json_col(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ─── Deployment Variables ───────────────────────────────────────────────

    async fn upsert_deployment_variable(&self, variable: &DeploymentVariable) -> Result<()> {
        check_selectors(variable.values.iter().map(|v| &v.resource_selector))?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO deployment_variables (id, deployment_id, key, description, default_value_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                key = excluded.key,
                description = excluded.description,
                default_value_id = excluded.default_value_id",
            params![
                variable.id,
                variable.deployment_id,
                variable.key,
                variable.description,
                variable.default_value_id,
            ],
        )?;
        tx.execute(
            "DELETE FROM deployment_variable_values WHERE variable_id = ?1",
            params![variable.id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO deployment_variable_values (id, variable_id, priority,
                    resource_selector, value_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for value in &variable.values {
                stmt.execute(params![
                    value.id,
                    variable.id,
                    value.priority,
                    opt_json(&value.resource_selector)?,
                    serde_json::to_string(&value.value)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_deployment_variables(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<DeploymentVariable>> {
        let conn = self.conn()?;
        load_deployment_variables(
            &conn,
            "SELECT id, deployment_id, key, description, default_value_id
             FROM deployment_variables WHERE deployment_id = ?1 ORDER BY key",
            deployment_id,
        )
    }

    async fn list_workspace_deployment_variables(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<DeploymentVariable>> {
        let conn = self.conn()?;
        load_deployment_variables(
            &conn,
            "SELECT dv.id, dv.deployment_id, dv.key, dv.description, dv.default_value_id
             FROM deployment_variables dv
             JOIN deployments d ON d.id = dv.deployment_id
             JOIN systems s ON s.id = d.system_id
             WHERE s.workspace_id = ?1 ORDER BY dv.deployment_id, dv.key",
            workspace_id,
        )
    }

    // ─── Policies ───────────────────────────────────────────────────────────

    async fn upsert_policy(&self, policy: &Policy) -> Result<()> {
        check_selectors(policy.targets.iter().flat_map(|t| {
            [
                &t.deployment_selector,
                &t.environment_selector,
                &t.resource_selector,
            ]
        }))?;
        let rule_rows = policy.rules.to_rows()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO policies (id, workspace_id, name, priority, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, priority = excluded.priority, enabled = excluded.enabled",
            params![
                policy.id,
                policy.workspace_id,
                policy.name,
                policy.priority,
                policy.enabled as i32,
                ts(&policy.created_at),
            ],
        )?;
        tx.execute("DELETE FROM policy_targets WHERE policy_id = ?1", params![policy.id])?;
        tx.execute("DELETE FROM policy_rules WHERE policy_id = ?1", params![policy.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO policy_targets (id, policy_id, deployment_selector,
                    environment_selector, resource_selector)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for target in &policy.targets {
                stmt.execute(params![
                    target.id,
                    policy.id,
                    opt_json(&target.deployment_selector)?,
                    opt_json(&target.environment_selector)?,
                    opt_json(&target.resource_selector)?,
                ])?;
            }
            let mut stmt = tx.prepare(
                "INSERT INTO policy_rules (policy_id, rule_type, config_json) VALUES (?1, ?2, ?3)",
            )?;
            for (rule_type, config) in &rule_rows {
                stmt.execute(params![policy.id, rule_type.as_str(), config])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_policies(&self, workspace_id: &str) -> Result<Vec<Policy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, name, priority, enabled, created_at FROM policies
             WHERE workspace_id = ?1 ORDER BY priority DESC, created_at, rowid",
        )?;
        let mut policies = stmt
            .query_map(params![workspace_id], |row| {
                Ok(Policy {
                    id: row.get(0)?,
                    workspace_id: row.get(1)?,
                    name: row.get(2)?,
                    priority: row.get(3)?,
                    enabled: row.get::<_, i32>(4)? != 0,
                    targets: vec![],
                    rules: PolicyRules::default(),
                    created_at: ts_col(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut target_stmt = conn.prepare(
            "SELECT id, policy_id, deployment_selector, environment_selector, resource_selector
             FROM policy_targets WHERE policy_id = ?1 ORDER BY rowid",
        )?;
        let mut rule_stmt =
            conn.prepare("SELECT rule_type, config_json FROM policy_rules WHERE policy_id = ?1")?;
        for policy in &mut policies {
            policy.targets = target_stmt
                .query_map(params![policy.id], |row| {
                    Ok(PolicyTarget {
                        id: row.get(0)?,
                        policy_id: row.get(1)?,
                        deployment_selector: opt_json_col(row, 2)?,
                        environment_selector: opt_json_col(row, 3)?,
                        resource_selector: opt_json_col(row, 4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let rules = rule_stmt
                .query_map(params![policy.id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (rule_type, config) in rules {
                policy
                    .rules
                    .apply_row(&rule_type, &config)
                    .with_context(|| format!("Bad {} rule on policy '{}'", rule_type, policy.name))?;
            }
        }
        Ok(policies)
    }

    async fn delete_policy(&self, policy_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM policies WHERE id = ?1", params![policy_id])?;
        Ok(())
    }

    async fn record_approval(&self, approval: &ApprovalRecord) -> Result<()> {
        let conn = self.conn()?;
        let status = match approval.status {
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        };
        conn.execute(
            "INSERT INTO approvals (id, version_id, environment_id, user_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(version_id, environment_id, user_id) DO UPDATE SET
                status = excluded.status, created_at = excluded.created_at",
            params![
                approval.id,
                approval.version_id,
                approval.environment_id,
                approval.user_id,
                status,
                ts(&approval.created_at),
            ],
        )?;
        Ok(())
    }

    async fn list_approvals(
        &self,
        version_id: &str,
        environment_id: &str,
    ) -> Result<Vec<ApprovalRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, version_id, environment_id, user_id, status, created_at FROM approvals
             WHERE version_id = ?1 AND environment_id = ?2 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![version_id, environment_id], |row| {
                let status: String = row.get(4)?;
                Ok(ApprovalRecord {
                    id: row.get(0)?,
                    version_id: row.get(1)?,
                    environment_id: row.get(2)?,
                    user_id: row.get(3)?,
                    status: if status == "rejected" {
                        ApprovalStatus::Rejected
                    } else {
                        ApprovalStatus::Approved
                    },
                    created_at: ts_col(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Computed Matches ───────────────────────────────────────────────────

    async fn replace_matches(
        &self,
        table: MatchTable,
        entity_ids: &[String],
        selector_ids: &[String],
        rows: &[MatchRow],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut by_entity = tx.prepare(&format!(
                "DELETE FROM {} WHERE entity_id = ?1",
                table.table_name()
            ))?;
            for id in entity_ids {
                by_entity.execute(params![id])?;
            }
            let mut by_selector = tx.prepare(&format!(
                "DELETE FROM {} WHERE selector_id = ?1",
                table.table_name()
            ))?;
            for id in selector_ids {
                by_selector.execute(params![id])?;
            }
        }
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (selector_id, entity_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                table.table_name()
            ))?;
            for row in rows {
                stmt.execute(params![row.selector_id, row.entity_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn apply_match_delta(
        &self,
        table: MatchTable,
        inserts: &[MatchRow],
        deletes: &[MatchRow],
    ) -> Result<()> {
        if inserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut delete = tx.prepare(&format!(
                "DELETE FROM {} WHERE selector_id = ?1 AND entity_id = ?2",
                table.table_name()
            ))?;
            for row in deletes {
                delete.execute(params![row.selector_id, row.entity_id])?;
            }
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} (selector_id, entity_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                table.table_name()
            ))?;
            for row in inserts {
                insert.execute(params![row.selector_id, row.entity_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_matches(&self, table: MatchTable) -> Result<Vec<MatchRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT selector_id, entity_id FROM {} ORDER BY selector_id, entity_id",
            table.table_name()
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MatchRow {
                    selector_id: row.get(0)?,
                    entity_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Release Targets ────────────────────────────────────────────────────

    async fn list_release_targets(&self, workspace_id: &str) -> Result<Vec<ReleaseTarget>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM release_targets WHERE workspace_id = ?1
             ORDER BY resource_id, environment_id, deployment_id",
            RELEASE_TARGET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id], release_target_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn list_release_targets_for(
        &self,
        environment_id: &str,
        deployment_id: &str,
    ) -> Result<Vec<ReleaseTarget>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM release_targets WHERE environment_id = ?1 AND deployment_id = ?2
             ORDER BY id",
            RELEASE_TARGET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![environment_id, deployment_id], release_target_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_release_target(&self, key: &ReleaseTargetKey) -> Result<Option<ReleaseTarget>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM release_targets
             WHERE resource_id = ?1 AND environment_id = ?2 AND deployment_id = ?3",
            RELEASE_TARGET_COLUMNS
        );
        let result = conn
            .query_row(
                &sql,
                params![key.resource_id, key.environment_id, key.deployment_id],
                release_target_from_row,
            )
            .optional()?;
        Ok(result)
    }

    async fn insert_release_targets(&self, targets: &[ReleaseTarget]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO release_targets (id, workspace_id, resource_id, environment_id,
                    deployment_id, desired_release_id, desired_version_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(resource_id, environment_id, deployment_id) DO NOTHING",
            )?;
            for target in targets {
                inserted += stmt.execute(params![
                    target.id,
                    target.workspace_id,
                    target.resource_id,
                    target.environment_id,
                    target.deployment_id,
                    target.desired_release_id,
                    target.desired_version_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    async fn delete_release_targets(&self, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut cancel = tx.prepare(
                "UPDATE jobs SET status = 'cancelled', message = 'release target removed',
                    updated_at = ?2, completed_at = ?2
                 WHERE status IN ('pending', 'in_progress', 'action_required')
                   AND id IN (
                     SELECT rj.job_id FROM release_jobs rj
                     JOIN releases r ON r.id = rj.release_id
                     JOIN version_releases vr ON vr.id = r.version_release_id
                     WHERE vr.release_target_id = ?1)",
            )?;
            let mut delete = tx.prepare("DELETE FROM release_targets WHERE id = ?1")?;
            for id in ids {
                cancel.execute(params![id, ts(&at)])?;
                delete.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn set_desired_release(
        &self,
        release_target_id: &str,
        desired_version_id: Option<&str>,
        desired_release_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE release_targets SET desired_version_id = ?2, desired_release_id = ?3
             WHERE id = ?1",
            params![release_target_id, desired_version_id, desired_release_id],
        )?;
        Ok(())
    }

    // ─── Releases ───────────────────────────────────────────────────────────

    async fn latest_version_release(
        &self,
        release_target_id: &str,
    ) -> Result<Option<VersionRelease>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, release_target_id, version_id, created_at FROM version_releases
                 WHERE release_target_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![release_target_id],
                |row| {
                    Ok(VersionRelease {
                        id: row.get(0)?,
                        release_target_id: row.get(1)?,
                        version_id: row.get(2)?,
                        created_at: ts_col(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    async fn insert_version_release(&self, release: &VersionRelease) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO version_releases (id, release_target_id, version_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                release.id,
                release.release_target_id,
                release.version_id,
                ts(&release.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_version_release(&self, id: &str) -> Result<Option<VersionRelease>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, release_target_id, version_id, created_at FROM version_releases
                 WHERE id = ?1",
                params![id],
                |row| {
                    Ok(VersionRelease {
                        id: row.get(0)?,
                        release_target_id: row.get(1)?,
                        version_id: row.get(2)?,
                        created_at: ts_col(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    async fn latest_variable_set_release(
        &self,
        release_target_id: &str,
    ) -> Result<Option<(VariableSetRelease, Vec<VariableValueSnapshot>)>> {
        let release = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id, release_target_id, created_at FROM variable_set_releases
                 WHERE release_target_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![release_target_id],
                |row| {
                    Ok(VariableSetRelease {
                        id: row.get(0)?,
                        release_target_id: row.get(1)?,
                        created_at: ts_col(row, 2)?,
                    })
                },
            )
            .optional()?
        };
        match release {
            Some(release) => {
                let snapshots = self.list_variable_snapshots(&release.id).await?;
                Ok(Some((release, snapshots)))
            }
            None => Ok(None),
        }
    }

    async fn insert_variable_set_release(
        &self,
        release: &VariableSetRelease,
        snapshots: &[VariableValueSnapshot],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO variable_set_releases (id, release_target_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![release.id, release.release_target_id, ts(&release.created_at)],
        )?;
        {
            let mut snapshot_stmt = tx.prepare(
                "INSERT INTO variable_value_snapshots (id, workspace_id, key, value_json, sensitive)
                 VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(id) DO NOTHING",
            )?;
            let mut join_stmt = tx.prepare(
                "INSERT INTO variable_set_release_values (variable_set_release_id, snapshot_id)
                 VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            )?;
            for snapshot in snapshots {
                snapshot_stmt.execute(params![
                    snapshot.id,
                    snapshot.workspace_id,
                    snapshot.key,
                    serde_json::to_string(&snapshot.value)?,
                    snapshot.sensitive as i32,
                ])?;
                join_stmt.execute(params![release.id, snapshot.id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_variable_snapshots(
        &self,
        variable_release_id: &str,
    ) -> Result<Vec<VariableValueSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.workspace_id, s.key, s.value_json, s.sensitive
             FROM variable_value_snapshots s
             JOIN variable_set_release_values v ON v.snapshot_id = s.id
             WHERE v.variable_set_release_id = ?1 ORDER BY s.key",
        )?;
        let rows = stmt
            .query_map(params![variable_release_id], snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn current_release(&self, release_target_id: &str) -> Result<Option<Release>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT r.id, r.version_release_id, r.variable_release_id, r.created_at
                 FROM releases r
                 JOIN version_releases vr ON vr.id = r.version_release_id
                 JOIN variable_set_releases sr ON sr.id = r.variable_release_id
                 WHERE vr.release_target_id = ?1 AND sr.release_target_id = ?1
                 ORDER BY r.created_at DESC, r.rowid DESC LIMIT 1",
                params![release_target_id],
                release_from_row,
            )
            .optional()?;
        Ok(result)
    }

    async fn insert_release(&self, release: &Release) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO releases (id, version_release_id, variable_release_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                release.id,
                release.version_release_id,
                release.variable_release_id,
                ts(&release.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_release(&self, release_id: &str) -> Result<Option<Release>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, version_release_id, variable_release_id, created_at FROM releases
                 WHERE id = ?1",
                params![release_id],
                release_from_row,
            )
            .optional()?;
        Ok(result)
    }

    async fn list_releases(&self, release_target_id: &str) -> Result<Vec<Release>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.id, r.version_release_id, r.variable_release_id, r.created_at
             FROM releases r
             JOIN version_releases vr ON vr.id = r.version_release_id
             WHERE vr.release_target_id = ?1
             ORDER BY r.created_at, r.rowid",
        )?;
        let rows = stmt
            .query_map(params![release_target_id], release_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Jobs ───────────────────────────────────────────────────────────────

    async fn insert_job(
        &self,
        release_id: &str,
        job: &Job,
        variables: &[JobVariable],
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let attempt: i64 = tx.query_row(
            "SELECT COUNT(*) FROM release_jobs WHERE release_id = ?1",
            params![release_id],
            |row| row.get(0),
        )?;
        if attempt > 0 && job.reason != JobReason::Retry {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO jobs (id, job_agent_id, job_agent_config, status, reason, message,
                external_id, created_at, updated_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id,
                job.job_agent_id,
                serde_json::to_string(&job.job_agent_config)?,
                job.status.as_str(),
                job.reason.as_str(),
                job.message,
                job.external_id,
                ts(&job.created_at),
                ts(&job.updated_at),
                opt_ts(&job.started_at),
                opt_ts(&job.completed_at),
            ],
        )?;
        let linked = tx.execute(
            "INSERT INTO release_jobs (release_id, job_id, attempt) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![release_id, job.id, attempt],
        )?;
        if linked == 0 {
            // Lost a race for this attempt slot; dropping the transaction rolls back.
            return Ok(false);
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO job_variables (job_id, key, value_json, sensitive)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for variable in variables {
                stmt.execute(params![
                    job.id,
                    variable.key,
                    serde_json::to_string(&variable.value)?,
                    variable.sensitive as i32,
                ])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    async fn release_job_exists(&self, release_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM release_jobs WHERE release_id = ?1)",
            params![release_id],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    async fn count_jobs_for_release(&self, release_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM release_jobs WHERE release_id = ?1",
            params![release_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn list_jobs_for_release(&self, release_id: &str) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs j JOIN release_jobs rj ON rj.job_id = j.id
             WHERE rj.release_id = ?1 ORDER BY rj.attempt",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![release_id], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM jobs j WHERE j.id = ?1", JOB_COLUMNS);
        let result = conn
            .query_row(&sql, params![job_id], job_from_row)
            .optional()?;
        Ok(result)
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE jobs SET status = ?2, message = ?3, external_id = ?4, updated_at = ?5,
                started_at = ?6, completed_at = ?7, job_agent_config = ?8
             WHERE id = ?1",
            params![
                job.id,
                job.status.as_str(),
                job.message,
                job.external_id,
                ts(&job.updated_at),
                opt_ts(&job.started_at),
                opt_ts(&job.completed_at),
                serde_json::to_string(&job.job_agent_config)?,
            ],
        )?;
        if rows == 0 {
            return Err(crate::error::EngineError::not_found("job", &job.id).into());
        }
        Ok(())
    }

    async fn list_job_variables(&self, job_id: &str) -> Result<Vec<JobVariable>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, key, value_json, sensitive FROM job_variables
             WHERE job_id = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(JobVariable {
                    job_id: row.get(0)?,
                    key: row.get(1)?,
                    value: json_col(row, 2)?,
                    sensitive: row.get::<_, i32>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn find_job_release(&self, job_id: &str) -> Result<Option<(Release, ReleaseTarget)>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT r.id, r.version_release_id, r.variable_release_id, r.created_at,
                        rt.id, rt.workspace_id, rt.resource_id, rt.environment_id,
                        rt.deployment_id, rt.desired_release_id, rt.desired_version_id
                 FROM release_jobs rj
                 JOIN releases r ON r.id = rj.release_id
                 JOIN version_releases vr ON vr.id = r.version_release_id
                 JOIN release_targets rt ON rt.id = vr.release_target_id
                 WHERE rj.job_id = ?1",
                params![job_id],
                |row| {
                    let release = release_from_row(row)?;
                    let target = ReleaseTarget {
                        id: row.get(4)?,
                        workspace_id: row.get(5)?,
                        resource_id: row.get(6)?,
                        environment_id: row.get(7)?,
                        deployment_id: row.get(8)?,
                        desired_release_id: row.get(9)?,
                        desired_version_id: row.get(10)?,
                    };
                    Ok((release, target))
                },
            )
            .optional()?;
        Ok(result)
    }

    // ─── Rule Queries ───────────────────────────────────────────────────────

    async fn latest_successful_version(
        &self,
        resource_id: &str,
        deployment_id: &str,
    ) -> Result<Option<DeploymentVersion>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs j
             JOIN release_jobs rj ON rj.job_id = j.id
             JOIN releases r ON r.id = rj.release_id
             JOIN version_releases vr ON vr.id = r.version_release_id
             JOIN release_targets rt ON rt.id = vr.release_target_id
             JOIN deployment_versions v ON v.id = vr.version_id
             WHERE rt.resource_id = ?1 AND rt.deployment_id = ?2 AND j.status = 'completed'
             ORDER BY j.completed_at DESC, j.rowid DESC LIMIT 1",
            VERSION_COLUMNS
        );
        let result = conn
            .query_row(&sql, params![resource_id, deployment_id], version_from_row)
            .optional()?;
        Ok(result)
    }

    async fn version_job_outcomes(
        &self,
        environment_id: &str,
        deployment_id: &str,
        version_id: &str,
    ) -> Result<Vec<TargetJobOutcome>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rt.id, j.status, j.completed_at FROM jobs j
             JOIN release_jobs rj ON rj.job_id = j.id
             JOIN releases r ON r.id = rj.release_id
             JOIN version_releases vr ON vr.id = r.version_release_id
             JOIN release_targets rt ON rt.id = vr.release_target_id
             WHERE rt.environment_id = ?1 AND rt.deployment_id = ?2 AND vr.version_id = ?3
             ORDER BY j.created_at DESC, j.rowid DESC",
        )?;
        let rows = stmt
            .query_map(params![environment_id, deployment_id, version_id], |row| {
                Ok(TargetJobOutcome {
                    release_target_id: row.get(0)?,
                    status: status_col(row, 1)?,
                    completed_at: opt_ts_col(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = std::collections::HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|outcome| seen.insert(outcome.release_target_id.clone()))
            .collect())
    }

    async fn latest_job_status_by_version(
        &self,
        release_target_id: &str,
    ) -> Result<HashMap<String, JobStatus>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT vr.version_id, j.status FROM jobs j
             JOIN release_jobs rj ON rj.job_id = j.id
             JOIN releases r ON r.id = rj.release_id
             JOIN version_releases vr ON vr.id = r.version_release_id
             WHERE vr.release_target_id = ?1
             ORDER BY j.created_at DESC, j.rowid DESC",
        )?;
        let rows = stmt
            .query_map(params![release_target_id], |row| {
                Ok((row.get::<_, String>(0)?, status_col(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut latest = HashMap::new();
        for (version_id, status) in rows {
            latest.entry(version_id).or_insert(status);
        }
        Ok(latest)
    }

    // ─── Leases ─────────────────────────────────────────────────────────────

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // Expired leases are up for grabs.
        tx.execute(
            "DELETE FROM leases WHERE lease_key = ?1 AND expires_at < ?2",
            params![key, ts(&now)],
        )?;
        let inserted = tx.execute(
            "INSERT INTO leases (lease_key, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(lease_key) DO NOTHING",
            params![key, holder, ts(&now), ts(&expires_at)],
        )?;
        tx.commit()?;

        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(Lease {
            key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at,
        }))
    }

    async fn renew_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE leases SET expires_at = ?3 WHERE lease_key = ?1 AND holder = ?2",
            params![key, holder, ts(&expires_at)],
        )?;
        Ok(rows > 0)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM leases WHERE lease_key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(())
    }

    // ─── Query ──────────────────────────────────────────────────────────────

    async fn query_raw(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let column_names: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let rows = stmt.query_map([], |row| {
            let mut map = serde_json::Map::new();
            for (i, col_name) in column_names.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                    rusqlite::types::ValueRef::Integer(n) => serde_json::json!(n),
                    rusqlite::types::ValueRef::Real(f) => serde_json::json!(f),
                    rusqlite::types::ValueRef::Text(bytes) => {
                        let text = String::from_utf8_lossy(bytes).to_string();
                        // JSON columns come back structured.
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(v) if v.is_object() || v.is_array() => v,
                            _ => serde_json::Value::String(text),
                        }
                    }
                    rusqlite::types::ValueRef::Blob(bytes) => {
                        serde_json::Value::String(hex::encode(bytes))
                    }
                };
                map.insert(col_name.clone(), value);
            }
            Ok(serde_json::Value::Object(map))
        })?;

        let result = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(result)
    }
}
