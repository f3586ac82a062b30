use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::schema;

/// Bring the database up to `SCHEMA_VERSION`.
pub fn check_and_migrate(conn: &Connection) -> Result<()> {
    let has_version_table = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .is_some();

    let current = if has_version_table {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get::<_, i32>(0),
        )?
    } else {
        0
    };

    if current > schema::SCHEMA_VERSION {
        anyhow::bail!(
            "state database is at schema version {} but this build only knows {}",
            current,
            schema::SCHEMA_VERSION
        );
    }
    if current < schema::SCHEMA_VERSION {
        apply_migrations(conn, current)?;
    }
    Ok(())
}

fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();

    if from_version < 1 {
        conn.execute_batch(schema::CREATE_TABLES_SQL)
            .context("Failed to create state tables")?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)
            .context("Failed to create state indexes")?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at, description)
             VALUES (?1, ?2, ?3)",
            params![1, now, "Release target schema"],
        )?;
        tracing::debug!("applied state schema version 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        check_and_migrate(&conn).unwrap();
        check_and_migrate(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn refuses_newer_database() {
        let conn = Connection::open_in_memory().unwrap();
        check_and_migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (99, 'now')",
            [],
        )
        .unwrap();
        assert!(check_and_migrate(&conn).is_err());
    }
}
