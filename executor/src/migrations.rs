//! Versioned schema migrations for the executor database.
//!
//! Never delete columns in `up`; old readers keep working against the newer
//! schema. `down` exists for tests only. Applied versions are tracked in
//! `schema_migrations(version, description, applied_at)`.

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: fn(&Connection) -> rusqlite::Result<()>,
    pub down: fn(&Connection) -> rusqlite::Result<()>,
}

/// Columns of the base `executions` table, used when `down` rebuilds the table.
const BASE_COLUMNS: &[&str] = &[
    "execution_id",
    "plan_id",
    "changeset_id",
    "decision_id",
    "checksum",
    "verdict",
    "status",
    "risk_level",
    "affected_paths",
    "started_at",
    "ended_at",
    "duration_seconds",
    "files_changed",
    "verification_passed",
    "health_checks_passed",
    "rolled_back",
    "artifact_path",
    "error_message",
    "error_step",
    "created_at",
];

const M1_COLUMNS: &[(&str, &str)] = &[
    ("correlation_id", "TEXT"),
    ("parent_execution_id", "TEXT"),
    ("trigger_kind", "TEXT"),
    ("run_id", "TEXT"),
];

const M2_COLUMNS: &[(&str, &str)] = &[
    ("is_repair", "INTEGER DEFAULT 0"),
    ("repair_for_execution_id", "TEXT"),
];

pub fn registered_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "execution graph fields (correlation, parent, trigger, run)",
            up: migration_1_up,
            down: migration_1_down,
        },
        Migration {
            version: 2,
            description: "repair tracking fields",
            up: migration_2_up,
            down: migration_2_down,
        },
        Migration {
            version: 3,
            description: "execution_paths index table with backfill",
            up: migration_3_up,
            down: migration_3_down,
        },
    ]
}

/// Apply every unapplied migration in version order. Returns the versions
/// applied in this run.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<Vec<i64>> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;

    let mut applied = Vec::new();
    for migration in registered_migrations() {
        let already: bool = conn
            .prepare("SELECT 1 FROM schema_migrations WHERE version = ?1")?
            .exists([migration.version])?;
        if already {
            continue;
        }
        (migration.up)(conn)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, Utc::now().to_rfc3339()],
        )?;
        info!(version = migration.version, "applied executor migration");
        applied.push(migration.version);
    }
    Ok(applied)
}

/// Testing only: roll back one version (must be the highest applied).
pub fn rollback_migration(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    let migration = registered_migrations()
        .into_iter()
        .find(|m| m.version == version)
        .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    (migration.down)(conn)?;
    conn.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        [version],
    )?;
    Ok(())
}

pub fn applied_versions(conn: &Connection) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

fn migration_1_up(conn: &Connection) -> rusqlite::Result<()> {
    for (name, ddl) in M1_COLUMNS {
        add_column_if_missing(conn, name, ddl)?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_executions_correlation_id ON executions(correlation_id);
         CREATE INDEX IF NOT EXISTS idx_executions_parent_execution_id ON executions(parent_execution_id);
         CREATE INDEX IF NOT EXISTS idx_executions_run_id ON executions(run_id);",
    )
}

fn migration_1_down(conn: &Connection) -> rusqlite::Result<()> {
    rebuild_executions(conn, &[])
}

fn migration_2_up(conn: &Connection) -> rusqlite::Result<()> {
    for (name, ddl) in M2_COLUMNS {
        add_column_if_missing(conn, name, ddl)?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_executions_repair_for ON executions(repair_for_execution_id);",
    )
}

fn migration_2_down(conn: &Connection) -> rusqlite::Result<()> {
    rebuild_executions(conn, M1_COLUMNS)
}

fn migration_3_up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS execution_paths (
            execution_id TEXT NOT NULL,
            path TEXT NOT NULL,
            PRIMARY KEY (execution_id, path)
        );
        CREATE INDEX IF NOT EXISTS idx_execution_paths_execution_id ON execution_paths(execution_id);
        CREATE INDEX IF NOT EXISTS idx_execution_paths_path ON execution_paths(path);",
    )?;

    // Backfill from the JSON column of existing rows.
    let mut stmt = conn.prepare("SELECT execution_id, affected_paths FROM executions")?;
    let rows: Vec<(String, Option<String>)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    for (execution_id, paths_json) in rows {
        let Some(json) = paths_json else { continue };
        let Ok(paths) = serde_json::from_str::<Vec<String>>(&json) else {
            continue;
        };
        for path in paths {
            let trimmed = path.trim();
            if trimmed.is_empty() {
                continue;
            }
            conn.execute(
                "INSERT OR IGNORE INTO execution_paths (execution_id, path) VALUES (?1, ?2)",
                rusqlite::params![execution_id, trimmed],
            )?;
        }
    }
    Ok(())
}

fn migration_3_down(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("DROP TABLE IF EXISTS execution_paths;")
}

fn add_column_if_missing(conn: &Connection, name: &str, ddl: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('executions')")?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    if !existing.iter().any(|c| c == name) {
        conn.execute_batch(&format!("ALTER TABLE executions ADD COLUMN {name} {ddl};"))?;
    }
    Ok(())
}

/// SQLite cannot drop columns on the versions we target; `down` rebuilds the
/// table from the base columns plus the given extras.
fn rebuild_executions(conn: &Connection, extras: &[(&str, &str)]) -> rusqlite::Result<()> {
    let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    columns.extend(extras.iter().map(|(name, _)| name.to_string()));
    let column_list = columns.join(", ");

    let extra_ddl: String = extras
        .iter()
        .map(|(name, ddl)| format!(",\n            {name} {ddl}"))
        .collect();

    conn.execute_batch(&format!(
        "CREATE TABLE executions_rebuild (
            execution_id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            changeset_id TEXT NOT NULL,
            decision_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            verdict TEXT NOT NULL,
            status TEXT NOT NULL,
            risk_level TEXT,
            affected_paths TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_seconds REAL,
            files_changed INTEGER DEFAULT 0,
            verification_passed INTEGER DEFAULT 0,
            health_checks_passed INTEGER DEFAULT 0,
            rolled_back INTEGER DEFAULT 0,
            artifact_path TEXT,
            error_message TEXT,
            error_step TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')){extra_ddl}
        );
        INSERT INTO executions_rebuild ({column_list}) SELECT {column_list} FROM executions;
        DROP TABLE executions;
        ALTER TABLE executions_rebuild RENAME TO executions;
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_started_at ON executions(started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_executions_plan_id ON executions(plan_id);
        CREATE INDEX IF NOT EXISTS idx_executions_verdict ON executions(verdict);
        CREATE INDEX IF NOT EXISTS idx_executions_risk_level ON executions(risk_level);"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::base_schema;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(base_schema()).unwrap();
        conn
    }

    #[test]
    fn migrations_apply_once_in_order() {
        let conn = fresh_conn();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, vec![1, 2, 3]);

        let again = run_migrations(&conn).unwrap();
        assert!(again.is_empty());
        assert_eq!(applied_versions(&conn).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn graph_columns_exist_after_migration() {
        let conn = fresh_conn();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO executions (execution_id, plan_id, changeset_id, decision_id, checksum, verdict, status, started_at, correlation_id, is_repair)
             VALUES ('e1', 'p1', 'c1', 'd1', 'sum', 'allow', 'pending', '2026-01-01T00:00:00Z', 'e1', 0)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn migration_3_backfills_paths() {
        let conn = fresh_conn();
        // Apply 1 and 2 only, insert a row, then 3 backfills it.
        let migrations = registered_migrations();
        (migrations[0].up)(&conn).unwrap();
        (migrations[1].up)(&conn).unwrap();
        conn.execute(
            "INSERT INTO executions (execution_id, plan_id, changeset_id, decision_id, checksum, verdict, status, started_at, affected_paths)
             VALUES ('e1', 'p1', 'c1', 'd1', 'sum', 'allow', 'completed', '2026-01-01T00:00:00Z', '[\"src/a.rs\", \" \", \"src/b.rs\"]')",
            [],
        )
        .unwrap();
        (migrations[2].up)(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM execution_paths WHERE execution_id = 'e1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn rollback_restores_previous_shape() {
        let conn = fresh_conn();
        run_migrations(&conn).unwrap();

        rollback_migration(&conn, 3).unwrap();
        let has_paths_table: bool = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='execution_paths'")
            .unwrap()
            .exists([])
            .unwrap();
        assert!(!has_paths_table);

        rollback_migration(&conn, 2).unwrap();
        let cols: Vec<String> = conn
            .prepare("SELECT name FROM pragma_table_info('executions')")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert!(cols.iter().any(|c| c == "correlation_id"));
        assert!(!cols.iter().any(|c| c == "is_repair"));

        assert_eq!(applied_versions(&conn).unwrap(), vec![1]);
    }
}
