use super::StoreError;
use rusqlite::Connection;

pub(crate) struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

/// Ordered schema history. Append-only: released versions are never edited.
pub(crate) const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE run (
            id TEXT PRIMARY KEY,
            flow_name TEXT NOT NULL,
            status TEXT NOT NULL,
            input TEXT,
            output TEXT,
            error TEXT,
            metadata TEXT,
            name TEXT,
            description TEXT,
            flow_title TEXT,
            stdout TEXT,
            stderr TEXT,
            termination_reason TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            duration_ms INTEGER
        );

        CREATE TABLE stage (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES run(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            final INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            termination_reason TEXT,
            UNIQUE (run_id, name)
        );

        CREATE TABLE step (
            id TEXT NOT NULL,
            run_id TEXT NOT NULL REFERENCES run(id) ON DELETE CASCADE,
            stage_id TEXT NOT NULL REFERENCES stage(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            depends_on TEXT NOT NULL DEFAULT '[]',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            env TEXT,
            fields TEXT,
            error TEXT,
            stdout TEXT,
            stderr TEXT,
            termination_reason TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            duration_ms INTEGER,
            queued_at INTEGER,
            claimed_at INTEGER,
            heartbeat_at INTEGER,
            worker_id TEXT,
            PRIMARY KEY (run_id, id)
        );

        CREATE TABLE run_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES run(id) ON DELETE CASCADE,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX idx_run_status ON run(status);
        CREATE INDEX idx_stage_run ON stage(run_id);
        CREATE INDEX idx_step_run ON step(run_id);
        CREATE INDEX idx_step_stage ON step(stage_id);
        CREATE INDEX idx_step_claimable ON step(status, queued_at);
        CREATE INDEX idx_run_log_run ON run_log(run_id, created_at);
    ",
}];

pub(crate) fn apply_migrations(connection: &mut Connection) -> Result<(), StoreError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )
        .map_err(StoreError::sql)?;

    for migration in MIGRATIONS {
        let applied: Option<i64> = connection
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                [migration.version],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::sql(other)),
            })?;
        if applied.is_some() {
            continue;
        }

        let tx = connection.transaction().map_err(StoreError::sql)?;
        tx.execute_batch(migration.sql)
            .map_err(|source| StoreError::Migration {
                version: migration.version,
                source,
            })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, crate::shared::now_ms()],
        )
        .map_err(|source| StoreError::Migration {
            version: migration.version,
            source,
        })?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))
            .map_err(|source| StoreError::Migration {
                version: migration.version,
                source,
            })?;
        tx.commit().map_err(StoreError::sql)?;
    }

    Ok(())
}
