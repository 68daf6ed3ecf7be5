//! Task schema migrations.
//!
//! The schema grew in four steps: timestamp-only tasks, a resource reference,
//! a persisted status column backfilled from the timestamps, and the shared
//! expiring-entry table. `run_migrations()` applies whatever the database is
//! missing. A database from before version tracking (a `tasks` table but no
//! `_migrations` rows) is seeded at V1 and upgraded from there.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS namespaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                max_running_tasks INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                namespace_id TEXT NOT NULL,
                user_id TEXT,
                parent_id TEXT,
                name TEXT NOT NULL DEFAULT '',
                resource_type TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                attrs TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_resources_namespace ON resources(namespace_id);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                namespace_id TEXT NOT NULL,
                user_id TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                function TEXT NOT NULL,
                input TEXT NOT NULL DEFAULT '{}',
                payload TEXT NOT NULL DEFAULT '{}',
                output TEXT,
                exception TEXT,
                enqueued INTEGER NOT NULL DEFAULT 0,
                concurrency_threshold INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                canceled_at TEXT,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_namespace_created
                ON tasks(namespace_id, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "task_resource_reference",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN resource_id TEXT;
            CREATE INDEX IF NOT EXISTS idx_tasks_resource ON tasks(resource_id);
        "#,
    },
    Migration {
        version: 3,
        name: "task_status_column",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN status TEXT NOT NULL DEFAULT 'pending';
            UPDATE tasks SET status = CASE
                WHEN canceled_at IS NOT NULL THEN 'canceled'
                WHEN exception IS NOT NULL
                    AND exception NOT IN ('null', '{}', '[]', '""') THEN 'error'
                WHEN ended_at IS NOT NULL THEN 'finished'
                WHEN started_at IS NOT NULL THEN 'running'
                ELSE 'pending'
            END;
            CREATE INDEX IF NOT EXISTS idx_tasks_dispatch
                ON tasks(status, enqueued, priority DESC, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_namespace_status
                ON tasks(namespace_id, status);
        "#,
    },
    Migration {
        version: 4,
        name: "expiring_entries",
        sql: r#"
            CREATE TABLE IF NOT EXISTS expiring_entries (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (kind, key)
            );
            CREATE INDEX IF NOT EXISTS idx_expiring_entries_due
                ON expiring_entries(kind, expires_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let mut current_version = get_current_version(conn).await?;

    if current_version == 0 && legacy_tables_exist(conn).await? {
        // Tables predate version tracking. Their shape is V1.
        seed_version(conn, 1, "initial_schema").await?;
        current_version = 1;
        tracing::info!("Untracked tasks schema detected, seeded migration V1");
    }

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn legacy_tables_exist(conn: &Connection) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='tasks'",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check legacy tables: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read legacy check: {e}")))?;

    match row {
        Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
        None => Ok(false),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "namespaces",
            "resources",
            "tasks",
            "expiring_entries",
            "_migrations",
        ] {
            let n = count(
                &conn,
                &format!("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='{table}'"),
            )
            .await;
            assert_eq!(n, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(get_current_version(&conn).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn untracked_schema_gets_status_backfilled() {
        let conn = test_conn().await;

        // Pre-tracking schema with one row in every lifecycle position.
        conn.execute_batch(MIGRATIONS[0].sql).await.unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO tasks (id, namespace_id, function, created_at, updated_at)
                VALUES ('p', 'ns', 'f', '2024-01-01', '2024-01-01');
            INSERT INTO tasks (id, namespace_id, function, created_at, updated_at, started_at)
                VALUES ('r', 'ns', 'f', '2024-01-01', '2024-01-01', '2024-01-02');
            INSERT INTO tasks (id, namespace_id, function, created_at, updated_at, started_at, ended_at, exception)
                VALUES ('f', 'ns', 'f', '2024-01-01', '2024-01-01', '2024-01-02', '2024-01-03', '{}');
            INSERT INTO tasks (id, namespace_id, function, created_at, updated_at, started_at, ended_at, exception)
                VALUES ('e', 'ns', 'f', '2024-01-01', '2024-01-01', '2024-01-02', '2024-01-03', '{"error":"x"}');
            INSERT INTO tasks (id, namespace_id, function, created_at, updated_at, canceled_at)
                VALUES ('c', 'ns', 'f', '2024-01-01', '2024-01-01', '2024-01-02');
            "#,
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();
        assert_eq!(get_current_version(&conn).await.unwrap(), 4);

        let mut rows = conn
            .query("SELECT id, status FROM tasks ORDER BY id", ())
            .await
            .unwrap();
        let mut got = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).unwrap();
            let status: String = row.get(1).unwrap();
            got.push((id, status));
        }
        let expected = [
            ("c", "canceled"),
            ("e", "error"),
            ("f", "finished"),
            ("p", "pending"),
            ("r", "running"),
        ];
        assert_eq!(got.len(), expected.len());
        for ((id, status), (eid, estatus)) in got.iter().zip(expected) {
            assert_eq!(id, eid);
            assert_eq!(status, estatus, "task {id}");
        }
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            names.push((v, n));
        }
        assert_eq!(names[0], (1, "initial_schema".to_string()));
        assert_eq!(names[2], (3, "task_status_column".to_string()));
        assert_eq!(names.len(), 4);
    }
}
