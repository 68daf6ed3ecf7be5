//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file, in-memory and remote (`libsql://`) databases. The
//! same backend also serves as the namespace and resource directory.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::directory::{
    Namespace, NamespaceDirectory, Resource, ResourceDirectory, ResourceType, ResourceUpdate,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Completion, Database, DispatchCandidate, DispatchCursor, ExpiringEntry,
};
use crate::tasks::model::Task;
use crate::tasks::status::{TaskStatus, Transition, is_empty_payload};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Connect to a remote libSQL server shared by every replica.
    pub async fn new_remote(url: &str, auth_token: &SecretString) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote(url.to_string(), auth_token.expose_secret().to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to connect to {url}: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(url, "Remote database connected");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Directory seeding ───────────────────────────────────────────

    /// Insert or replace a namespace.
    pub async fn create_namespace(&self, ns: &Namespace) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO namespaces (id, name, max_running_tasks, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    max_running_tasks = excluded.max_running_tasks,
                    deleted_at = NULL",
                params![
                    ns.id.as_str(),
                    ns.name.as_str(),
                    ns.max_running_tasks,
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_namespace: {e}")))?;
        debug!(namespace_id = %ns.id, "Namespace stored");
        Ok(())
    }

    /// Insert or replace a resource.
    pub async fn create_resource(&self, resource: &Resource) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        let attrs = to_json_text(&Value::Object(resource.attrs.clone()))?;
        self.conn()
            .execute(
                "INSERT INTO resources
                    (id, namespace_id, user_id, parent_id, name, resource_type, content, attrs, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    namespace_id = excluded.namespace_id,
                    user_id = excluded.user_id,
                    parent_id = excluded.parent_id,
                    name = excluded.name,
                    resource_type = excluded.resource_type,
                    content = excluded.content,
                    attrs = excluded.attrs,
                    updated_at = excluded.updated_at,
                    deleted_at = NULL",
                params![
                    resource.id.as_str(),
                    resource.namespace_id.as_str(),
                    opt_text(resource.user_id.as_deref()),
                    opt_text(resource.parent_id.as_deref()),
                    resource.name.as_str(),
                    resource.resource_type.as_str(),
                    resource.content.as_str(),
                    attrs,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_resource: {e}")))?;
        Ok(())
    }

    /// Soft-delete a resource so directory lookups stop seeing it.
    pub async fn delete_resource(&self, namespace_id: &str, id: &str) -> Result<bool, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let n = self
            .conn()
            .execute(
                "UPDATE resources SET deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND namespace_id = ?3 AND deleted_at IS NULL",
                params![now, id, namespace_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_resource: {e}")))?;
        Ok(n > 0)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text. Fixed precision keeps text order equal to time order.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|n| n.and_utc()).unwrap_or(DateTime::<Utc>::MIN_UTC);
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json_text(value: &Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_json_text(value: Option<&Value>) -> Result<libsql::Value, DatabaseError> {
    Ok(match value {
        Some(v) => libsql::Value::Text(to_json_text(v)?),
        None => libsql::Value::Null,
    })
}

fn parse_json(s: &str, field: &str) -> Result<Value, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const TASK_COLUMNS: &str = "id, namespace_id, user_id, priority, function, input, payload, \
    output, exception, status, enqueued, concurrency_threshold, resource_id, \
    created_at, updated_at, started_at, ended_at, canceled_at, deleted_at";

const RESOURCE_COLUMNS: &str =
    "id, namespace_id, user_id, parent_id, name, resource_type, content, attrs";

/// Column order matches TASK_COLUMNS, starting at `base`.
fn row_to_task(row: &libsql::Row, base: i32) -> Result<Task, DatabaseError> {
    let col = |i: i32| base + i;
    let read = |e: libsql::Error| DatabaseError::Query(format!("row_to_task: {e}"));

    let id_str: String = row.get(col(0)).map_err(read)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task id {id_str}: {e}")))?;
    let input: String = row.get(col(5)).map_err(read)?;
    let payload: String = row.get(col(6)).map_err(read)?;
    let output: Option<String> = row.get(col(7)).ok();
    let exception: Option<String> = row.get(col(8)).ok();
    let status_str: String = row.get(col(9)).map_err(read)?;
    let status = TaskStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("task {id}: unknown status {status_str}"))
    })?;
    let created: String = row.get(col(13)).map_err(read)?;
    let updated: String = row.get(col(14)).map_err(read)?;

    Ok(Task {
        id,
        namespace_id: row.get(col(1)).map_err(read)?,
        user_id: row.get(col(2)).ok(),
        priority: row.get(col(3)).map_err(read)?,
        function: row.get(col(4)).map_err(read)?,
        input: parse_json(&input, "input")?,
        payload: parse_json(&payload, "payload")?,
        output: output.as_deref().map(|s| parse_json(s, "output")).transpose()?,
        exception: exception
            .as_deref()
            .map(|s| parse_json(s, "exception"))
            .transpose()?,
        status,
        enqueued: row.get::<i64>(col(10)).map_err(read)? != 0,
        concurrency_threshold: row.get(col(11)).map_err(read)?,
        resource_id: row.get(col(12)).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        started_at: parse_optional_datetime(row.get(col(15)).ok()),
        ended_at: parse_optional_datetime(row.get(col(16)).ok()),
        canceled_at: parse_optional_datetime(row.get(col(17)).ok()),
        deleted_at: parse_optional_datetime(row.get(col(18)).ok()),
    })
}

/// Column order matches RESOURCE_COLUMNS.
fn row_to_resource(row: &libsql::Row) -> Result<Resource, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("row_to_resource: {e}"));
    let type_str: String = row.get(5).map_err(read)?;
    let attrs_str: String = row.get(7).map_err(read)?;
    let attrs = match parse_json(&attrs_str, "attrs")? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    Ok(Resource {
        id: row.get(0).map_err(read)?,
        namespace_id: row.get(1).map_err(read)?,
        user_id: row.get(2).ok(),
        parent_id: row.get(3).ok(),
        name: row.get(4).map_err(read)?,
        resource_type: ResourceType::parse(&type_str),
        content: row.get(6).map_err(read)?,
        attrs,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ),
                params![
                    task.id.to_string(),
                    task.namespace_id.as_str(),
                    opt_text(task.user_id.as_deref()),
                    task.priority,
                    task.function.as_str(),
                    to_json_text(&task.input)?,
                    to_json_text(&task.payload)?,
                    opt_json_text(task.output.as_ref())?,
                    opt_json_text(task.exception.as_ref())?,
                    task.status.as_str(),
                    task.enqueued as i64,
                    task.concurrency_threshold,
                    opt_text(task.resource_id.as_deref()),
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                    opt_text(task.started_at.map(fmt_ts).as_deref()),
                    opt_text(task.ended_at.map(fmt_ts).as_deref()),
                    opt_text(task.canceled_at.map(fmt_ts).as_deref()),
                    opt_text(task.deleted_at.map(fmt_ts).as_deref())
                ],
            )
            .await
            .map_err(query_err("insert_task"))?;

        debug!(task_id = %task.id, function = %task.function, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_task"))?;

        match rows.next().await.map_err(query_err("get_task"))? {
            Some(row) => Ok(Some(row_to_task(&row, 0)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(
        &self,
        namespace_id: &str,
        user_id: Option<&str>,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Task>, u64), DatabaseError> {
        const FILTER: &str =
            "namespace_id = ?1 AND deleted_at IS NULL AND (?2 IS NULL OR user_id = ?2)";

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM tasks WHERE {FILTER}"),
                params![namespace_id, opt_text(user_id)],
            )
            .await
            .map_err(query_err("list_tasks"))?;
        let total: i64 = match rows.next().await.map_err(query_err("list_tasks"))? {
            Some(row) => row.get(0).map_err(query_err("list_tasks"))?,
            None => 0,
        };

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE {FILTER}
                     ORDER BY created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
                ),
                params![namespace_id, opt_text(user_id), limit as i64, offset as i64],
            )
            .await
            .map_err(query_err("list_tasks"))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row, 0)?);
        }
        Ok((tasks, total.max(0) as u64))
    }

    async fn running_load(&self) -> Result<HashMap<String, i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT namespace_id, COALESCE(SUM(concurrency_threshold), 0)
                 FROM tasks WHERE status = 'running' GROUP BY namespace_id",
                (),
            )
            .await
            .map_err(query_err("running_load"))?;

        let mut load = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let ns: String = row.get(0).map_err(query_err("running_load"))?;
            let sum: i64 = row.get(1).map_err(query_err("running_load"))?;
            load.insert(ns, sum);
        }
        Ok(load)
    }

    async fn list_dispatch_candidates(
        &self,
        after: Option<&DispatchCursor>,
        limit: u64,
    ) -> Result<Vec<DispatchCandidate>, DatabaseError> {
        const ELIGIBLE: &str = "status = 'pending' AND enqueued = 0 AND deleted_at IS NULL";
        const ORDER: &str = "ORDER BY priority DESC, created_at ASC, rowid ASC";

        let mut rows = match after {
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT rowid, {TASK_COLUMNS} FROM tasks WHERE {ELIGIBLE} {ORDER} LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
            Some(cursor) => self
                .conn()
                .query(
                    &format!(
                        "SELECT rowid, {TASK_COLUMNS} FROM tasks WHERE {ELIGIBLE}
                         AND (priority < ?1
                              OR (priority = ?1 AND created_at > ?2)
                              OR (priority = ?1 AND created_at = ?2 AND rowid > ?3))
                         {ORDER} LIMIT ?4"
                    ),
                    params![
                        cursor.priority,
                        fmt_ts(cursor.created_at),
                        cursor.rowid,
                        limit as i64
                    ],
                )
                .await,
        }
        .map_err(query_err("list_dispatch_candidates"))?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let rowid: i64 = row.get(0).map_err(query_err("list_dispatch_candidates"))?;
            let task = row_to_task(&row, 1)?;
            let cursor = DispatchCursor {
                priority: task.priority,
                created_at: task.created_at,
                rowid,
            };
            candidates.push(DispatchCandidate { task, cursor });
        }
        Ok(candidates)
    }

    async fn claim_task(
        &self,
        id: Uuid,
        namespace_id: &str,
        max_running: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let claim = Transition::Claim;
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET enqueued = 1, status = ?1, started_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND enqueued = 0 AND deleted_at IS NULL
                       AND status IN ({allowed})
                       AND concurrency_threshold + (
                           SELECT COALESCE(SUM(r.concurrency_threshold), 0) FROM tasks r
                           WHERE r.namespace_id = ?4 AND r.status = 'running'
                       ) <= ?5",
                    allowed = claim.sql_allowed_from()
                ),
                params![
                    claim.target().as_str(),
                    fmt_ts(now),
                    id.to_string(),
                    namespace_id,
                    max_running
                ],
            )
            .await
            .map_err(query_err("claim_task"))?;
        Ok(n > 0)
    }

    async fn park_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let park = Transition::ParkForQuota;
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND enqueued = 0 AND status IN ({})",
                    park.sql_allowed_from()
                ),
                params![park.target().as_str(), fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(query_err("park_task"))?;
        Ok(n > 0)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let complete = Transition::Complete {
            failed: !is_empty_payload(completion.exception.as_ref()),
        };
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET ended_at = ?1, output = ?2, exception = ?3, status = ?4, updated_at = ?5
                     WHERE id = ?6 AND canceled_at IS NULL AND ended_at IS NULL
                       AND status IN ({})",
                    complete.sql_allowed_from()
                ),
                params![
                    fmt_ts(completion.ended_at),
                    opt_json_text(completion.output.as_ref())?,
                    opt_json_text(completion.exception.as_ref())?,
                    complete.target().as_str(),
                    fmt_ts(now),
                    id.to_string()
                ],
            )
            .await
            .map_err(query_err("complete_task"))?;
        Ok(n > 0)
    }

    async fn cancel_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let cancel = Transition::Cancel;
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET canceled_at = ?1, status = ?2, updated_at = ?1
                     WHERE id = ?3 AND canceled_at IS NULL AND status IN ({})",
                    cancel.sql_allowed_from()
                ),
                params![fmt_ts(now), cancel.target().as_str(), id.to_string()],
            )
            .await
            .map_err(query_err("cancel_task"))?;
        Ok(n > 0)
    }

    async fn reset_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let reset = Transition::Reset;
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET status = ?1, enqueued = 0, started_at = NULL, updated_at = ?2
                     WHERE id = ?3 AND status IN ({})",
                    reset.sql_allowed_from()
                ),
                params![reset.target().as_str(), fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(query_err("reset_task"))?;
        Ok(n > 0)
    }

    async fn soft_delete_task(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .conn()
            .execute(
                "UPDATE tasks SET deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(query_err("soft_delete_task"))?;
        Ok(n > 0)
    }

    async fn put_expiring(
        &self,
        kind: &str,
        key: &str,
        value: &Value,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO expiring_entries (kind, key, value, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at",
                params![kind, key, to_json_text(value)?, fmt_ts(expires_at)],
            )
            .await
            .map_err(query_err("put_expiring"))?;
        Ok(())
    }

    async fn get_expiring(
        &self,
        kind: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value, expires_at FROM expiring_entries WHERE kind = ?1 AND key = ?2",
                params![kind, key],
            )
            .await
            .map_err(query_err("get_expiring"))?;

        let Some(row) = rows.next().await.map_err(query_err("get_expiring"))? else {
            return Ok(None);
        };
        let value: String = row.get(0).map_err(query_err("get_expiring"))?;
        let expires_at: String = row.get(1).map_err(query_err("get_expiring"))?;

        if parse_datetime(&expires_at) <= now {
            self.conn()
                .execute(
                    "DELETE FROM expiring_entries WHERE kind = ?1 AND key = ?2 AND expires_at <= ?3",
                    params![kind, key, fmt_ts(now)],
                )
                .await
                .map_err(query_err("get_expiring"))?;
            return Ok(None);
        }
        Ok(Some(parse_json(&value, "value")?))
    }

    async fn take_expired(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<ExpiringEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "DELETE FROM expiring_entries WHERE rowid IN (
                    SELECT rowid FROM expiring_entries
                    WHERE kind = ?1 AND expires_at <= ?2
                    ORDER BY expires_at LIMIT ?3
                 ) RETURNING kind, key, value, expires_at",
                params![kind, fmt_ts(now), limit as i64],
            )
            .await
            .map_err(query_err("take_expired"))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let value: String = row.get(2).map_err(query_err("take_expired"))?;
            let expires_at: String = row.get(3).map_err(query_err("take_expired"))?;
            entries.push(ExpiringEntry {
                kind: row.get(0).map_err(query_err("take_expired"))?,
                key: row.get(1).map_err(query_err("take_expired"))?,
                value: parse_json(&value, "value")?,
                expires_at: parse_datetime(&expires_at),
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl NamespaceDirectory for LibSqlBackend {
    async fn get_namespace(&self, id: &str) -> Result<Option<Namespace>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, max_running_tasks FROM namespaces
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
            )
            .await
            .map_err(query_err("get_namespace"))?;

        match rows.next().await.map_err(query_err("get_namespace"))? {
            Some(row) => Ok(Some(Namespace {
                id: row.get(0).map_err(query_err("get_namespace"))?,
                name: row.get(1).map_err(query_err("get_namespace"))?,
                max_running_tasks: row.get(2).map_err(query_err("get_namespace"))?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResourceDirectory for LibSqlBackend {
    async fn get_resource(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<Option<Resource>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources
                     WHERE id = ?1 AND namespace_id = ?2 AND deleted_at IS NULL"
                ),
                params![id, namespace_id],
            )
            .await
            .map_err(query_err("get_resource"))?;

        match rows.next().await.map_err(query_err("get_resource"))? {
            Some(row) => Ok(Some(row_to_resource(&row)?)),
            None => Ok(None),
        }
    }

    async fn existing_resource_ids(
        &self,
        namespace_id: &str,
        ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders = (0..ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let mut values = vec![libsql::Value::Text(namespace_id.to_string())];
        values.extend(ids.iter().map(|id| libsql::Value::Text(id.clone())));

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT id FROM resources
                     WHERE namespace_id = ?1 AND deleted_at IS NULL AND id IN ({placeholders})"
                ),
                values,
            )
            .await
            .map_err(query_err("existing_resource_ids"))?;

        let mut found = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            found.insert(row.get::<String>(0).map_err(query_err("existing_resource_ids"))?);
        }
        Ok(found)
    }

    async fn update_resource(
        &self,
        namespace_id: &str,
        id: &str,
        update: ResourceUpdate,
    ) -> Result<bool, DatabaseError> {
        let mut sets = vec!["updated_at = ?1".to_string()];
        let mut values = vec![libsql::Value::Text(fmt_ts(Utc::now()))];

        let mut set = |column: &str, value: String| {
            values.push(libsql::Value::Text(value));
            sets.push(format!("{column} = ?{}", values.len()));
        };
        if let Some(name) = update.name {
            set("name", name);
        }
        if let Some(content) = update.content {
            set("content", content);
        }
        if let Some(attrs) = update.attrs {
            set("attrs", to_json_text(&Value::Object(attrs))?);
        }

        let id_param = values.len() + 1;
        values.push(libsql::Value::Text(id.to_string()));
        values.push(libsql::Value::Text(namespace_id.to_string()));

        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE resources SET {} WHERE id = ?{id_param} AND namespace_id = ?{} AND deleted_at IS NULL",
                    sets.join(", "),
                    id_param + 1
                ),
                values,
            )
            .await
            .map_err(query_err("update_resource"))?;

        debug!(resource_id = %id, updated = n > 0, "Resource update applied");
        Ok(n > 0)
    }
}
