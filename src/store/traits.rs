//! `Database` trait: single async interface for task persistence.
//!
//! Every lifecycle mutator is a conditional update; the returned `bool`
//! says whether this caller's update won.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::Task;

/// Position of a task in dispatch order (priority desc, created asc, rowid asc).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchCursor {
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub rowid: i64,
}

/// A dispatch candidate and its cursor for resuming the scan after it.
#[derive(Debug, Clone)]
pub struct DispatchCandidate {
    pub task: Task,
    pub cursor: DispatchCursor,
}

/// Outcome fields written by a worker callback.
#[derive(Debug, Clone)]
pub struct Completion {
    pub ended_at: DateTime<Utc>,
    pub output: Option<Value>,
    pub exception: Option<Value>,
}

/// A row of the shared expiring-entry table.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiringEntry {
    pub kind: String,
    pub key: String,
    pub value: Value,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait Database: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID, including soft-deleted ones.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Newest-first page of a namespace's live tasks, with the total count.
    async fn list_tasks(
        &self,
        namespace_id: &str,
        user_id: Option<&str>,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Task>, u64), DatabaseError>;

    // ── Dispatch ────────────────────────────────────────────────────

    /// Sum of `concurrency_threshold` over running tasks, per namespace.
    async fn running_load(&self) -> Result<HashMap<String, i64>, DatabaseError>;

    /// Next batch of pending, unenqueued, live tasks strictly after `after`.
    async fn list_dispatch_candidates(
        &self,
        after: Option<&DispatchCursor>,
        limit: u64,
    ) -> Result<Vec<DispatchCandidate>, DatabaseError>;

    /// Atomically claim a pending task if its namespace still has room under
    /// `max_running`. `false` means another caller got there first or the
    /// namespace filled up.
    async fn claim_task(
        &self,
        id: Uuid,
        namespace_id: &str,
        max_running: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a pending task to `insufficient_quota`.
    async fn park_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Record a callback outcome once. `false` if canceled or already ended.
    async fn complete_task(
        &self,
        id: Uuid,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn cancel_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Return a parked task to the pending pool.
    async fn reset_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn soft_delete_task(&self, id: Uuid, now: DateTime<Utc>)
    -> Result<bool, DatabaseError>;

    // ── Expiring entries ────────────────────────────────────────────

    /// Insert or replace an entry, resetting its expiry.
    async fn put_expiring(
        &self,
        kind: &str,
        key: &str,
        value: &Value,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Live entry value. An expired entry is removed on access.
    async fn get_expiring(
        &self,
        kind: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>, DatabaseError>;

    /// Remove and return up to `limit` due entries of `kind`. Each due entry
    /// is returned to exactly one caller.
    async fn take_expired(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<ExpiringEntry>, DatabaseError>;
}
