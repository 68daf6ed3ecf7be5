//! Worker fetch: select and atomically claim the next eligible task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::directory::{Namespace, NamespaceDirectory};
use crate::error::TaskError;
use crate::quota::QuotaPolicy;
use crate::store::{Database, DispatchCandidate, DispatchCursor};
use crate::tasks::model::Task;
use crate::tasks::status::TaskStatus;

pub const DEFAULT_SCAN_BATCH: u64 = 64;

/// Result of trying to claim one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    /// Namespace is at its cap.
    NoCapacity,
    /// Quota exhausted; the task was parked.
    Parked,
    /// Candidate was skipped (lookup or quota failure).
    Skipped,
    /// Another fetch claimed it, or filled the namespace, first.
    LostRace,
}

/// Per-call memo of namespace lookups.
enum NamespaceSlot {
    Known(Namespace),
    Unavailable,
}

pub struct Dispatcher {
    db: Arc<dyn Database>,
    namespaces: Arc<dyn NamespaceDirectory>,
    quota: Arc<dyn QuotaPolicy>,
    scan_batch: u64,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        namespaces: Arc<dyn NamespaceDirectory>,
        quota: Arc<dyn QuotaPolicy>,
    ) -> Self {
        Self {
            db,
            namespaces,
            quota,
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    pub fn with_scan_batch(mut self, batch: u64) -> Self {
        self.scan_batch = batch.max(1);
        self
    }

    /// Claim the next eligible task, or `None` when nothing can run now.
    pub async fn fetch(&self) -> Result<Option<Task>, TaskError> {
        let mut load = self.db.running_load().await?;
        let mut namespaces: HashMap<String, NamespaceSlot> = HashMap::new();
        let mut cursor: Option<DispatchCursor> = None;

        loop {
            let batch = self
                .db
                .list_dispatch_candidates(cursor.as_ref(), self.scan_batch)
                .await?;
            let exhausted = (batch.len() as u64) < self.scan_batch;

            for candidate in batch {
                cursor = Some(candidate.cursor.clone());
                match self.try_claim(&candidate, &mut load, &mut namespaces).await? {
                    ClaimOutcome::Claimed(task) => return Ok(Some(task)),
                    outcome => debug!(task_id = %candidate.task.id, ?outcome, "Candidate passed over"),
                }
            }

            if exhausted {
                return Ok(None);
            }
        }
    }

    async fn try_claim(
        &self,
        candidate: &DispatchCandidate,
        load: &mut HashMap<String, i64>,
        namespaces: &mut HashMap<String, NamespaceSlot>,
    ) -> Result<ClaimOutcome, TaskError> {
        let task = &candidate.task;
        let ns_id = task.namespace_id.as_str();

        if !namespaces.contains_key(ns_id) {
            let slot = match self.namespaces.get_namespace(ns_id).await {
                Ok(Some(ns)) => NamespaceSlot::Known(ns),
                Ok(None) => {
                    warn!(namespace_id = %ns_id, "Namespace not found, skipping its tasks");
                    NamespaceSlot::Unavailable
                }
                Err(e) => {
                    warn!(namespace_id = %ns_id, error = %e, "Namespace lookup failed, skipping its tasks");
                    NamespaceSlot::Unavailable
                }
            };
            namespaces.insert(ns_id.to_string(), slot);
        }
        let max_running = match namespaces.get(ns_id) {
            Some(NamespaceSlot::Known(ns)) => ns.max_running_tasks,
            _ => return Ok(ClaimOutcome::Skipped),
        };

        let running = load.get(ns_id).copied().unwrap_or(0);
        if running + task.concurrency_threshold > max_running {
            return Ok(ClaimOutcome::NoCapacity);
        }

        match self.quota.check_task_admission(ns_id, task).await {
            Ok(verdict) if verdict.exhausted => {
                if self.db.park_task(task.id, Utc::now()).await? {
                    info!(task_id = %task.id, namespace_id = %ns_id, "Quota exhausted, task parked");
                    return Ok(ClaimOutcome::Parked);
                }
                return Ok(ClaimOutcome::LostRace);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(task_id = %task.id, namespace_id = %ns_id, error = %e, "Quota check failed, leaving task pending");
                return Ok(ClaimOutcome::Skipped);
            }
        }

        let now = Utc::now();
        if !self.db.claim_task(task.id, ns_id, max_running, now).await? {
            // Our load snapshot may be stale; let later candidates see the
            // namespace as full rather than retrying it blindly.
            if let Ok(fresh) = self.db.running_load().await {
                *load = fresh;
            }
            return Ok(ClaimOutcome::LostRace);
        }

        *load.entry(ns_id.to_string()).or_insert(0) += task.concurrency_threshold;

        let mut claimed = task.clone();
        claimed.status = TaskStatus::Running;
        claimed.enqueued = true;
        claimed.started_at = Some(now);
        claimed.updated_at = now;
        info!(
            task_id = %claimed.id,
            namespace_id = %ns_id,
            function = %claimed.function,
            wait_ms = claimed.wait_ms().unwrap_or_default(),
            "Task dispatched"
        );
        Ok(ClaimOutcome::Claimed(claimed))
    }
}
