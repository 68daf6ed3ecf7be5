//! Task store operations: create, read, list, cancel, rerun, soft-delete.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::directory::ResourceDirectory;
use crate::error::TaskError;
use crate::store::Database;
use crate::tasks::model::{NewTask, Task, TaskPage, TaskView};
use crate::tasks::status::{TaskStatus, Transition};

pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 100;

pub struct TaskService {
    db: Arc<dyn Database>,
    resources: Arc<dyn ResourceDirectory>,
}

impl TaskService {
    pub fn new(db: Arc<dyn Database>, resources: Arc<dyn ResourceDirectory>) -> Self {
        Self { db, resources }
    }

    /// Create a pending task.
    pub async fn create(&self, new: NewTask) -> Result<Task, TaskError> {
        let task = new.into_task(Utc::now())?;
        self.db.insert_task(&task).await?;
        info!(
            task_id = %task.id,
            namespace_id = %task.namespace_id,
            function = %task.function,
            priority = task.priority,
            "Task created"
        );
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, TaskError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// Newest-first page of a namespace's tasks with UI affordances.
    pub async fn list(
        &self,
        namespace_id: &str,
        offset: u64,
        limit: Option<u64>,
        user_id: Option<&str>,
    ) -> Result<TaskPage, TaskError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let (tasks, total) = self
            .db
            .list_tasks(namespace_id, user_id, offset, limit)
            .await?;

        let mut refs: Vec<String> = tasks
            .iter()
            .filter_map(|t| t.resource_ref().map(String::from))
            .collect();
        refs.sort();
        refs.dedup();
        let existing = self
            .resources
            .existing_resource_ids(namespace_id, &refs)
            .await?;

        let tasks = tasks
            .into_iter()
            .map(|task| {
                let exists = task
                    .resource_ref()
                    .is_some_and(|id| existing.contains(id));
                TaskView::new(task, exists)
            })
            .collect();
        Ok(TaskPage { tasks, total })
    }

    /// Cancel a pending or running task. Canceling twice is a no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<Task, TaskError> {
        let task = self.get(id).await?;
        if task.status == TaskStatus::Canceled {
            return Ok(task);
        }
        let cancel = Transition::Cancel;
        if !cancel.can_apply(task.status) {
            return Err(invalid(&task, cancel));
        }

        if !self.db.cancel_task(id, Utc::now()).await? {
            // Lost to a concurrent cancel or callback.
            let current = self.get(id).await?;
            return match current.status {
                TaskStatus::Canceled => Ok(current),
                _ => Err(invalid(&current, cancel)),
            };
        }

        info!(task_id = %id, function = %task.function, "Task canceled");
        self.get(id).await
    }

    /// Rerun a task.
    ///
    /// A task parked for quota goes back to the pending pool as-is. A canceled
    /// task is re-emitted as a fresh pending copy, which is returned.
    pub async fn rerun(&self, id: Uuid) -> Result<Task, TaskError> {
        let task = self.get(id).await?;
        match task.status {
            TaskStatus::InsufficientQuota => {
                if !self.db.reset_task(id, Utc::now()).await? {
                    let current = self.get(id).await?;
                    return Err(invalid(&current, Transition::Reset));
                }
                info!(task_id = %id, "Parked task returned to pending");
                self.get(id).await
            }
            TaskStatus::Canceled => {
                let copy = NewTask {
                    namespace_id: task.namespace_id.clone(),
                    user_id: task.user_id.clone(),
                    priority: Some(task.priority),
                    function: task.function.clone(),
                    input: task.input.clone(),
                    payload: task.payload.clone(),
                    concurrency_threshold: Some(task.concurrency_threshold),
                    resource_id: task.resource_id.clone(),
                };
                let rerun = self.create(copy).await?;
                debug!(task_id = %id, rerun_id = %rerun.id, "Canceled task re-emitted");
                Ok(rerun)
            }
            _ => Err(invalid(&task, Transition::Reset)),
        }
    }

    /// Hide a task from listings and dispatch. Deleting twice is a no-op.
    pub async fn soft_delete(&self, id: Uuid) -> Result<(), TaskError> {
        self.get(id).await?;
        if self.db.soft_delete_task(id, Utc::now()).await? {
            info!(task_id = %id, "Task soft-deleted");
        }
        Ok(())
    }
}

fn invalid(task: &Task, transition: Transition) -> TaskError {
    TaskError::InvalidTransition {
        id: task.id,
        state: task.status.to_string(),
        action: transition.name().to_string(),
    }
}
