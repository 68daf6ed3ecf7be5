//! Task data model and wire bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TaskError;
use crate::tasks::status::{TaskStatus, derive_status};

pub const UPSERT_INDEX: &str = "upsert_index";
/// Index deletion. It cannot be canceled from the UI.
pub const DELETE_INDEX: &str = "delete_index";
pub const UPSERT_MESSAGE_INDEX: &str = "upsert_message_index";
pub const GENERATE_TITLE: &str = "generate_title";
pub const FILE_READER: &str = "file_reader";
pub const COLLECT: &str = "collect";

/// A unit of asynchronous work handed to external workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub namespace_id: String,
    pub user_id: Option<String>,
    pub priority: i64,
    pub function: String,
    pub input: Value,
    pub payload: Value,
    pub output: Option<Value>,
    pub exception: Option<Value>,
    pub status: TaskStatus,
    pub enqueued: bool,
    /// Capacity weight consumed against the namespace cap while running.
    pub concurrency_threshold: i64,
    pub resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Status computed from the task's own fields.
    pub fn derived_status(&self) -> TaskStatus {
        derive_status(
            self.canceled_at,
            self.exception.as_ref(),
            self.ended_at,
            self.started_at,
        )
    }

    /// The resource this task refers to: the column, or the payload reference.
    pub fn resource_ref(&self) -> Option<&str> {
        self.resource_id
            .as_deref()
            .or_else(|| payload_resource_id(&self.payload))
    }

    /// Millis between creation and claim.
    pub fn wait_ms(&self) -> Option<i64> {
        self.started_at
            .map(|s| (s - self.created_at).num_milliseconds())
    }

    /// Millis between claim and completion.
    pub fn cost_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
            _ => None,
        }
    }
}

/// `payload.resource_id`, or the older camelCase `payload.resourceId`.
pub fn payload_resource_id(payload: &Value) -> Option<&str> {
    payload
        .get("resource_id")
        .or_else(|| payload.get("resourceId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Producer request to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(alias = "namespaceId")]
    pub namespace_id: String,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    pub function: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, alias = "concurrencyThreshold")]
    pub concurrency_threshold: Option<i64>,
    #[serde(default, alias = "resourceId")]
    pub resource_id: Option<String>,
}

impl NewTask {
    pub fn new(namespace_id: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_concurrency_threshold(mut self, threshold: i64) -> Self {
        self.concurrency_threshold = Some(threshold);
        self
    }

    /// Validate and build the pending task.
    pub fn into_task(self, now: DateTime<Utc>) -> Result<Task, TaskError> {
        if self.namespace_id.trim().is_empty() {
            return Err(TaskError::Validation("namespace_id is required".into()));
        }
        if self.function.trim().is_empty() {
            return Err(TaskError::Validation("function is required".into()));
        }
        let threshold = self.concurrency_threshold.unwrap_or(1);
        if threshold < 1 {
            return Err(TaskError::Validation(format!(
                "concurrency_threshold must be at least 1, got {threshold}"
            )));
        }

        let input = object_or_empty(self.input);
        let payload = object_or_empty(self.payload);
        let resource_id = self
            .resource_id
            .filter(|s| !s.is_empty())
            .or_else(|| payload_resource_id(&payload).map(String::from));

        Ok(Task {
            id: Uuid::new_v4(),
            namespace_id: self.namespace_id,
            user_id: self.user_id,
            priority: self.priority.unwrap_or(0),
            function: self.function,
            input,
            payload,
            output: None,
            exception: None,
            status: TaskStatus::Pending,
            enqueued: false,
            concurrency_threshold: threshold,
            resource_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            canceled_at: None,
            deleted_at: None,
        })
    }
}

fn object_or_empty(value: Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

/// Single-shot worker callback body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCallback {
    pub id: Uuid,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub exception: Option<Value>,
}

/// One fragment of an oversized callback body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkUpload {
    pub id: Uuid,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Base64-encoded bytes of this fragment.
    pub data: String,
    #[serde(default)]
    pub is_final_chunk: bool,
}

/// A task enriched with UI affordances.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub can_cancel: bool,
    pub can_rerun: bool,
    pub can_redirect: bool,
}

impl TaskView {
    /// Affordances depend on the status and on whether the referenced resource
    /// still exists. Without a live resource nothing is offered.
    pub fn new(task: Task, resource_exists: bool) -> Self {
        let (can_cancel, can_rerun, can_redirect) = if resource_exists {
            (
                matches!(task.status, TaskStatus::Pending | TaskStatus::Running)
                    && task.function != DELETE_INDEX,
                matches!(
                    task.status,
                    TaskStatus::Canceled | TaskStatus::InsufficientQuota
                ),
                true,
            )
        } else {
            (false, false, false)
        };
        Self {
            task,
            can_cancel,
            can_rerun,
            can_redirect,
        }
    }
}

/// One page of a namespace's task listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<TaskView>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_into_task_defaults() {
        let task = NewTask::new("ns1", "generate_title")
            .into_task(Utc::now())
            .unwrap();
        assert_eq!(task.priority, 0);
        assert_eq!(task.concurrency_threshold, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.enqueued);
        assert_eq!(task.input, json!({}));
        assert_eq!(task.payload, json!({}));
        assert_eq!(task.derived_status(), TaskStatus::Pending);
    }

    #[test]
    fn test_into_task_rejects_bad_input() {
        assert!(NewTask::new("", "f").into_task(Utc::now()).is_err());
        assert!(NewTask::new("ns", " ").into_task(Utc::now()).is_err());
        let err = NewTask::new("ns", "f")
            .with_concurrency_threshold(0)
            .into_task(Utc::now())
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[test]
    fn test_resource_id_from_payload() {
        let task = NewTask::new("ns", "generate_title")
            .with_payload(json!({"resourceId": "r1"}))
            .into_task(Utc::now())
            .unwrap();
        assert_eq!(task.resource_id.as_deref(), Some("r1"));
        assert_eq!(task.resource_ref(), Some("r1"));
    }

    #[test]
    fn test_new_task_accepts_camel_case() {
        let body = json!({
            "namespaceId": "ns",
            "userId": "u1",
            "function": "file_reader",
            "priority": 3,
            "concurrencyThreshold": 2
        });
        let new: NewTask = serde_json::from_value(body).unwrap();
        assert_eq!(new.namespace_id, "ns");
        assert_eq!(new.user_id.as_deref(), Some("u1"));
        assert_eq!(new.concurrency_threshold, Some(2));
    }

    #[test]
    fn test_callback_ignores_unknown_fields() {
        let cb: TaskCallback = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "ended_at": "2024-05-01T10:00:00+00:00",
            "output": {"x": 1},
            "status": "finished"
        }))
        .unwrap();
        assert!(cb.ended_at.is_some());
        assert!(cb.exception.is_none());
    }

    #[test]
    fn test_view_flags() {
        let mut task = NewTask::new("ns", "upsert_index")
            .into_task(Utc::now())
            .unwrap();
        let view = TaskView::new(task.clone(), true);
        assert!(view.can_cancel && !view.can_rerun && view.can_redirect);

        task.status = TaskStatus::Canceled;
        let view = TaskView::new(task.clone(), true);
        assert!(!view.can_cancel && view.can_rerun);

        let view = TaskView::new(task.clone(), false);
        assert!(!view.can_cancel && !view.can_rerun && !view.can_redirect);

        task.status = TaskStatus::Pending;
        task.function = DELETE_INDEX.into();
        assert!(!TaskView::new(task, true).can_cancel);
    }

    #[test]
    fn test_view_serializes_flat() {
        let task = NewTask::new("ns", "f").into_task(Utc::now()).unwrap();
        let v = serde_json::to_value(TaskView::new(task, true)).unwrap();
        assert_eq!(v["function"], "f");
        assert_eq!(v["status"], "pending");
        assert_eq!(v["can_cancel"], true);
        assert!(v.get("deleted_at").is_none());
    }
}
