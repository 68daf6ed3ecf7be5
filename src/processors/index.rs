//! Search index reconciliation.
//!
//! Index tasks are produced from resource state at emit time. By the time a
//! worker finishes, the resource may have been edited, deleted or restored;
//! these processors queue the follow-up task that brings the index back in
//! line with the resource.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::directory::ResourceDirectory;
use crate::error::ProcessorError;
use crate::processors::{Processor, required_resource_id};
use crate::tasks::emitter::TaskEmitter;
use crate::tasks::model::{DELETE_INDEX, Task, UPSERT_INDEX, UPSERT_MESSAGE_INDEX};

fn result_with(resource_id: &str, follow_up: Option<&Task>) -> Map<String, Value> {
    let mut result = Map::new();
    result.insert("resource_id".into(), json!(resource_id));
    if let Some(task) = follow_up {
        result.insert("follow_up_task_id".into(), json!(task.id));
    }
    result
}

pub struct UpsertIndexProcessor {
    resources: Arc<dyn ResourceDirectory>,
    emitter: Arc<TaskEmitter>,
}

impl UpsertIndexProcessor {
    pub fn new(resources: Arc<dyn ResourceDirectory>, emitter: Arc<TaskEmitter>) -> Self {
        Self { resources, emitter }
    }
}

#[async_trait]
impl Processor for UpsertIndexProcessor {
    fn function(&self) -> &str {
        UPSERT_INDEX
    }

    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessorError> {
        let resource_id = required_resource_id(task)?;
        let user = task.user_id.as_deref();

        let follow_up = match self
            .resources
            .get_resource(&task.namespace_id, resource_id)
            .await?
        {
            None => {
                debug!(resource_id, "Indexed resource is gone, removing from index");
                Some(
                    self.emitter
                        .emit_delete_index(user, &task.namespace_id, resource_id)
                        .await?,
                )
            }
            Some(resource) => {
                let indexed = task
                    .input
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if resource.content != indexed {
                    debug!(resource_id, "Resource changed while indexing, re-indexing");
                    self.emitter
                        .emit_upsert_index(task.priority, user, &resource)
                        .await?
                } else {
                    None
                }
            }
        };
        Ok(result_with(resource_id, follow_up.as_ref()))
    }
}

pub struct DeleteIndexProcessor {
    resources: Arc<dyn ResourceDirectory>,
    emitter: Arc<TaskEmitter>,
}

impl DeleteIndexProcessor {
    pub fn new(resources: Arc<dyn ResourceDirectory>, emitter: Arc<TaskEmitter>) -> Self {
        Self { resources, emitter }
    }
}

#[async_trait]
impl Processor for DeleteIndexProcessor {
    fn function(&self) -> &str {
        DELETE_INDEX
    }

    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessorError> {
        let resource_id = match task.input.get("resource_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id,
            _ => required_resource_id(task)?,
        };

        // Restored after deletion was queued.
        let follow_up = match self
            .resources
            .get_resource(&task.namespace_id, resource_id)
            .await?
        {
            Some(resource) => {
                self.emitter
                    .emit_upsert_index(task.priority, task.user_id.as_deref(), &resource)
                    .await?
            }
            None => None,
        };
        Ok(result_with(resource_id, follow_up.as_ref()))
    }
}

/// Chat message indexing has no resource to reconcile; it reports what was indexed.
pub struct MessageIndexProcessor;

#[async_trait]
impl Processor for MessageIndexProcessor {
    fn function(&self) -> &str {
        UPSERT_MESSAGE_INDEX
    }

    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessorError> {
        let field = |key: &str| {
            task.payload
                .get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| ProcessorError::InvalidPayload {
                    function: task.function.clone(),
                    reason: format!("missing {key}"),
                })
        };

        let mut result = Map::new();
        result.insert("conversation_id".into(), json!(field("conversation_id")?));
        result.insert("message_id".into(), json!(field("message_id")?));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::directory::{Resource, ResourceType};
    use crate::store::{Database, LibSqlBackend};
    use crate::tasks::model::NewTask;
    use crate::tasks::service::TaskService;

    struct Fixture {
        db: Arc<LibSqlBackend>,
        emitter: Arc<TaskEmitter>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut doc = Resource::new("r1", "ns", ResourceType::Doc);
        doc.content = "current".into();
        db.create_resource(&doc).await.unwrap();
        let emitter = Arc::new(TaskEmitter::new(Arc::new(TaskService::new(
            db.clone(),
            db.clone(),
        ))));
        Fixture { db, emitter }
    }

    fn index_task(function: &str, content: &str) -> Task {
        NewTask::new("ns", function)
            .with_input(json!({"content": content, "resource_id": "r1"}))
            .with_payload(json!({"resource_id": "r1"}))
            .into_task(Utc::now())
            .unwrap()
    }

    async fn follow_up(f: &Fixture, out: &Map<String, Value>) -> Option<Task> {
        let id = out.get("follow_up_task_id")?.as_str()?.parse().ok()?;
        f.db.get_task(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_in_sync_does_nothing() {
        let f = fixture().await;
        let p = UpsertIndexProcessor::new(f.db.clone(), f.emitter.clone());
        let out = p.process(&index_task(UPSERT_INDEX, "current")).await.unwrap();
        assert!(follow_up(&f, &out).await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_stale_content_reindexes() {
        let f = fixture().await;
        let p = UpsertIndexProcessor::new(f.db.clone(), f.emitter.clone());
        let out = p.process(&index_task(UPSERT_INDEX, "old")).await.unwrap();
        let next = follow_up(&f, &out).await.unwrap();
        assert_eq!(next.function, UPSERT_INDEX);
        assert_eq!(next.input["content"], "current");
    }

    #[tokio::test]
    async fn test_upsert_deleted_resource_removes_index() {
        let f = fixture().await;
        f.db.delete_resource("ns", "r1").await.unwrap();
        let p = UpsertIndexProcessor::new(f.db.clone(), f.emitter.clone());
        let out = p.process(&index_task(UPSERT_INDEX, "current")).await.unwrap();
        assert_eq!(follow_up(&f, &out).await.unwrap().function, DELETE_INDEX);
    }

    #[tokio::test]
    async fn test_delete_restored_resource_reindexes() {
        let f = fixture().await;
        let p = DeleteIndexProcessor::new(f.db.clone(), f.emitter.clone());
        let out = p.process(&index_task(DELETE_INDEX, "")).await.unwrap();
        assert_eq!(follow_up(&f, &out).await.unwrap().function, UPSERT_INDEX);

        f.db.delete_resource("ns", "r1").await.unwrap();
        let out = p.process(&index_task(DELETE_INDEX, "")).await.unwrap();
        assert!(follow_up(&f, &out).await.is_none());
    }

    #[tokio::test]
    async fn test_message_index_reports_refs() {
        let mut t = NewTask::new("ns", UPSERT_MESSAGE_INDEX)
            .with_payload(json!({"conversation_id": "c1", "message_id": "m1"}))
            .into_task(Utc::now())
            .unwrap();
        let out = MessageIndexProcessor.process(&t).await.unwrap();
        assert_eq!(out["message_id"], "m1");

        t.payload = json!({"conversation_id": "c1"});
        assert!(MessageIndexProcessor.process(&t).await.is_err());
    }
}
