//! Producers: create tasks on behalf of resource, message and upload flows.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::directory::{Resource, ResourceType};
use crate::error::TaskError;
use crate::tasks::model::{
    DELETE_INDEX, FILE_READER, GENERATE_TITLE, NewTask, Task, UPSERT_INDEX, UPSERT_MESSAGE_INDEX,
};
use crate::tasks::service::TaskService;

/// A chat message to be indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: String,
}

pub struct TaskEmitter {
    tasks: Arc<TaskService>,
}

impl TaskEmitter {
    pub fn new(tasks: Arc<TaskService>) -> Self {
        Self { tasks }
    }

    fn base(namespace_id: &str, function: &str, user_id: Option<&str>) -> NewTask {
        let mut new = NewTask::new(namespace_id, function);
        new.user_id = user_id.map(String::from);
        new
    }

    /// Index a resource's content. Folders and empty documents are skipped.
    pub async fn emit_upsert_index(
        &self,
        priority: i64,
        user_id: Option<&str>,
        resource: &Resource,
    ) -> Result<Option<Task>, TaskError> {
        if resource.resource_type == ResourceType::Folder || resource.content.trim().is_empty() {
            debug!(resource_id = %resource.id, "Nothing to index");
            return Ok(None);
        }

        let new = Self::base(&resource.namespace_id, UPSERT_INDEX, user_id)
            .with_priority(priority)
            .with_input(json!({
                "title": resource.name,
                "content": resource.content,
                "meta_info": {
                    "user_id": user_id,
                    "resource_id": resource.id,
                    "parent_id": resource.parent_id,
                },
            }))
            .with_payload(json!({ "resource_id": resource.id }));
        self.tasks.create(new).await.map(Some)
    }

    pub async fn emit_delete_index(
        &self,
        user_id: Option<&str>,
        namespace_id: &str,
        resource_id: &str,
    ) -> Result<Task, TaskError> {
        let new = Self::base(namespace_id, DELETE_INDEX, user_id)
            .with_input(json!({ "resource_id": resource_id }))
            .with_payload(json!({ "resource_id": resource_id }));
        self.tasks.create(new).await
    }

    /// Index a chat message. Blank messages and system/tool turns are skipped.
    pub async fn emit_upsert_message_index(
        &self,
        priority: i64,
        user_id: Option<&str>,
        namespace_id: &str,
        conversation_id: &str,
        message: &ChatMessage,
    ) -> Result<Option<Task>, TaskError> {
        if message.content.trim().is_empty() || matches!(message.role.as_str(), "system" | "tool")
        {
            return Ok(None);
        }

        let new = Self::base(namespace_id, UPSERT_MESSAGE_INDEX, user_id)
            .with_priority(priority)
            .with_input(json!({
                "conversation_id": conversation_id,
                "message_id": message.id,
                "message": message,
            }))
            .with_payload(json!({
                "conversation_id": conversation_id,
                "message_id": message.id,
            }));
        self.tasks.create(new).await.map(Some)
    }

    pub async fn emit_generate_title(
        &self,
        user_id: Option<&str>,
        namespace_id: &str,
        resource_id: &str,
        text: &str,
        lang: Option<&str>,
        parent_task_id: Option<Uuid>,
    ) -> Result<Task, TaskError> {
        let new = Self::base(namespace_id, GENERATE_TITLE, user_id)
            .with_input(json!({ "lang": lang, "text": text }))
            .with_payload(json!({
                "resource_id": resource_id,
                "parent_task_id": parent_task_id,
            }));
        self.tasks.create(new).await
    }

    /// Parse an uploaded file resource into text.
    pub async fn emit_file_reader(
        &self,
        user_id: Option<&str>,
        resource: &Resource,
        source: Option<&str>,
    ) -> Result<Task, TaskError> {
        let new = Self::base(&resource.namespace_id, FILE_READER, user_id)
            .with_input(json!({
                "title": resource.name,
                "original_name": resource.attr_str("original_name"),
                "filename": resource.attr_str("filename"),
                "mimetype": resource.attr_str("mimetype"),
                "resource_id": resource.id,
            }))
            .with_payload(json!({
                "resource_id": resource.id,
                "source": source,
            }));
        self.tasks.create(new).await
    }
}
