//! `generate_title`: rename the originating resource.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::directory::{ResourceDirectory, ResourceUpdate};
use crate::error::ProcessorError;
use crate::processors::{Processor, required_resource_id};
use crate::tasks::model::{GENERATE_TITLE, Task};
use crate::tasks::status::is_empty_payload;

pub struct GenerateTitleProcessor {
    resources: Arc<dyn ResourceDirectory>,
}

impl GenerateTitleProcessor {
    pub fn new(resources: Arc<dyn ResourceDirectory>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Processor for GenerateTitleProcessor {
    fn function(&self) -> &str {
        GENERATE_TITLE
    }

    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessorError> {
        let resource_id = required_resource_id(task)?;
        if !is_empty_payload(task.exception.as_ref()) {
            return Ok(Map::new());
        }

        let title = task
            .output
            .as_ref()
            .and_then(|o| o.get("title"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let Some(title) = title else {
            return Ok(Map::new());
        };

        let update = ResourceUpdate {
            name: Some(title.to_string()),
            ..Default::default()
        };
        if !self
            .resources
            .update_resource(&task.namespace_id, resource_id, update)
            .await?
        {
            return Err(ProcessorError::ResourceNotFound {
                id: resource_id.to_string(),
            });
        }

        tracing::debug!(task_id = %task.id, resource_id, "Resource renamed from generated title");
        let mut result = Map::new();
        result.insert("resource_id".into(), json!(resource_id));
        result.insert("title".into(), json!(title));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::directory::{Resource, ResourceType};
    use crate::store::LibSqlBackend;
    use crate::tasks::model::NewTask;

    async fn setup() -> (Arc<LibSqlBackend>, GenerateTitleProcessor) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut doc = Resource::new("r1", "ns", ResourceType::Doc);
        doc.name = "Untitled".into();
        db.create_resource(&doc).await.unwrap();
        (db.clone(), GenerateTitleProcessor::new(db))
    }

    fn task(output: Value) -> Task {
        let mut t = NewTask::new("ns", GENERATE_TITLE)
            .with_payload(json!({"resource_id": "r1"}))
            .into_task(Utc::now())
            .unwrap();
        t.output = Some(output);
        t
    }

    async fn name(db: &LibSqlBackend) -> String {
        db.get_resource("ns", "r1").await.unwrap().unwrap().name
    }

    #[tokio::test]
    async fn test_title_renames_resource() {
        let (db, processor) = setup().await;
        let out = processor.process(&task(json!({"title": "  Hello "}))).await.unwrap();
        assert_eq!(out["title"], "Hello");
        assert_eq!(name(&db).await, "Hello");
    }

    #[tokio::test]
    async fn test_blank_title_is_noop() {
        let (db, processor) = setup().await;
        for output in [json!({"title": ""}), json!({"title": "   "}), json!({"title": 5}), json!({})] {
            let out = processor.process(&task(output)).await.unwrap();
            assert!(out.is_empty());
        }
        assert_eq!(name(&db).await, "Untitled");
    }

    #[tokio::test]
    async fn test_exception_is_noop() {
        let (db, processor) = setup().await;
        let mut t = task(json!({"title": "Hello"}));
        t.exception = Some(json!({"error": "llm down"}));
        assert!(processor.process(&t).await.unwrap().is_empty());
        assert_eq!(name(&db).await, "Untitled");
    }

    #[tokio::test]
    async fn test_missing_resource_reference() {
        let (_db, processor) = setup().await;
        let mut t = task(json!({"title": "Hello"}));
        t.payload = json!({});
        t.resource_id = None;
        let err = processor.process(&t).await.unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidPayload { .. }));
    }
}
