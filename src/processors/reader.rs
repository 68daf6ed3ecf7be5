//! `file_reader` and `collect`: store parsed document content on the resource.
//!
//! Worker output is `{markdown?, title?, images?, ...attrs}`. Image links in
//! the markdown are rewritten to their uploaded attachments, the remaining
//! keys are merged into the resource attrs, and the updated resource is
//! queued for indexing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::directory::{ResourceDirectory, ResourceUpdate};
use crate::error::ProcessorError;
use crate::processors::{Processor, required_resource_id};
use crate::tasks::emitter::TaskEmitter;
use crate::tasks::model::{COLLECT, FILE_READER, Task};

pub struct ParsedContentProcessor {
    function: &'static str,
    resources: Arc<dyn ResourceDirectory>,
    emitter: Arc<TaskEmitter>,
}

impl ParsedContentProcessor {
    pub fn file_reader(resources: Arc<dyn ResourceDirectory>, emitter: Arc<TaskEmitter>) -> Self {
        Self {
            function: FILE_READER,
            resources,
            emitter,
        }
    }

    pub fn collect(resources: Arc<dyn ResourceDirectory>, emitter: Arc<TaskEmitter>) -> Self {
        Self {
            function: COLLECT,
            resources,
            emitter,
        }
    }
}

/// Replace every `originalLink` from `images` with `attachments/{attachmentId}`.
fn rewrite_image_links(markdown: &str, images: Option<&Value>) -> String {
    let mut out = markdown.to_string();
    for image in images.and_then(Value::as_array).into_iter().flatten() {
        let link = image
            .get("originalLink")
            .or_else(|| image.get("original_link"))
            .and_then(Value::as_str);
        let attachment = image
            .get("attachmentId")
            .or_else(|| image.get("attachment_id"))
            .and_then(Value::as_str);
        if let (Some(link), Some(attachment)) = (link, attachment)
            && !link.is_empty()
        {
            out = out.replace(link, &format!("attachments/{attachment}"));
        }
    }
    out
}

#[async_trait]
impl Processor for ParsedContentProcessor {
    fn function(&self) -> &str {
        self.function
    }

    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessorError> {
        let resource_id = required_resource_id(task)?;
        let ns = task.namespace_id.as_str();

        let Some(Value::Object(output)) = task.output.as_ref() else {
            return Ok(Map::new());
        };

        let resource = self
            .resources
            .get_resource(ns, resource_id)
            .await?
            .ok_or_else(|| ProcessorError::ResourceNotFound {
                id: resource_id.to_string(),
            })?;

        let mut attrs = output.clone();
        let markdown = attrs.remove("markdown");
        let title = attrs.remove("title");
        let images = attrs.remove("images");

        let content = rewrite_image_links(
            markdown.as_ref().and_then(Value::as_str).unwrap_or_default(),
            images.as_ref(),
        );
        let name = title
            .as_ref()
            .and_then(Value::as_str)
            .or_else(|| task.input.get("title").and_then(Value::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from);

        let mut merged = resource.attrs.clone();
        merged.extend(attrs);

        let update = ResourceUpdate {
            name,
            content: Some(content),
            attrs: Some(merged),
        };
        self.resources.update_resource(ns, resource_id, update).await?;
        debug!(task_id = %task.id, resource_id, "Parsed content stored");

        let mut result = Map::new();
        result.insert("resource_id".into(), json!(resource_id));

        if let Some(updated) = self.resources.get_resource(ns, resource_id).await?
            && let Some(index_task) = self
                .emitter
                .emit_upsert_index(task.priority, task.user_id.as_deref(), &updated)
                .await?
        {
            result.insert("index_task_id".into(), json!(index_task.id));
        }
        Ok(result)
    }
}
