//! Completion side effects, selected by task function name.

pub mod index;
pub mod reader;
pub mod title;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::directory::ResourceDirectory;
use crate::error::ProcessorError;
use crate::tasks::emitter::TaskEmitter;
use crate::tasks::model::Task;

pub use index::{DeleteIndexProcessor, MessageIndexProcessor, UpsertIndexProcessor};
pub use reader::ParsedContentProcessor;
pub use title::GenerateTitleProcessor;

/// A side-effect handler run when a task finishes.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Task function this processor handles.
    fn function(&self) -> &str;

    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessorError>;
}

/// The task's resource reference, or an error naming the function.
pub(crate) fn required_resource_id(task: &Task) -> Result<&str, ProcessorError> {
    task.resource_ref()
        .ok_or_else(|| ProcessorError::InvalidPayload {
            function: task.function.clone(),
            reason: "missing resource_id".into(),
        })
}

/// Registry of completion processors.
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in processors.
    pub fn with_defaults(
        resources: Arc<dyn ResourceDirectory>,
        emitter: Arc<TaskEmitter>,
    ) -> Self {
        let registry = Self::new();
        registry.register_sync(Arc::new(GenerateTitleProcessor::new(resources.clone())));
        registry.register_sync(Arc::new(ParsedContentProcessor::file_reader(
            resources.clone(),
            emitter.clone(),
        )));
        registry.register_sync(Arc::new(ParsedContentProcessor::collect(
            resources.clone(),
            emitter.clone(),
        )));
        registry.register_sync(Arc::new(UpsertIndexProcessor::new(
            resources.clone(),
            emitter.clone(),
        )));
        registry.register_sync(Arc::new(DeleteIndexProcessor::new(resources, emitter)));
        registry.register_sync(Arc::new(MessageIndexProcessor));
        registry
    }

    /// Register a processor, replacing any previous one for the same function.
    pub async fn register(&self, processor: Arc<dyn Processor>) {
        let name = processor.function().to_string();
        if self
            .processors
            .write()
            .await
            .insert(name.clone(), processor)
            .is_some()
        {
            tracing::warn!(function = %name, "Replaced existing processor");
        }
        tracing::debug!("Registered processor: {}", name);
    }

    /// Register a processor (sync version for startup).
    pub fn register_sync(&self, processor: Arc<dyn Processor>) {
        let name = processor.function().to_string();
        if let Ok(mut processors) = self.processors.try_write() {
            processors.insert(name.clone(), processor);
            tracing::debug!("Registered processor: {}", name);
        }
    }

    pub async fn get(&self, function: &str) -> Option<Arc<dyn Processor>> {
        self.processors.read().await.get(function).cloned()
    }

    pub async fn has(&self, function: &str) -> bool {
        self.processors.read().await.contains_key(function)
    }

    /// Registered function names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the processor for `task.function`. Unregistered functions yield `{}`.
    pub async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessorError> {
        let Some(processor) = self.get(&task.function).await else {
            tracing::warn!(
                task_id = %task.id,
                function = %task.function,
                "No processor registered, skipping side effects"
            );
            return Ok(Map::new());
        };
        processor.process(task).await
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::NewTask;
    use crate::tasks::service::TaskService;

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Counting {
        fn function(&self) -> &str {
            "count_me"
        }

        async fn process(&self, _task: &Task) -> Result<Map<String, Value>, ProcessorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut out = Map::new();
            out.insert("calls".into(), json!(n));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let registry = ProcessorRegistry::new();
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        registry.register(counting.clone()).await;
        assert!(registry.has("count_me").await);

        let task = NewTask::new("ns", "count_me").into_task(Utc::now()).unwrap();
        let out = registry.process(&task).await.unwrap();
        assert_eq!(out["calls"], 1);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_function_is_ignored() {
        let registry = ProcessorRegistry::new();
        let task = NewTask::new("ns", "mystery").into_task(Utc::now()).unwrap();
        assert!(registry.process(&task).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_defaults_cover_builtin_functions() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let service = Arc::new(TaskService::new(db.clone(), db.clone()));
        let registry =
            ProcessorRegistry::with_defaults(db, Arc::new(TaskEmitter::new(service)));
        assert_eq!(
            registry.list().await,
            vec![
                "collect",
                "delete_index",
                "file_reader",
                "generate_title",
                "upsert_index",
                "upsert_message_index"
            ]
        );
    }
}
