//! Worker callback ingestion.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::error::TaskError;
use crate::processors::ProcessorRegistry;
use crate::store::{Completion, Database};
use crate::tasks::model::{Task, TaskCallback};
use crate::tasks::status::TaskStatus;

pub struct CallbackIngestor {
    db: Arc<dyn Database>,
    processors: Arc<ProcessorRegistry>,
}

fn summary(task: &Task) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("task_id".into(), json!(task.id));
    map.insert("function".into(), json!(task.function));
    map.insert("status".into(), json!(task.status));
    map
}

impl CallbackIngestor {
    pub fn new(db: Arc<dyn Database>, processors: Arc<ProcessorRegistry>) -> Self {
        Self { db, processors }
    }

    /// Record a worker's outcome for a task.
    ///
    /// Canceled, parked and already-ended tasks are left as they are and the
    /// call still succeeds. Processor failures never fail the callback.
    pub async fn handle(&self, callback: TaskCallback) -> Result<Map<String, Value>, TaskError> {
        let id = callback.id;
        let task = self
            .db
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })?;

        if let Some(result) = Self::ignored(&task) {
            return Ok(result);
        }

        let completion = Completion {
            ended_at: callback.ended_at.unwrap_or_else(Utc::now),
            output: callback.output,
            exception: callback.exception,
        };
        let applied = self.db.complete_task(id, &completion, Utc::now()).await?;

        let task = self
            .db
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })?;
        if !applied {
            // A concurrent delivery or cancel won.
            return Ok(Self::ignored(&task).unwrap_or_else(|| summary(&task)));
        }

        info!(
            task_id = %id,
            function = %task.function,
            status = %task.status,
            cost_ms = task.cost_ms().unwrap_or_default(),
            wait_ms = task.wait_ms().unwrap_or_default(),
            "Task callback applied"
        );

        let mut result = summary(&task);
        if task.status == TaskStatus::Finished {
            match self.processors.process(&task).await {
                Ok(extra) => result.extend(extra),
                Err(e) => error!(
                    task_id = %id,
                    function = %task.function,
                    error = %e,
                    "Processor failed, task result kept"
                ),
            }
        }
        Ok(result)
    }

    /// Result for a callback that must not change the task, if any.
    fn ignored(task: &Task) -> Option<Map<String, Value>> {
        let mut result = summary(task);
        if matches!(
            task.status,
            TaskStatus::Canceled | TaskStatus::InsufficientQuota
        ) {
            warn!(task_id = %task.id, status = %task.status, "Callback ignored");
            result.insert("ignored".into(), json!(task.status));
            return Some(result);
        }
        if task.ended_at.is_some() {
            info!(task_id = %task.id, "Duplicate callback, keeping stored result");
            result.insert("duplicate".into(), json!(true));
            result.insert("output".into(), task.output.clone().unwrap_or(Value::Null));
            return Some(result);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::error::ProcessorError;
    use crate::processors::Processor;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::NewTask;

    struct Recorder {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Processor for Recorder {
        fn function(&self) -> &str {
            "record"
        }

        async fn process(&self, _task: &Task) -> Result<Map<String, Value>, ProcessorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProcessorError::ResourceNotFound { id: "r".into() });
            }
            let mut out = Map::new();
            out.insert("recorded".into(), json!(true));
            Ok(out)
        }
    }

    async fn setup(fail: bool) -> (Arc<LibSqlBackend>, CallbackIngestor, Arc<AtomicUsize>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ProcessorRegistry::new();
        registry.register_sync(Arc::new(Recorder {
            calls: calls.clone(),
            fail,
        }));
        let ingestor = CallbackIngestor::new(db.clone(), Arc::new(registry));
        (db, ingestor, calls)
    }

    async fn running_task(db: &LibSqlBackend) -> Task {
        let task = NewTask::new("ns", "record").into_task(Utc::now()).unwrap();
        db.insert_task(&task).await.unwrap();
        db.claim_task(task.id, "ns", 10, Utc::now()).await.unwrap();
        task
    }

    fn callback(id: Uuid, output: Value) -> TaskCallback {
        TaskCallback {
            id,
            ended_at: Some(Utc::now()),
            output: Some(output),
            exception: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (_db, ingestor, _) = setup(false).await;
        let err = ingestor
            .handle(callback(Uuid::new_v4(), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_callback_applies_once() {
        let (db, ingestor, calls) = setup(false).await;
        let task = running_task(&db).await;

        let first = ingestor.handle(callback(task.id, json!({"x": 1}))).await.unwrap();
        assert_eq!(first["status"], "finished");
        assert_eq!(first["recorded"], true);

        let second = ingestor.handle(callback(task.id, json!({"x": 2}))).await.unwrap();
        assert_eq!(second["duplicate"], true);
        assert_eq!(second["output"], json!({"x": 1}));

        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.output, Some(json!({"x": 1})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canceled_task_ignores_callback() {
        let (db, ingestor, calls) = setup(false).await;
        let task = running_task(&db).await;
        db.cancel_task(task.id, Utc::now()).await.unwrap();

        let result = ingestor.handle(callback(task.id, json!({"x": 1}))).await.unwrap();
        assert_eq!(result["ignored"], "canceled");

        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Canceled);
        assert!(stored.output.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exception_sets_error_without_processing() {
        let (db, ingestor, calls) = setup(false).await;
        let task = running_task(&db).await;

        let result = ingestor
            .handle(TaskCallback {
                id: task.id,
                ended_at: None,
                output: None,
                exception: Some(json!({"error": "worker crashed"})),
            })
            .await
            .unwrap();
        assert_eq!(result["status"], "error");

        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert!(stored.ended_at.is_some(), "ended_at defaults to now");
        assert_eq!(stored.exception, Some(json!({"error": "worker crashed"})));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_processor_failure_is_swallowed() {
        let (db, ingestor, calls) = setup(true).await;
        let task = running_task(&db).await;

        let result = ingestor.handle(callback(task.id, json!({}))).await.unwrap();
        assert_eq!(result["status"], "finished");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Finished
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_process_once() {
        let (db, ingestor, calls) = setup(false).await;
        let task = running_task(&db).await;
        let ingestor = Arc::new(ingestor);

        let deliveries = (0..5).map(|_| {
            let ingestor = ingestor.clone();
            let cb = callback(task.id, json!({"x": 1}));
            tokio::spawn(async move { ingestor.handle(cb).await.unwrap() })
        });
        for r in futures::future::join_all(deliveries).await {
            r.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
