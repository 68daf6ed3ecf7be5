//! Chunked callback reassembly.
//!
//! Oversized callback bodies arrive as base64 fragments. Fragments are staged
//! in the object store under `wizard-chunks/{task_id}/chunk-{index:06}`; the
//! final fragment triggers reassembly and normal callback ingestion. Each
//! staged fragment pushes the task's cleanup deadline out by the cleanup
//! delay; once a task's fragments go quiet for that long they are removed
//! through the shared expiring-entry table, so cleanup survives restarts and
//! is done by exactly one replica.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::store::{Database, ObjectStore};
use crate::tasks::callback::CallbackIngestor;
use crate::tasks::model::{ChunkUpload, TaskCallback};

/// Expiring-entry kind for scheduled chunk deletions.
pub const CLEANUP_KIND: &str = "chunk_cleanup";
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_secs(60);
const SWEEP_BATCH: u64 = 100;

pub fn chunk_key(task_id: Uuid, index: u32) -> String {
    format!("wizard-chunks/{task_id}/chunk-{index:06}")
}

/// What happened to an uploaded chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkReceipt {
    /// Staged; more chunks expected.
    Stored {
        task_id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
    },
    /// Final chunk; the reassembled callback was ingested.
    Completed(Map<String, Value>),
}

impl ChunkReceipt {
    /// Response body for the chunk endpoint.
    pub fn into_body(self) -> Value {
        match self {
            ChunkReceipt::Stored {
                task_id,
                chunk_index,
                total_chunks,
            } => json!({
                "detail": "Chunk received",
                "task_id": task_id,
                "chunk_index": chunk_index,
                "total_chunks": total_chunks,
            }),
            ChunkReceipt::Completed(result) => Value::Object(result),
        }
    }
}

pub struct ChunkBuffer {
    db: Arc<dyn Database>,
    objects: Arc<dyn ObjectStore>,
    ingestor: Arc<CallbackIngestor>,
    cleanup_delay: Duration,
}

impl ChunkBuffer {
    pub fn new(
        db: Arc<dyn Database>,
        objects: Arc<dyn ObjectStore>,
        ingestor: Arc<CallbackIngestor>,
    ) -> Self {
        Self {
            db,
            objects,
            ingestor,
            cleanup_delay: DEFAULT_CLEANUP_DELAY,
        }
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    pub async fn receive(&self, upload: ChunkUpload) -> Result<ChunkReceipt, TaskError> {
        let ChunkUpload {
            id,
            chunk_index,
            total_chunks,
            data,
            is_final_chunk,
        } = upload;

        if total_chunks == 0 {
            return Err(TaskError::Validation("total_chunks must be at least 1".into()));
        }
        if chunk_index >= total_chunks {
            return Err(TaskError::Validation(format!(
                "chunk_index {chunk_index} out of range for {total_chunks} chunks"
            )));
        }
        let bytes = general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| TaskError::Validation(format!("chunk data is not base64: {e}")))?;

        if total_chunks == 1 && is_final_chunk {
            return self.ingest(id, bytes).await.map(ChunkReceipt::Completed);
        }

        if let Err(e) = self.objects.put(&chunk_key(id, chunk_index), &bytes).await {
            warn!(task_id = %id, chunk_index, error = %e, "Chunk write failed");
            self.schedule_cleanup(id, total_chunks).await;
            return Err(e.into());
        }
        debug!(task_id = %id, chunk_index, total_chunks, "Chunk staged");

        if !is_final_chunk {
            // Every staged chunk re-arms cleanup, so abandoned uploads and
            // retransmissions after the final chunk are removed too.
            self.schedule_cleanup(id, total_chunks).await;
            return Ok(ChunkReceipt::Stored {
                task_id: id,
                chunk_index,
                total_chunks,
            });
        }

        let result = self.reassemble(id, total_chunks).await;
        self.schedule_cleanup(id, total_chunks).await;
        let result = result?;
        info!(task_id = %id, total_chunks, "Chunked callback reassembled");
        Ok(ChunkReceipt::Completed(result))
    }

    async fn reassemble(&self, id: Uuid, total_chunks: u32) -> Result<Map<String, Value>, TaskError> {
        let mut body = Vec::new();
        for index in 0..total_chunks {
            match self.objects.get(&chunk_key(id, index)).await? {
                Some(bytes) => body.extend_from_slice(&bytes),
                None => return Err(TaskError::IncompleteChunks { id, missing: index }),
            }
        }
        self.ingest(id, body).await
    }

    /// Parse a whole callback body and hand it to the ingestor.
    async fn ingest(&self, id: Uuid, body: Vec<u8>) -> Result<Map<String, Value>, TaskError> {
        let text = String::from_utf8(body)
            .map_err(|e| TaskError::Validation(format!("callback body is not UTF-8: {e}")))?;
        let callback: TaskCallback = serde_json::from_str(&text)
            .map_err(|e| TaskError::Validation(format!("callback body is not valid: {e}")))?;
        if callback.id != id {
            return Err(TaskError::Validation(format!(
                "chunk id {id} does not match callback id {}",
                callback.id
            )));
        }
        self.ingestor.handle(callback).await
    }

    /// Record (or push out) the deferred deletion of a task's staged chunks.
    async fn schedule_cleanup(&self, id: Uuid, total_chunks: u32) {
        let key = id.to_string();
        let now = Utc::now();

        // Keep the widest chunk count seen for this task.
        let previous = match self.db.get_expiring(CLEANUP_KIND, &key, now).await {
            Ok(v) => v
                .and_then(|v| v.get("total_chunks").and_then(Value::as_u64))
                .unwrap_or(0),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to read chunk cleanup entry");
                0
            }
        };
        let total = u64::from(total_chunks).max(previous);

        let delay = chrono::Duration::from_std(self.cleanup_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if let Err(e) = self
            .db
            .put_expiring(CLEANUP_KIND, &key, &json!({ "total_chunks": total }), now + delay)
            .await
        {
            warn!(task_id = %id, error = %e, "Failed to schedule chunk cleanup");
        }
    }

    /// Delete staged chunks whose cleanup is due. Returns the number of
    /// objects removed. Failures are logged and not retried.
    pub async fn sweep_due_cleanups(&self) -> Result<usize, TaskError> {
        let mut removed = 0;
        loop {
            let due = self
                .db
                .take_expired(CLEANUP_KIND, Utc::now(), SWEEP_BATCH)
                .await?;
            let last_batch = (due.len() as u64) < SWEEP_BATCH;

            for entry in due {
                let Ok(id) = Uuid::parse_str(&entry.key) else {
                    warn!(key = %entry.key, "Malformed chunk cleanup entry dropped");
                    continue;
                };
                let total = entry
                    .value
                    .get("total_chunks")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                for index in 0..total {
                    let Ok(index) = u32::try_from(index) else {
                        break;
                    };
                    let key = chunk_key(id, index);
                    match self.objects.delete(&key).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(key = %key, error = %e, "Failed to remove staged chunk"),
                    }
                }
                debug!(task_id = %id, total, "Staged chunks cleaned up");
            }

            if last_batch {
                return Ok(removed);
            }
        }
    }
}

/// Periodically remove staged chunks whose cleanup delay has passed.
pub fn spawn_cleanup_sweeper(
    buffer: Arc<ChunkBuffer>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match buffer.sweep_due_cleanups().await {
                Ok(0) => {}
                Ok(n) => info!(removed = n, "Chunk cleanup sweep"),
                Err(e) => warn!(error = %e, "Chunk cleanup sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::ProcessorRegistry;
    use crate::store::{LibSqlBackend, MemoryObjectStore};
    use crate::tasks::model::{NewTask, Task};
    use crate::tasks::status::TaskStatus;

    struct Fixture {
        db: Arc<LibSqlBackend>,
        objects: Arc<MemoryObjectStore>,
        buffer: ChunkBuffer,
    }

    async fn fixture(delay: Duration) -> Fixture {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let objects = Arc::new(MemoryObjectStore::new());
        let ingestor = Arc::new(CallbackIngestor::new(
            db.clone(),
            Arc::new(ProcessorRegistry::new()),
        ));
        let buffer = ChunkBuffer::new(db.clone(), objects.clone(), ingestor)
            .with_cleanup_delay(delay);
        Fixture {
            db,
            objects,
            buffer,
        }
    }

    async fn running_task(db: &LibSqlBackend) -> Task {
        let task = NewTask::new("ns", "f").into_task(Utc::now()).unwrap();
        db.insert_task(&task).await.unwrap();
        db.claim_task(task.id, "ns", 10, Utc::now()).await.unwrap();
        task
    }

    fn split(body: &Value, parts: usize) -> Vec<String> {
        let bytes = serde_json::to_vec(body).unwrap();
        let size = bytes.len().div_ceil(parts);
        bytes
            .chunks(size)
            .map(|c| general_purpose::STANDARD.encode(c))
            .collect()
    }

    fn upload(id: Uuid, index: u32, total: u32, data: &str, last: bool) -> ChunkUpload {
        ChunkUpload {
            id,
            chunk_index: index,
            total_chunks: total,
            data: data.to_string(),
            is_final_chunk: last,
        }
    }

    #[test]
    fn test_chunk_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            chunk_key(id, 7),
            "wizard-chunks/00000000-0000-0000-0000-000000000000/chunk-000007"
        );
    }

    #[tokio::test]
    async fn test_out_of_order_reassembly() {
        let f = fixture(Duration::from_secs(60)).await;
        let task = running_task(&f.db).await;
        let body = json!({"id": task.id, "output": {"markdown": "é ✓ long text"}});
        let parts = split(&body, 3);

        let r = f.buffer.receive(upload(task.id, 1, 3, &parts[1], false)).await.unwrap();
        assert!(matches!(r, ChunkReceipt::Stored { chunk_index: 1, .. }));
        f.buffer.receive(upload(task.id, 0, 3, &parts[0], false)).await.unwrap();
        let done = f.buffer.receive(upload(task.id, 2, 3, &parts[2], true)).await.unwrap();

        let ChunkReceipt::Completed(result) = done else {
            panic!("expected completion");
        };
        assert_eq!(result["status"], "finished");
        let stored = f.db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.output, Some(json!({"markdown": "é ✓ long text"})));
        assert_eq!(stored.status, TaskStatus::Finished);

        // Staged until the cleanup delay passes.
        assert_eq!(
            f.objects.keys_with_prefix(&format!("wizard-chunks/{}", task.id)).await.len(),
            3
        );
    }

    #[tokio::test]
    async fn test_missing_chunk_is_reported() {
        let f = fixture(Duration::from_secs(60)).await;
        let task = running_task(&f.db).await;
        let parts = split(&json!({"id": task.id, "output": {}}), 3);

        f.buffer.receive(upload(task.id, 0, 3, &parts[0], false)).await.unwrap();
        let err = f
            .buffer
            .receive(upload(task.id, 2, 3, &parts[2], true))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::IncompleteChunks { missing: 1, .. }));
        // Cleanup still scheduled.
        assert!(
            f.db.get_expiring(CLEANUP_KIND, &task.id.to_string(), Utc::now())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_single_chunk_skips_staging() {
        let f = fixture(Duration::from_secs(60)).await;
        let task = running_task(&f.db).await;
        let parts = split(&json!({"id": task.id, "output": {"x": 1}}), 1);

        let done = f.buffer.receive(upload(task.id, 0, 1, &parts[0], true)).await.unwrap();
        assert!(matches!(done, ChunkReceipt::Completed(_)));
        assert!(f.objects.keys_with_prefix("wizard-chunks/").await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let f = fixture(Duration::from_secs(60)).await;
        let id = Uuid::new_v4();
        for bad in [
            upload(id, 0, 0, "", true),
            upload(id, 3, 3, "", false),
            upload(id, 0, 2, "not base64!!", false),
        ] {
            let err = f.buffer.receive(bad).await.unwrap_err();
            assert!(matches!(err, TaskError::Validation(_)));
        }

        // Body id must match the chunk id.
        let other = split(&json!({"id": Uuid::new_v4(), "output": {}}), 1);
        let err = f.buffer.receive(upload(id, 0, 1, &other[0], true)).await.unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));

        let garbage = general_purpose::STANDARD.encode(b"{not json");
        let err = f.buffer.receive(upload(id, 0, 1, &garbage, true)).await.unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[tokio::test]
    async fn test_sweep_removes_staged_chunks() {
        let f = fixture(Duration::ZERO).await;
        let task = running_task(&f.db).await;
        let parts = split(&json!({"id": task.id, "output": {}}), 2);
        f.buffer.receive(upload(task.id, 0, 2, &parts[0], false)).await.unwrap();
        f.buffer.receive(upload(task.id, 1, 2, &parts[1], true)).await.unwrap();

        let removed = f.buffer.sweep_due_cleanups().await.unwrap();
        assert_eq!(removed, 2);
        assert!(f.objects.keys_with_prefix("wizard-chunks/").await.is_empty());
        // Ledger entry consumed.
        assert_eq!(f.buffer.sweep_due_cleanups().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_late_chunk_reschedules_cleanup() {
        let f = fixture(Duration::from_secs(60)).await;
        let task = running_task(&f.db).await;
        let parts = split(&json!({"id": task.id, "output": {}}), 2);
        f.buffer.receive(upload(task.id, 0, 2, &parts[0], false)).await.unwrap();
        f.buffer.receive(upload(task.id, 1, 2, &parts[1], true)).await.unwrap();

        // Retransmitted after completion: stored, ingestion not repeated.
        let late = f.buffer.receive(upload(task.id, 0, 2, &parts[0], false)).await.unwrap();
        assert!(matches!(late, ChunkReceipt::Stored { .. }));
        let entry = f
            .db
            .get_expiring(CLEANUP_KIND, &task.id.to_string(), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry["total_chunks"], 2);
    }

    #[tokio::test]
    async fn test_abandoned_upload_is_cleaned_up() {
        let f = fixture(Duration::ZERO).await;
        let task = running_task(&f.db).await;
        let parts = split(&json!({"id": task.id, "output": {}}), 3);
        f.buffer.receive(upload(task.id, 0, 3, &parts[0], false)).await.unwrap();
        f.buffer.receive(upload(task.id, 1, 3, &parts[1], false)).await.unwrap();

        // The final chunk never arrives.
        f.buffer.sweep_due_cleanups().await.unwrap();
        assert!(f.objects.keys_with_prefix("wizard-chunks/").await.is_empty());
        assert_eq!(
            f.db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_chunk_after_sweep_is_rescheduled() {
        let f = fixture(Duration::ZERO).await;
        let task = running_task(&f.db).await;
        let parts = split(&json!({"id": task.id, "output": {}}), 2);
        f.buffer.receive(upload(task.id, 0, 2, &parts[0], false)).await.unwrap();
        f.buffer.receive(upload(task.id, 1, 2, &parts[1], true)).await.unwrap();
        f.buffer.sweep_due_cleanups().await.unwrap();

        f.buffer.receive(upload(task.id, 0, 2, &parts[0], false)).await.unwrap();
        assert_eq!(f.objects.keys_with_prefix("wizard-chunks/").await.len(), 1);
        f.buffer.sweep_due_cleanups().await.unwrap();
        assert!(f.objects.keys_with_prefix("wizard-chunks/").await.is_empty());
    }
}
