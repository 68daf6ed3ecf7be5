//! Assembles the task services behind one handle.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::config::ServerConfig;
use crate::directory::{NamespaceDirectory, ResourceDirectory};
use crate::processors::ProcessorRegistry;
use crate::quota::QuotaPolicy;
use crate::store::{Database, LibSqlBackend, ObjectStore};
use crate::tasks::callback::CallbackIngestor;
use crate::tasks::chunks::{self, ChunkBuffer};
use crate::tasks::dispatch::Dispatcher;
use crate::tasks::emitter::TaskEmitter;
use crate::tasks::routes::{AppState, task_routes};
use crate::tasks::service::TaskService;

/// Core dependencies for the hub.
///
/// Bundles the shared components to reduce argument count.
pub struct HubDeps {
    pub db: Arc<dyn Database>,
    pub namespaces: Arc<dyn NamespaceDirectory>,
    pub resources: Arc<dyn ResourceDirectory>,
    pub objects: Arc<dyn ObjectStore>,
    pub quota: Arc<dyn QuotaPolicy>,
}

impl HubDeps {
    /// Use one libSQL backend for tasks, namespaces and resources.
    pub fn from_backend(
        backend: Arc<LibSqlBackend>,
        objects: Arc<dyn ObjectStore>,
        quota: Arc<dyn QuotaPolicy>,
    ) -> Self {
        Self {
            db: backend.clone(),
            namespaces: backend.clone(),
            resources: backend,
            objects,
            quota,
        }
    }
}

pub struct TaskHub {
    pub tasks: Arc<TaskService>,
    pub emitter: Arc<TaskEmitter>,
    pub processors: Arc<ProcessorRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingestor: Arc<CallbackIngestor>,
    pub chunks: Arc<ChunkBuffer>,
}

impl TaskHub {
    pub fn new(deps: HubDeps, config: &ServerConfig) -> Self {
        let tasks = Arc::new(TaskService::new(deps.db.clone(), deps.resources.clone()));
        let emitter = Arc::new(TaskEmitter::new(tasks.clone()));
        let processors = Arc::new(ProcessorRegistry::with_defaults(
            deps.resources.clone(),
            emitter.clone(),
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(deps.db.clone(), deps.namespaces, deps.quota)
                .with_scan_batch(config.dispatch_scan_batch),
        );
        let ingestor = Arc::new(CallbackIngestor::new(deps.db.clone(), processors.clone()));
        let chunks = Arc::new(
            ChunkBuffer::new(deps.db, deps.objects, ingestor.clone())
                .with_cleanup_delay(config.chunk_cleanup_delay),
        );

        Self {
            tasks,
            emitter,
            processors,
            dispatcher,
            ingestor,
            chunks,
        }
    }

    pub fn router(&self) -> Router {
        task_routes(AppState {
            tasks: self.tasks.clone(),
            dispatcher: self.dispatcher.clone(),
            ingestor: self.ingestor.clone(),
            chunks: self.chunks.clone(),
        })
    }

    /// Start the chunk cleanup sweeper.
    pub fn spawn_background(&self, sweep_interval: Duration) -> tokio::task::JoinHandle<()> {
        chunks::spawn_cleanup_sweeper(self.chunks.clone(), sweep_interval)
    }
}
