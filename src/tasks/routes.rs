//! HTTP surface: worker-facing internal endpoints plus the task admin API.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Query, Request, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, error};
use uuid::Uuid;

use super::callback::CallbackIngestor;
use super::chunks::ChunkBuffer;
use super::dispatch::Dispatcher;
use super::model::{ChunkUpload, NewTask, TaskCallback};
use super::service::TaskService;
use crate::error::TaskError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<TaskService>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingestor: Arc<CallbackIngestor>,
    pub chunks: Arc<ChunkBuffer>,
}

/// Build the Axum router with worker and admin routes.
///
/// CORS applies to the admin API only; workers call the internal routes
/// server-to-server.
pub fn task_routes(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/v1/tasks/{id}/cancel", post(cancel_task))
        .route("/api/v1/tasks/{id}/rerun", post(rerun_task))
        .route("/api/v1/namespaces/{namespace_id}/tasks", get(list_tasks))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/health", get(health))
        .route("/internal/api/v1/tasks/fetch", get(fetch_task))
        .route("/internal/api/v1/tasks/callback", post(task_callback))
        .route("/internal/api/v1/wizard/callback/chunk", post(chunk_callback))
        .merge(admin)
        .with_state(state)
}

/// JSON body whose rejection renders as a `VALIDATION_ERROR`.
struct ValidJson<T>(T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = TaskError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(validation_rejection(rejection)),
        }
    }
}

fn validation_rejection(rejection: JsonRejection) -> TaskError {
    TaskError::Validation(rejection.body_text())
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = match &self {
            TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskError::Validation(_) | TaskError::IncompleteChunks { .. } => {
                StatusCode::BAD_REQUEST
            }
            TaskError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TaskError::Storage(_) | TaskError::Database(_) => {
                error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(json!({"code": self.code(), "error": self.to_string()})),
        )
            .into_response()
    }
}

fn parse_task_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": "INVALID_TASK_ID", "error": format!("Invalid task ID: {id}")})),
        )
            .into_response()
    })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "taskhub"
    }))
}

// ── Worker endpoints ────────────────────────────────────────────────────

async fn fetch_task(State(state): State<AppState>) -> Response {
    match state.dispatcher.fetch().await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn task_callback(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<TaskCallback>,
) -> Response {
    match state.ingestor.handle(body).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn chunk_callback(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<ChunkUpload>,
) -> Response {
    debug!(
        task_id = %body.id,
        chunk_index = body.chunk_index,
        total_chunks = body.total_chunks,
        "Chunk received"
    );
    match state.chunks.receive(body).await {
        Ok(receipt) => Json(receipt.into_body()).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Admin endpoints ─────────────────────────────────────────────────────

async fn create_task(State(state): State<AppState>, ValidJson(body): ValidJson<NewTask>) -> Response {
    match state.tasks.create(body).await {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.tasks.get(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.tasks.soft_delete(id).await {
        Ok(()) => Json(json!({"detail": "Task deleted"})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.tasks.cancel(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn rerun_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.tasks.rerun(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: u64,
    limit: Option<u64>,
    #[serde(alias = "userId")]
    user_id: Option<String>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(namespace_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state
        .tasks
        .list(
            &namespace_id,
            query.offset,
            query.limit,
            query.user_id.as_deref(),
        )
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => e.into_response(),
    }
}
