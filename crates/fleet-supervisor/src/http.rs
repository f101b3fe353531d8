//! HTTP surface for dashboards and tooling.
//!
//! Thin translation layer over the store, bus, and supervisor: every handler
//! calls one public operation and maps its result onto a status code. Push
//! notifications go out as SSE on `/v1/events`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use fleet_core::{
    Blocker, CoreError, MessageDraft, Priority, ProjectId, TaskId, TaskSpec, TaskStatus, WorkerId,
    WorkerKind,
};

use crate::bus::MessageBus;
use crate::metrics::collect_metrics;
use crate::store::TaskStore;
use crate::supervisor::Supervisor;

/// Shared handles behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub bus: Arc<MessageBus>,
    pub supervisor: Arc<Supervisor>,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// `CoreError` mapped onto an HTTP response.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            CoreError::TaskNotFound(_)
            | CoreError::WorkerNotFound(_)
            | CoreError::MessageNotFound(_)
            | CoreError::BlockerNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidTransition { .. }
            | CoreError::AlreadyRunning { .. }
            | CoreError::NotRunning(_) => StatusCode::CONFLICT,
            CoreError::UnknownWorkerKind(_) => StatusCode::BAD_REQUEST,
            CoreError::Worker(_) | CoreError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Build the router over the given handles.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/events", get(events))
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/metrics", get(task_metrics))
        .route("/v1/tasks/:id", get(get_task))
        .route("/v1/tasks/:id/status", post(update_task_status))
        .route("/v1/tasks/:id/assign", post(assign_task))
        .route("/v1/tasks/:id/can-start", get(can_start))
        .route("/v1/tasks/:id/blockers", post(add_blocker))
        .route("/v1/tasks/:id/blockers/:blocker_id", delete(remove_blocker))
        .route("/v1/workers", get(list_all_workers))
        .route("/v1/workers/health", get(worker_health))
        .route(
            "/v1/projects/:project/workers",
            post(launch_worker).get(list_project_workers),
        )
        .route("/v1/projects/:project/workers/:worker", get(worker_status))
        .route("/v1/projects/:project/workers/:worker/logs", get(worker_logs))
        .route("/v1/projects/:project/workers/:worker/stop", post(stop_worker))
        .route(
            "/v1/projects/:project/workers/:worker/restart",
            post(restart_worker),
        )
        .route(
            "/v1/projects/:project/workers/:worker/message",
            post(message_worker),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> String {
    collect_metrics(&state.store, &state.bus, &state.supervisor)
}

/// SSE stream merging the supervisor's outbound events with the task store's
/// mutation events.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let supervisor_events = BroadcastStream::new(state.supervisor.subscribe())
        .filter_map(|result| result.ok())
        .filter_map(|event| {
            Event::default()
                .event("supervisor")
                .json_data(&event)
                .ok()
        });
    let task_events = BroadcastStream::new(state.store.subscribe())
        .filter_map(|result| result.ok())
        .filter_map(|event| Event::default().event("task").json_data(&event).ok());

    let merged = supervisor_events.merge(task_events).map(Ok);
    Sse::new(merged).keep_alive(KeepAlive::default())
}

// --- tasks ---

#[derive(Debug, Deserialize)]
struct TaskQuery {
    project: Option<String>,
    status: Option<TaskStatus>,
    worker: Option<String>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(spec): Json<TaskSpec>,
) -> impl IntoResponse {
    let task = state.store.create_task(spec);
    (StatusCode::CREATED, Json(task))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> impl IntoResponse {
    let tasks = if let Some(worker) = query.worker {
        state.store.tasks_by_worker(&WorkerId::from(worker))
    } else if let Some(status) = query.status {
        state.store.tasks_by_status(status)
    } else if let Some(project) = query.project {
        state.store.project_tasks(&ProjectId::from(project))
    } else {
        state.store.all_tasks()
    };
    Json(tasks)
}

async fn task_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.metrics())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = TaskId::from(id);
    let task = state.store.task(&id).ok_or(CoreError::TaskNotFound(id))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct StatusUpdateRequest {
    status: TaskStatus,
    details: Option<String>,
}

async fn update_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.update_status(
        &TaskId::from(id),
        request.status,
        request.details.as_deref(),
    )?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    worker_id: WorkerId,
}

async fn assign_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.assign(&TaskId::from(id), &request.worker_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn can_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let can_start = state.store.can_start(&TaskId::from(id))?;
    Ok(Json(serde_json::json!({ "can_start": can_start })))
}

#[derive(Debug, Deserialize)]
struct BlockerRequest {
    description: String,
    #[serde(default)]
    kind: String,
}

async fn add_blocker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<BlockerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.add_blocker(
        &TaskId::from(id),
        Blocker::new(request.description, request.kind),
    )?;
    Ok(Json(task))
}

async fn remove_blocker(
    State(state): State<AppState>,
    Path((id, blocker_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .store
        .remove_blocker(&TaskId::from(id), &blocker_id.into())?;
    Ok(Json(task))
}

// --- workers ---

#[derive(Debug, Deserialize)]
struct LaunchRequest {
    kind: WorkerKind,
    #[serde(default)]
    config: Option<fleet_core::WorkerConfig>,
}

#[derive(Debug, Serialize)]
struct LaunchResponse {
    worker_id: WorkerId,
}

async fn launch_worker(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(request): Json<LaunchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = state.supervisor.launch(
        project.as_str(),
        request.kind,
        request.config.unwrap_or_default(),
    )?;
    info!(project = %project, worker_id = %worker_id, "Worker launched via HTTP");
    Ok((StatusCode::CREATED, Json(LaunchResponse { worker_id })))
}

async fn list_project_workers(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> impl IntoResponse {
    Json(state.supervisor.list_for_project(&ProjectId::from(project)))
}

async fn list_all_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.list_all())
}

async fn worker_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.health_check())
}

async fn worker_status(
    State(state): State<AppState>,
    Path((project, worker)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .supervisor
        .status(&ProjectId::from(project), &WorkerId::from(worker))?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    n: Option<usize>,
}

async fn worker_logs(
    State(state): State<AppState>,
    Path((project, worker)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state.supervisor.logs(
        &ProjectId::from(project),
        &WorkerId::from(worker),
        query.n.unwrap_or(100),
    )?;
    Ok(Json(logs))
}

async fn stop_worker(
    State(state): State<AppState>,
    Path((project, worker)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .supervisor
        .stop(&ProjectId::from(project), &WorkerId::from(worker))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_worker(
    State(state): State<AppState>,
    Path((project, worker)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = state
        .supervisor
        .restart(&ProjectId::from(project), &WorkerId::from(worker))
        .await?;
    Ok(Json(LaunchResponse { worker_id }))
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    from: WorkerId,
    kind: String,
    #[serde(default)]
    payload_json: String,
    #[serde(default)]
    priority: Priority,
}

async fn message_worker(
    State(state): State<AppState>,
    Path((project, worker)): Path<(String, String)>,
    Json(request): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = WorkerId::from(worker);
    let draft = MessageDraft::new(request.from, worker_id.clone(), request.kind)
        .with_payload(request.payload_json)
        .with_priority(request.priority);
    state
        .supervisor
        .send_message(&ProjectId::from(project), &worker_id, draft)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::worker::WorkerFactory;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(TaskStore::new()),
            bus: Arc::new(MessageBus::new()),
            supervisor: Supervisor::new(
                WorkerFactory::new(),
                None,
                None,
                SupervisorConfig::default(),
            ),
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_task_handlers() {
        let state = test_state();

        let response = create_task(
            State(state.clone()),
            Json(TaskSpec::new("demo", "Build X")),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let tasks = state.store.all_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);

        let fetched = get_task(State(state), Path(tasks[0].id.to_string())).await;
        assert!(fetched.is_ok());
    }

    #[tokio::test]
    async fn test_update_status_conflict_maps_to_409() {
        let state = test_state();
        let task = state.store.create_task(TaskSpec::new("demo", "Build X"));
        store_complete(&state, &task.id);

        let result = update_task_status(
            State(state),
            Path(task.id.to_string()),
            Json(StatusUpdateRequest {
                status: TaskStatus::InProgress,
                details: None,
            }),
        )
        .await;

        let response = result.err().expect("expected a conflict").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_launch_unknown_kind_maps_to_400() {
        let state = test_state();
        let result = launch_worker(
            State(state),
            Path("demo".to_string()),
            Json(LaunchRequest {
                kind: WorkerKind::Command,
                config: None,
            }),
        )
        .await;

        let response = result.err().expect("expected an error").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn store_complete(state: &AppState, id: &TaskId) {
        state
            .store
            .update_status(id, TaskStatus::InProgress, None)
            .unwrap();
        state
            .store
            .update_status(id, TaskStatus::Completed, None)
            .unwrap();
    }
}
