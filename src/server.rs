use crate::broadcast;
use crate::control::ControlPlane;
use crate::errors::AppError;
use crate::models::{
    CreateAutomationPayload, CreateCommentPayload, CreateThreadPayload, RerunFromCommentsPayload,
    RunControlPayload, StartRunPayload, StreamEnvelope, ToggleAutomationPayload,
};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
}

pub fn build_router(plane: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/threads", get(list_threads).post(create_thread))
        .route("/threads/{id}/events", get(thread_events))
        .route("/threads/{id}/runs", post(start_run))
        .route("/threads/{id}/diff", get(thread_diff))
        .route(
            "/threads/{id}/comments",
            get(list_comments).post(create_comment),
        )
        .route("/threads/{id}/rerun-from-comments", post(rerun_from_comments))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/control", post(control_run))
        .route("/automations", get(list_automations).post(create_automation))
        .route("/automations/{id}/toggle", post(toggle_automation))
        .route("/automations/{id}/run-now", post(run_automation_now))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(AppState { plane })
}

/// AppError mapped onto the documented status codes: 400 input, 404 missing,
/// 409 illegal transition, 500 everything else.
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::Input(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Worktree(_) | AppError::Io(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn list_threads(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.plane.list_threads()?))
}

async fn create_thread(
    State(state): State<AppState>,
    Json(payload): Json<CreateThreadPayload>,
) -> ApiResult<impl IntoResponse> {
    let thread = state.plane.create_thread(payload).await?;
    Ok((StatusCode::CREATED, Json(thread)))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<u32>,
}

async fn thread_events(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.plane.thread_events(&thread_id, query.limit)?))
}

async fn start_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<StartRunPayload>,
) -> ApiResult<impl IntoResponse> {
    let run = state.plane.start_run(&thread_id, payload)?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn thread_diff(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(state.plane.thread_diff(&thread_id).await?)
}

async fn list_comments(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.plane.list_comments(&thread_id)?))
}

async fn create_comment(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<CreateCommentPayload>,
) -> ApiResult<impl IntoResponse> {
    let comment = state.plane.create_comment(&thread_id, payload)?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn rerun_from_comments(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<RerunFromCommentsPayload>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .plane
        .rerun_from_comments(&thread_id, &payload.comment_ids)?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.plane.get_run(&run_id)?))
}

async fn control_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(payload): Json<RunControlPayload>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.plane.control_run(&run_id, payload.action)?))
}

async fn list_automations(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.plane.list_automations()?))
}

async fn create_automation(
    State(state): State<AppState>,
    Json(payload): Json<CreateAutomationPayload>,
) -> ApiResult<impl IntoResponse> {
    let automation = state.plane.create_automation(payload)?;
    Ok((StatusCode::CREATED, Json(automation)))
}

async fn toggle_automation(
    State(state): State<AppState>,
    Path(automation_id): Path<String>,
    Json(payload): Json<ToggleAutomationPayload>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.plane.toggle_automation(&automation_id, payload.enabled)?,
    ))
}

async fn run_automation_now(
    State(state): State<AppState>,
    Path(automation_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = state.plane.trigger_automation_now(&automation_id)?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The live stream is server-to-client only: forward each journal append
/// until the subscriber drops or the plane shuts down.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let connected = StreamEnvelope::System {
        message: "connected".to_string(),
        missed: None,
    };
    if send_frame(&mut socket, &connected).await.is_err() {
        return;
    }

    let mut receiver = state.plane.broadcaster().subscribe();
    while let Some(frame) = broadcast::next_frame(&mut receiver).await {
        if send_frame(&mut socket, &frame).await.is_err() {
            break;
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamEnvelope) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text.into())).await
}
