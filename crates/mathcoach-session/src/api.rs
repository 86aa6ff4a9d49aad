//! HTTP API for the MathCoach session controller.
//!
//! The tutor agent activates and closes tools and streams the chat
//! transcript; the tool renderer reports learner actions and subscribes to
//! `/ws` for everything that happens as a result.
//!
//! # Endpoints
//!
//! - `POST /api/session` - Activate a tool session
//! - `GET /api/session` - Get the current session snapshot
//! - `DELETE /api/session` - Close the current session
//! - `POST /api/session/chat-blocked` - Set the advisory chat-blocked flag
//! - `POST /api/session/events` - Report a learner action for grading
//! - `POST /api/transcript` - Feed chat messages to the interruption detector
//! - `POST /api/demo/pause` - Pause the demonstration
//! - `POST /api/demo/resume` - Resume the demonstration
//! - `GET /ws` - Event stream
//! - `GET /health` - Liveness check
//!
//! # Example
//!
//! ```no_run
//! use mathcoach_session::{create_router, spawn_demo_driver, AppState, Config};
//!
//! # async fn example() {
//! let state = AppState::new(Config::default());
//! let _driver = spawn_demo_driver(state.controller.clone(), state.wake.clone());
//!
//! let router = create_router(state);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//! axum::serve(listener, router).await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::demo::Narration;
use crate::driver::now;
use crate::error::MathCoachError;
use crate::events::{ws_handler, EventBroadcaster, SessionEvent};
use crate::interruption::{ChatMessage, Interruption};
use crate::session::{
    Completion, SessionController, SessionId, SessionSnapshot, ToolEvent, ToolProps,
};
use crate::validation::{GradingRequest, ValidationEngine, ValidationResult};
use crate::Config;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for the activation endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    /// Which tool to open and with what problem.
    pub props: ToolProps,
    /// Initial value of the chat-blocked flag.
    #[serde(default)]
    pub chat_blocked: bool,
}

/// Response body for the activation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    /// Id of the new session.
    pub session_id: SessionId,
}

/// Response body for the close endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResponse {
    /// Whether a session was open.
    pub closed: bool,
}

/// Request body for the chat-blocked endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatBlockedRequest {
    /// New flag value.
    pub blocked: bool,
}

/// Response body for the events endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    /// Whether the event was graded. `false` when it was ignored.
    pub accepted: bool,
    /// The verdict, for accepted events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ValidationResult>,
}

/// Request body for the transcript endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptRequest {
    /// Transcript messages, oldest first. Already-seen ids are skipped.
    pub messages: Vec<ChatMessage>,
}

/// Response body for the transcript endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResponse {
    /// Interruptions that paused or resumed the demonstration.
    pub interruptions: Vec<Interruption>,
}

/// Request body for the pause endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PauseRequest {
    /// Why the demonstration is paused, usually the learner's question.
    #[serde(default)]
    pub reason: String,
}

/// Response body for the pause and resume endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoControlResponse {
    /// Whether the player changed state.
    pub changed: bool,
    /// The narration produced by the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<Narration>,
}

/// Response body for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Connected event stream clients.
    pub clients: usize,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The session controller.
    pub controller: Arc<Mutex<SessionController>>,
    /// Fan-out to WebSocket clients.
    pub broadcaster: EventBroadcaster,
    /// Wakes the demo driver after a state change.
    pub wake: Arc<Notify>,
}

impl AppState {
    /// Creates a new `AppState` with no active session.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            controller: Arc::new(Mutex::new(SessionController::new(&config))),
            broadcaster: EventBroadcaster::new(config.event_buffer),
            wake: Arc::new(Notify::new()),
            config,
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Internal error type for API handlers.
#[derive(Debug)]
struct ApiError(MathCoachError);

impl From<MathCoachError> for ApiError {
    fn from(err: MathCoachError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MathCoachError::NoActiveSession => StatusCode::NOT_FOUND,
            MathCoachError::WrongTool { .. } => StatusCode::CONFLICT,
            MathCoachError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            MathCoachError::MalformedProblem { .. } | MathCoachError::InvalidInput { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            MathCoachError::ValidationBackendFailure { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all endpoints.
///
/// The demo driver is not started here; spawn it with
/// [`crate::spawn_demo_driver`] on the same state.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/session",
            post(handle_activate)
                .get(handle_snapshot)
                .delete(handle_close),
        )
        .route("/session/chat-blocked", post(handle_chat_blocked))
        .route("/session/events", post(handle_event))
        .route("/transcript", post(handle_transcript))
        .route("/demo/pause", post(handle_pause))
        .route("/demo/resume", post(handle_resume));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `POST /api/session`.
///
/// Installs the session and wires its callbacks to the event stream.
async fn handle_activate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<ActivateResponse>, ApiError> {
    let tool_type = request.props.tool_type();
    info!(tool = %tool_type, problem = ?request.props.problem(), "Activation requested");

    let on_complete = {
        let broadcaster = state.broadcaster.clone();
        Box::new(move |completion: Completion| {
            info!(session = %completion.session, summary = %completion.summary, "Session completed");
            broadcaster.send(SessionEvent::Completed(completion));
        })
    };
    let on_narration = {
        let broadcaster = state.broadcaster.clone();
        Box::new(move |narration: &Narration| {
            broadcaster.send(SessionEvent::Narration(narration.clone()));
        })
    };

    let mut controller = state.controller.lock().await;
    let session_id = controller
        .activate(request.props, on_complete, Some(on_narration), now())
        .map_err(|e| {
            warn!(error = %e, "Activation rejected");
            ApiError::from(e)
        })?;
    if request.chat_blocked {
        controller.set_chat_blocked(true)?;
    }
    // Announced under the lock so it precedes the first narration
    state
        .broadcaster
        .send(SessionEvent::session_activated(session_id, tool_type));
    drop(controller);
    state.wake.notify_one();

    Ok(Json(ActivateResponse { session_id }))
}

/// Handler for `GET /api/session`.
async fn handle_snapshot(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let snapshot = state.controller.lock().await.snapshot();
    snapshot
        .map(Json)
        .ok_or(ApiError(MathCoachError::NoActiveSession))
}

/// Handler for `DELETE /api/session`.
async fn handle_close(State(state): State<Arc<AppState>>) -> Json<CloseResponse> {
    let mut controller = state.controller.lock().await;
    let closing = controller
        .session()
        .map(|session| (session.id, session.tool_type()));
    let closed = controller.close();
    drop(controller);

    if let Some((session, tool_type)) = closing {
        state.wake.notify_one();
        state
            .broadcaster
            .send(SessionEvent::session_closed(session, tool_type));
    }
    Json(CloseResponse { closed })
}

/// Handler for `POST /api/session/chat-blocked`.
async fn handle_chat_blocked(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatBlockedRequest>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let mut controller = state.controller.lock().await;
    controller.set_chat_blocked(request.blocked)?;
    controller
        .snapshot()
        .map(Json)
        .ok_or(ApiError(MathCoachError::NoActiveSession))
}

/// Handler for `POST /api/session/events`.
async fn handle_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ToolEvent>,
) -> Result<Json<EventResponse>, ApiError> {
    apply_event(&state, event, |engine, request| engine.grade(&request))
        .await
        .map(Json)
}

/// Grades one tool event and applies the verdict.
///
/// `grade` runs on a blocking task under the configured timeout, outside
/// the controller lock. A result whose session was replaced meanwhile is
/// dropped and reported as not accepted.
async fn apply_event<G>(state: &AppState, event: ToolEvent, grade: G) -> Result<EventResponse, ApiError>
where
    G: FnOnce(ValidationEngine, GradingRequest) -> crate::error::Result<ValidationResult>
        + Send
        + 'static,
{
    debug!(event = event.name(), "Tool event received");

    let (ticket, engine) = {
        let mut controller = state.controller.lock().await;
        let ticket = controller.begin_grading(event, now()).map_err(|e| {
            debug!(error = %e, "Event rejected");
            if e.is_learner_facing() {
                state.broadcaster.send(SessionEvent::error(e.to_string()));
            }
            ApiError::from(e)
        })?;
        (ticket, controller.engine())
    };
    let Some(ticket) = ticket else {
        return Ok(EventResponse {
            accepted: false,
            result: None,
        });
    };

    let request = ticket.request.clone();
    let outcome = match tokio::time::timeout(
        state.config.grading.timeout(),
        tokio::task::spawn_blocking(move || grade(engine, request)),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) => Err(MathCoachError::backend_failure(format!(
            "grading task failed: {join_error}"
        ))),
        Err(_) => Err(MathCoachError::backend_failure(format!(
            "grading timed out after {}ms",
            state.config.grading.timeout_ms
        ))),
    };

    let session = ticket.session;
    let finished = state.controller.lock().await.finish_grading(ticket, outcome);
    state.wake.notify_one();

    match finished {
        Ok(result) => {
            state
                .broadcaster
                .send(SessionEvent::validated(session, result.clone()));
            Ok(EventResponse {
                accepted: true,
                result: Some(result),
            })
        }
        Err(e) if e.is_silent() => Ok(EventResponse {
            accepted: false,
            result: None,
        }),
        Err(e) => {
            error!(error = %e, "Failed to apply grading result");
            Err(e.into())
        }
    }
}

/// Handler for `POST /api/transcript`.
async fn handle_transcript(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TranscriptRequest>,
) -> Json<TranscriptResponse> {
    debug!(messages = request.messages.len(), "Transcript received");

    let interruptions = state
        .controller
        .lock()
        .await
        .ingest(&request.messages, now());

    if !interruptions.is_empty() {
        state.wake.notify_one();
    }
    for interruption in &interruptions {
        state
            .broadcaster
            .send(SessionEvent::Interrupted(interruption.clone()));
    }
    Json(TranscriptResponse { interruptions })
}

/// Handler for `POST /api/demo/pause`.
async fn handle_pause(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PauseRequest>,
) -> Result<Json<DemoControlResponse>, ApiError> {
    info!(reason = %request.reason, "Pause requested");
    let narration = state.controller.lock().await.pause_demo(request.reason)?;
    state.wake.notify_one();
    Ok(Json(DemoControlResponse {
        changed: narration.is_some(),
        narration,
    }))
}

/// Handler for `POST /api/demo/resume`.
async fn handle_resume(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DemoControlResponse>, ApiError> {
    info!("Resume requested");
    let narration = state.controller.lock().await.resume_demo(now())?;
    state.wake.notify_one();
    Ok(Json(DemoControlResponse {
        changed: narration.is_some(),
        narration,
    }))
}

/// Handler for `GET /health`.
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        clients: state.broadcaster.receiver_count(),
    })
}

// ============================================================================
// Tests
// ============================================================================
