//! WebSocket event stream for tool renderers.
//!
//! Every state change the renderer cares about is broadcast as a JSON frame
//! of the form `{"event": "<name>", "payload": {...}}`.
//!
//! # Event Types
//!
//! - `connected` - Sent when a client connects, includes the current snapshot
//! - `session_activated` - A tool session was installed
//! - `narration` - One line of demonstration narration
//! - `validated` - A learner action was graded
//! - `interrupted` - A chat message paused or resumed the demonstration
//! - `completed` - A session completed
//! - `session_closed` - The session was closed
//! - `error` - A request failed
//!
//! # Example
//!
//! ```no_run
//! use mathcoach_session::events::{EventBroadcaster, SessionEvent};
//!
//! # async fn example() {
//! let broadcaster = EventBroadcaster::new(100);
//! let mut receiver = broadcaster.subscribe();
//!
//! broadcaster.send(SessionEvent::error("grading timed out"));
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {}", event.event_name());
//! }
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::demo::Narration;
use crate::interruption::Interruption;
use crate::session::{Completion, SessionId, SessionSnapshot, ToolType};
use crate::validation::ValidationResult;

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// The active session, if any.
    pub session: Option<SessionSnapshot>,
}

/// Payload for the `session_activated` and `session_closed` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// The session concerned.
    pub session: SessionId,
    /// Its tool type.
    pub tool_type: ToolType,
}

/// Payload for the `validated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedPayload {
    /// The graded session.
    pub session: SessionId,
    /// The verdict.
    pub result: ValidationResult,
}

/// Payload for the `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Events pushed to connected renderers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Sent when a client connects.
    Connected(ConnectedPayload),
    /// A tool session was installed.
    SessionActivated(SessionPayload),
    /// A demonstration narration line.
    Narration(Narration),
    /// A learner action was graded.
    Validated(ValidatedPayload),
    /// An interruption was applied.
    Interrupted(Interruption),
    /// A session completed.
    Completed(Completion),
    /// The session was closed.
    SessionClosed(SessionPayload),
    /// A request failed.
    Error(ErrorPayload),
}

impl SessionEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub const fn connected(session: Option<SessionSnapshot>) -> Self {
        Self::Connected(ConnectedPayload { session })
    }

    /// Creates a `SessionActivated` event.
    #[must_use]
    pub const fn session_activated(session: SessionId, tool_type: ToolType) -> Self {
        Self::SessionActivated(SessionPayload { session, tool_type })
    }

    /// Creates a `SessionClosed` event.
    #[must_use]
    pub const fn session_closed(session: SessionId, tool_type: ToolType) -> Self {
        Self::SessionClosed(SessionPayload { session, tool_type })
    }

    /// Creates a `Validated` event.
    #[must_use]
    pub const fn validated(session: SessionId, result: ValidationResult) -> Self {
        Self::Validated(ValidatedPayload { session, result })
    }

    /// Creates an `Error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::SessionActivated(_) => "session_activated",
            Self::Narration(_) => "narration",
            Self::Validated(_) => "validated",
            Self::Interrupted(_) => "interrupted",
            Self::Completed(_) => "completed",
            Self::SessionClosed(_) => "session_closed",
            Self::Error(_) => "error",
        }
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Broadcasts session events to all connected WebSocket clients.
///
/// Events are not persisted for disconnected clients.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster buffering `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber.
    ///
    /// A subscriber that falls behind receives `Lagged` and misses events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event, returning how many subscribers will receive it.
    pub fn send(&self, event: SessionEvent) -> usize {
        // Err only means nobody is listening
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

/// Interval between heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("New WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handles a single WebSocket connection.
///
/// - Sends `connected` with the current snapshot immediately
/// - Forwards every broadcast event
/// - Pings every 30 seconds and closes after 3 missed pongs
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the snapshot so nothing falls in between
    let mut event_receiver = state.broadcaster.subscribe();
    let snapshot = state.controller.lock().await.snapshot();

    let connected_json = match serde_json::to_string(&SessionEvent::connected(snapshot)) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize connected event: {}", e);
            return;
        }
    };
    if sender.send(Message::Text(connected_json)).await.is_err() {
        debug!("Client disconnected before receiving connected event");
        return;
    }
    info!(
        clients = state.broadcaster.receiver_count(),
        "WebSocket client connected, sent current snapshot"
    );

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    // The first tick completes immediately
    heartbeat.tick().await;
    let mut missed_pongs = 0u8;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested close");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            debug!("Failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("Ignoring data frame from client");
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }

            event = event_receiver.recv() => {
                match event {
                    Ok(session_event) => {
                        let json = match serde_json::to_string(&session_event) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!("Failed to serialize {} event: {}", session_event.event_name(), e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            debug!("Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcaster closed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    debug!("Failed to send ping, client disconnected");
                    break;
                }
                missed_pongs += 1;
                if missed_pongs >= MAX_MISSED_PONGS {
                    info!("Client missed {} pongs, closing connection", MAX_MISSED_PONGS);
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

// ============================================================================
// Tests
// ============================================================================
