//! Integration tests for the WebSocket event stream.
//!
//! These tests connect renderer clients to a real server and check that
//! session lifecycle, narration and grading events reach them in order.

use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use mathcoach_session::{
    create_router, spawn_demo_driver, AppState, CompletionMethod, Config, DemoTiming,
    NarrationKind, SessionEvent, ToolCompletion, ToolType,
};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

/// Helper type for WebSocket client
type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawns the test server and returns its HTTP and WebSocket base URLs.
async fn spawn_test_server(state: AppState) -> (String, String) {
    spawn_demo_driver(state.controller.clone(), state.wake.clone());
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    (format!("http://{addr}"), format!("ws://{addr}/ws"))
}

fn fast_state() -> AppState {
    AppState::new(Config {
        demo: DemoTiming::uniform(20),
        ..Config::default()
    })
}

/// Connects a WebSocket client to the given URL.
async fn connect_client(url: &str) -> WsClient {
    let (ws_stream, _) = connect_async(url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Receives the next text message and parses it as a `SessionEvent`.
/// Answers ping frames along the way.
async fn receive_event(client: &mut WsClient) -> SessionEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) => {}
            other => panic!("Expected text message, got: {other:?}"),
        }
    }
}

/// Reads events until one named `name` arrives, returning everything read.
async fn receive_until(client: &mut WsClient, name: &str) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = receive_event(client).await;
        let done = event.event_name() == name;
        events.push(event);
        if done {
            return events;
        }
    }
}

async fn activate(base_url: &str, props: serde_json::Value) {
    let status = reqwest::Client::new()
        .post(format!("{base_url}/api/session"))
        .json(&json!({ "props": props }))
        .send()
        .await
        .expect("Request failed")
        .status();
    assert!(status.is_success(), "activation failed: {status}");
}

// ============================================================================
// Connection Tests
// ============================================================================

/// A client receives a connected event without a session.
#[tokio::test]
async fn test_connected_event_without_session() {
    let (_, ws_url) = spawn_test_server(fast_state()).await;

    let mut client = connect_client(&ws_url).await;
    match receive_event(&mut client).await {
        SessionEvent::Connected(payload) => assert!(payload.session.is_none()),
        other => panic!("Expected Connected event, got: {other:?}"),
    }
}

/// A late client receives the current snapshot on connect.
#[tokio::test]
async fn test_connected_event_contains_snapshot() {
    let (base_url, ws_url) = spawn_test_server(fast_state()).await;
    activate(&base_url, json!({ "tool": "practice_problem", "problem": "7 + 4" })).await;

    let mut client = connect_client(&ws_url).await;
    match receive_event(&mut client).await {
        SessionEvent::Connected(payload) => {
            let snapshot = payload.session.expect("Expected a snapshot");
            assert_eq!(snapshot.tool_type, ToolType::PracticeProblem);
            assert!(!snapshot.completed);
        }
        other => panic!("Expected Connected event, got: {other:?}"),
    }
}

// ============================================================================
// Event Broadcast Tests
// ============================================================================

/// A demonstration streams its narration and then completes.
#[tokio::test]
async fn test_demo_narration_streamed() {
    let (base_url, ws_url) = spawn_test_server(fast_state()).await;
    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await;

    activate(
        &base_url,
        json!({ "tool": "demonstrate_number_line", "problem": "4 + 2" }),
    )
    .await;

    let events = receive_until(&mut client, "completed").await;
    let names: Vec<_> = events.iter().map(SessionEvent::event_name).collect();
    assert_eq!(
        names,
        [
            "session_activated",
            "narration",
            "narration",
            "narration",
            "narration",
            "completed"
        ]
    );

    let kinds: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Narration(narration) => Some(narration.kind),
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        [
            NarrationKind::Start,
            NarrationKind::Step,
            NarrationKind::Step,
            NarrationKind::Complete
        ]
    );

    let Some(SessionEvent::Completed(completion)) = events.last() else {
        panic!("Expected Completed event");
    };
    assert_eq!(completion.answer, Some(6.0));
    assert_eq!(completion.narrations.len(), 4);

    let summary = ToolCompletion::parse(&completion.summary).expect("Unparseable summary");
    assert_eq!(summary.method, CompletionMethod::NumberLine);
    assert_eq!(summary.answer, 6.0);
    assert_eq!(summary.problem, "4 + 2");
}

/// Grading results reach every connected client.
#[tokio::test]
async fn test_validated_event_broadcast_to_all_clients() {
    let (base_url, ws_url) = spawn_test_server(fast_state()).await;
    let mut client1 = connect_client(&ws_url).await;
    let mut client2 = connect_client(&ws_url).await;
    receive_event(&mut client1).await;
    receive_event(&mut client2).await;

    activate(&base_url, json!({ "tool": "number_line", "problem": "5 + 3" })).await;
    reqwest::Client::new()
        .post(format!("{base_url}/api/session/events"))
        .json(&json!({ "type": "number_clicked", "number": 5 }))
        .send()
        .await
        .expect("Request failed");

    for client in [&mut client1, &mut client2] {
        let events = receive_until(client, "validated").await;
        let Some(SessionEvent::Validated(payload)) = events.last() else {
            panic!("Expected Validated event");
        };
        assert!(payload.result.is_correct);
        assert_eq!(payload.result.remaining_steps, Some(3));
    }
}

/// Closing the session is announced.
#[tokio::test]
async fn test_session_closed_event() {
    let (base_url, ws_url) = spawn_test_server(fast_state()).await;
    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await;

    activate(&base_url, json!({ "tool": "calculator" })).await;
    reqwest::Client::new()
        .delete(format!("{base_url}/api/session"))
        .send()
        .await
        .expect("Request failed");

    let events = receive_until(&mut client, "session_closed").await;
    let Some(SessionEvent::SessionClosed(payload)) = events.last() else {
        panic!("Expected SessionClosed event");
    };
    assert_eq!(payload.tool_type, ToolType::Calculator);
}

// ============================================================================
// Disconnection Tests
// ============================================================================

/// The server keeps serving after a client disconnects.
#[tokio::test]
async fn test_server_continues_after_client_disconnect() {
    let (base_url, ws_url) = spawn_test_server(fast_state()).await;

    let mut client1 = connect_client(&ws_url).await;
    receive_event(&mut client1).await;
    client1.close(None).await.expect("Failed to close");
    drop(client1);

    let mut client2 = connect_client(&ws_url).await;
    receive_event(&mut client2).await;
    activate(&base_url, json!({ "tool": "calculator" })).await;

    let event = receive_event(&mut client2).await;
    assert_eq!(event.event_name(), "session_activated");
}
