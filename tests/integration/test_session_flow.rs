//! Integration tests for the session HTTP API.
//!
//! Each test starts a real server with fast demo pacing and drives it over
//! HTTP the way the tutor agent and tool renderer do.

use std::time::Duration;

use mathcoach_session::{
    create_router, spawn_demo_driver, AppState, ChatMessage, Config, DemoTiming,
};
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Server handle returned by [`spawn_test_server`].
struct TestServer {
    base_url: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .expect("Request failed");
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .expect("Request failed");
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .delete(format!("{}{path}", self.base_url))
            .send()
            .await
            .expect("Request failed");
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn click(&self, number: i64) -> Value {
        let (status, body) = self
            .post(
                "/api/session/events",
                json!({ "type": "number_clicked", "number": number }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "click {number}: {body}");
        body
    }

    /// Polls the snapshot until `predicate` holds or five seconds pass.
    async fn wait_for(&self, predicate: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (_, snapshot) = self.get("/api/session").await;
            if predicate(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting, last snapshot: {snapshot}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn fast_config() -> Config {
    Config {
        demo: DemoTiming::uniform(20),
        ..Config::default()
    }
}

/// Spawns the server with its demo driver on a free port.
async fn spawn_test_server(config: Config) -> TestServer {
    let state = AppState::new(config);
    spawn_demo_driver(state.controller.clone(), state.wake.clone());
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
    }
}

// ============================================================================
// Number Line Tests
// ============================================================================

/// Walks a full addition problem and checks the session completes.
#[tokio::test]
async fn test_number_line_walk_completes_session() {
    let server = spawn_test_server(fast_config()).await;
    let (status, _) = server
        .post(
            "/api/session",
            json!({ "props": { "tool": "number_line", "problem": "5 + 3" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let body = server.click(5).await;
    assert_eq!(body["result"]["remaining_steps"], 3);

    let body = server.click(6).await;
    assert_eq!(body["result"]["result"], "correct");
    assert_eq!(body["result"]["remaining_steps"], 2);

    server.click(7).await;
    let body = server.click(8).await;
    assert_eq!(body["result"]["problem_completed"], true);
    assert_eq!(body["result"]["final_answer"], 8);

    let (_, snapshot) = server.get("/api/session").await;
    assert_eq!(snapshot["completed"], true);
    assert_eq!(snapshot["acceptedSteps"], json!([5, 6, 7, 8]));

    // Clicks after completion are ignored
    let body = server.click(9).await;
    assert_eq!(body["accepted"], false);
}

/// A skipped step is graded incorrect and not recorded.
#[tokio::test]
async fn test_number_line_skip_rejected() {
    let server = spawn_test_server(fast_config()).await;
    server
        .post(
            "/api/session",
            json!({ "props": { "tool": "number_line", "problem": "5 - 3" } }),
        )
        .await;

    server.click(5).await;
    let body = server.click(3).await;
    assert_eq!(body["result"]["is_correct"], false);

    let (_, snapshot) = server.get("/api/session").await;
    assert_eq!(snapshot["acceptedSteps"], json!([5]));
}

// ============================================================================
// Practice & Calculator Tests
// ============================================================================

/// A wrong answer reveals the correct one; a right answer completes.
#[tokio::test]
async fn test_practice_problem_flow() {
    let server = spawn_test_server(fast_config()).await;
    server
        .post(
            "/api/session",
            json!({ "props": { "tool": "practice_problem", "problem": "12 ÷ 4 = ?" } }),
        )
        .await;

    let (_, body) = server
        .post(
            "/api/session/events",
            json!({ "type": "answer_checked", "answer": "8" }),
        )
        .await;
    assert_eq!(body["result"]["result"], "incorrect");
    assert_eq!(body["result"]["correct_answer"], 3.0);

    let (_, body) = server
        .post(
            "/api/session/events",
            json!({ "type": "answer_checked", "answer": " 3 " }),
        )
        .await;
    assert_eq!(body["result"]["is_correct"], true);

    let (_, snapshot) = server.get("/api/session").await;
    assert_eq!(snapshot["completed"], true);
    assert_eq!(snapshot["attempts"], 2);
}

/// The sixth answer inside the window is rejected.
#[tokio::test]
async fn test_practice_rate_limit() {
    let server = spawn_test_server(fast_config()).await;
    server
        .post(
            "/api/session",
            json!({ "props": { "tool": "practice_problem", "problem": "7 + 4" } }),
        )
        .await;

    for guess in 1..=5 {
        let (status, _) = server
            .post(
                "/api/session/events",
                json!({ "type": "answer_checked", "answer": guess.to_string() }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = server
        .post(
            "/api/session/events",
            json!({ "type": "answer_checked", "answer": "11" }),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap_or_default().contains("Rate limit"));
}

/// A calculator result completes the calculator session.
#[tokio::test]
async fn test_calculator_completes() {
    let server = spawn_test_server(fast_config()).await;
    server
        .post("/api/session", json!({ "props": { "tool": "calculator" } }))
        .await;

    let (status, body) = server
        .post(
            "/api/session/events",
            json!({ "type": "expression_evaluated", "expression": "6 × 7", "result": 42.0 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["is_correct"], true);

    let (_, snapshot) = server.get("/api/session").await;
    assert_eq!(snapshot["completed"], true);
}

// ============================================================================
// Demonstration Tests
// ============================================================================

/// A demonstration runs to completion on its own.
#[tokio::test]
async fn test_demo_runs_to_completion() {
    let server = spawn_test_server(fast_config()).await;
    let (status, _) = server
        .post(
            "/api/session",
            json!({ "props": { "tool": "demonstrate_number_line", "problem": "4 + 2" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let snapshot = server.wait_for(|s| s["completed"] == true).await;
    assert_eq!(snapshot["toolType"], "demonstrate_number_line");
    // The finished run is discarded
    assert!(snapshot.get("demo").is_none());
}

/// A question pauses the demonstration and "continue" resumes it.
#[tokio::test]
async fn test_demo_interrupted_by_question() {
    let server = spawn_test_server(Config {
        demo: DemoTiming::uniform(200),
        ..Config::default()
    })
    .await;
    server
        .post(
            "/api/session",
            json!({ "props": { "tool": "demonstrate_number_line", "problem": "3 + 4" } }),
        )
        .await;

    let question = ChatMessage::user("u1", "Why do we go to the right?");
    let (_, body) = server
        .post("/api/transcript", json!({ "messages": [question] }))
        .await;
    assert_eq!(body["interruptions"][0]["action"], "pause");

    let paused = server.wait_for(|s| s["demo"]["status"] == "paused").await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    let (_, still) = server.get("/api/session").await;
    assert_eq!(still["demo"]["currentStep"], paused["demo"]["currentStep"]);

    // The same transcript is re-sent with the new message appended
    let resume = ChatMessage::user("u2", "ok, continue");
    let (_, body) = server
        .post("/api/transcript", json!({ "messages": [question, resume] }))
        .await;
    assert_eq!(body["interruptions"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["interruptions"][0]["action"], "resume");

    let done = server.wait_for(|s| s["completed"] == true).await;
    assert!(done.get("demo").is_none());
}

/// A malformed demonstration is refused and the open tool stays.
#[tokio::test]
async fn test_malformed_demo_rejected() {
    let server = spawn_test_server(fast_config()).await;
    server
        .post("/api/session", json!({ "props": { "tool": "calculator" } }))
        .await;

    let (status, _) = server
        .post(
            "/api/session",
            json!({ "props": { "tool": "demonstrate_number_line", "problem": "four plus two" } }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, snapshot) = server.get("/api/session").await;
    assert_eq!(snapshot["toolType"], "calculator");
}

/// Closing a running demonstration stops it.
#[tokio::test]
async fn test_close_stops_demo() {
    let server = spawn_test_server(fast_config()).await;
    server
        .post(
            "/api/session",
            json!({ "props": { "tool": "demonstrate_number_line", "problem": "2 + 9" } }),
        )
        .await;

    let (_, body) = server.delete("/api/session").await;
    assert_eq!(body["closed"], true);

    let (status, _) = server.get("/api/session").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// The health endpoint answers.
#[tokio::test]
async fn test_health() {
    let server = spawn_test_server(fast_config()).await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
