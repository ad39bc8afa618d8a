//! Integration tests for the approval REST surface.
//!
//! Each test spins up an Axum server on a random port over an in-memory
//! store and exercises the real HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use inbox_assist::approval::approval_routes;
use inbox_assist::config::EngineConfig;
use inbox_assist::pipeline::{LogOutbox, RulesClassifier, TemplateDrafter, WorkflowEngine};
use inbox_assist::store::LibSqlBackend;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start an Axum server on a random port, return its base URL.
async fn start_server() -> String {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let engine = Arc::new(WorkflowEngine::new(
        store,
        Arc::new(RulesClassifier::default_rules().unwrap()),
        Arc::new(TemplateDrafter::with_signature("Jane")),
        Arc::new(LogOutbox),
        EngineConfig::default(),
    ));
    let app = approval_routes(engine);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (u16, Value) {
    let resp = client.post(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn get(client: &reqwest::Client, url: String) -> (u16, Value) {
    let resp = client.get(url).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

fn question(id: &str) -> Value {
    json!({
        "id": id,
        "sender": "Alice <a@x.com>",
        "subject": "Lunch",
        "body": "Are you free on Friday?"
    })
}

#[tokio::test]
async fn health_check() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let (status, body) = get(&reqwest::Client::new(), format!("{base}/health")).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ingest_then_edit_resolves_once() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let (status, body) = post(&client, format!("{base}/api/messages"), question("m1")).await;
        assert_eq!(status, 201);
        assert_eq!(body["state"], "awaiting_approval");
        assert_eq!(body["label"], "respond");

        let (status, body) = post(&client, format!("{base}/api/messages"), question("m1")).await;
        assert_eq!(status, 200);
        assert_eq!(body["duplicate"], true);

        let (status, pending) = get(&client, format!("{base}/api/checkpoints")).await;
        assert_eq!(status, 200);
        assert_eq!(pending.as_array().unwrap().len(), 1);
        let draft = pending[0]["draft_text"].as_str().unwrap().to_string();
        assert!(draft.starts_with("Hi,"));

        let resolve_url = format!("{base}/api/checkpoints/m1/resolve");
        let (status, body) = post(
            &client,
            resolve_url.clone(),
            json!({"decision": "edit", "text": "Thank you for reaching out about \"Lunch\". I will look into it and follow up shortly."}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "edited");
        assert_eq!(body["state"], "sent");
        assert_eq!(body["delivered"], true);

        let (status, body) = post(&client, resolve_url, json!({"decision": "approve"})).await;
        assert_eq!(status, 409);
        assert!(body["error"].as_str().unwrap().contains("already resolved"));

        let (_, bias) = get(&client, format!("{base}/api/senders/a@x.com/bias")).await;
        assert_eq!(bias["sender"], "a@x.com");
        assert_eq!(bias["examples"].as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resolve_errors_map_to_status_codes() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let (status, _) = post(
            &client,
            format!("{base}/api/checkpoints/ghost/resolve"),
            json!({"decision": "approve"}),
        )
        .await;
        assert_eq!(status, 404);

        post(&client, format!("{base}/api/messages"), question("m1")).await;
        let (status, _) = post(
            &client,
            format!("{base}/api/checkpoints/m1/resolve"),
            json!({"decision": "edit", "text": "   "}),
        )
        .await;
        assert_eq!(status, 400);

        let (status, body) = post(
            &client,
            format!("{base}/api/checkpoints/m1/resolve"),
            json!({"decision": "deny"}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["state"], "denied");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn triage_override_and_stats() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let (status, body) = post(
            &client,
            format!("{base}/api/messages"),
            json!({"id": "n1", "sender": "bob@y.com", "subject": "FYI", "body": "The build is green."}),
        )
        .await;
        assert_eq!(status, 201);
        assert_eq!(body["state"], "notified");

        let (status, body) = post(
            &client,
            format!("{base}/api/messages/n1/triage"),
            json!({"label": "respond"}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["state"], "awaiting_approval");

        let (status, _) = post(
            &client,
            format!("{base}/api/messages/n1/triage"),
            json!({"label": "ignore"}),
        )
        .await;
        assert_eq!(status, 409);

        let (status, _) = post(
            &client,
            format!("{base}/api/messages/ghost/triage"),
            json!({"label": "respond"}),
        )
        .await;
        assert_eq!(status, 404);

        let (status, stats) = get(&client, format!("{base}/api/stats")).await;
        assert_eq!(status, 200);
        assert_eq!(stats["messages"]["awaiting_approval"], 1);
        assert_eq!(stats["feedback_events"], 1);
    })
    .await
    .expect("test timed out");
}
