//! HTTP API tests against an in-process server on an ephemeral port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use parley::config::Config;
use parley::llm::{ChatRequest, ChatResponse, LlmClient, LlmError, TokenUsage};
use parley::server::{router, AppState};
use parley::services::Services;
use parley_core::store::memory::InMemoryStore;

const TRANSCRIPT: &str = "Seller: you must sign today or the price doubles.\n\n\
Buyer: I would like to read the contract first.\n\n\
Seller: everyone else already signed, so sign today.\n";

struct ScriptedLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let user = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let content = if user.starts_with("Excerpt ") {
            let findings: Vec<Value> = if user.contains("sign today") {
                vec![json!({
                    "category": "manipulation", "label": "false urgency", "quote": "sign today",
                    "severity": 3, "explanation": "artificial deadline"
                })]
            } else {
                vec![]
            };
            json!({ "findings": findings })
        } else {
            json!({
                "overall": "Urgency pressure throughout.",
                "strategic": "Ask for time.",
                "barometer": { "score": 61, "label": "tense", "rationale": "Deadlines." }
            })
        };
        Ok(ChatResponse {
            content: content.to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: 80,
                completion_tokens: 20,
                total_tokens: 100,
            }),
        })
    }
}

fn test_config() -> Config {
    let mut config = Config::minimal("unused.sqlite");
    config.analysis.chunk_chars = 60;
    config.analysis.overlap_chars = 0;
    config
}

/// Serve the router with the given model; returns the base URL.
async fn spawn_server(llm: Option<Arc<dyn LlmClient>>) -> (String, Arc<InMemoryStore>) {
    let config = test_config();
    let store = Arc::new(InMemoryStore::new());
    let services = Arc::new(Services::new(&config, store.clone(), llm));
    let app = router(AppState::new(Arc::new(config), services));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), store)
}

fn scripted() -> Option<Arc<dyn LlmClient>> {
    Some(Arc::new(ScriptedLlm {
        calls: AtomicUsize::new(0),
    }))
}

/// Parse `data:` frames out of an event-stream body.
fn frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_health() {
    let (base, _) = spawn_server(None).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_analyze_streams_and_persists() {
    let (base, store) = spawn_server(scripted()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/analyze", base))
        .json(&json!({ "client_id": "acme", "text": TRANSCRIPT, "method": "text" }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let events = frames(&response.text().await.unwrap());
    assert_eq!(events.first().unwrap()["type"], "analysis_started");
    assert_eq!(events.first().unwrap()["total_chunks"], 3);
    let last = events.last().unwrap();
    assert_eq!(last["type"], "complete");
    assert!(events.iter().all(|e| e["type"] != "error"));
    assert!(events.iter().any(|e| e["type"] == "highlight"));

    let barometer = events.iter().find(|e| e["type"] == "barometer").unwrap();
    assert_eq!(barometer["score"], 61);

    let id = last["analysis_id"].as_str().unwrap();
    assert_eq!(store.analysis_count(), 1);

    let stored: Value = client
        .get(format!("{}/api/analyses/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored["id"], id);
    assert_eq!(stored["client_id"], "acme");
    for h in stored["highlights"].as_array().unwrap() {
        let start = h["global_start"].as_u64().unwrap() as usize;
        let end = h["global_end"].as_u64().unwrap() as usize;
        assert_eq!(&TRANSCRIPT[start..end], h["text"].as_str().unwrap());
    }

    let usage: Value = client
        .get(format!("{}/api/usage", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(usage["tokens_used"].as_u64().unwrap() > 0);
    assert_eq!(usage["locked"], false);
}

#[tokio::test]
async fn test_blank_text_is_fatal_in_stream() {
    let (base, store) = spawn_server(scripted()).await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze", base))
        .json(&json!({ "client_id": "acme", "text": "   " }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let events = frames(&response.text().await.unwrap());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "error");
    assert_eq!(events[0]["fatal"], true);
    assert!(events[0].get("chunkNumber").is_none());
    assert_eq!(store.analysis_count(), 0);
}

#[tokio::test]
async fn test_multipart_upload() {
    let (base, _) = spawn_server(scripted()).await;
    let form = reqwest::multipart::Form::new()
        .text("client_id", "acme")
        .text("participants", "Seller")
        .text("profile", r#"{"role": "buyer"}"#)
        .part(
            "file",
            reqwest::multipart::Part::bytes(TRANSCRIPT.as_bytes().to_vec())
                .file_name("call.txt")
                .mime_str("text/plain")
                .unwrap(),
        );

    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let events = frames(&response.text().await.unwrap());
    assert_eq!(events.last().unwrap()["type"], "complete");
}

#[tokio::test]
async fn test_multipart_rejects_unsupported_file() {
    let (base, _) = spawn_server(scripted()).await;
    let form = reqwest::multipart::Form::new().text("client_id", "acme").part(
        "file",
        reqwest::multipart::Part::bytes(vec![0u8; 16])
            .file_name("deck.pptx")
            .mime_str("application/octet-stream")
            .unwrap(),
    );

    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_analyze_without_llm_is_unavailable() {
    let (base, _) = spawn_server(None).await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze", base))
        .json(&json!({ "client_id": "acme", "text": TRANSCRIPT }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "llm_disabled");
}

#[tokio::test]
async fn test_missing_analysis_is_not_found() {
    let (base, _) = spawn_server(None).await;
    let response = reqwest::get(format!("{}/api/analyses/nope", base)).await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let (base, _) = spawn_server(scripted()).await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
