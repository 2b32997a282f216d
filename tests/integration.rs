use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

const TRANSCRIPT: &str = "Seller: you must sign today or the price doubles.\n\n\
Buyer: I would like to read the contract first.\n\n\
Seller: everyone else already signed, so sign today.\n";

fn parley_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("parley");
    path
}

fn setup_test_env(llm_section: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(root.join("call.txt"), TRANSCRIPT).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/parley.sqlite"

[analysis]
chunk_chars = 60
overlap_chars = 0
max_concurrency = 2

[budget]
daily_token_limit = 1000000

[logging]
level = "warn"

{}
"#,
        root.display(),
        llm_section
    );

    let config_path = config_dir.join("parley.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_parley(config_path: &Path, args: &[&str], envs: &[(&str, &str)]) -> (String, String, bool) {
    let binary = parley_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .envs(envs.iter().copied())
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run parley binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// Chat-completions stand-in: findings for excerpt prompts, insights otherwise.
async fn fake_completion(Json(body): Json<Value>) -> Json<Value> {
    let user = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();

    let content = if user.starts_with("Excerpt ") {
        let mut findings = Vec::new();
        if user.contains("sign today") {
            findings.push(json!({
                "category": "manipulation", "label": "false urgency", "quote": "sign today",
                "severity": 2, "explanation": "artificial deadline"
            }));
        }
        json!({ "findings": findings })
    } else {
        json!({
            "overall": "The seller leans on urgency.",
            "strategic": "Slow the pace down.",
            "barometer": { "score": 58, "label": "tense", "rationale": "Repeated deadlines." }
        })
    };

    Json(json!({
        "choices": [{ "message": { "role": "assistant", "content": content.to_string() } }],
        "usage": { "prompt_tokens": 90, "completion_tokens": 30, "total_tokens": 120 }
    }))
}

/// Serve the fake model on its own thread and runtime; returns the base URL.
fn spawn_fake_llm() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let app = Router::new().route("/v1/chat/completions", post(fake_completion));
            axum::serve(listener, app).await.unwrap();
        });
    });

    format!("http://{}/v1", addr)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env("[llm]\nprovider = \"disabled\"");

    let (stdout, stderr, success) = run_parley(&config_path, &["init"], &[]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("[llm]\nprovider = \"disabled\"");

    let (_, _, success1) = run_parley(&config_path, &["init"], &[]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_parley(&config_path, &["init"], &[]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_usage_on_fresh_database() {
    let (_tmp, config_path) = setup_test_env("[llm]\nprovider = \"disabled\"");
    run_parley(&config_path, &["init"], &[]);

    let (stdout, stderr, success) = run_parley(&config_path, &["usage", "--json"], &[]);
    assert!(success, "usage failed: {}", stderr);
    let usage: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(usage["tokens_used"], 0);
    assert_eq!(usage["daily_limit"], 1_000_000);
    assert_eq!(usage["locked"], false);
}

#[test]
fn test_usage_rejects_bad_date() {
    let (_tmp, config_path) = setup_test_env("[llm]\nprovider = \"disabled\"");
    let (_, stderr, success) = run_parley(&config_path, &["usage", "--date", "yesterday"], &[]);
    assert!(!success);
    assert!(stderr.contains("YYYY-MM-DD"));
}

#[test]
fn test_get_missing_analysis_fails() {
    let (_tmp, config_path) = setup_test_env("[llm]\nprovider = \"disabled\"");
    run_parley(&config_path, &["init"], &[]);

    let (_, stderr, success) = run_parley(&config_path, &["get", "no-such-id"], &[]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_analyze_requires_llm() {
    let (tmp, config_path) = setup_test_env("[llm]\nprovider = \"disabled\"");
    let file = tmp.path().join("call.txt");

    let (_, stderr, success) = run_parley(
        &config_path,
        &["analyze", file.to_str().unwrap(), "--client-id", "acme"],
        &[],
    );
    assert!(!success);
    assert!(stderr.contains("llm provider"));
}

#[test]
fn test_analyze_rejects_unsupported_file() {
    let (tmp, config_path) = setup_test_env("[llm]\nprovider = \"openai\"\napi_key_env = \"PARLEY_TEST_KEY\"");
    let file = tmp.path().join("deck.pptx");
    fs::write(&file, b"PK").unwrap();

    let (_, stderr, success) = run_parley(
        &config_path,
        &["analyze", file.to_str().unwrap(), "--client-id", "acme"],
        &[("PARLEY_TEST_KEY", "test")],
    );
    assert!(!success);
    assert!(stderr.contains("unsupported file type"));
}

#[test]
fn test_analyze_then_get_roundtrip() {
    let base_url = spawn_fake_llm();
    let llm_section = format!(
        "[llm]\nprovider = \"openai\"\nbase_url = \"{}\"\napi_key_env = \"PARLEY_TEST_KEY\"\nmax_retries = 0\n",
        base_url
    );
    let (tmp, config_path) = setup_test_env(&llm_section);
    let file = tmp.path().join("call.txt");

    let (stdout, stderr, success) = run_parley(
        &config_path,
        &[
            "analyze",
            file.to_str().unwrap(),
            "--client-id",
            "acme",
            "--progress",
            "json",
        ],
        &[("PARLEY_TEST_KEY", "test")],
    );
    assert!(success, "analyze failed: stdout={}, stderr={}", stdout, stderr);

    let result: Value = serde_json::from_str(&stdout).unwrap();
    let id = result["id"].as_str().expect("analysis id").to_string();
    assert_eq!(result["client_id"], "acme");
    assert_eq!(result["barometer"]["score"], 58);

    let highlights = result["highlights"].as_array().unwrap();
    assert!(!highlights.is_empty());
    for h in highlights {
        let start = h["global_start"].as_u64().unwrap() as usize;
        let end = h["global_end"].as_u64().unwrap() as usize;
        assert_eq!(TRANSCRIPT[start..end].to_lowercase(), "sign today");
    }

    // JSON progress lines on stderr end with the complete event.
    let last_event = stderr
        .lines()
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter(|v| v.get("type").is_some())
        .last()
        .expect("at least one event line");
    assert_eq!(last_event["type"], "complete");

    let (stdout, stderr, success) = run_parley(&config_path, &["get", &id], &[]);
    assert!(success, "get failed: {}", stderr);
    let stored: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stored["id"], id.as_str());
    assert_eq!(stored["highlights"], result["highlights"]);

    let (stdout, _, success) = run_parley(&config_path, &["usage", "--json"], &[]);
    assert!(success);
    let usage: Value = serde_json::from_str(&stdout).unwrap();
    assert!(usage["tokens_used"].as_u64().unwrap() > 0);
}
