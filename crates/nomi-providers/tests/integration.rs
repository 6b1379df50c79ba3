//! Provider integration tests against a local OpenAI-compatible endpoint.
//!
//! The live JLLM test only runs when `JLLM_LIVE_TEST` is set.
//! Run with: `cargo test -p nomi-providers --test integration`

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use nomi_core::chat::{ChatContext, ChatRole};
use nomi_providers::jllm::NomiLlm;
use nomi_providers::openai::OpenAiClient;
use nomi_providers::{ChatRequest, Credentials, LlmProvider, collect_text};
use tokio_stream::StreamExt;

type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

#[derive(Clone)]
struct FakeEndpoint {
    frames: Vec<String>,
    fail_with: Option<StatusCode>,
    captured: Captured,
}

async fn completions(
    State(state): State<FakeEndpoint>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.captured.lock().unwrap().push((auth, body));

    if let Some(status) = state.fail_with {
        return (status, "invalid credential").into_response();
    }

    let sse: String = state
        .frames
        .iter()
        .map(|f| format!("data: {f}\n\n"))
        .collect();
    ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
}

/// Start a fake completions server and return its URL plus captured requests.
async fn start_fake_endpoint(frames: &[&str], fail_with: Option<StatusCode>) -> (String, Captured) {
    let captured: Captured = Arc::default();
    let state = FakeEndpoint {
        frames: frames.iter().map(|f| f.to_string()).collect(),
        fail_with,
        captured: captured.clone(),
    };
    let app = Router::new()
        .route("/hackathon/completions", post(completions))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (
        format!("http://127.0.0.1:{port}/hackathon/completions"),
        captured,
    )
}

fn persona() -> ChatContext {
    ChatContext::new().append(ChatRole::System, "You are Nomi, a witty AI character.")
}

#[tokio::test]
async fn test_streams_tokens_with_bearer_auth() {
    let (url, captured) = start_fake_endpoint(
        &[
            r#"{"choices":[{"index":0,"delta":{"content":"Hi "}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"there!"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ],
        None,
    )
    .await;

    let client = OpenAiClient::new(
        &url,
        Credentials::ApiKey {
            api_key: "tok-123".into(),
        },
        "default",
    );
    let ctx = persona();
    let mut request = ChatRequest::new(&ctx);
    request.temperature = Some(0.8);

    let stream = client.chat(request).await.expect("stream should open");
    assert_eq!(collect_text(stream).await.unwrap(), "Hi there!");

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (auth, body) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer tok-123"));
    assert_eq!(body["model"], "default");
    assert_eq!(body["temperature"], 0.8);
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
}

#[tokio::test]
async fn test_stream_is_lazy_and_forward_only() {
    let (url, _captured) = start_fake_endpoint(
        &[
            r#"{"choices":[{"delta":{"content":"one"}}]}"#,
            r#"{"choices":[{"delta":{"content":"two"}}]}"#,
            "[DONE]",
        ],
        None,
    )
    .await;

    let client = OpenAiClient::new(&url, Credentials::None, "default");
    let ctx = persona();
    let mut stream = client.chat(ChatRequest::new(&ctx)).await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.delta.as_deref(), Some("one"));
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.delta.as_deref(), Some("two"));
    assert!(stream.next().await.is_none());
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_non_success_status_propagates() {
    let (url, _captured) = start_fake_endpoint(&[], Some(StatusCode::UNAUTHORIZED)).await;

    let client = OpenAiClient::new(&url, Credentials::None, "default").with_provider_id("jllm");
    let ctx = persona();
    let err = client
        .chat(ChatRequest::new(&ctx))
        .await
        .err()
        .expect("401 must fail");
    let message = err.to_string();
    assert!(message.contains("jllm API error"), "got: {message}");
    assert!(message.contains("401"), "got: {message}");
    assert!(message.contains("invalid credential"), "got: {message}");
}

#[tokio::test]
async fn test_network_failure_propagates() {
    // Bind then drop to get a port with nothing listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = OpenAiClient::new(
        &format!("http://127.0.0.1:{port}/hackathon/completions"),
        Credentials::None,
        "default",
    );
    let ctx = persona();
    assert!(client.chat(ChatRequest::new(&ctx)).await.is_err());
}

#[tokio::test]
async fn test_jllm_live_completion() {
    if std::env::var("JLLM_LIVE_TEST").map_or(true, |v| v.is_empty()) {
        eprintln!("Skipping: JLLM_LIVE_TEST not set");
        return;
    }

    let llm = NomiLlm::new();
    let ctx = persona().append(ChatRole::User, "Reply with exactly the word 'hello'.");
    let stream = llm.chat(ChatRequest::new(&ctx)).await.expect("JLLM stream");
    let text = collect_text(stream).await.expect("JLLM tokens");
    assert!(!text.trim().is_empty(), "Expected a reply from JLLM");
}
