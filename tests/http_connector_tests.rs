//! Tests for the OpenAI-compatible HTTP connector against a local mock
//! upstream.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use proxiium::{
    BackendConnector, BackendResponse, ChatMessage, CompletionRequest, HttpChatConnector,
    LoopDetector, ProcessedResponse, RawResponse, ResponseProcessor,
};

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<Value>>>,
    response: Arc<AsyncMutex<Value>>,
    sse_body: Arc<String>,
}

async fn handle_chat(State(state): State<UpstreamState>, Json(payload): Json<Value>) -> axum::response::Response {
    let stream_requested = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    state.requests.lock().await.push(payload);

    if stream_requested {
        return (
            [(header::CONTENT_TYPE, "text/event-stream")],
            state.sse_body.as_str().to_owned(),
        )
            .into_response();
    }
    Json(state.response.lock().await.clone()).into_response()
}

async fn handle_models() -> Json<Value> {
    Json(json!({"data": [{"id": "m1"}, {"id": "m2"}]}))
}

struct MockUpstream {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<Value>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(response: Value, sse_body: &str) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            response: Arc::new(AsyncMutex::new(response)),
            sse_body: Arc::new(sse_body.to_string()),
        };

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat))
            .route("/v1/models", get(handle_models))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{addr}/v1");

        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("upstream server error");
        });

        Self {
            base_url,
            requests,
            join,
        }
    }

    async fn last_request(&self) -> Value {
        let guard = self.requests.lock().await;
        guard.last().cloned().unwrap_or_else(|| json!({}))
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn request(model: &str) -> CompletionRequest {
    CompletionRequest {
        model: model.into(),
        messages: vec![ChatMessage::user("hello upstream")],
        ..CompletionRequest::default()
    }
}

#[tokio::test]
async fn complete_call_round_trips_body_and_model() {
    let upstream = MockUpstream::start(
        json!({
            "id": "chatcmpl-1",
            "model": "m1",
            "choices": [{"message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1}
        }),
        "",
    )
    .await;

    let connector =
        HttpChatConnector::new("mock", upstream.base_url.clone(), None, reqwest::Client::new());
    let response = connector
        .chat_completions(&request("m1"), false)
        .await
        .unwrap();

    let body = match response {
        BackendResponse::Complete(v) => v,
        BackendResponse::Streaming(_) => panic!("expected complete"),
    };
    assert_eq!(body["choices"][0]["message"]["content"], "pong");

    let sent = upstream.last_request().await;
    assert_eq!(sent["model"], "m1");
    assert_eq!(sent["stream"], false);
    assert_eq!(sent["messages"][0]["content"], "hello upstream");
}

#[tokio::test]
async fn streaming_call_frames_sse_lines() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        ": keep-alive comment\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = MockUpstream::start(json!({}), sse_body).await;

    let connector =
        HttpChatConnector::new("mock", upstream.base_url.clone(), None, reqwest::Client::new());
    let response = connector
        .chat_completions(&request("m1"), true)
        .await
        .unwrap();

    let stream = match response {
        BackendResponse::Streaming(s) => s,
        BackendResponse::Complete(_) => panic!("expected stream"),
    };
    let chunks: Vec<_> = stream.collect().await;

    let lines: Vec<String> = chunks
        .into_iter()
        .map(|c| match c.unwrap() {
            RawResponse::SseLine(line) => line,
            other => panic!("unexpected variant: {other:?}"),
        })
        .collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("Hel"));
    assert_eq!(lines[2], "[DONE]");
}

#[tokio::test]
async fn streamed_sse_flows_through_the_processor() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"one \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"two\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = MockUpstream::start(json!({}), sse_body).await;

    let connector =
        HttpChatConnector::new("mock", upstream.base_url.clone(), None, reqwest::Client::new());
    let response = connector
        .chat_completions(&request("m1"), true)
        .await
        .unwrap();
    let stream = match response {
        BackendResponse::Streaming(s) => s,
        BackendResponse::Complete(_) => panic!("expected stream"),
    };

    let processor = Arc::new(
        ResponseProcessor::new(Arc::new(LoopDetector::default()))
            .with_chunk_delay(std::time::Duration::ZERO),
    );
    let collected: Vec<ProcessedResponse> = processor
        .process_streaming_response(stream, "s1")
        .collect()
        .await;

    let text: String = collected.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, "one two");
    assert!(collected.iter().all(|c| !c.metadata.contains_key("error")));
}

#[tokio::test]
async fn model_discovery_lists_upstream_models() {
    let upstream = MockUpstream::start(json!({}), "").await;
    let connector =
        HttpChatConnector::new("mock", upstream.base_url.clone(), None, reqwest::Client::new());
    let models = connector.get_available_models().await.unwrap();
    assert_eq!(models, vec!["m1", "m2"]);
}

#[tokio::test]
async fn upstream_error_status_is_a_backend_error() {
    // Point at a closed port: connect error surfaces as a backend failure.
    let connector = HttpChatConnector::new(
        "mock",
        "http://127.0.0.1:1/v1",
        None,
        reqwest::Client::new(),
    );
    let err = connector
        .chat_completions(&request("m1"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, proxiium::GatewayError::Backend { .. }));
}
