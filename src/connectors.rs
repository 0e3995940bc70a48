//! Backend connectors.
//!
//! A connector owns the wire protocol for one provider. The router only
//! sees the [`BackendConnector`] capability: completions, best-effort model
//! discovery, and a functionality check (credentials present). Vendor
//! translation layers beyond the generic OpenAI-compatible shape live
//! outside this crate.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tracing::debug;

use crate::errors::GatewayError;
use crate::models::{BackendResponse, CompletionRequest, RawResponse};

/// Capability consumed by the router, one implementation per vendor.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Registry name of this backend (the `backend` half of
    /// `backend:model`).
    fn name(&self) -> &str;

    /// Whether credentials/configuration are present and the backend is
    /// usable for routing.
    fn is_functional(&self) -> bool;

    /// Best-effort model discovery. Staleness is tolerated downstream.
    async fn get_available_models(&self) -> Result<Vec<String>, GatewayError>;

    /// Issue one completion call. `stream=true` yields a lazy chunk
    /// sequence, otherwise a buffered body.
    async fn chat_completions(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<BackendResponse, GatewayError>;
}

/// Generic OpenAI-compatible `/chat/completions` connector over reqwest.
/// Covers vLLM, Ollama, OpenRouter and friends.
pub struct HttpChatConnector {
    name: String,
    base_url: String,
    /// Env var holding the bearer key. `None` means the upstream is
    /// unauthenticated (local inference servers).
    key_env: Option<String>,
    client: reqwest::Client,
}

impl HttpChatConnector {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        key_env: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            key_env,
            client,
        }
    }

    fn api_key(&self) -> Option<String> {
        self.key_env
            .as_deref()
            .and_then(|k| std::env::var(k).ok())
            .filter(|s| !s.is_empty())
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": stream,
        });
        if let Some(obj) = body.as_object_mut() {
            for (key, value) in &request.extra {
                obj.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        body
    }
}

#[async_trait]
impl BackendConnector for HttpChatConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_functional(&self) -> bool {
        match &self.key_env {
            Some(env) => std::env::var(env).map(|v| !v.trim().is_empty()).unwrap_or(false),
            None => true,
        }
    }

    async fn get_available_models(&self) -> Result<Vec<String>, GatewayError> {
        let url = self.endpoint("models");
        let mut rb = self.client.get(&url);
        if let Some(key) = self.api_key() {
            rb = rb.bearer_auth(key);
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| GatewayError::backend(&self.name, "-", e))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::backend(&self.name, "-", e))?;

        let models = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn chat_completions(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<BackendResponse, GatewayError> {
        let url = self.endpoint("chat/completions");
        let body = self.request_body(request, stream);

        let mut rb = self
            .client
            .post(&url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .json(&body);
        if stream {
            rb = rb.header(http::header::ACCEPT, "text/event-stream");
        }
        if let Some(key) = self.api_key() {
            rb = rb.bearer_auth(key);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| GatewayError::backend(&self.name, &request.model, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::backend(
                &self.name,
                &request.model,
                format!("upstream status {status}: {text}"),
            ));
        }

        if !stream {
            let value: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| GatewayError::backend(&self.name, &request.model, e))?;
            return Ok(BackendResponse::Complete(value));
        }

        debug!(backend = %self.name, model = %request.model, "opening SSE stream");
        let backend = self.name.clone();
        let model = request.model.clone();
        let mut bytes_stream = resp.bytes_stream();

        // Frame the byte stream into SSE data lines. Partial lines are
        // buffered across chunks; non-data lines (comments, event names,
        // blanks) are dropped here.
        let chunks = try_stream! {
            let mut buffer = String::new();
            while let Some(piece) = bytes_stream.next().await {
                let piece =
                    piece.map_err(|e| GatewayError::backend(&backend, &model, e))?;
                buffer.push_str(&String::from_utf8_lossy(&piece));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);
                    if let Some(data) = line.strip_prefix("data:") {
                        yield RawResponse::SseLine(data.trim_start().to_string());
                    }
                }
            }
            let tail = buffer.trim();
            if let Some(data) = tail.strip_prefix("data:") {
                yield RawResponse::SseLine(data.trim_start().to_string());
            }
        };

        Ok(BackendResponse::Streaming(Box::pin(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;

    #[test]
    fn endpoint_joins_without_duplicate_slashes() {
        let c = HttpChatConnector::new(
            "local",
            "http://localhost:11434/v1/",
            None,
            reqwest::Client::new(),
        );
        assert_eq!(
            c.endpoint("/chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_keeps_extra_params_without_clobbering_core_fields() {
        let c = HttpChatConnector::new("local", "http://x/v1", None, reqwest::Client::new());
        let mut request = CompletionRequest {
            model: "m1".into(),
            messages: vec![ChatMessage::user("hi")],
            ..CompletionRequest::default()
        };
        request
            .extra
            .insert("temperature".into(), serde_json::json!(0.2));
        request.extra.insert("model".into(), serde_json::json!("evil"));

        let body = c.request_body(&request, false);
        assert_eq!(body["model"], "m1");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn missing_key_env_marks_backend_non_functional() {
        let c = HttpChatConnector::new(
            "cloud",
            "https://api.example.com/v1",
            Some("PROXIIUM_TEST_SURELY_UNSET_KEY".into()),
            reqwest::Client::new(),
        );
        assert!(!c.is_functional());

        let local = HttpChatConnector::new("local", "http://x/v1", None, reqwest::Client::new());
        assert!(local.is_functional());
    }
}
