//! Raw-output normalization and the response middleware chain.
//!
//! Heterogeneous backend output (complete message objects, streamed deltas,
//! plain text, decoded SSE lines, raw bytes) is normalized into one
//! `ProcessedResponse` shape at this boundary, then pushed through an
//! ordered middleware chain. Loop screening runs once over complete
//! responses and over a growing accumulation on the streaming path.
//!
//! Streaming is forward-only and single-consumer: dropping the returned
//! stream stops upstream pulling. A chunk that fails to process becomes an
//! error-metadata chunk so one bad chunk never kills the stream; a detected
//! loop yields exactly one terminal error chunk and ends the stream.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::loop_detector::LoopDetector;
use crate::models::{ProcessedResponse, RawResponse};

/// Default accumulated-content length at which the streaming path starts
/// consulting the loop detector.
pub const DEFAULT_ACCUMULATION_THRESHOLD: usize = 100;

/// Default cooperative pause between emitted chunks.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(2);

/// One stage of the response pipeline. Receives the response plus a shared
/// per-response context map and returns the (possibly modified) response.
#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    async fn process(
        &self,
        response: ProcessedResponse,
        context: &mut HashMap<String, serde_json::Value>,
    ) -> Result<ProcessedResponse, GatewayError>;
}

/// Normalizes raw backend output and runs the middleware chain over
/// complete and streaming responses.
pub struct ResponseProcessor {
    /// `(priority, middleware)` pairs in registration order. Appended
    /// without de-duplication; sorted highest priority first at run time.
    middlewares: Mutex<Vec<(i32, Arc<dyn ResponseMiddleware>)>>,
    detector: Arc<LoopDetector>,
    accumulation_threshold: usize,
    chunk_delay: Duration,
}

impl ResponseProcessor {
    pub fn new(detector: Arc<LoopDetector>) -> Self {
        Self {
            middlewares: Mutex::new(Vec::new()),
            detector,
            accumulation_threshold: DEFAULT_ACCUMULATION_THRESHOLD,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }

    #[must_use]
    pub fn with_accumulation_threshold(mut self, threshold: usize) -> Self {
        self.accumulation_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Append a middleware. Duplicate registrations run twice.
    pub fn register_middleware(&self, middleware: Arc<dyn ResponseMiddleware>, priority: i32) {
        self.middlewares
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((priority, middleware));
    }

    /// Snapshot of the chain, highest priority first. Equal priorities keep
    /// registration order.
    fn chain(&self) -> Vec<Arc<dyn ResponseMiddleware>> {
        let mut pairs = self
            .middlewares
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        pairs.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));
        pairs.into_iter().map(|(_, m)| m).collect()
    }

    /// Process one complete response. A detected loop aborts the whole
    /// response with [`GatewayError::LoopDetection`].
    pub async fn process_response(
        &self,
        raw: RawResponse,
        session_id: &str,
    ) -> Result<ProcessedResponse, GatewayError> {
        let mut context: HashMap<String, serde_json::Value> = HashMap::new();
        context.insert("session_id".into(), serde_json::json!(session_id));

        let mut response = normalize(raw)?.unwrap_or_default();
        for middleware in self.chain() {
            response = middleware.process(response, &mut context).await?;
        }

        let scan = self.detector.check_for_loops(&response.content);
        if scan.has_loop {
            warn!(
                session_id,
                pattern = scan.pattern.as_deref().unwrap_or(""),
                repetitions = scan.repetitions,
                "loop detected in complete response; discarding output"
            );
            return Err(GatewayError::LoopDetection {
                pattern: scan.pattern.unwrap_or_default(),
                repetitions: scan.repetitions,
            });
        }

        Ok(response)
    }

    /// Process a streaming response lazily. The returned stream terminates
    /// when upstream closes, on the `[DONE]` sentinel, or after the single
    /// terminal error chunk emitted on loop detection.
    pub fn process_streaming_response(
        &self,
        chunks: BoxStream<'static, Result<RawResponse, GatewayError>>,
        session_id: &str,
    ) -> BoxStream<'static, ProcessedResponse> {
        let detector = Arc::clone(&self.detector);
        let chain = self.chain();
        let threshold = self.accumulation_threshold;
        let delay = self.chunk_delay;
        let session_id = session_id.to_string();

        let out = async_stream::stream! {
            let mut context: HashMap<String, serde_json::Value> = HashMap::new();
            context.insert("session_id".into(), serde_json::json!(session_id));

            let mut upstream = chunks;
            let mut accumulated = String::new();
            let mut checked_at = 0usize;

            while let Some(item) = upstream.next().await {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(e) => {
                        // Localized: one bad chunk never kills the stream.
                        warn!(session_id = %session_id, error = %e, "bad upstream chunk");
                        yield error_chunk("chunk_processing", &e.to_string());
                        continue;
                    }
                };

                let mut response = match normalize(raw) {
                    Ok(Some(response)) => response,
                    Ok(None) => break, // [DONE]
                    Err(e) => {
                        yield error_chunk("chunk_processing", &e.to_string());
                        continue;
                    }
                };

                let mut failed = false;
                for middleware in &chain {
                    match middleware.process(response.clone(), &mut context).await {
                        Ok(next) => response = next,
                        Err(e) => {
                            yield error_chunk("chunk_processing", &e.to_string());
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    continue;
                }

                accumulated.push_str(&response.content);

                // Detector cost is bounded: consult it only once another
                // threshold's worth of content has accumulated.
                if accumulated.len() - checked_at >= threshold {
                    checked_at = accumulated.len();
                    let scan = detector.check_for_loops(&accumulated);
                    if scan.has_loop {
                        warn!(
                            session_id = %session_id,
                            pattern = scan.pattern.as_deref().unwrap_or(""),
                            repetitions = scan.repetitions,
                            "loop detected mid-stream; truncating"
                        );
                        let mut terminal = error_chunk(
                            "loop_detected",
                            "response stream truncated: repeated content detected",
                        );
                        if let Some(pattern) = scan.pattern {
                            terminal
                                .metadata
                                .insert("pattern".into(), serde_json::json!(pattern));
                        }
                        terminal.metadata.insert(
                            "repetitions".into(),
                            serde_json::json!(scan.repetitions),
                        );
                        yield terminal;
                        // Stop pulling upstream chunks.
                        return;
                    }
                }

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield response;
            }
            debug!(session_id = %session_id, "stream closed by upstream");
        };

        Box::pin(out)
    }
}

fn error_chunk(kind: &str, message: &str) -> ProcessedResponse {
    let mut chunk = ProcessedResponse::default();
    chunk.metadata.insert("error".into(), serde_json::json!(kind));
    chunk
        .metadata
        .insert("message".into(), serde_json::json!(message));
    chunk
}

/// Normalize raw backend output into a `ProcessedResponse`. Returns
/// `Ok(None)` for the SSE `[DONE]` sentinel.
pub fn normalize(raw: RawResponse) -> Result<Option<ProcessedResponse>, GatewayError> {
    match raw {
        RawResponse::Text(text) => Ok(Some(ProcessedResponse::from_content(text))),
        RawResponse::RawBytes(bytes) => Ok(Some(ProcessedResponse::from_content(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))),
        RawResponse::SseLine(line) => {
            let trimmed = line.trim();
            if trimmed == "[DONE]" {
                return Ok(None);
            }
            let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
                GatewayError::ChunkProcessing(format!("undecodable SSE payload: {e}"))
            })?;
            Ok(Some(normalize_object(&value)))
        }
        RawResponse::DecodedObject(value) => Ok(Some(normalize_object(&value))),
    }
}

/// Map a decoded completion object (full message or streamed delta) onto
/// the `(content, usage, metadata)` triple.
fn normalize_object(value: &serde_json::Value) -> ProcessedResponse {
    let first_choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    let content = first_choice
        .and_then(|choice| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .or_else(|| choice.get("delta").and_then(|d| d.get("content")))
        })
        .or_else(|| value.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let mut usage = HashMap::new();
    if let Some(map) = value.get("usage").and_then(|u| u.as_object()) {
        for (key, val) in map {
            if let Some(n) = val.as_u64() {
                usage.insert(key.clone(), n);
            }
        }
    }

    let mut metadata = HashMap::new();
    if let Some(model) = value.get("model").and_then(|m| m.as_str()) {
        metadata.insert("model".into(), serde_json::json!(model));
    }
    if let Some(reason) = first_choice
        .and_then(|c| c.get("finish_reason"))
        .filter(|r| !r.is_null())
    {
        metadata.insert("finish_reason".into(), reason.clone());
    }

    ProcessedResponse {
        content,
        usage,
        metadata,
    }
}
