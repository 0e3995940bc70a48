//! Error taxonomy for the request-processing pipeline.
//!
//! The variants map one-to-one onto the failure modes the pipeline is
//! designed around: command failures are caught and fail open, backend
//! failures only surface after failover exhaustion, loop detection is a
//! deliberate abort of otherwise-successful output, and chunk failures stay
//! local to the chunk they occurred in.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A command handler failed while resolving or executing. The
    /// interceptor catches this at the top level and fails open; it never
    /// reaches a client as a hard error.
    #[error("command execution failed: {0}")]
    CommandExecution(String),

    /// A backend call failed. Propagated only after every failover
    /// candidate has been exhausted.
    #[error("backend call failed ({backend}:{model}): {message}")]
    Backend {
        backend: String,
        model: String,
        message: String,
    },

    /// Every eligible candidate was rate limited.
    #[error("rate limited on key '{key}', retry after {reset_in_secs}s")]
    RateLimited { key: String, reset_in_secs: u64 },

    /// Pathological repetition detected in generated output. Aborts the
    /// whole response on the complete path; truncates on the streaming path.
    #[error("loop detected: pattern {pattern:?} repeated {repetitions} times")]
    LoopDetection { pattern: String, repetitions: usize },

    /// A single streamed chunk failed to process. Non-fatal; converted to
    /// an error-metadata chunk so the stream survives.
    #[error("chunk processing failed: {0}")]
    ChunkProcessing(String),

    /// The stream itself failed at the generator level. Terminal.
    #[error("stream processing failed: {0}")]
    StreamProcessing(String),

    /// Session store failure.
    #[error("session store error: {0}")]
    Session(String),
}

impl GatewayError {
    /// Build a backend error from a candidate and an underlying cause.
    pub fn backend(backend: impl Into<String>, model: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Backend {
            backend: backend.into(),
            model: model.into(),
            message: message.to_string(),
        }
    }
}
