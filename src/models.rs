//! Value objects shared across the pipeline.
//!
//! `BackendConfiguration` and `FailoverRoute` are immutable: every mutator
//! returns a new instance and the original is never altered. Session state
//! transitions are whole-object replacements built from these values, which
//! keeps the session store's update contract simple.

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::GatewayError;

/// Failover policy for a route. Only ordered walking is implemented today;
/// the enum is tagged so configs stay forward compatible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Try candidates strictly in declared order.
    #[default]
    Ordered,
}

/// Named ordered list of `backend:model` candidates tried in sequence on
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailoverRoute {
    pub name: String,

    #[serde(default)]
    pub policy: FailoverPolicy,

    /// Ordered `backend:model` elements.
    #[serde(default)]
    pub elements: Vec<String>,
}

impl FailoverRoute {
    pub fn new(name: impl Into<String>, policy: FailoverPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            elements: Vec::new(),
        }
    }

    /// Return a copy with `element` appended.
    #[must_use]
    pub fn with_element(&self, element: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.elements.push(element.into());
        next
    }

    /// Return a copy with every occurrence of `element` removed.
    #[must_use]
    pub fn without_element(&self, element: &str) -> Self {
        let mut next = self.clone();
        next.elements.retain(|e| e != element);
        next
    }

    /// Return a copy with all elements removed.
    #[must_use]
    pub fn cleared(&self) -> Self {
        let mut next = self.clone();
        next.elements.clear();
        next
    }
}

/// Immutable backend selection state carried on a session.
///
/// All mutators return a new instance; callers replace the whole session
/// state rather than writing individual fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BackendConfiguration {
    /// Persistent backend override (e.g. "openrouter"). Empty means no
    /// override; the request's own `backend:model` or a failover route
    /// decides.
    #[serde(default)]
    pub backend_type: String,

    /// Persistent model override.
    #[serde(default)]
    pub model: String,

    /// Optional explicit API URL override handed to the connector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Interactive mode flag (commands answer inline instead of silently
    /// mutating state).
    #[serde(default)]
    pub interactive_mode: bool,

    /// Named failover routes.
    #[serde(default)]
    pub failover_routes: HashMap<String, FailoverRoute>,

    /// Single-use `backend:model` override, cleared after the next
    /// completion call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oneoff_backend: Option<String>,
}

impl BackendConfiguration {
    #[must_use]
    pub fn with_backend(&self, backend_type: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.backend_type = backend_type.into();
        next
    }

    #[must_use]
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.model = model.into();
        next
    }

    #[must_use]
    pub fn with_api_url(&self, api_url: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.api_url = Some(api_url.into());
        next
    }

    #[must_use]
    pub fn with_interactive_mode(&self, interactive: bool) -> Self {
        let mut next = self.clone();
        next.interactive_mode = interactive;
        next
    }

    #[must_use]
    pub fn with_oneoff_backend(&self, element: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.oneoff_backend = Some(element.into());
        next
    }

    #[must_use]
    pub fn without_oneoff_backend(&self) -> Self {
        let mut next = self.clone();
        next.oneoff_backend = None;
        next
    }

    #[must_use]
    pub fn with_failover_route(&self, route: FailoverRoute) -> Self {
        let mut next = self.clone();
        next.failover_routes.insert(route.name.clone(), route);
        next
    }

    #[must_use]
    pub fn without_failover_route(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.failover_routes.remove(name);
        next
    }
}

/// Reasoning knobs carried on the session and forwarded to connectors that
/// understand them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReasoningConfig {
    /// Effort hint ("low" | "medium" | "high") when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,

    /// Provider-specific thinking-token budget when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// Loop-detection configuration surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_min_pattern_length")]
    pub min_pattern_length: usize,

    #[serde(default = "default_max_pattern_length")]
    pub max_pattern_length: usize,

    #[serde(default = "default_min_repetitions")]
    pub min_repetitions: usize,
}

fn default_true() -> bool {
    true
}

fn default_min_pattern_length() -> usize {
    2
}

fn default_max_pattern_length() -> usize {
    64
}

fn default_min_repetitions() -> usize {
    3
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_pattern_length: default_min_pattern_length(),
            max_pattern_length: default_max_pattern_length(),
            min_repetitions: default_min_repetitions(),
        }
    }
}

/// One chat message as exchanged with the interceptor and connectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

/// Minimal chat-shaped completion request routed to a backend. Vendor wire
/// schemas live outside this crate; connectors translate from this shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    /// Requested model. May be `backend:model`, a bare model name, or the
    /// name of a failover route.
    pub model: String,

    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Extra parameters passed through to the connector untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub success: bool,

    /// Replacement session state. When present it is persisted even if
    /// `success` is false (partial-failure tolerance; see DESIGN.md).
    pub new_state: Option<crate::session::SessionState>,

    /// Human-readable outcome shown to the user in interactive mode.
    pub message: String,

    /// Structured payload for programmatic consumers.
    pub data: HashMap<String, serde_json::Value>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: crate::session::SessionState) -> Self {
        self.new_state = Some(state);
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Result of scanning one inbound message list for directives.
#[derive(Debug, Clone, Default)]
pub struct ProcessedResult {
    /// The (possibly modified) message list.
    pub messages: Vec<ChatMessage>,

    /// True only when a registered handler actually ran.
    pub command_executed: bool,

    pub results: Vec<CommandResult>,
}

/// Snapshot returned by `RateLimiter::check_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub is_limited: bool,

    /// Requests left in the current window. `None` when the key has no
    /// configured limit.
    pub remaining: Option<u64>,

    /// Unix seconds at which the oldest counted entry expires.
    pub reset_at: Option<u64>,

    pub limit: Option<u64>,

    /// Window length in seconds.
    pub time_window: Option<u64>,
}

impl RateLimitInfo {
    pub fn unlimited() -> Self {
        Self {
            is_limited: false,
            remaining: None,
            reset_at: None,
            limit: None,
            time_window: None,
        }
    }
}

/// A normalized response (or streamed chunk) flowing through the middleware
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProcessedResponse {
    pub content: String,

    #[serde(default)]
    pub usage: HashMap<String, u64>,

    /// Carries loop-detection flags and per-chunk errors among other
    /// middleware annotations.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProcessedResponse {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Outcome of a loop scan.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoopDetectionResult {
    pub has_loop: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default)]
    pub repetitions: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LoopDetectionResult {
    pub fn clean() -> Self {
        Self::default()
    }
}

/// Raw backend output, normalized exactly once at the response-processor
/// boundary. Connectors emit whichever variant is closest to what came off
/// the wire instead of sniffing shapes downstream.
#[derive(Debug, Clone)]
pub enum RawResponse {
    /// Plain text fragment.
    Text(String),

    /// Already-decoded JSON object (complete response or streamed delta).
    DecodedObject(serde_json::Value),

    /// Undecoded bytes straight off the wire.
    RawBytes(bytes::Bytes),

    /// One decoded SSE line, `data:` prefix already stripped. May be the
    /// `[DONE]` sentinel.
    SseLine(String),
}

/// What a connector hands back for one completion call.
pub enum BackendResponse {
    /// Fully buffered response body.
    Complete(serde_json::Value),

    /// Lazy, forward-only chunk sequence. Single consumer; dropping it
    /// stops upstream pulling.
    Streaming(BoxStream<'static, Result<RawResponse, GatewayError>>),
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(v) => f.debug_tuple("Complete").field(v).finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_configuration_mutators_return_new_instances() {
        let base = BackendConfiguration::default();
        let a = base.with_backend("openrouter");
        let b = a.with_backend("gemini");

        assert_eq!(base.backend_type, "");
        assert_eq!(a.backend_type, "openrouter");
        assert_eq!(b.backend_type, "gemini");
    }

    #[test]
    fn oneoff_override_round_trip() {
        let cfg = BackendConfiguration::default().with_oneoff_backend("b1:m1");
        assert_eq!(cfg.oneoff_backend.as_deref(), Some("b1:m1"));
        let cleared = cfg.without_oneoff_backend();
        assert!(cleared.oneoff_backend.is_none());
        // Original untouched.
        assert_eq!(cfg.oneoff_backend.as_deref(), Some("b1:m1"));
    }

    #[test]
    fn failover_route_editing_is_persistent_value_semantics() {
        let route = FailoverRoute::new("fast", FailoverPolicy::Ordered)
            .with_element("b1:m1")
            .with_element("b2:m2");
        assert_eq!(route.elements, vec!["b1:m1", "b2:m2"]);

        let trimmed = route.without_element("b1:m1");
        assert_eq!(trimmed.elements, vec!["b2:m2"]);
        assert_eq!(route.elements.len(), 2);

        assert!(route.cleared().elements.is_empty());
    }

    #[test]
    fn loop_config_defaults() {
        let cfg = LoopDetectionConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.min_pattern_length, 2);
        assert_eq!(cfg.max_pattern_length, 64);
        assert_eq!(cfg.min_repetitions, 3);
    }
}
