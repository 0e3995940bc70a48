#![forbid(unsafe_code)]
#![doc = r#"
Proxiium

Request-processing core for a chat gateway sitting between chat-style
clients and multiple heterogeneous LLM providers.

Crate highlights
- In-band command interception: `!/name(args)` directives embedded in chat
  messages are parsed, executed against the session, and stripped before any
  backend sees them.
- Backend routing with failover: named routes of `backend:model` candidates
  tried in order, rate-limit aware, with one-off and persistent session
  overrides.
- Response middleware chain with loop screening over both complete and
  streaming outputs.

Modules
- `models`: Value objects shared across the pipeline (sessions excepted).
- `session`: Session state and the async session store.
- `commands`: Directive grammar, interceptor, and the built-in handlers.
- `backend_router`: Candidate resolution, failover walk, model validation.
- `rate_limiter`: Sliding-window usage limiter.
- `response_processor`: Raw-output normalization and the middleware chain.
- `loop_detector`: Repeated-substring screening.
- `connectors`: Backend connector trait plus the OpenAI-compatible HTTP one.
- `util`: Shared helpers (tracing init, env parsing, HTTP client).

Note: the HTTP transport, auth, and per-vendor wire schemas live outside
this crate; it exchanges plain chat-shaped requests and raw provider output.
"#]

pub mod backend_router;
pub mod commands;
pub mod connectors;
pub mod errors;
pub mod loop_detector;
pub mod models;
pub mod rate_limiter;
pub mod response_processor;
pub mod session;
pub mod util;

pub use crate::backend_router::{BackendRegistry, BackendRouter, CallContext};
pub use crate::commands::{
    CommandContext, CommandHandler, CommandInterceptor, CommandRegistry, FnCommand,
};
pub use crate::connectors::{BackendConnector, HttpChatConnector};
pub use crate::errors::GatewayError;
pub use crate::loop_detector::LoopDetector;
pub use crate::models::{
    BackendConfiguration, BackendResponse, ChatMessage, CommandResult, CompletionRequest,
    FailoverPolicy, FailoverRoute, LoopDetectionConfig, LoopDetectionResult, ProcessedResponse,
    ProcessedResult, RateLimitInfo, RawResponse, ReasoningConfig,
};
pub use crate::rate_limiter::RateLimiter;
pub use crate::response_processor::{ResponseMiddleware, ResponseProcessor};
pub use crate::session::{InMemorySessionStore, Session, SessionState, SessionStore};
