//! In-band command interception.
//!
//! Chat messages may carry directives of the form `!/name(arg, key=value)`.
//! The interceptor scans the most recent user message, executes at most one
//! registered handler against the session, persists the resulting state, and
//! strips the directive so no backend ever sees it.
//!
//! Grammar (prefix configurable, default `!/`):
//!   prefix + `[A-Za-z0-9_-]+` + optional `(arg[,arg...])`
//!   arg = `key=value` (value unwrapped from matching quotes)
//!       | bare token containing `:` or `/`  -> captured under key `element`
//!       | bare flag token                   -> `key=true`

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::models::{ChatMessage, CommandResult, ProcessedResult};
use crate::session::{Session, SessionStore};

/// Default directive prefix.
pub const DEFAULT_COMMAND_PREFIX: &str = "!/";

/// Per-request context handed to handlers.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub session_id: String,
    pub data: HashMap<String, serde_json::Value>,
}

impl CommandContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            data: HashMap::new(),
        }
    }
}

/// A registered command. Handlers are asynchronous; synchronous logic just
/// returns immediately from `execute`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Name the handler is registered under.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        args: &HashMap<String, String>,
        session: &Session,
        context: &CommandContext,
    ) -> Result<CommandResult, GatewayError>;
}

/// Adapter exposing a plain function as a [`CommandHandler`].
pub struct FnCommand<F> {
    name: String,
    func: F,
}

impl<F> FnCommand<F>
where
    F: Fn(&HashMap<String, String>, &Session) -> CommandResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> CommandHandler for FnCommand<F>
where
    F: Fn(&HashMap<String, String>, &Session) -> CommandResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        args: &HashMap<String, String>,
        session: &Session,
        _context: &CommandContext,
    ) -> Result<CommandResult, GatewayError> {
        Ok((self.func)(args, session))
    }
}

/// Explicit name → handler collection, injected at composition time so
/// tests can construct isolated instances.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in session commands.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for handler in builtin::all() {
            registry.register(handler);
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Register a plain function under `name`, wrapping it in [`FnCommand`].
    pub fn register_command<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&HashMap<String, String>, &Session) -> CommandResult + Send + Sync + 'static,
    {
        let handler = FnCommand::new(name, func);
        self.register(Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// One parsed directive occurrence inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedCommand {
    name: String,
    args: HashMap<String, String>,
    /// Byte span of the full directive match within the message content.
    start: usize,
    end: usize,
}

/// Scans inbound messages for directives and runs at most one handler per
/// call.
pub struct CommandInterceptor {
    registry: CommandRegistry,
    store: Arc<dyn SessionStore>,
    prefix: String,
    pattern: Regex,
    /// When true, messages carrying an unknown command are left untouched.
    preserve_unknown: bool,
}

impl CommandInterceptor {
    pub fn new(registry: CommandRegistry, store: Arc<dyn SessionStore>) -> Self {
        Self::with_prefix(registry, store, DEFAULT_COMMAND_PREFIX)
    }

    pub fn with_prefix(
        registry: CommandRegistry,
        store: Arc<dyn SessionStore>,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let pattern = if prefix == DEFAULT_COMMAND_PREFIX {
            DEFAULT_PATTERN.clone()
        } else {
            command_pattern(&prefix)
        };
        Self {
            registry,
            store,
            prefix,
            pattern,
            preserve_unknown: false,
        }
    }

    #[must_use]
    pub fn preserve_unknown(mut self, preserve: bool) -> Self {
        self.preserve_unknown = preserve;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Scan `messages` (newest to oldest) for a directive in the first user
    /// message, execute it, and return the modified list.
    ///
    /// Any error raised while resolving or executing a handler is caught
    /// here: the call fails open with the original messages and
    /// `command_executed = false`.
    pub async fn process_commands(
        &self,
        messages: &[ChatMessage],
        session_id: &str,
    ) -> ProcessedResult {
        let untouched = ProcessedResult {
            messages: messages.to_vec(),
            command_executed: false,
            results: Vec::new(),
        };

        // Only the first user message found (scanning newest to oldest) is
        // ever examined.
        let Some(index) = messages.iter().rposition(|m| m.role == "user") else {
            return untouched;
        };

        let Some(parsed) = self.parse_first(&messages[index].content) else {
            return untouched;
        };

        let Some(handler) = self.registry.get(&parsed.name) else {
            debug!(command = %parsed.name, "unknown command");
            if self.preserve_unknown {
                return untouched;
            }
            // Strip the directive but report that nothing executed.
            let mut modified = messages.to_vec();
            let content = &modified[index].content;
            let mut stripped = String::with_capacity(content.len());
            stripped.push_str(&content[..parsed.start]);
            stripped.push_str(&content[parsed.end..]);
            modified[index].content = stripped;
            return ProcessedResult {
                messages: modified,
                command_executed: false,
                results: Vec::new(),
            };
        };

        match self
            .execute_one(handler, &parsed, &messages[index], session_id)
            .await
        {
            Ok((new_content, result)) => {
                let mut modified = messages.to_vec();
                modified[index].content = new_content;
                ProcessedResult {
                    messages: modified,
                    command_executed: true,
                    results: vec![result],
                }
            }
            Err(e) => {
                warn!(command = %parsed.name, error = %e, "command failed; continuing without it");
                untouched
            }
        }
    }

    async fn execute_one(
        &self,
        handler: Arc<dyn CommandHandler>,
        parsed: &ParsedCommand,
        message: &ChatMessage,
        session_id: &str,
    ) -> Result<(String, CommandResult), GatewayError> {
        let mut session = self.store.get_session(session_id).await?;
        let context = CommandContext::for_session(session_id);

        let result = handler.execute(&parsed.args, &session, &context).await?;

        // Persist whenever the handler succeeded or handed back a
        // replacement state, even on failure. A handler may report a
        // user-facing error while still committing a partial state change.
        if let Some(new_state) = result.new_state.clone() {
            session.state = new_state;
            self.store.update_session(session).await?;
        } else if result.success {
            self.store.update_session(session).await?;
        }

        // The message becomes the trailing text after the directive,
        // leading space preserved.
        let remainder = message.content[parsed.end..].to_string();
        Ok((remainder, result))
    }

    /// Find the first directive in `content`.
    fn parse_first(&self, content: &str) -> Option<ParsedCommand> {
        let caps = self.pattern.captures(content)?;
        let whole = caps.get(0)?;
        let name = caps.get(1)?.as_str().to_string();
        let args = caps
            .get(2)
            .map(|m| parse_args(m.as_str()))
            .unwrap_or_default();
        Some(ParsedCommand {
            name,
            args,
            start: whole.start(),
            end: whole.end(),
        })
    }
}

static DEFAULT_PATTERN: Lazy<Regex> = Lazy::new(|| command_pattern(DEFAULT_COMMAND_PREFIX));

fn command_pattern(prefix: &str) -> Regex {
    let escaped = regex::escape(prefix);
    // Name, then an optional parenthesized argument list on the same token.
    let raw = format!(r"{escaped}([A-Za-z0-9_-]+)(?:\(([^)]*)\))?");
    Regex::new(&raw).expect("command pattern must compile")
}

/// Parse a comma-separated argument list.
fn parse_args(raw: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((key, value)) = token.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            args.insert(key.to_string(), unquote(value.trim()).to_string());
        } else if token.contains(':') || token.contains('/') {
            // Bare backend:model / path-like token.
            args.insert("element".to_string(), token.to_string());
        } else {
            // Bare flag.
            args.insert(token.to_string(), "true".to_string());
        }
    }
    args
}

/// Strip one pair of matching single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Built-in session commands registered by `CommandRegistry::with_builtins`.
pub mod builtin {
    use super::*;
    use crate::models::{FailoverPolicy, FailoverRoute};
    use serde_json::json;

    pub fn all() -> Vec<Arc<dyn CommandHandler>> {
        vec![
            Arc::new(Hello),
            Arc::new(Set),
            Arc::new(Unset),
            Arc::new(Oneoff),
            Arc::new(CreateFailoverRoute),
            Arc::new(RouteAppend),
            Arc::new(RouteClear),
            Arc::new(RouteList),
        ]
    }

    /// `!/hello`: liveness check for the directive path.
    pub struct Hello;

    #[async_trait]
    impl CommandHandler for Hello {
        fn name(&self) -> &str {
            "hello"
        }

        async fn execute(
            &self,
            _args: &HashMap<String, String>,
            _session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            Ok(CommandResult::ok("hello"))
        }
    }

    /// `!/set(key=value, ...)`: update session configuration.
    ///
    /// Recognized keys: `project`, `backend`, `model`, `api-url`,
    /// `interactive`, `reasoning-effort`, `loop-enabled`,
    /// `min-pattern-length`, `max-pattern-length`, `min-repetitions`.
    pub struct Set;

    #[async_trait]
    impl CommandHandler for Set {
        fn name(&self) -> &str {
            "set"
        }

        async fn execute(
            &self,
            args: &HashMap<String, String>,
            session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            if args.is_empty() {
                return Ok(CommandResult::fail("set: no arguments given"));
            }

            let mut state = session.state.clone();
            let mut applied = Vec::new();
            let mut unknown = Vec::new();

            for (key, value) in args {
                match key.as_str() {
                    "project" => {
                        state = state.with_project(Some(value.clone()));
                        applied.push(key.clone());
                    }
                    "backend" => {
                        state = state
                            .with_backend_config(state.backend_config.with_backend(value.clone()));
                        applied.push(key.clone());
                    }
                    "model" => {
                        state = state
                            .with_backend_config(state.backend_config.with_model(value.clone()));
                        applied.push(key.clone());
                    }
                    "api-url" | "api_url" => {
                        state = state
                            .with_backend_config(state.backend_config.with_api_url(value.clone()));
                        applied.push(key.clone());
                    }
                    "interactive" => {
                        let on = parse_bool(value);
                        state = state
                            .with_backend_config(state.backend_config.with_interactive_mode(on));
                        applied.push(key.clone());
                    }
                    "reasoning-effort" | "reasoning_effort" => {
                        let mut reasoning = state.reasoning_config.clone();
                        reasoning.effort = Some(value.clone());
                        state = state.with_reasoning_config(reasoning);
                        applied.push(key.clone());
                    }
                    "loop-enabled" | "loop_enabled" => {
                        let mut loops = state.loop_config;
                        loops.enabled = parse_bool(value);
                        state = state.with_loop_config(loops);
                        applied.push(key.clone());
                    }
                    "min-pattern-length" | "min_pattern_length" => {
                        match value.parse::<usize>() {
                            Ok(n) => {
                                let mut loops = state.loop_config;
                                loops.min_pattern_length = n.max(1);
                                state = state.with_loop_config(loops);
                                applied.push(key.clone());
                            }
                            Err(_) => unknown.push(format!("{key}={value}")),
                        }
                    }
                    "max-pattern-length" | "max_pattern_length" => {
                        match value.parse::<usize>() {
                            Ok(n) => {
                                let mut loops = state.loop_config;
                                loops.max_pattern_length = n.max(1);
                                state = state.with_loop_config(loops);
                                applied.push(key.clone());
                            }
                            Err(_) => unknown.push(format!("{key}={value}")),
                        }
                    }
                    "min-repetitions" | "min_repetitions" => match value.parse::<usize>() {
                        Ok(n) => {
                            let mut loops = state.loop_config;
                            loops.min_repetitions = n.max(2);
                            state = state.with_loop_config(loops);
                            applied.push(key.clone());
                        }
                        Err(_) => unknown.push(format!("{key}={value}")),
                    },
                    _ => unknown.push(format!("{key}={value}")),
                }
            }

            if applied.is_empty() {
                // Nothing valid: report failure without touching state.
                return Ok(CommandResult::fail(format!(
                    "set: no recognized keys in [{}]",
                    unknown.join(", ")
                )));
            }

            applied.sort();
            let mut result = CommandResult::ok(format!("set: updated {}", applied.join(", ")))
                .with_state(state);
            if !unknown.is_empty() {
                // Partial failure: the valid keys are still committed.
                result.success = false;
                result.message = format!(
                    "set: updated {}; ignored {}",
                    applied.join(", "),
                    unknown.join(", ")
                );
            }
            Ok(result)
        }
    }

    /// `!/unset(project, model, ...)`: clear session configuration keys
    /// passed as bare flags.
    pub struct Unset;

    #[async_trait]
    impl CommandHandler for Unset {
        fn name(&self) -> &str {
            "unset"
        }

        async fn execute(
            &self,
            args: &HashMap<String, String>,
            session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            let mut state = session.state.clone();
            let mut cleared = Vec::new();

            for key in args.keys() {
                match key.as_str() {
                    "project" => {
                        state = state.with_project(None);
                        cleared.push(key.clone());
                    }
                    "backend" => {
                        state = state.with_backend_config(state.backend_config.with_backend(""));
                        cleared.push(key.clone());
                    }
                    "model" => {
                        state = state.with_backend_config(state.backend_config.with_model(""));
                        cleared.push(key.clone());
                    }
                    "oneoff" => {
                        state = state
                            .with_backend_config(state.backend_config.without_oneoff_backend());
                        cleared.push(key.clone());
                    }
                    _ => {}
                }
            }

            if cleared.is_empty() {
                return Ok(CommandResult::fail("unset: nothing to clear"));
            }
            cleared.sort();
            Ok(CommandResult::ok(format!("unset: cleared {}", cleared.join(", ")))
                .with_state(state))
        }
    }

    /// `!/oneoff(backend:model)`: single-use backend override, cleared
    /// after the next completion call.
    pub struct Oneoff;

    #[async_trait]
    impl CommandHandler for Oneoff {
        fn name(&self) -> &str {
            "oneoff"
        }

        async fn execute(
            &self,
            args: &HashMap<String, String>,
            session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            let Some(element) = args.get("element") else {
                return Ok(CommandResult::fail("oneoff: expected backend:model"));
            };
            let valid = element
                .split_once(':')
                .is_some_and(|(backend, model)| !backend.is_empty() && !model.is_empty());
            if !valid {
                return Ok(CommandResult::fail(format!(
                    "oneoff: '{element}' is not backend:model"
                )));
            }
            let state = session.state.with_backend_config(
                session.state.backend_config.with_oneoff_backend(element.clone()),
            );
            Ok(
                CommandResult::ok(format!("oneoff: next call routed to {element}"))
                    .with_state(state),
            )
        }
    }

    /// `!/create-failover-route(name=fast, policy=ordered)`.
    pub struct CreateFailoverRoute;

    #[async_trait]
    impl CommandHandler for CreateFailoverRoute {
        fn name(&self) -> &str {
            "create-failover-route"
        }

        async fn execute(
            &self,
            args: &HashMap<String, String>,
            session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            let Some(name) = args.get("name") else {
                return Ok(CommandResult::fail("create-failover-route: name required"));
            };
            let policy = match args.get("policy").map(String::as_str) {
                None | Some("ordered") => FailoverPolicy::Ordered,
                Some(other) => {
                    return Ok(CommandResult::fail(format!(
                        "create-failover-route: unknown policy '{other}'"
                    )))
                }
            };
            let route = FailoverRoute::new(name.clone(), policy);
            let state = session
                .state
                .with_backend_config(session.state.backend_config.with_failover_route(route));
            Ok(CommandResult::ok(format!("route '{name}' created")).with_state(state))
        }
    }

    /// `!/route-append(name=fast, backend:model)`.
    pub struct RouteAppend;

    #[async_trait]
    impl CommandHandler for RouteAppend {
        fn name(&self) -> &str {
            "route-append"
        }

        async fn execute(
            &self,
            args: &HashMap<String, String>,
            session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            let (Some(name), Some(element)) = (args.get("name"), args.get("element")) else {
                return Ok(CommandResult::fail(
                    "route-append: name and backend:model required",
                ));
            };
            let Some(route) = session.state.backend_config.failover_routes.get(name) else {
                return Ok(CommandResult::fail(format!("route '{name}' not found")));
            };
            let updated = route.with_element(element.clone());
            let state = session
                .state
                .with_backend_config(session.state.backend_config.with_failover_route(updated));
            Ok(CommandResult::ok(format!("route '{name}': appended {element}"))
                .with_state(state))
        }
    }

    /// `!/route-clear(name=fast)`.
    pub struct RouteClear;

    #[async_trait]
    impl CommandHandler for RouteClear {
        fn name(&self) -> &str {
            "route-clear"
        }

        async fn execute(
            &self,
            args: &HashMap<String, String>,
            session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            let Some(name) = args.get("name") else {
                return Ok(CommandResult::fail("route-clear: name required"));
            };
            let Some(route) = session.state.backend_config.failover_routes.get(name) else {
                return Ok(CommandResult::fail(format!("route '{name}' not found")));
            };
            let state = session.state.with_backend_config(
                session
                    .state
                    .backend_config
                    .with_failover_route(route.cleared()),
            );
            Ok(CommandResult::ok(format!("route '{name}' cleared")).with_state(state))
        }
    }

    /// `!/route-list(name=fast)`: report route elements in `data`.
    pub struct RouteList;

    #[async_trait]
    impl CommandHandler for RouteList {
        fn name(&self) -> &str {
            "route-list"
        }

        async fn execute(
            &self,
            args: &HashMap<String, String>,
            session: &Session,
            _context: &CommandContext,
        ) -> Result<CommandResult, GatewayError> {
            let Some(name) = args.get("name") else {
                return Ok(CommandResult::fail("route-list: name required"));
            };
            let Some(route) = session.state.backend_config.failover_routes.get(name) else {
                return Ok(CommandResult::fail(format!("route '{name}' not found")));
            };
            Ok(CommandResult::ok(format!(
                "route '{name}': {}",
                route.elements.join(", ")
            ))
            .with_data("elements", json!(route.elements)))
        }
    }

    fn parse_bool(value: &str) -> bool {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }
}
