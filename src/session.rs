//! Session state and the async session store.
//!
//! Sessions are owned by the store; the interceptor reads and replaces
//! whole `SessionState` values and the router reads them. Updates are
//! last-writer-wins; coordinating concurrent commands against the same
//! session id is the store's problem, not this crate's.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

use crate::errors::GatewayError;
use crate::models::{BackendConfiguration, ChatMessage, LoopDetectionConfig, ReasoningConfig};

/// Mutable per-session state. Replaced as a whole object, never patched
/// field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub backend_config: BackendConfiguration,
    pub reasoning_config: ReasoningConfig,
    pub loop_config: LoopDetectionConfig,
    pub project: Option<String>,
}

impl SessionState {
    #[must_use]
    pub fn with_backend_config(&self, backend_config: BackendConfiguration) -> Self {
        let mut next = self.clone();
        next.backend_config = backend_config;
        next
    }

    #[must_use]
    pub fn with_reasoning_config(&self, reasoning_config: ReasoningConfig) -> Self {
        let mut next = self.clone();
        next.reasoning_config = reasoning_config;
        next
    }

    #[must_use]
    pub fn with_loop_config(&self, loop_config: LoopDetectionConfig) -> Self {
        let mut next = self.clone();
        next.loop_config = loop_config;
        next
    }

    #[must_use]
    pub fn with_project(&self, project: Option<String>) -> Self {
        let mut next = self.clone();
        next.project = project;
        next
    }
}

/// One recorded prompt/response exchange.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub prompt: ChatMessage,
    pub response: Option<String>,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub at: SystemTime,
}

/// A chat session as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub history: Vec<Interaction>,
    /// Tag of the agent/client that opened the session, when known.
    pub agent: Option<String>,
    pub created_at: SystemTime,
    pub last_active_at: SystemTime,
}

impl Session {
    /// Session with a freshly generated id, for clients that did not
    /// supply one.
    pub fn anonymous() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            state: SessionState::default(),
            history: Vec::new(),
            agent: None,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = SystemTime::now();
    }

    pub fn record_interaction(&mut self, interaction: Interaction) {
        self.history.push(interaction);
        self.touch();
    }
}

/// Opaque async session store consumed by the pipeline.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the session for `id`, creating it if the store supports that.
    async fn get_session(&self, id: &str) -> Result<Session, GatewayError>;

    /// Persist the full session, replacing whatever was stored.
    async fn update_session(&self, session: Session) -> Result<(), GatewayError>;
}

/// In-process store backed by a `tokio::sync::RwLock`. Creates sessions on
/// first access and touches last-active on reads.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of sessions currently held.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session(&self, id: &str) -> Result<Session, GatewayError> {
        if let Some(existing) = self.sessions.read().await.get(id) {
            return Ok(existing.clone());
        }

        let mut guard = self.sessions.write().await;
        let session = guard
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id))
            .clone();
        Ok(session)
    }

    async fn update_session(&self, mut session: Session) -> Result<(), GatewayError> {
        session.touch();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }
}
