//! Backend selection with failover and rate-limit-aware retry.
//!
//! Resolution precedence for one completion call:
//!   1. session one-off override (cleared after one use)
//!   2. session persistent override
//!   3. `backend:model` declared on the request
//!   4. a failover route whose name matches the requested model
//!
//! Candidates are tried strictly in sequence, never raced. A candidate is
//! skipped when its key is rate limited; a failed attempt advances to the
//! next candidate only when failover is allowed. The last failure is
//! propagated once candidates run out.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connectors::BackendConnector;
use crate::errors::GatewayError;
use crate::models::{BackendResponse, CompletionRequest};
use crate::rate_limiter::RateLimiter;
use crate::session::SessionStore;

/// Explicit name → connector collection, injected at composition time.
#[derive(Default)]
pub struct BackendRegistry {
    connectors: HashMap<String, Arc<dyn BackendConnector>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn BackendConnector>) {
        self.connectors
            .insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendConnector>> {
        self.connectors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }
}

/// Per-call context handed to the router by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub session_id: String,
    /// Tag of the calling agent/client, when known.
    pub agent: Option<String>,
}

impl CallContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent: None,
        }
    }
}

/// One `backend:model` candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    backend: String,
    model: String,
}

impl Candidate {
    fn parse(element: &str) -> Option<Self> {
        let (backend, model) = element.split_once(':')?;
        if backend.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            backend: backend.to_string(),
            model: model.to_string(),
        })
    }

    fn key(&self) -> String {
        format!("{}:{}", self.backend, self.model)
    }
}

/// Resolves a concrete backend/model for each call and walks failover
/// candidates on failure, consulting the shared rate limiter.
pub struct BackendRouter {
    backends: BackendRegistry,
    store: Arc<dyn SessionStore>,
    limiter: Arc<RateLimiter>,
    /// Best-effort cache of discovered model lists per backend.
    model_cache: RwLock<HashMap<String, Vec<String>>>,
}

impl BackendRouter {
    pub fn new(
        backends: BackendRegistry,
        store: Arc<dyn SessionStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            backends,
            store,
            limiter,
            model_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Issue one completion call, walking failover candidates in order.
    pub async fn call_completion(
        &self,
        request: &CompletionRequest,
        stream: bool,
        allow_failover: bool,
        context: &CallContext,
    ) -> Result<BackendResponse, GatewayError> {
        let candidates = self.resolve_candidates(request, context).await?;

        let mut last_err: Option<GatewayError> = None;
        let mut limited_key: Option<(String, u64)> = None;

        for candidate in &candidates {
            let key = candidate.key();
            let limit = self.limiter.check_limit(&key);
            if limit.is_limited {
                debug!(candidate = %key, "skipping rate-limited candidate");
                let reset_in = limit
                    .reset_at
                    .map(|at| at.saturating_sub(unix_now()))
                    .unwrap_or(0);
                limited_key.get_or_insert((key, reset_in));
                continue;
            }

            if let Err(e) = self
                .validate_backend_and_model(&candidate.backend, &candidate.model)
                .await
            {
                if !allow_failover {
                    return Err(e);
                }
                last_err = Some(e);
                continue;
            }

            // Registry hit guaranteed by validate above.
            let Some(connector) = self.backends.get(&candidate.backend) else {
                continue;
            };

            let attempt_request = CompletionRequest {
                model: candidate.model.clone(),
                messages: request.messages.clone(),
                extra: request.extra.clone(),
            };

            match connector.chat_completions(&attempt_request, stream).await {
                Ok(response) => {
                    self.limiter.record_usage(&key, 1);
                    info!(candidate = %key, stream, "completion attempt succeeded");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(candidate = %key, error = %e, "completion attempt failed");
                    if !allow_failover {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }

        if let Some(e) = last_err {
            return Err(e);
        }
        if let Some((key, reset_in_secs)) = limited_key {
            return Err(GatewayError::RateLimited {
                key,
                reset_in_secs,
            });
        }
        Err(GatewayError::backend(
            "-",
            &request.model,
            "no routable candidates for request",
        ))
    }

    /// Backend must be functional (credentials present); the model is
    /// checked against a best-effort cached model list and unknown models
    /// are allowed with a warning, tolerating stale discovery data.
    pub async fn validate_backend_and_model(
        &self,
        backend: &str,
        model: &str,
    ) -> Result<(), GatewayError> {
        let Some(connector) = self.backends.get(backend) else {
            return Err(GatewayError::backend(
                backend,
                model,
                "backend not registered",
            ));
        };
        if !connector.is_functional() {
            return Err(GatewayError::backend(
                backend,
                model,
                "backend not functional (credentials missing)",
            ));
        }

        let known = {
            let cache = self.model_cache.read().await;
            cache.get(backend).cloned()
        };
        let known = match known {
            Some(models) => Some(models),
            None => match connector.get_available_models().await {
                Ok(models) => {
                    self.model_cache
                        .write()
                        .await
                        .insert(backend.to_string(), models.clone());
                    Some(models)
                }
                // Discovery is best effort; a backend without a model list
                // is still routable.
                Err(e) => {
                    debug!(backend, error = %e, "model discovery unavailable");
                    None
                }
            },
        };

        if let Some(models) = known {
            if !models.is_empty() && !models.iter().any(|m| m == model) {
                warn!(backend, model, "model not in discovered list; proceeding anyway");
            }
        }
        Ok(())
    }

    /// Build the ordered candidate list for this call. Clears a one-off
    /// override as a side effect (whole-state replacement, persisted).
    async fn resolve_candidates(
        &self,
        request: &CompletionRequest,
        context: &CallContext,
    ) -> Result<Vec<Candidate>, GatewayError> {
        let mut session = self.store.get_session(&context.session_id).await?;
        let config = session.state.backend_config.clone();

        // 1. One-off override. Cleared before the attempt so that even a
        // malformed element is spent rather than re-tried forever.
        if let Some(element) = config.oneoff_backend.clone() {
            session.state = session
                .state
                .with_backend_config(config.without_oneoff_backend());
            self.store.update_session(session).await?;
            let Some(candidate) = Candidate::parse(&element) else {
                return Err(GatewayError::backend(
                    "-",
                    &element,
                    "malformed one-off override",
                ));
            };
            debug!(candidate = %candidate.key(), "using one-off override");
            return Ok(vec![candidate]);
        }

        // 2. Persistent session override.
        if !config.backend_type.is_empty() && !config.model.is_empty() {
            return Ok(vec![Candidate {
                backend: config.backend_type.clone(),
                model: config.model.clone(),
            }]);
        }

        // 3. backend:model declared on the request.
        if let Some(candidate) = Candidate::parse(&request.model) {
            return Ok(vec![candidate]);
        }

        // 4. Failover route matching the declared model name.
        if let Some(route) = config.failover_routes.get(&request.model) {
            let candidates: Vec<Candidate> = route
                .elements
                .iter()
                .filter_map(|e| Candidate::parse(e))
                .collect();
            if candidates.is_empty() {
                return Err(GatewayError::backend(
                    "-",
                    &request.model,
                    "failover route has no usable elements",
                ));
            }
            return Ok(candidates);
        }

        Err(GatewayError::backend(
            "-",
            &request.model,
            "no backend resolved: expected backend:model or a failover route name",
        ))
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailoverPolicy, FailoverRoute};
    use crate::session::InMemorySessionStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted connector: succeeds or fails on command, counts calls.
    struct StaticConnector {
        name: String,
        functional: bool,
        fail: bool,
        models: Vec<String>,
        calls: AtomicUsize,
    }

    impl StaticConnector {
        fn ok(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                functional: true,
                fail: false,
                models: vec![],
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                functional: true,
                fail: true,
                models: vec![],
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BackendConnector for StaticConnector {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_functional(&self) -> bool {
            self.functional
        }

        async fn get_available_models(&self) -> Result<Vec<String>, GatewayError> {
            Ok(self.models.clone())
        }

        async fn chat_completions(
            &self,
            request: &CompletionRequest,
            _stream: bool,
        ) -> Result<BackendResponse, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::backend(
                    &self.name,
                    &request.model,
                    "transport error",
                ));
            }
            Ok(BackendResponse::Complete(serde_json::json!({
                "served_by": self.name,
                "model": request.model,
            })))
        }
    }

    fn router_with(
        connectors: Vec<Arc<StaticConnector>>,
        store: Arc<InMemorySessionStore>,
    ) -> BackendRouter {
        let mut registry = BackendRegistry::new();
        for c in connectors {
            registry.register(c);
        }
        BackendRouter::new(registry, store, Arc::new(RateLimiter::new()))
    }

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.into(),
            ..CompletionRequest::default()
        }
    }

    async fn install_route(store: &InMemorySessionStore, session_id: &str, elements: &[&str]) {
        let mut session = store.get_session(session_id).await.unwrap();
        let mut route = FailoverRoute::new("fast", FailoverPolicy::Ordered);
        for e in elements {
            route = route.with_element(*e);
        }
        session.state = session
            .state
            .with_backend_config(session.state.backend_config.with_failover_route(route));
        store.update_session(session).await.unwrap();
    }

    fn served_by(response: BackendResponse) -> String {
        match response {
            BackendResponse::Complete(v) => v["served_by"].as_str().unwrap_or("").to_string(),
            BackendResponse::Streaming(_) => panic!("expected complete response"),
        }
    }

    #[tokio::test]
    async fn request_with_backend_model_routes_directly() {
        let store = InMemorySessionStore::shared();
        let router = router_with(vec![StaticConnector::ok("b1")], store);
        let response = router
            .call_completion(&request("b1:m1"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(served_by(response), "b1");
    }

    #[tokio::test]
    async fn failover_route_advances_past_transport_errors() {
        let store = InMemorySessionStore::shared();
        let b1 = StaticConnector::failing("b1");
        let b2 = StaticConnector::ok("b2");
        let router = router_with(vec![b1.clone(), b2.clone()], store.clone());
        install_route(&store, "s1", &["b1:m1", "b2:m2"]).await;

        let response = router
            .call_completion(&request("fast"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        // b1's error is swallowed; b2's success is returned.
        assert_eq!(served_by(response), "b2");
        assert_eq!(b1.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b2.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_route_propagates_last_failure() {
        let store = InMemorySessionStore::shared();
        let router =
            router_with(vec![StaticConnector::failing("b1"), StaticConnector::failing("b2")], store.clone());
        install_route(&store, "s1", &["b1:m1", "b2:m2"]).await;

        let err = router
            .call_completion(&request("fast"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap_err();
        match err {
            GatewayError::Backend { backend, .. } => assert_eq!(backend, "b2"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failover_disabled_surfaces_first_failure() {
        let store = InMemorySessionStore::shared();
        let b2 = StaticConnector::ok("b2");
        let router =
            router_with(vec![StaticConnector::failing("b1"), b2.clone()], store.clone());
        install_route(&store, "s1", &["b1:m1", "b2:m2"]).await;

        let err = router
            .call_completion(&request("fast"), false, false, &CallContext::for_session("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend { .. }));
        assert_eq!(b2.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limited_candidate_is_skipped() {
        let store = InMemorySessionStore::shared();
        let b1 = StaticConnector::ok("b1");
        let b2 = StaticConnector::ok("b2");
        let router = router_with(vec![b1.clone(), b2.clone()], store.clone());
        install_route(&store, "s1", &["b1:m1", "b2:m2"]).await;

        router.rate_limiter().set_limit("b1:m1", 1, Duration::from_secs(60));
        router.rate_limiter().record_usage("b1:m1", 1);

        let response = router
            .call_completion(&request("fast"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(served_by(response), "b2");
        assert_eq!(b1.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_candidates_limited_yields_rate_limited_error() {
        let store = InMemorySessionStore::shared();
        let router = router_with(vec![StaticConnector::ok("b1")], store.clone());
        install_route(&store, "s1", &["b1:m1"]).await;

        router.rate_limiter().set_limit("b1:m1", 1, Duration::from_secs(60));
        router.rate_limiter().record_usage("b1:m1", 1);

        let err = router
            .call_completion(&request("fast"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn oneoff_override_wins_and_is_cleared_after_one_use() {
        let store = InMemorySessionStore::shared();
        let b1 = StaticConnector::ok("b1");
        let b9 = StaticConnector::ok("b9");
        let router = router_with(vec![b1.clone(), b9.clone()], store.clone());

        let mut session = store.get_session("s1").await.unwrap();
        session.state = session.state.with_backend_config(
            session.state.backend_config.with_oneoff_backend("b9:m9"),
        );
        store.update_session(session).await.unwrap();

        let first = router
            .call_completion(&request("b1:m1"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(served_by(first), "b9");

        // Cleared: the declared backend:model applies again.
        let session = store.get_session("s1").await.unwrap();
        assert!(session.state.backend_config.oneoff_backend.is_none());

        let second = router
            .call_completion(&request("b1:m1"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(served_by(second), "b1");
    }

    #[tokio::test]
    async fn malformed_oneoff_override_is_spent_by_its_failed_use() {
        let store = InMemorySessionStore::shared();
        let b1 = StaticConnector::ok("b1");
        let router = router_with(vec![b1.clone()], store.clone());

        let mut session = store.get_session("s1").await.unwrap();
        session.state = session.state.with_backend_config(
            session.state.backend_config.with_oneoff_backend("b1:"),
        );
        store.update_session(session).await.unwrap();

        let err = router
            .call_completion(&request("b1:m1"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend { .. }));

        // The bad override is consumed; routing recovers on the next call.
        let session = store.get_session("s1").await.unwrap();
        assert!(session.state.backend_config.oneoff_backend.is_none());
        let response = router
            .call_completion(&request("b1:m1"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(served_by(response), "b1");
    }

    #[tokio::test]
    async fn persistent_override_beats_request_model() {
        let store = InMemorySessionStore::shared();
        let b1 = StaticConnector::ok("b1");
        let b7 = StaticConnector::ok("b7");
        let router = router_with(vec![b1, b7], store.clone());

        let mut session = store.get_session("s1").await.unwrap();
        session.state = session.state.with_backend_config(
            session
                .state
                .backend_config
                .with_backend("b7")
                .with_model("m7"),
        );
        store.update_session(session).await.unwrap();

        let response = router
            .call_completion(&request("b1:m1"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(served_by(response), "b7");
    }

    #[tokio::test]
    async fn non_functional_backend_is_a_failover_step() {
        let store = InMemorySessionStore::shared();
        let dead = Arc::new(StaticConnector {
            name: "dead".into(),
            functional: false,
            fail: false,
            models: vec![],
            calls: AtomicUsize::new(0),
        });
        let live = StaticConnector::ok("live");
        let router = router_with(vec![dead.clone(), live], store.clone());

        let mut session = store.get_session("s1").await.unwrap();
        let route = FailoverRoute::new("fast", FailoverPolicy::Ordered)
            .with_element("dead:m1")
            .with_element("live:m2");
        session.state = session
            .state
            .with_backend_config(session.state.backend_config.with_failover_route(route));
        store.update_session(session).await.unwrap();

        let response = router
            .call_completion(&request("fast"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(served_by(response), "live");
        assert_eq!(dead.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_model_name_without_route_errors() {
        let store = InMemorySessionStore::shared();
        let router = router_with(vec![StaticConnector::ok("b1")], store);
        let err = router
            .call_completion(&request("gpt-nonexistent"), false, true, &CallContext::for_session("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend { .. }));
    }
}
