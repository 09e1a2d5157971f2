pub mod context;
pub mod sse;

mod chat;
mod payload;
mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ApiConfig, Config};
use crate::error::{ErrorKind, GenQueueError, Result};

pub use chat::ChatBackend;
pub use context::{Attachment, GenerationRequest, Role, Turn};
pub use stream::StreamBackend;

// -- Results -----------------------------------------------------------------

/// Raw output of one successful request: result fragments (image URLs or
/// data URIs) in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub fragments: Vec<String>,
}

impl Generation {
    pub fn content(&self) -> String {
        self.fragments.join("\n")
    }
}

/// Outcome of one dispatched prompt as handed to the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub ok: bool,
    pub content: String,
    pub error_kind: Option<ErrorKind>,
}

impl GenerationResult {
    pub fn success(generation: &Generation) -> Self {
        Self {
            ok: true,
            content: generation.content(),
            error_kind: None,
        }
    }

    pub fn failure(err: &GenQueueError) -> Self {
        Self {
            ok: false,
            content: err.user_message(),
            error_kind: Some(err.kind()),
        }
    }
}

// -- Backend trait -----------------------------------------------------------

/// Trait that all generation backends implement.  Allows dynamic dispatch
/// so the queue can be driven by a real API or a test double.
#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Human-readable name of this backend (e.g. "SSE image stream").
    fn name(&self) -> &str;

    /// Send one request and wait for its complete result.
    async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Generation>;
}

#[async_trait::async_trait]
impl GenerationBackend for ChatBackend {
    fn name(&self) -> &str {
        "chat completions"
    }
    async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Generation> {
        self.generate(req).await
    }
}

#[async_trait::async_trait]
impl GenerationBackend for StreamBackend {
    fn name(&self) -> &str {
        "SSE image stream"
    }
    async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Generation> {
        self.generate(req).await
    }
}

// -- Shared HTTP settings ----------------------------------------------------

/// Connection settings resolved from config and environment.
///
/// Priority (highest → lowest):
///   1. Environment variables (`GENQUEUE_API_KEY`, `GENQUEUE_BASE_URL`, `GENQUEUE_MODEL`)
///   2. `[api]` section of `config.toml`
///   3. Built-in defaults
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

fn env_or(var: &str, configured: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| (!configured.is_empty()).then(|| configured.to_string()))
}

impl ApiSettings {
    /// Resolve settings from the `[api]` section, letting environment
    /// variables win.
    pub fn from_config(api: &ApiConfig) -> Self {
        let defaults = ApiConfig::default();
        let base_url = env_or("GENQUEUE_BASE_URL", &api.base_url)
            .unwrap_or(defaults.base_url)
            .trim_end_matches('/')
            .to_string();
        let model = env_or("GENQUEUE_MODEL", &api.model).unwrap_or(defaults.model);
        let timeout_secs = if api.timeout_secs > 0 {
            api.timeout_secs
        } else {
            defaults.timeout_secs
        };

        Self {
            base_url,
            api_key: env_or("GENQUEUE_API_KEY", &api.api_key),
            model,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn http_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("genqueue/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GenQueueError::Config(format!("failed to create HTTP client: {e}")))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: Some("test-key".into()),
            model: "test-model".into(),
            timeout: Duration::from_secs(5),
        }
    }
}

// -- Backend registry --------------------------------------------------------

/// Registry of available generation backends keyed by config name.  The
/// built-in backends are registered by [`GenerationEngine::new`]; others can
/// be added with `register()`.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a backend under `key`, replacing any previous one.
    pub fn register(&mut self, key: &str, backend: Arc<dyn GenerationBackend>) {
        info!(backend = key, name = backend.name(), "generation backend registered");
        self.backends.insert(key.to_string(), backend);
    }

    /// Get a registered backend by key.
    pub fn get(&self, key: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(key).cloned()
    }

    /// List all registered backend keys, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.backends.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// -- GenerationEngine --------------------------------------------------------

/// Dispatches to the backend selected by `api.backend` (overridable with
/// the `GENQUEUE_BACKEND` environment variable).
///
/// Built-in backends:
/// - **stream** -- server-sent image frames (default)
/// - **chat**   -- single JSON chat completion
pub struct GenerationEngine {
    /// The active backend used for generation.
    active: Arc<dyn GenerationBackend>,
    /// The key identifying the active backend.
    active_key: String,
    /// Registry of all available backends.
    pub backends: BackendRegistry,
}

impl GenerationEngine {
    /// Build the engine from config.
    ///
    /// Registers the built-in backends with the resolved [`ApiSettings`] and
    /// selects `api.backend`, or `GENQUEUE_BACKEND` when set.  Valid values:
    /// `"stream"`, `"chat"`.
    pub fn new(config: &Config) -> Result<Self> {
        let key = std::env::var("GENQUEUE_BACKEND").unwrap_or_else(|_| config.api.backend.clone());
        let settings = ApiSettings::from_config(&config.api);

        let mut backends = BackendRegistry::new();
        backends.register("chat", Arc::new(ChatBackend::new(settings.clone())?));
        backends.register("stream", Arc::new(StreamBackend::new(settings)?));

        Self::select(backends, &key)
    }

    /// Build an engine around an explicit registry.  Fails with a config
    /// error naming the available keys when `key` is not registered.
    pub fn select(backends: BackendRegistry, key: &str) -> Result<Self> {
        let active = backends.get(key).ok_or_else(|| {
            GenQueueError::Config(format!(
                "unknown generation backend \"{key}\", available: [{}]",
                backends.list().join(", "),
            ))
        })?;
        info!(backend = %key, name = active.name(), "generation backend selected");

        Ok(Self {
            active,
            active_key: key.to_string(),
            backends,
        })
    }

    /// Return the key of the active backend.
    pub fn active_backend(&self) -> &str {
        &self.active_key
    }
}

#[async_trait::async_trait]
impl GenerationBackend for GenerationEngine {
    fn name(&self) -> &str {
        self.active.name()
    }
    async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Generation> {
        self.active.generate(req).await
    }
}
