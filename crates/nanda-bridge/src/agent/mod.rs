//! Agent runtime contract.
//!
//! The bridge drives an agent library it treats as opaque: an
//! [`AgentFactory`] builds an [`AgentRuntime`] from one improvement function,
//! and the runtime exposes two long-running server entry points. The bridge
//! always runs them off the main task, so it passes
//! `install_signal_handlers: false` and a cancellation token instead of
//! letting the runtime own process signals.

pub mod http;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::improver::Improver;

/// Registry landing page used to build enrollment links.
pub const ENROLLMENT_BASE_URL: &str = "https://chat.nanda-registry.com/landing.html";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent backend unavailable: {0}")]
    Unavailable(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(String),

    #[error("registry enrollment failed: {0}")]
    Registry(String),
}

/// How a server entry point should run.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Whether the runtime may install OS signal handlers (ctrl-c).
    pub install_signal_handlers: bool,
    /// Cancelled when the bridge wants the server to stop.
    pub shutdown: CancellationToken,
}

impl ServeOptions {
    /// Options for a server running in a background task.
    pub fn background(shutdown: CancellationToken) -> Self {
        Self {
            install_signal_handlers: false,
            shutdown,
        }
    }
}

fn default_port() -> u16 {
    6000
}

fn default_api_port() -> u16 {
    6001
}

fn default_ssl() -> bool {
    true
}

/// Options for the API server entry point.
#[derive(Clone, Deserialize)]
pub struct ApiServerConfig {
    pub anthropic_key: String,
    pub domain: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_ssl")]
    pub ssl: bool,
}

/// Why a `start_server_api` payload was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ApiConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid start_server_api payload: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl ApiServerConfig {
    /// Parse a command payload. `domain` and `anthropic_key` must be present
    /// and non-empty.
    pub fn from_payload(data: &Value) -> Result<Self, ApiConfigError> {
        for field in ["domain", "anthropic_key"] {
            let present = data
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ApiConfigError::MissingField(field));
            }
        }
        Ok(serde_json::from_value(data.clone())?)
    }

    pub fn agent_id(&self) -> &str {
        self.agent_id.as_deref().unwrap_or("default")
    }

    pub fn enrollment_link(&self) -> String {
        format!("{ENROLLMENT_BASE_URL}?agentId={}", self.agent_id())
    }

    fn scheme(&self) -> &'static str {
        if self.ssl { "https" } else { "http" }
    }

    /// URL peers use to reach the agent server.
    pub fn agent_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("{}://{}:{}", self.scheme(), self.domain, self.port))
    }

    /// URL clients use to reach the API server.
    pub fn api_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| format!("{}://{}:{}", self.scheme(), self.domain, self.api_port))
    }
}

impl fmt::Debug for ApiServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiServerConfig")
            .field("anthropic_key", &"<redacted>")
            .field("domain", &self.domain)
            .field("agent_id", &self.agent_id)
            .field("port", &self.port)
            .field("api_port", &self.api_port)
            .field("registry", &self.registry)
            .field("public_url", &self.public_url)
            .field("api_url", &self.api_url)
            .field("cert", &self.cert)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// The wrapped agent instance.
#[async_trait]
pub trait AgentRuntime: Send + Sync + 'static {
    /// Run the plain agent server until `opts.shutdown` is cancelled.
    async fn start_server(&self, opts: ServeOptions) -> Result<(), AgentError>;

    /// Run the agent and API servers until `opts.shutdown` is cancelled.
    async fn start_server_api(
        &self,
        config: ApiServerConfig,
        opts: ServeOptions,
    ) -> Result<(), AgentError>;
}

/// Builds the wrapped agent instance from an improvement function.
pub trait AgentFactory: Send + Sync {
    fn create(&self, improver: Arc<dyn Improver>) -> Result<Arc<dyn AgentRuntime>, AgentError>;
}

/// Resolve an agent backend by name. Failure here is a startup error.
pub fn load_factory(
    backend: &str,
    settings: http::HttpAgentSettings,
) -> Result<Arc<dyn AgentFactory>, AgentError> {
    match backend {
        "http" => Ok(Arc::new(http::HttpAgentFactory::new(settings))),
        other => Err(AgentError::Unavailable(format!(
            "unknown agent backend '{other}', expected 'http'"
        ))),
    }
}
