//! Built-in HTTP agent.
//!
//! A small stand-in for the wrapped agent library: it serves the improvement
//! function over HTTP and can enroll itself with a registry. TLS material is
//! accepted but not terminated here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{AgentError, AgentFactory, AgentRuntime, ApiServerConfig, ServeOptions};
use crate::improver::Improver;
use crate::version::{BRIDGE_VERSION, VersionInfo};

#[derive(Debug, Clone)]
pub struct HttpAgentSettings {
    /// Bind address for both servers.
    pub host: String,
    /// Port for the plain `start_server` entry point.
    pub port: u16,
    /// Timeout for registry requests.
    pub registry_timeout: Duration,
}

impl Default for HttpAgentSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6000,
            registry_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpAgentFactory {
    settings: HttpAgentSettings,
}

impl HttpAgentFactory {
    pub fn new(settings: HttpAgentSettings) -> Self {
        Self { settings }
    }
}

impl AgentFactory for HttpAgentFactory {
    fn create(&self, improver: Arc<dyn Improver>) -> Result<Arc<dyn AgentRuntime>, AgentError> {
        let user_agent = format!("nanda-bridge/{}", BRIDGE_VERSION);
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(self.settings.registry_timeout)
            .build()
            .map_err(|e| AgentError::Unavailable(format!("failed to create HTTP client: {e}")))?;

        info!(logic = %improver.name(), "Created HTTP agent");
        Ok(Arc::new(HttpAgent {
            settings: self.settings.clone(),
            improver,
            client,
        }))
    }
}

pub struct HttpAgent {
    settings: HttpAgentSettings,
    improver: Arc<dyn Improver>,
    client: reqwest::Client,
}

pub struct AgentState {
    pub agent_id: String,
    pub improver: Arc<dyn Improver>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agent_id: String,
    pub version: VersionInfo,
}

#[derive(Debug, Deserialize)]
pub struct ImproveRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ImproveResponse {
    pub improved_message: String,
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
struct Registration<'a> {
    agent_id: &'a str,
    agent_url: String,
    api_url: String,
}

pub fn routes(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/improve", post(improve))
        .with_state(state)
}

async fn health(State(state): State<Arc<AgentState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        agent_id: state.agent_id.clone(),
        version: VersionInfo::new(),
    })
}

async fn improve(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<ImproveRequest>,
) -> impl IntoResponse {
    let improved_message = state.improver.improve(&request.message).await;
    (
        StatusCode::OK,
        Json(ImproveResponse {
            improved_message,
            agent_id: state.agent_id.clone(),
        }),
    )
}

async fn bind(addr: String) -> Result<TcpListener, AgentError> {
    TcpListener::bind(&addr)
        .await
        .map_err(|source| AgentError::Bind { addr, source })
}

async fn serve(
    listener: TcpListener,
    app: Router,
    opts: ServeOptions,
    name: &'static str,
) -> Result<(), AgentError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Starting {} on {}", name, addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(opts.shutdown, opts.install_signal_handlers))
        .await
        .map_err(|e| AgentError::Serve(e.to_string()))?;
    info!("{} shutdown complete", name);
    Ok(())
}

/// Wait for cancellation, or ctrl-c when signal handlers are allowed.
async fn shutdown_signal(shutdown: CancellationToken, install_signal_handlers: bool) {
    let ctrl_c = async {
        if !install_signal_handlers {
            return std::future::pending::<()>().await;
        }
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Agent server stop requested");
        }
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down agent server");
        }
    }
}

/// Enroll the agent with a registry (`POST <registry>/register`).
pub async fn register_agent(
    client: &reqwest::Client,
    registry: &str,
    config: &ApiServerConfig,
) -> Result<(), AgentError> {
    let url = format!("{}/register", registry.trim_end_matches('/'));
    let registration = Registration {
        agent_id: config.agent_id(),
        agent_url: config.agent_url(),
        api_url: config.api_url(),
    };

    let response = client
        .post(&url)
        .json(&registration)
        .send()
        .await
        .map_err(|e| AgentError::Registry(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AgentError::Registry(format!("{url} returned {status}")));
    }
    info!(%url, agent_id = %registration.agent_id, "Registered agent");
    Ok(())
}

impl HttpAgent {
    fn state(&self, agent_id: &str) -> Arc<AgentState> {
        Arc::new(AgentState {
            agent_id: agent_id.to_string(),
            improver: Arc::clone(&self.improver),
        })
    }
}

#[async_trait]
impl AgentRuntime for HttpAgent {
    async fn start_server(&self, opts: ServeOptions) -> Result<(), AgentError> {
        let listener = bind(format!("{}:{}", self.settings.host, self.settings.port)).await?;
        serve(listener, routes(self.state("default")), opts, "agent server").await
    }

    async fn start_server_api(
        &self,
        config: ApiServerConfig,
        opts: ServeOptions,
    ) -> Result<(), AgentError> {
        info!(domain = %config.domain, agent_id = %config.agent_id(), "Starting agent API server");
        if config.ssl && config.cert.is_some() && config.key.is_some() {
            tracing::warn!("TLS termination is not supported by the built-in agent, serving plain HTTP");
        }

        let agent_listener = bind(format!("{}:{}", self.settings.host, config.port)).await?;
        let api_listener = bind(format!("{}:{}", self.settings.host, config.api_port)).await?;

        if let Some(ref registry) = config.registry
            && let Err(e) = register_agent(&self.client, registry, &config).await
        {
            tracing::warn!(error = %e, "Registry enrollment failed, continuing unregistered");
        }

        let state = self.state(config.agent_id());
        tokio::try_join!(
            serve(agent_listener, routes(Arc::clone(&state)), opts.clone(), "agent server"),
            serve(api_listener, routes(state), opts, "API server"),
        )?;
        Ok(())
    }
}
