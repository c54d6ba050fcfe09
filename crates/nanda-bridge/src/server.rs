//! Background server tasks.
//!
//! Each `start_server*` command spawns one task that runs an agent entry point
//! until its cancellation token fires. Failures (and panics) inside the task
//! have no pending command to answer, so they are reported as `server_error`
//! events.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRuntime, ApiServerConfig, ServeOptions};
use crate::emitter::Emitter;

/// Which agent entry point a handle runs.
#[derive(Debug, Clone)]
pub enum ServerMode {
    Plain,
    Api(ApiServerConfig),
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::Plain => "server",
            ServerMode::Api(_) => "api",
        }
    }
}

/// Ownership record for one running server task.
pub struct ServerHandle {
    mode: &'static str,
    token: CancellationToken,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

impl ServerHandle {
    pub fn spawn(agent: Arc<dyn AgentRuntime>, mode: ServerMode, emitter: Emitter) -> Self {
        let token = CancellationToken::new();
        let opts = ServeOptions::background(token.clone());
        let mode_name = mode.as_str();

        let task = tokio::spawn(async move {
            let run = async move {
                match mode {
                    ServerMode::Plain => agent.start_server(opts).await,
                    ServerMode::Api(config) => agent.start_server_api(config, opts).await,
                }
            };

            let error = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::info!(mode = mode_name, "Server task finished");
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("server task panicked: {}", panic_message(panic.as_ref())),
            };

            tracing::error!(mode = mode_name, error = %error, "Server task failed");
            if let Err(e) = emitter.event("server_error", json!({ "error": error })).await {
                tracing::warn!(error = %e, "Failed to report server error");
            }
        });

        Self {
            mode: mode_name,
            token,
            task,
            started_at: Utc::now(),
        }
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Ask the server to shut down. Does not wait for it.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end after [`stop`](Self::stop).
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(mode = self.mode, error = %e, "Server task did not exit cleanly");
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
