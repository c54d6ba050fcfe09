//! Command routing.
//!
//! Maps a command name to its handler and normalizes every handler result
//! into an [`Outcome`]. Handlers never write responses themselves; the
//! session correlates the outcome with the command's `id`.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::agent::{AgentError, AgentFactory, AgentRuntime, ApiConfigError, ApiServerConfig};
use crate::bridge::protocol::{Command, Outcome};
use crate::callback::CallbackExecutor;
use crate::emitter::Emitter;
use crate::improver::{
    CallbackImprover, DEFAULT_LOGIC_NAME, DefaultImprover, Improver, RegisteredCallback,
};
use crate::server::{ServerHandle, ServerMode};
use crate::session::SessionState;

/// Port reported for the plain server when none is configured.
pub const DEFAULT_AGENT_PORT: u16 = 6000;

/// The fixed command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    RegisterImprovementLogic,
    StartServer,
    StartServerApi,
    TestImprovement,
    GetStatus,
    StopServer,
    Shutdown,
}

impl CommandKind {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "register_improvement_logic" => Self::RegisterImprovementLogic,
            "start_server" => Self::StartServer,
            "start_server_api" => Self::StartServerApi,
            "test_improvement" => Self::TestImprovement,
            "get_status" => Self::GetStatus,
            "stop_server" => Self::StopServer,
            "shutdown" => Self::Shutdown,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterImprovementLogic => "register_improvement_logic",
            Self::StartServer => "start_server",
            Self::StartServerApi => "start_server_api",
            Self::TestImprovement => "test_improvement",
            Self::GetStatus => "get_status",
            Self::StopServer => "stop_server",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("No improvement logic registered")]
    NoImprover,

    #[error("failed to create agent instance: {0}")]
    Agent(#[from] AgentError),

    #[error(transparent)]
    ApiConfig(#[from] ApiConfigError),
}

/// Everything a command handler may read or change.
pub struct BridgeState {
    factory: Arc<dyn AgentFactory>,
    executor: Arc<CallbackExecutor>,
    emitter: Emitter,
    agent_port: u16,
    callback: Option<RegisteredCallback>,
    improver: Option<Arc<dyn Improver>>,
    instance: Option<Arc<dyn AgentRuntime>>,
    servers: Vec<ServerHandle>,
    running: bool,
    phase: SessionState,
}

impl BridgeState {
    pub fn new(
        factory: Arc<dyn AgentFactory>,
        executor: Arc<CallbackExecutor>,
        emitter: Emitter,
    ) -> Self {
        Self {
            factory,
            executor,
            emitter,
            agent_port: DEFAULT_AGENT_PORT,
            callback: None,
            improver: None,
            instance: None,
            servers: Vec::new(),
            running: false,
            phase: SessionState::Created,
        }
    }

    pub fn with_agent_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    /// Preset the active improvement function, as if it had been registered.
    pub fn with_improver(mut self, improver: Arc<dyn Improver>) -> Self {
        self.improver = Some(improver);
        self
    }

    pub fn phase(&self) -> SessionState {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: SessionState) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Session state change");
        self.phase = phase;
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn callback(&self) -> Option<&RegisteredCallback> {
        self.callback.as_ref()
    }

    pub fn server_running(&self) -> bool {
        self.running
    }

    pub fn tracked_servers(&self) -> usize {
        self.servers.len()
    }

    /// State to return to when no server is running.
    fn idle_phase(&self) -> SessionState {
        if self.callback.is_some() {
            SessionState::CallbackRegistered
        } else {
            SessionState::Idle
        }
    }

    /// Build the wrapped instance on first use.
    ///
    /// With no logic registered the default transform is used, and it becomes
    /// the active function. On failure nothing is changed.
    fn ensure_instance(&mut self) -> Result<Arc<dyn AgentRuntime>, CommandError> {
        if let Some(ref instance) = self.instance {
            return Ok(Arc::clone(instance));
        }

        let improver = match self.improver {
            Some(ref improver) => Arc::clone(improver),
            None => {
                tracing::info!("Using default improvement logic");
                Arc::new(DefaultImprover) as Arc<dyn Improver>
            }
        };
        let instance = self.factory.create(Arc::clone(&improver))?;
        tracing::info!(logic = %improver.name(), "Agent instance created");

        self.improver = Some(improver);
        self.instance = Some(Arc::clone(&instance));
        Ok(instance)
    }

    fn spawn_server(&mut self, instance: Arc<dyn AgentRuntime>, mode: ServerMode) {
        self.servers.retain(|handle| !handle.is_finished());
        if !self.servers.is_empty() {
            tracing::warn!(
                running = self.servers.len(),
                "Starting another server while a previous one is still running"
            );
        }
        let handle = ServerHandle::spawn(instance, mode, self.emitter.clone());
        self.servers.push(handle);
        self.running = true;
    }

    /// Clear the running flag and cancel every tracked server task.
    pub fn stop_servers(&mut self) {
        self.running = false;
        for handle in self.servers.drain(..) {
            tracing::info!(mode = handle.mode(), started_at = %handle.started_at(), "Stopping server");
            handle.stop();
        }
    }

    async fn emit_event(&self, name: &str, data: Value) {
        if let Err(e) = self.emitter.event(name, data).await {
            tracing::warn!(event = name, error = %e, "Failed to emit event");
        }
    }
}

/// Run one command against the state. Handler errors become error outcomes.
pub async fn dispatch(state: &mut BridgeState, command: &Command) -> Outcome {
    let result = match CommandKind::parse(command.name()) {
        Some(kind) => {
            tracing::debug!(command = kind.as_str(), "Dispatching command");
            handle(state, kind, &command.data).await
        }
        None => Err(CommandError::Unknown(command.name().to_string())),
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(command = command.name(), error = %e, "Command failed");
        Outcome::error(e.to_string())
    })
}

async fn handle(
    state: &mut BridgeState,
    kind: CommandKind,
    data: &Value,
) -> Result<Outcome, CommandError> {
    match kind {
        CommandKind::RegisterImprovementLogic => register_improvement_logic(state, data),
        CommandKind::StartServer => start_server(state).await,
        CommandKind::StartServerApi => start_server_api(state, data).await,
        CommandKind::TestImprovement => test_improvement(state, data).await,
        CommandKind::GetStatus => Ok(get_status(state)),
        CommandKind::StopServer => Ok(stop_server(state)),
        CommandKind::Shutdown => Ok(shutdown(state)),
    }
}

fn optional_str<'a>(data: &'a Value, field: &'static str) -> Result<Option<&'a str>, CommandError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(CommandError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}

fn register_improvement_logic(
    state: &mut BridgeState,
    data: &Value,
) -> Result<Outcome, CommandError> {
    let name = optional_str(data, "name")?
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(DEFAULT_LOGIC_NAME)
        .to_string();

    let mut source = None;
    for field in ["code", "source", "logic"] {
        if let Some(s) = optional_str(data, field)? {
            source = Some(s);
            break;
        }
    }
    let source = source
        .filter(|s| !s.trim().is_empty())
        .ok_or(CommandError::MissingField("code"))?
        .to_string();

    let callback = RegisteredCallback { name, source };
    let improver = CallbackImprover::new(callback.clone(), Arc::clone(&state.executor));

    if state.instance.is_some() {
        tracing::info!(
            logic = %callback.name,
            "Agent instance already created, new logic applies to test_improvement only"
        );
    }
    if let Some(ref previous) = state.callback {
        tracing::info!(previous = %previous.name, "Replacing registered improvement logic");
    }

    let message = format!("Registered improvement logic: {}", callback.name);
    state.improver = Some(Arc::new(improver));
    state.callback = Some(callback);
    if !state.running {
        state.set_phase(SessionState::CallbackRegistered);
    }
    Ok(Outcome::success(message))
}

async fn start_server(state: &mut BridgeState) -> Result<Outcome, CommandError> {
    let previous = state.phase;
    state.set_phase(SessionState::ServerStarting);
    let instance = match state.ensure_instance() {
        Ok(instance) => instance,
        Err(e) => {
            state.set_phase(previous);
            return Err(e);
        }
    };

    state.spawn_server(instance, ServerMode::Plain);
    state.set_phase(SessionState::ServerRunning);

    let started_at = chrono::Utc::now().to_rfc3339();
    state
        .emit_event(
            "server_started",
            json!({ "mode": "server", "port": state.agent_port, "started_at": started_at }),
        )
        .await;
    Ok(Outcome::success("Server started"))
}

async fn start_server_api(state: &mut BridgeState, data: &Value) -> Result<Outcome, CommandError> {
    let config = ApiServerConfig::from_payload(data)?;

    let previous = state.phase;
    state.set_phase(SessionState::ServerStarting);
    let instance = match state.ensure_instance() {
        Ok(instance) => instance,
        Err(e) => {
            state.set_phase(previous);
            return Err(e);
        }
    };

    let enrollment_link = config.enrollment_link();
    let event = json!({
        "mode": "api",
        "port": config.port,
        "api_port": config.api_port,
        "agent_id": config.agent_id(),
        "enrollment_link": enrollment_link,
        "started_at": chrono::Utc::now().to_rfc3339(),
    });
    tracing::info!(domain = %config.domain, agent_id = %config.agent_id(), "API server task starting");

    state.spawn_server(instance, ServerMode::Api(config));
    state.set_phase(SessionState::ServerRunning);
    state.emit_event("server_started", event).await;

    Ok(Outcome::success("API server started").with_field("enrollment_link", enrollment_link))
}

async fn test_improvement(state: &mut BridgeState, data: &Value) -> Result<Outcome, CommandError> {
    let message = optional_str(data, "message")?.ok_or(CommandError::MissingField("message"))?;
    let improver = state.improver.as_ref().ok_or(CommandError::NoImprover)?;

    let improved = improver.improve(message).await;
    Ok(Outcome::success_fields().with_field("improved_message", improved))
}

fn get_status(state: &BridgeState) -> Outcome {
    Outcome::success_fields()
        .with_field("bridge_running", true)
        .with_field("nanda_initialized", state.instance.is_some())
        .with_field("server_running", state.running)
        .with_field("improvement_logic_registered", state.improver.is_some())
}

fn stop_server(state: &mut BridgeState) -> Outcome {
    state.stop_servers();
    if state.phase == SessionState::ServerRunning {
        let idle = state.idle_phase();
        state.set_phase(idle);
    }
    Outcome::success("Server stopped")
}

fn shutdown(state: &mut BridgeState) -> Outcome {
    state.stop_servers();
    state.set_phase(SessionState::ShuttingDown);
    Outcome::success("Bridge shutdown")
}
