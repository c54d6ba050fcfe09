//! nanda-bridge: drive a NANDA agent from a Node.js host over stdin/stdout.

pub mod agent;
pub mod bridge;
pub mod callback;
pub mod config;
pub mod emitter;
pub mod improver;
pub mod logging;
pub mod router;
pub mod server;
pub mod session;
mod version;

#[cfg(test)]
mod testing;

pub use agent::{AgentError, AgentFactory, AgentRuntime, ApiServerConfig, ServeOptions, load_factory};
pub use callback::{CallbackError, CallbackExecutor, ScriptRuntime};
pub use config::{BridgeConfig, ConfigError};
pub use emitter::Emitter;
pub use improver::{DefaultImprover, Improver};
pub use router::{BridgeState, CommandError, CommandKind};
pub use session::{BridgeError, BridgeSession, SessionExit, SessionState};
pub use version::{BRIDGE_VERSION, VersionInfo};
