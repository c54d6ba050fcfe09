use std::process;
use std::sync::Arc;

use anyhow::Context;
use nanda_bridge::{
    BridgeConfig, BridgeSession, BridgeState, ConfigError, Emitter, SessionExit, VersionInfo,
    load_factory,
};

const EXIT_STARTUP: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CHANNEL: i32 = 3;

const USAGE: &str = "\
Usage: nanda-bridge [--node <path>] [--timeout <secs>] [--port <port>] [--backend <name>]

Reads one JSON command per line on stdin and writes one JSON response per line
on stdout. Logs go to stderr.

Options:
  --node <path>      Callback runtime executable [env: NANDA_NODE] [default: node]
  --timeout <secs>   Callback timeout in seconds [env: NANDA_CALLBACK_TIMEOUT] [default: 30]
  --port <port>      Plain agent server port [env: NANDA_AGENT_PORT] [default: 6000]
  --backend <name>   Agent backend [env: NANDA_AGENT_BACKEND] [default: http]
  -h, --help         Print this help";

#[tokio::main]
async fn main() {
    nanda_bridge::logging::init_tracing();

    let config = match BridgeConfig::from_env().and_then(|c| c.with_args(std::env::args().skip(1)))
    {
        Ok(config) => config,
        Err(ConfigError::HelpRequested) => {
            eprintln!("{USAGE}");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(EXIT_USAGE);
        }
    };
    tracing::debug!(?config, "Loaded configuration");

    let factory = match load_factory(&config.backend, config.agent_settings()) {
        Ok(factory) => factory,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load agent backend");
            eprintln!("error: {e}");
            process::exit(EXIT_STARTUP);
        }
    };

    // Exit explicitly: the runtime's blocking stdin reader would otherwise
    // hold up shutdown until the host closes the pipe.
    let code = match run(config, factory).await {
        Ok(exit) => {
            tracing::info!(?exit, "Bridge exiting");
            0
        }
        Err(e) => {
            tracing::error!("Bridge failed: {e:#}");
            EXIT_CHANNEL
        }
    };
    process::exit(code);
}

async fn run(
    config: BridgeConfig,
    factory: Arc<dyn nanda_bridge::AgentFactory>,
) -> anyhow::Result<SessionExit> {
    let executor = config.executor();

    let mut version = VersionInfo::new();
    if let Some(runtime) = executor.probe_version().await {
        tracing::info!(runtime = %runtime, "Callback runtime found");
        version = version.with_runtime(runtime);
    }

    let state = BridgeState::new(factory, Arc::new(executor), Emitter::stdout())
        .with_agent_port(config.agent_port);
    let mut session = BridgeSession::start(state, version)
        .await
        .context("failed to send ready signal")?
        .with_max_line_bytes(config.max_line_bytes);

    session
        .run(tokio::io::stdin())
        .await
        .context("control channel failed")
}
