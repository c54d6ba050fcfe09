//! Bridge configuration: defaults, then environment, then command-line flags.

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::http::HttpAgentSettings;
use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;
use crate::callback::{CallbackExecutor, DEFAULT_CALLBACK_TIMEOUT, ScriptRuntime};
use crate::router::DEFAULT_AGENT_PORT;

pub const ENV_NODE: &str = "NANDA_NODE";
pub const ENV_CALLBACK_TIMEOUT: &str = "NANDA_CALLBACK_TIMEOUT";
pub const ENV_AGENT_PORT: &str = "NANDA_AGENT_PORT";
pub const ENV_AGENT_BACKEND: &str = "NANDA_AGENT_BACKEND";
pub const ENV_MAX_LINE_BYTES: &str = "NANDA_MAX_LINE_BYTES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),

    /// `--help` was passed; not an error for the user.
    #[error("help requested")]
    HelpRequested,
}

impl ConfigError {
    fn invalid(name: &str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Callback runtime executable.
    pub node: PathBuf,
    pub callback_timeout: Duration,
    /// Port for the plain agent server.
    pub agent_port: u16,
    /// Agent backend name passed to [`crate::agent::load_factory`].
    pub backend: String,
    pub max_line_bytes: usize,
    /// Directory the module search path is anchored to.
    pub bridge_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node: PathBuf::from("node"),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            agent_port: DEFAULT_AGENT_PORT,
            backend: "http".to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            bridge_dir: default_bridge_dir(),
        }
    }
}

/// Directory holding the running executable, or `.` if it cannot be found.
fn default_bridge_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_timeout(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(name, value, e))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::invalid(name, value, "must be a positive number of seconds"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::invalid(name, value, e))
}

fn parse_port(name: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(name, value, e))
}

fn parse_max_line(name: &str, value: &str) -> Result<usize, ConfigError> {
    let max: usize = value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(name, value, e))?;
    if max == 0 {
        return Err(ConfigError::invalid(name, value, "must be greater than zero"));
    }
    Ok(max)
}

impl BridgeConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    /// Empty values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(node) = get(ENV_NODE) {
            config.node = PathBuf::from(node);
        }
        if let Some(v) = get(ENV_CALLBACK_TIMEOUT) {
            config.callback_timeout = parse_timeout(ENV_CALLBACK_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_AGENT_PORT) {
            config.agent_port = parse_port(ENV_AGENT_PORT, &v)?;
        }
        if let Some(v) = get(ENV_AGENT_BACKEND) {
            config.backend = v.trim().to_string();
        }
        if let Some(v) = get(ENV_MAX_LINE_BYTES) {
            config.max_line_bytes = parse_max_line(ENV_MAX_LINE_BYTES, &v)?;
        }
        Ok(config)
    }

    /// Apply command-line flags (without the program name).
    pub fn with_args<I>(mut self, args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
            };
            match arg.as_str() {
                "--node" => self.node = PathBuf::from(value("--node")?),
                "--timeout" => self.callback_timeout = parse_timeout("--timeout", &value("--timeout")?)?,
                "--port" => self.agent_port = parse_port("--port", &value("--port")?)?,
                "--backend" => self.backend = value("--backend")?,
                "--help" | "-h" => return Err(ConfigError::HelpRequested),
                flag if flag.starts_with('-') => {
                    return Err(ConfigError::UnknownFlag(flag.to_string()));
                }
                other => return Err(ConfigError::UnexpectedArgument(other.to_string())),
            }
        }
        Ok(self)
    }

    pub fn with_node(mut self, node: impl Into<PathBuf>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn with_agent_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_bridge_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bridge_dir = dir.into();
        self
    }

    pub fn executor(&self) -> CallbackExecutor {
        CallbackExecutor::new(ScriptRuntime::node(&self.node), &self.bridge_dir)
            .with_timeout(self.callback_timeout)
    }

    pub fn agent_settings(&self) -> HttpAgentSettings {
        HttpAgentSettings {
            port: self.agent_port,
            ..HttpAgentSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.node, PathBuf::from("node"));
        assert_eq!(config.callback_timeout, Duration::from_secs(30));
        assert_eq!(config.agent_port, 6000);
        assert_eq!(config.backend, "http");
        assert_eq!(config.max_line_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[
            (ENV_NODE, "/opt/node/bin/node"),
            (ENV_CALLBACK_TIMEOUT, "2.5"),
            (ENV_AGENT_PORT, "7100"),
            (ENV_AGENT_BACKEND, " custom "),
            (ENV_MAX_LINE_BYTES, "4096"),
        ]))
        .unwrap();
        assert_eq!(config.node, PathBuf::from("/opt/node/bin/node"));
        assert_eq!(config.callback_timeout, Duration::from_millis(2500));
        assert_eq!(config.agent_port, 7100);
        assert_eq!(config.backend, "custom");
        assert_eq!(config.max_line_bytes, 4096);
    }

    #[test]
    fn empty_environment_values_are_ignored() {
        let config = BridgeConfig::from_lookup(lookup(&[(ENV_AGENT_PORT, "  ")])).unwrap();
        assert_eq!(config.agent_port, 6000);
    }

    #[test]
    fn invalid_environment_value_is_reported() {
        let err = BridgeConfig::from_lookup(lookup(&[(ENV_AGENT_PORT, "70000")])).unwrap_err();
        assert!(err.to_string().contains(ENV_AGENT_PORT), "{err}");

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_CALLBACK_TIMEOUT, "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_MAX_LINE_BYTES, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_CALLBACK_TIMEOUT, "1e20")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = BridgeConfig::default()
            .with_args(args(&["--timeout", "1e20"]))
            .unwrap_err();
        assert!(err.to_string().contains("--timeout"), "{err}");
    }

    #[test]
    fn flags_override_environment() {
        let config = BridgeConfig::from_lookup(lookup(&[(ENV_AGENT_PORT, "7100")]))
            .unwrap()
            .with_args(args(&["--port", "7200", "--node", "nodejs", "--timeout", "5"]))
            .unwrap();
        assert_eq!(config.agent_port, 7200);
        assert_eq!(config.node, PathBuf::from("nodejs"));
        assert_eq!(config.callback_timeout, Duration::from_secs(5));
    }

    #[test]
    fn flag_errors() {
        let base = BridgeConfig::default;
        assert!(matches!(
            base().with_args(args(&["--port"])).unwrap_err(),
            ConfigError::MissingValue(f) if f == "--port"
        ));
        assert!(matches!(
            base().with_args(args(&["--verbose"])).unwrap_err(),
            ConfigError::UnknownFlag(f) if f == "--verbose"
        ));
        assert!(matches!(
            base().with_args(args(&["extra"])).unwrap_err(),
            ConfigError::UnexpectedArgument(_)
        ));
        assert!(matches!(
            base().with_args(args(&["-h"])).unwrap_err(),
            ConfigError::HelpRequested
        ));
    }

    #[test]
    fn builds_executor_and_agent_settings() {
        let config = BridgeConfig::default()
            .with_node("/usr/local/bin/node")
            .with_callback_timeout(Duration::from_secs(3))
            .with_agent_port(6100)
            .with_backend("http")
            .with_bridge_dir("/opt/bridge");

        let executor = config.executor();
        assert_eq!(executor.timeout(), Duration::from_secs(3));
        assert_eq!(executor.runtime().program, PathBuf::from("/usr/local/bin/node"));
        assert_eq!(executor.runtime().search_path_var, "NODE_PATH");

        let settings = config.agent_settings();
        assert_eq!(settings.port, 6100);
        assert_eq!(settings.host, "0.0.0.0");
    }
}
