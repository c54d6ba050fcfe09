//! Out-of-process execution of host-supplied callbacks.
//!
//! The host registers improvement logic as JavaScript source. Each invocation
//! materializes that source into a wrapper script in a fresh temporary file,
//! runs it with the script runtime (`node` by default) and reads the improved
//! text from stdout:
//!
//! ```text
//! <runtime> <script-path> <input-text>
//! ```
//!
//! The process boundary is the isolation mechanism: a callback can neither
//! touch bridge state nor block it beyond the configured timeout.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Default bound on a single callback invocation.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("failed to write callback script: {0}")]
    Script(#[source] std::io::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("callback did not finish within {0:?}")]
    Timeout(Duration),

    #[error("failed to collect callback output: {0}")]
    Io(#[source] std::io::Error),
}

/// Describes how to materialize and run a callback script.
#[derive(Debug, Clone)]
pub struct ScriptRuntime {
    /// Runtime executable, resolved through `PATH` when not absolute.
    pub program: PathBuf,
    /// Suffix of the generated script file.
    pub extension: String,
    /// Per-project dependency directory the runtime resolves modules from.
    pub dependency_dir: String,
    /// Environment variable holding the module search path.
    pub search_path_var: String,
    /// Renders the wrapper script around the callback source.
    pub template: fn(&str) -> String,
}

impl ScriptRuntime {
    /// Node.js runtime: CommonJS wrapper, `node_modules`, `NODE_PATH`.
    pub fn node(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extension: ".cjs".to_string(),
            dependency_dir: "node_modules".to_string(),
            search_path_var: "NODE_PATH".to_string(),
            template: render_node_script,
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

const NODE_PRELUDE: &str = r#"'use strict';
const fs = require('fs');
const path = require('path');
const util = require('util');

const improve = (
"#;

const NODE_POSTLUDE: &str = r#"
);

const input = process.argv[2] === undefined ? '' : process.argv[2];

Promise.resolve()
  .then(() => improve(input))
  .then((result) => {
    process.stdout.write(result === undefined || result === null ? input : String(result));
  })
  .catch((err) => {
    process.stderr.write(`Error in improvement logic: ${err && err.stack ? err.stack : err}\n`);
    process.stdout.write(input);
  });
"#;

/// Wrap callback source (a function expression or declaration) so that the
/// script prints the callback's result, or the unchanged input if it throws.
pub fn render_node_script(source: &str) -> String {
    let source = source.trim().trim_end_matches(';').trim_end();
    format!("{NODE_PRELUDE}{source}{NODE_POSTLUDE}")
}

/// Module search path: the dependency directory under `cwd`, under
/// `bridge_dir` and under its parent, followed by any existing entries.
///
/// Returns `None` when the entries cannot be joined (an entry contains the
/// platform path separator).
pub fn build_search_path(
    cwd: &Path,
    bridge_dir: &Path,
    dependency_dir: &str,
    existing: Option<OsString>,
) -> Option<OsString> {
    let mut entries = vec![cwd.join(dependency_dir), bridge_dir.join(dependency_dir)];
    if let Some(parent) = bridge_dir.parent() {
        entries.push(parent.join(dependency_dir));
    }
    if let Some(existing) = existing {
        entries.extend(std::env::split_paths(&existing).filter(|p| !p.as_os_str().is_empty()));
    }

    match std::env::join_paths(entries) {
        Ok(joined) => Some(joined),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot build module search path, leaving it unchanged");
            None
        }
    }
}

/// Runs callback source against an input string in a subprocess.
#[derive(Debug, Clone)]
pub struct CallbackExecutor {
    runtime: ScriptRuntime,
    timeout: Duration,
    bridge_dir: PathBuf,
}

impl CallbackExecutor {
    pub fn new(runtime: ScriptRuntime, bridge_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            timeout: DEFAULT_CALLBACK_TIMEOUT,
            bridge_dir: bridge_dir.into(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    fn search_path(&self) -> Option<OsString> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        build_search_path(
            &cwd,
            &self.bridge_dir,
            &self.runtime.dependency_dir,
            std::env::var_os(&self.runtime.search_path_var),
        )
    }

    /// Run `source` with `input` as its single argument.
    ///
    /// Returns the trimmed stdout when the callback exits cleanly with new
    /// text. A clean exit with empty or unchanged output, or a non-zero exit,
    /// yields `input` unchanged. Timeouts and spawn failures are errors.
    pub async fn execute(&self, source: &str, input: &str) -> Result<String, CallbackError> {
        let script = self.write_script(source)?;
        let result = self.run_script(&script, input).await;

        if let Err(e) = script.close() {
            tracing::debug!(error = %e, "Failed to remove callback script");
        }
        result
    }

    fn write_script(&self, source: &str) -> Result<tempfile::TempPath, CallbackError> {
        let mut file = tempfile::Builder::new()
            .prefix("nanda-callback-")
            .suffix(&self.runtime.extension)
            .tempfile()
            .map_err(CallbackError::Script)?;
        file.write_all((self.runtime.template)(source).as_bytes())
            .and_then(|()| file.flush())
            .map_err(CallbackError::Script)?;
        Ok(file.into_temp_path())
    }

    async fn run_script(&self, script: &Path, input: &str) -> Result<String, CallbackError> {
        let mut cmd = Command::new(&self.runtime.program);
        cmd.arg(script)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = self.search_path() {
            cmd.env(&self.runtime.search_path_var, path);
        }

        tracing::debug!(script = %script.display(), "Running callback");
        let child = cmd.spawn().map_err(|source| CallbackError::Spawn {
            program: self.runtime.program_name(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(CallbackError::Io)?,
            Err(_) => return Err(CallbackError::Timeout(self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            tracing::warn!(
                status = %output.status,
                stderr = %stderr.trim(),
                "Callback exited with failure, keeping original text"
            );
            return Ok(input.to_string());
        }
        if !stderr.trim().is_empty() {
            tracing::warn!(stderr = %stderr.trim(), "Callback reported an error");
        }

        let improved = stdout.trim();
        if improved.is_empty() || improved == input {
            tracing::debug!("Callback produced no change");
            return Ok(input.to_string());
        }
        Ok(improved.to_string())
    }

    /// Ask the runtime for its version (`<runtime> --version`).
    pub async fn probe_version(&self) -> Option<String> {
        let output = Command::new(&self.runtime.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(Duration::from_secs(5), output).await {
            Ok(Ok(out)) if out.status.success() => {
                let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
                (!version.is_empty()).then_some(version)
            }
            Ok(Ok(_)) | Err(_) => None,
            Ok(Err(e)) => {
                tracing::warn!(
                    program = %self.runtime.program_name(),
                    error = %e,
                    "Callback runtime not found, registered callbacks will fall back to the original text"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[cfg(unix)]
    fn shell_runtime() -> ScriptRuntime {
        ScriptRuntime {
            program: PathBuf::from("sh"),
            extension: ".sh".to_string(),
            dependency_dir: "node_modules".to_string(),
            search_path_var: "NANDA_TEST_SEARCH_PATH".to_string(),
            template: |source| source.to_string(),
        }
    }

    #[cfg(unix)]
    fn shell_executor() -> CallbackExecutor {
        CallbackExecutor::new(shell_runtime(), std::env::temp_dir().join("bridge-bin"))
    }

    #[test]
    fn node_script_wraps_source() {
        let script = render_node_script("(text) => text.toUpperCase();\n");
        assert!(script.contains("const improve = (\n(text) => text.toUpperCase()\n);"));
        assert!(script.contains("process.argv[2]"));
        assert!(script.contains("process.stdout.write(input)"));
    }

    #[test]
    fn node_runtime_defaults() {
        let runtime = ScriptRuntime::node("node");
        assert_eq!(runtime.search_path_var, "NODE_PATH");
        assert_eq!(runtime.dependency_dir, "node_modules");
        assert_eq!(runtime.extension, ".cjs");
    }

    #[cfg(unix)]
    #[test]
    fn search_path_orders_cwd_bridge_parent_then_existing() {
        let path = build_search_path(
            Path::new("/work"),
            Path::new("/opt/bridge/bin"),
            "node_modules",
            Some(OsString::from("/usr/lib/node:/home/me/lib")),
        )
        .unwrap();
        assert_eq!(
            path,
            OsString::from(
                "/work/node_modules:/opt/bridge/bin/node_modules:/opt/bridge/node_modules:/usr/lib/node:/home/me/lib"
            )
        );
    }

    #[cfg(unix)]
    #[test]
    fn search_path_without_existing_value() {
        let path =
            build_search_path(Path::new("/work"), Path::new("/bridge"), "node_modules", None)
                .unwrap();
        assert_eq!(
            path,
            OsString::from("/work/node_modules:/bridge/node_modules:/node_modules")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn returns_trimmed_output() {
        let out = shell_executor()
            .execute(r#"printf '%s\n' "$1" | tr '[:lower:]' '[:upper:]'"#, "hi")
            .await
            .unwrap();
        assert_eq!(out, "HI");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unchanged_output_returns_input() {
        let out = shell_executor()
            .execute(r#"printf '%s\n' "$1""#, "same text")
            .await
            .unwrap();
        assert_eq!(out, "same text");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn whitespace_only_change_is_kept() {
        let out = shell_executor()
            .execute(r#"printf '%s' "hi""#, "  hi  ")
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_returns_input() {
        let out = shell_executor().execute("true", "keep me").await.unwrap();
        assert_eq!(out, "keep me");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_exit_returns_input() {
        let out = shell_executor()
            .execute("echo 'partial output'; echo 'boom' >&2; exit 3", "original")
            .await
            .unwrap();
        assert_eq!(out, "original");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_reported_within_bound() {
        let executor = shell_executor().with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = executor.execute("sleep 5", "slow").await.unwrap_err();
        assert!(matches!(err, CallbackError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_file_is_removed_after_run() {
        let script_path = shell_executor()
            .execute(r#"printf '%s' "$0""#, "input")
            .await
            .unwrap();
        assert!(script_path.contains("nanda-callback-"));
        assert!(!Path::new(&script_path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_file_is_removed_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("script-path");
        let source = format!("printf '%s' \"$0\" > '{}'; sleep 5", marker.display());

        let executor = shell_executor().with_timeout(Duration::from_millis(500));
        let _ = executor.execute(&source, "x").await;

        let script_path = std::fs::read_to_string(&marker).unwrap();
        assert!(!Path::new(&script_path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runtime_sees_search_path() {
        let bridge_dir = tempfile::tempdir().unwrap();
        let executor = CallbackExecutor::new(shell_runtime(), bridge_dir.path());
        let out = executor
            .execute(r#"printf '%s' "$NANDA_TEST_SEARCH_PATH""#, "x")
            .await
            .unwrap();

        let expected_bridge = bridge_dir.path().join("node_modules");
        let expected_parent = bridge_dir.path().parent().unwrap().join("node_modules");
        let entries: Vec<PathBuf> = std::env::split_paths(&out).collect();
        assert_eq!(entries[0], std::env::current_dir().unwrap().join("node_modules"));
        assert_eq!(entries[1], expected_bridge);
        assert_eq!(entries[2], expected_parent);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn input_is_passed_as_single_argument() {
        let out = shell_executor()
            .execute(r#"printf '%s|%s' "$#" "$1""#, "two words; $(not expanded)")
            .await
            .unwrap();
        assert_eq!(out, "1|two words; $(not expanded)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_invocations_are_independent() {
        let executor = shell_executor();
        let source = r#"sleep 0.1; printf '%s' "$1" | tr '[:lower:]' '[:upper:]'"#;
        let (a, b, c) = tokio::join!(
            executor.execute(source, "alpha"),
            executor.execute(source, "beta"),
            executor.execute(source, "gamma"),
        );
        assert_eq!(a.unwrap(), "ALPHA");
        assert_eq!(b.unwrap(), "BETA");
        assert_eq!(c.unwrap(), "GAMMA");
    }

    #[tokio::test]
    async fn missing_runtime_is_spawn_error() {
        let executor = CallbackExecutor::new(
            ScriptRuntime::node("/nonexistent/nanda-runtime"),
            std::env::temp_dir(),
        );
        let err = executor.execute("(t) => t", "x").await.unwrap_err();
        assert!(matches!(err, CallbackError::Spawn { .. }));
        assert!(executor.probe_version().await.is_none());
    }

    #[tokio::test]
    async fn node_round_trip_when_available() {
        let available = std::process::Command::new("node")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !available {
            return;
        }

        let executor = CallbackExecutor::new(ScriptRuntime::node("node"), std::env::temp_dir());
        assert_eq!(
            executor
                .execute("(text) => text.toUpperCase()", "hi")
                .await
                .unwrap(),
            "HI"
        );
        assert_eq!(
            executor
                .execute("function improve(t) { throw new Error('nope'); }", "hi")
                .await
                .unwrap(),
            "hi"
        );
        assert_eq!(
            executor
                .execute("async (t) => `${t}!`", "hey")
                .await
                .unwrap(),
            "hey!"
        );
    }
}
