//! Version information for the bridge.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported in the ready signal and agent health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Bridge version.
    pub bridge: &'static str,
    /// Version of the callback runtime (if it could be probed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            runtime: None,
        }
    }
}

impl VersionInfo {
    /// Create version info with bridge version only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set callback runtime version.
    pub fn with_runtime(mut self, version: String) -> Self {
        self.runtime = Some(version);
        self
    }
}
