use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid runtime configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("frame_interval_ms must be greater than zero")]
    ZeroFrameInterval,
}

/// How the host decides which sessions to tick on a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPolicy {
    /// Tick a session only when its bookmark is due
    #[default]
    Bookmarks,
    /// Tick every session on every frame
    EveryFrame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Whether scripting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Directory containing resource modules (default: ./resources)
    #[serde(default)]
    pub resource_dir: Option<PathBuf>,

    #[serde(default)]
    pub tick_policy: TickPolicy,

    /// Host frame interval in milliseconds (default: 16ms)
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,

    /// Start every session with profiling enabled
    #[serde(default)]
    pub profiling: bool,

    /// Per-resource configuration (resource name -> config values)
    #[serde(default)]
    pub resources: HashMap<String, toml::Value>,

    #[serde(default)]
    pub wasm: WasmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasmConfig {
    /// Fuel granted to each call into a guest; unlimited when unset
    #[serde(default)]
    pub fuel_per_call: Option<u64>,

    /// Upper bound on a guest's linear memory
    #[serde(default)]
    pub max_memory_bytes: Option<usize>,

    /// Optimize generated code for speed (default: true)
    #[serde(default = "default_optimize")]
    pub optimize: bool,

    /// Link WASI preview 1 imports
    #[serde(default)]
    pub wasi: bool,

    /// Give guests the host's stdio when WASI is linked
    #[serde(default)]
    pub inherit_stdio: bool,

    /// Directory preopened as `/data` when WASI is linked
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_frame_interval() -> u64 {
    16
}

fn default_optimize() -> bool {
    true
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            fuel_per_call: None,
            max_memory_bytes: None,
            optimize: true,
            wasi: false,
            inherit_stdio: false,
            data_dir: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resource_dir: None,
            tick_policy: TickPolicy::default(),
            frame_interval_ms: 16,
            profiling: false,
            resources: HashMap::new(),
            wasm: WasmConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(text)?;
        if config.frame_interval_ms == 0 {
            return Err(ConfigError::ZeroFrameInterval);
        }
        Ok(config)
    }

    /// Get the resource directory path (use provided or default)
    pub fn resource_dir(&self) -> PathBuf {
        self.resource_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("resources"))
    }

    /// Resources are enabled unless their table says `enabled = false`
    pub fn is_resource_enabled(&self, name: &str) -> bool {
        self.resources
            .get(name)
            .and_then(|config| config.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert!(config.enabled);
        assert_eq!(config.tick_policy, TickPolicy::Bookmarks);
        assert_eq!(config.frame_interval_ms, 16);
        assert!(config.wasm.optimize);
        assert!(!config.wasm.wasi);
        assert_eq!(config.resource_dir(), PathBuf::from("resources"));
    }

    #[test]
    fn test_full_config() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            resource_dir = "/srv/resources"
            tick_policy = "every_frame"
            frame_interval_ms = 50
            profiling = true

            [resources.chat]
            enabled = false

            [resources.spawner]
            greeting = "hi"

            [wasm]
            fuel_per_call = 1000000
            max_memory_bytes = 16777216
            wasi = true
            "#,
        )
        .unwrap();

        assert_eq!(config.tick_policy, TickPolicy::EveryFrame);
        assert_eq!(config.frame_interval_ms, 50);
        assert!(config.profiling);
        assert_eq!(config.resource_dir(), PathBuf::from("/srv/resources"));
        assert!(!config.is_resource_enabled("chat"));
        assert!(config.is_resource_enabled("spawner"));
        assert!(config.is_resource_enabled("unlisted"));
        assert_eq!(config.wasm.fuel_per_call, Some(1_000_000));
        assert_eq!(config.wasm.max_memory_bytes, Some(16 * 1024 * 1024));
        assert!(config.wasm.wasi);
    }

    #[test]
    fn test_rejects_zero_frame_interval() {
        let err = RuntimeConfig::from_toml_str("frame_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroFrameInterval));
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let err = RuntimeConfig::from_toml_str(r#"tick_policy = "sometimes""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
