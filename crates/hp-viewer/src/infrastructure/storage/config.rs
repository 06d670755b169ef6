//! TOML-based configuration for the viewer host.
//!
//! ```toml
//! [engine]
//! default_protocol_id = "default"
//! baseline_protocol_id = "default"
//! loading_retry_delay_ms = 500
//! notification_duration_ms = 3000
//!
//! [logging]
//! log_level = "info"
//!
//! [protocols]
//! use_builtin = true
//! paths = ["protocols/site.toml"]
//! ```
//!
//! Every field has a `#[serde(default = "...")]` helper, so a partial file (or
//! no file at all) still yields a complete configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::hanging_protocol::EngineSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level viewer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ViewerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub protocols: ProtocolSourceConfig,
}

/// Hanging-protocol controller settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Protocol used when nothing else matches the study.
    #[serde(default = "default_protocol_id")]
    pub default_protocol_id: String,
    /// Protocol restored by toggling off a protocol with no recorded predecessor.
    #[serde(default = "default_protocol_id")]
    pub baseline_protocol_id: String,
    /// Delay before retrying a toggle whose series are still loading.
    #[serde(default = "default_loading_retry_delay_ms")]
    pub loading_retry_delay_ms: u64,
    #[serde(default = "default_notification_duration_ms")]
    pub notification_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset: `"error"` … `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where hanging protocols are loaded from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSourceConfig {
    /// Start from the protocols compiled into the binary.
    #[serde(default = "default_true")]
    pub use_builtin: bool,
    /// Additional protocol files, relative to the config file.  A protocol
    /// with an id already loaded replaces the earlier one.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_protocol_id() -> String {
    "default".to_string()
}
fn default_loading_retry_delay_ms() -> u64 {
    500
}
fn default_notification_duration_ms() -> u64 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_protocol_id: default_protocol_id(),
            baseline_protocol_id: default_protocol_id(),
            loading_retry_delay_ms: default_loading_retry_delay_ms(),
            notification_duration_ms: default_notification_duration_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ProtocolSourceConfig {
    fn default() -> Self {
        Self {
            use_builtin: default_true(),
            paths: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn to_settings(&self) -> EngineSettings {
        EngineSettings {
            default_protocol_id: self.default_protocol_id.clone(),
            baseline_protocol_id: self.baseline_protocol_id.clone(),
            loading_retry_delay: Duration::from_millis(self.loading_retry_delay_ms),
            notification_duration_ms: self.notification_duration_ms,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads `ViewerConfig` from `path`, returning `ViewerConfig::default()` if
/// the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ViewerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: ViewerConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ViewerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &ViewerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("hp-viewer-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_viewer_config_default_engine_values() {
        // Arrange / Act
        let cfg = ViewerConfig::default();

        // Assert
        assert_eq!(cfg.engine.default_protocol_id, "default");
        assert_eq!(cfg.engine.baseline_protocol_id, "default");
        assert_eq!(cfg.engine.loading_retry_delay_ms, 500);
        assert_eq!(cfg.engine.notification_duration_ms, 3000);
    }

    #[test]
    fn test_viewer_config_default_uses_builtin_protocols() {
        let cfg = ViewerConfig::default();
        assert!(cfg.protocols.use_builtin);
        assert!(cfg.protocols.paths.is_empty());
        assert_eq!(cfg.logging.log_level, "info");
    }

    #[test]
    fn test_engine_config_to_settings_converts_delay() {
        let mut engine = EngineConfig::default();
        engine.loading_retry_delay_ms = 20;

        let settings = engine.to_settings();

        assert_eq!(settings.loading_retry_delay, Duration::from_millis(20));
        assert_eq!(settings.default_protocol_id, "default");
    }

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn test_partial_toml_fills_missing_fields_with_defaults() {
        // Arrange
        let text = r#"
            [engine]
            default_protocol_id = "fallback"
        "#;

        // Act
        let cfg: ViewerConfig = toml::from_str(text).expect("parse");

        // Assert
        assert_eq!(cfg.engine.default_protocol_id, "fallback");
        assert_eq!(cfg.engine.baseline_protocol_id, "default");
        assert_eq!(cfg.engine.loading_retry_delay_ms, 500);
        assert!(cfg.protocols.use_builtin);
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let path = scratch_path("bad.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[engine\nbroken").unwrap();

        let err = load_config(&path).unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
    }

    // ── Repository ────────────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_returns_defaults() {
        let cfg = load_config(&scratch_path("absent.toml")).expect("defaults");
        assert_eq!(cfg, ViewerConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_changes() {
        // Arrange
        let path = scratch_path("viewer.toml");
        let mut cfg = ViewerConfig::default();
        cfg.engine.baseline_protocol_id = "fourUp".to_string();
        cfg.protocols.paths.push(PathBuf::from("site.toml"));

        // Act
        save_config(&path, &cfg).expect("save");
        let loaded = load_config(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);
    }
}
