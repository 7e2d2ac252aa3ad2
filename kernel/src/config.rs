// Arbiter Configuration
//
// Loaded from TOML (or JSON, by file extension). Every section has
// defaults, so an empty file yields the built-in policy set over a
// file-backed log in `data/log`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::DriftPolicyConfig;
use crate::invariants::config::build_engine;
use crate::invariants::{InvariantEngine, PolicyError, PolicySpec};
use crate::log::{BackendError, FileLogStore, InMemoryLogStore, LogBackend, MetadataLog};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid policy set: {0}")]
    Policy(#[from] PolicyError),

    #[error("failed to open log backend: {0}")]
    Backend(#[from] BackendError),
}

/// Top-level arbiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    #[serde(default)]
    pub log: LogConfig,

    /// Policies in evaluation order.
    #[serde(default = "PolicySpec::defaults")]
    pub policies: Vec<PolicySpec>,

    /// Severity-to-action mapping for drift audits.
    #[serde(default)]
    pub drift: DriftPolicyConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            policies: PolicySpec::defaults(),
            drift: DriftPolicyConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Directory holding one log file per table.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// fsync every append before acknowledging it.
    #[serde(default = "default_sync_on_write")]
    pub sync_on_write: bool,

    /// How long a proposal waits for a table's append lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            dir: default_log_dir(),
            sync_on_write: default_sync_on_write(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("data/log")
}

fn default_sync_on_write() -> bool {
    true
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ArbiterConfig {
    /// Load and validate a config file. `.json` files are parsed as JSON,
    /// anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ArbiterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: ArbiterConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "log.lock_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.log.backend == BackendKind::File && self.log.dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "log.dir is required for the file backend".into(),
            ));
        }
        // Building the engine catches duplicates and malformed groups.
        self.build_invariants()?;
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.log.lock_timeout_ms)
    }

    pub fn build_invariants(&self) -> Result<InvariantEngine, ConfigError> {
        Ok(build_engine(&self.policies)?)
    }

    /// Open the configured log backend.
    pub fn open_log(&self) -> Result<MetadataLog<Box<dyn LogBackend>>, ConfigError> {
        let backend: Box<dyn LogBackend> = match self.log.backend {
            BackendKind::Memory => Box::new(InMemoryLogStore::new()),
            BackendKind::File => Box::new(FileLogStore::open(
                self.log.dir.clone(),
                self.log.sync_on_write,
            )?),
        };
        Ok(MetadataLog::new(backend).with_lock_timeout(self.lock_timeout()))
    }
}
