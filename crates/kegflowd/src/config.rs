//! Flow manager configuration.
//!
//! Values are resolved in layers: built-in defaults, an optional TOML file,
//! then `KEGFLOW_*` environment overrides. Command-line flags are applied
//! on top by the binary.
//!
//! ```toml
//! default_idle_timeout_ms = 30000
//! min_flow_start_ticks = 10
//! idle_poll_interval_ms = 1000
//!
//! [[taps]]
//! name = "Main Tap"
//! meter_name = "kegboard.flow0"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use kegflow_core::{StaticTapRegistry, Tap};

/// Default idle timeout applied to new flows.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Minimum tick delta needed to start or extend a flow.
///
/// Prevents slight meter readings (for example those caused by bubbles)
/// from starting a new pour.
pub const MIN_FLOW_START_TICKS: u64 = 10;

/// Fixed delay between idle-reaper scans.
pub const DEFAULT_IDLE_POLL_INTERVAL_MS: u64 = 1_000;

/// Environment variable overriding `default_idle_timeout_ms`.
pub const ENV_IDLE_TIMEOUT_MS: &str = "KEGFLOW_IDLE_TIMEOUT_MS";
/// Environment variable overriding `min_flow_start_ticks`.
pub const ENV_MIN_START_TICKS: &str = "KEGFLOW_MIN_START_TICKS";
/// Environment variable overriding `idle_poll_interval_ms`.
pub const ENV_POLL_INTERVAL_MS: &str = "KEGFLOW_POLL_INTERVAL_MS";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A tap entry in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TapConfig {
    pub name: String,
    pub meter_name: String,
}

/// Tunables for the flow session manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    /// Idle threshold copied onto each new flow
    pub default_idle_timeout_ms: u64,

    /// Debounce threshold for meter deltas
    pub min_flow_start_ticks: u64,

    /// Delay between idle-reaper scans
    pub idle_poll_interval_ms: u64,

    /// Taps known to the static registry
    pub taps: Vec<TapConfig>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            default_idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            min_flow_start_ticks: MIN_FLOW_START_TICKS,
            idle_poll_interval_ms: DEFAULT_IDLE_POLL_INTERVAL_MS,
            taps: Vec::new(),
        }
    }
}

impl FlowConfig {
    /// Loads configuration from `path`, or from the default location when
    /// `path` is `None` and that file exists, then applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file without validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Applies `KEGFLOW_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_IDLE_TIMEOUT_MS) {
            self.default_idle_timeout_ms = parse_u64("default_idle_timeout_ms", &raw)?;
        }
        if let Some(raw) = lookup(ENV_MIN_START_TICKS) {
            self.min_flow_start_ticks = parse_u64("min_flow_start_ticks", &raw)?;
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            self.idle_poll_interval_ms = parse_u64("idle_poll_interval_ms", &raw)?;
        }
        Ok(())
    }

    /// Rejects values the manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_idle_timeout(self.default_idle_timeout_ms)?;
        if self.idle_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "idle_poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    /// Builds the tap registry from the configured taps.
    pub fn tap_registry(&self) -> StaticTapRegistry {
        StaticTapRegistry::new(
            self.taps
                .iter()
                .map(|tap| Tap::new(&tap.name, &tap.meter_name)),
        )
    }
}

/// Rejects an idle timeout of zero, which would make every flow idle at birth.
pub(crate) fn check_idle_timeout(timeout_ms: u64) -> Result<(), ConfigError> {
    if timeout_ms == 0 {
        return Err(ConfigError::Invalid {
            field: "default_idle_timeout_ms",
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Returns `$XDG_CONFIG_HOME/kegflow/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kegflow").join("config.toml"))
}

fn parse_u64(field: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("expected a non-negative integer, got {raw:?}"),
    })
}
