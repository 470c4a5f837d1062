//! Configuration for Tether.
//!
//! ```toml
//! [ownership]
//! transfer_allowed = true
//!
//! [diagnostics]
//! enabled = false
//! deadlock_detection = false
//! histogram_buckets_us = [10, 100, 1000, 10000, 100000, 1000000]
//! max_deadlock_reports = 64
//!
//! [registry]
//! reap_on_thread_exit = true
//! ```
//!
//! The file lives at `$TETHER_CONFIG` or `~/.tether/config.toml`. Every section
//! and field is optional; [`TetherConfig::resolve`] fills in defaults.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use tether_types::{DEFAULT_WAIT_BUCKETS_US, TransferPolicy};

pub const CONFIG_PATH_ENV: &str = "TETHER_CONFIG";
pub const DIAGNOSTICS_ENV: &str = "TETHER_DIAGNOSTICS";
pub const DEADLOCK_DETECTION_ENV: &str = "TETHER_DEADLOCK_DETECTION";

pub const DEFAULT_MAX_DEADLOCK_REPORTS: usize = 64;

// Default value function for serde (bool::default() is false, so only true needs a fn)
const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    pub ownership: Option<OwnershipConfig>,
    pub diagnostics: Option<DiagnosticsConfig>,
    pub registry: Option<RegistryConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Defaults for newly created `Owned` values.
#[derive(Debug, Deserialize)]
pub struct OwnershipConfig {
    /// Whether `transfer()` is permitted by default. Default: true.
    #[serde(default = "default_true")]
    pub transfer_allowed: bool,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            transfer_allowed: true,
        }
    }
}

/// Instrumentation settings.
#[derive(Debug, Default, Deserialize)]
pub struct DiagnosticsConfig {
    /// Count borrows, contention and wait times. Default: false.
    #[serde(default)]
    pub enabled: bool,
    /// Track the wait-for graph and report cycles. Default: false.
    #[serde(default)]
    pub deadlock_detection: bool,
    /// Upper bucket bounds for the wait-time histogram, in microseconds.
    pub histogram_buckets_us: Option<Vec<u64>>,
    /// Number of deadlock reports to retain. Default: 64.
    pub max_deadlock_reports: Option<usize>,
}

/// Thread context registry settings.
#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    /// Drop a thread's context once it has exited and holds no borrows.
    /// When false, exited contexts stay until `reap_exited`. Default: true.
    #[serde(default = "default_true")]
    pub reap_on_thread_exit: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reap_on_thread_exit: true,
        }
    }
}

/// Fully-defaulted configuration, ready to build a coordinator from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfig {
    pub transfer_policy: TransferPolicy,
    pub diagnostics: ResolvedDiagnostics,
    pub reap_on_thread_exit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDiagnostics {
    pub enabled: bool,
    pub deadlock_detection: bool,
    pub histogram_buckets_us: Vec<u64>,
    pub max_deadlock_reports: usize,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        TetherConfig::default().resolve()
    }
}

impl TetherConfig {
    /// Load the config file, if there is one.
    ///
    /// Returns `Ok(None)` when no path can be determined or the file does not exist.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `TETHER_DIAGNOSTICS` / `TETHER_DEADLOCK_DETECTION` from the process
    /// environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| env::var(name).ok())
    }

    /// Apply overrides read through `lookup`. Unset or unrecognised values leave
    /// the file setting alone.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let diagnostics = self.diagnostics.get_or_insert_with(DiagnosticsConfig::default);
        if let Some(on) = lookup(DIAGNOSTICS_ENV).as_deref().and_then(parse_flag) {
            diagnostics.enabled = on;
        }
        if let Some(on) = lookup(DEADLOCK_DETECTION_ENV)
            .as_deref()
            .and_then(parse_flag)
        {
            diagnostics.deadlock_detection = on;
        }
        self
    }

    /// Fill in defaults for everything left unset.
    #[must_use]
    pub fn resolve(&self) -> ResolvedConfig {
        let transfer_allowed = self
            .ownership
            .as_ref()
            .is_none_or(|ownership| ownership.transfer_allowed);
        let reap_on_thread_exit = self
            .registry
            .as_ref()
            .is_none_or(|registry| registry.reap_on_thread_exit);

        let diagnostics = self.diagnostics.as_ref();
        ResolvedConfig {
            transfer_policy: TransferPolicy::from_allowed(transfer_allowed),
            diagnostics: ResolvedDiagnostics {
                enabled: diagnostics.is_some_and(|d| d.enabled),
                deadlock_detection: diagnostics.is_some_and(|d| d.deadlock_detection),
                histogram_buckets_us: resolve_buckets(
                    diagnostics.and_then(|d| d.histogram_buckets_us.as_deref()),
                ),
                max_deadlock_reports: diagnostics
                    .and_then(|d| d.max_deadlock_reports)
                    .unwrap_or(DEFAULT_MAX_DEADLOCK_REPORTS),
            },
            reap_on_thread_exit,
        }
    }
}

fn resolve_buckets(configured: Option<&[u64]>) -> Vec<u64> {
    let Some(configured) = configured else {
        return DEFAULT_WAIT_BUCKETS_US.to_vec();
    };
    let mut buckets: Vec<u64> = configured.iter().copied().filter(|&b| b > 0).collect();
    buckets.sort_unstable();
    buckets.dedup();
    if buckets.is_empty() {
        warn!("diagnostics.histogram_buckets_us has no positive bounds; using defaults");
        return DEFAULT_WAIT_BUCKETS_US.to_vec();
    }
    buckets
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `$TETHER_CONFIG` if set, otherwise `~/.tether/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}
