//! The composition root.
//!
//! A [`Coordinator`] owns one thread-context registry and one diagnostics sink
//! and carries the resolved configuration. Build one at the edge of the program
//! and pass it (or clones of it) to whatever creates `Owned` and `SharedRef`
//! values. Values remember the registry and diagnostics they were built with,
//! so they do not need the coordinator afterwards.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use tether_config::{ConfigError, ResolvedConfig, TetherConfig};
use tether_diagnostics::{Diagnostics, DiagnosticsSettings, DiagnosticsSnapshot};
use tether_types::{ThreadKey, TransferPolicy};

use crate::context::{ContextSnapshot, ThreadContextRegistry};
use crate::{Owned, SharedRef};

#[derive(Clone)]
pub struct Coordinator {
    registry: ThreadContextRegistry,
    diagnostics: Arc<Diagnostics>,
    config: Arc<ResolvedConfig>,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: ResolvedConfig) -> Self {
        let diagnostics = Arc::new(Diagnostics::new(DiagnosticsSettings {
            enabled: config.diagnostics.enabled,
            deadlock_detection: config.diagnostics.deadlock_detection,
            histogram_buckets_us: config.diagnostics.histogram_buckets_us.clone(),
            max_deadlock_reports: config.diagnostics.max_deadlock_reports,
        }));
        let registry =
            ThreadContextRegistry::new(Arc::clone(&diagnostics), config.reap_on_thread_exit);
        Self {
            registry,
            diagnostics,
            config: Arc::new(config),
        }
    }

    /// Build from the user config file (if any) plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = TetherConfig::load()?.unwrap_or_default();
        Ok(Self::new(config.with_env_overrides().resolve()))
    }

    /// Build from an explicit config file plus environment overrides.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = TetherConfig::load_from(path)?;
        Ok(Self::new(config.with_env_overrides().resolve()))
    }

    #[must_use]
    pub fn registry(&self) -> &ThreadContextRegistry {
        &self.registry
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Policy given to `Owned` values created without an explicit one.
    #[must_use]
    pub fn transfer_policy(&self) -> TransferPolicy {
        self.config.transfer_policy
    }

    pub fn owned<T>(&self, value: T) -> Owned<T> {
        Owned::new(self, value)
    }

    pub fn shared<T>(&self, value: T) -> SharedRef<T> {
        SharedRef::new(self, value)
    }

    /// Drop the contexts of exited threads that no longer hold borrows.
    pub fn reap_exited(&self) -> Vec<ThreadKey> {
        self.registry.reap_exited()
    }

    #[must_use]
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            diagnostics: self.diagnostics.snapshot(),
            threads: self.registry.snapshot(),
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(ResolvedConfig::default())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .field("diagnostics", &self.diagnostics)
            .field("config", &self.config)
            .finish()
    }
}

/// Everything an operator might want to look at, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub diagnostics: DiagnosticsSnapshot,
    pub threads: Vec<ContextSnapshot>,
}
