//! # Pipeline Configuration
//!
//! Layered settings: built-in defaults, then an optional `skypipe.toml`,
//! then `SKYPIPE_*` environment variables (`SKYPIPE_MAX_WORKERS=4`,
//! `SKYPIPE_PROVIDER__KIND=batch`). Binaries load this once in `main` and
//! pass it down; the library never reads configuration implicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::provider::{BatchProvider, BatchSettings, LocalProvider, Provider};

/// Which dispatch backend to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Batch,
}

/// Provider section of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub batch: BatchSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Local,
            batch: BatchSettings::default(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding queue stores and the `.skypipe/` namespace
    pub base_dir: PathBuf,
    /// Manager poll cadence in milliseconds
    pub poll_interval_ms: u64,
    /// Concurrent worker ceiling
    pub max_workers: usize,
    /// Wait for in-flight workers at shutdown instead of killing them
    pub wait_on_shutdown: bool,
    /// Auto-launch a detached manager on first enqueue
    pub spawn: bool,
    pub provider: ProviderSettings,
    /// Worker executable override; defaults to re-entering the current
    /// executable through the bootstrap hook
    pub worker_command: Option<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("_skypipe"),
            poll_interval_ms: 500,
            max_workers: 1,
            wait_on_shutdown: true,
            spawn: false,
            provider: ProviderSettings::default(),
            worker_command: None,
        }
    }
}

impl PipelineConfig {
    /// Load with the standard layering (defaults → `skypipe.toml` → env)
    pub fn load() -> PipelineResult<Self> {
        Self::build(config::File::with_name("skypipe").required(false))
    }

    /// Load from an explicit file, still honoring env overrides
    pub fn load_from(path: &Path) -> PipelineResult<Self> {
        Self::build(config::File::from(path).required(true))
    }

    fn build(file: config::File<config::FileSourceFile, config::FileFormat>) -> PipelineResult<Self> {
        config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("SKYPIPE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| PipelineError::config(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The worker command the provider launches, defaulting to the current
    /// executable (whose `main` must call [`crate::bootstrap`])
    pub fn resolved_worker_command(&self) -> PipelineResult<Vec<String>> {
        if let Some(command) = &self.worker_command {
            if command.is_empty() {
                return Err(PipelineError::config("worker_command must not be empty"));
            }
            return Ok(command.clone());
        }
        let exe = std::env::current_exe()?;
        Ok(vec![exe.display().to_string()])
    }

    pub fn build_provider(&self) -> PipelineResult<Provider> {
        let worker_command = self.resolved_worker_command()?;
        Ok(match self.provider.kind {
            ProviderKind::Local => Provider::Local(LocalProvider { worker_command }),
            ProviderKind::Batch => Provider::Batch(BatchProvider {
                worker_command,
                settings: self.provider.batch.clone(),
            }),
        })
    }
}
