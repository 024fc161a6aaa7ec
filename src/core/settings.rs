//! Controller settings - Read-only view of `configs/settings.json`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::profile::SavedConfig;

/// Settings file location relative to the working root
pub const SETTINGS_PATH: &str = "configs/settings.json";

/// Binary locations for cores installed outside the bundled `cores/` tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreUpdates {
    /// Core name -> binary path
    pub paths: HashMap<String, PathBuf>,
}

/// Supervisor timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Health-check tick interval in ms
    pub tick_interval_ms: u64,
    /// Max time stop_engine waits for the health loop in ms
    pub join_timeout_ms: u64,
    /// Grace period before survivors of a tree termination are killed, in ms
    pub terminate_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            join_timeout_ms: 3000,
            terminate_timeout_ms: 3000,
        }
    }
}

impl EngineSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Application settings. Unknown keys written by other tools are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub core_updates: CoreUpdates,
    pub engine: EngineSettings,
    /// Saved connection profiles
    pub configs: Vec<SavedConfig>,
    /// Index into `configs` of the profile to start by default
    pub active_config: Option<usize>,
}

impl Settings {
    /// Load settings from the working root, falling back to defaults
    pub fn load_or_default(root: &Path) -> Self {
        let path = root.join(SETTINGS_PATH);
        if !path.exists() {
            info!("No settings at {:?}; using defaults", path);
            return Self::default();
        }
        match Self::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring unreadable settings: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        settings.validate();
        Ok(settings)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.engine.tick_interval_ms = self.engine.tick_interval_ms.clamp(50, 10_000);
        self.engine.join_timeout_ms = self.engine.join_timeout_ms.max(100);
        self.engine.terminate_timeout_ms = self.engine.terminate_timeout_ms.max(100);
        if let Some(idx) = self.active_config {
            if idx >= self.configs.len() {
                self.active_config = None;
            }
        }
    }

    /// The saved profile selected as active, if any
    pub fn active(&self) -> Option<&SavedConfig> {
        self.active_config.and_then(|idx| self.configs.get(idx))
    }
}
