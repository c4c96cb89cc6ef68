use crate::clienv;
use crate::error::{Result, ServiceError};
use crate::terminal::TerminalMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file for a service, `service.toml`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Backend name (e.g., "standard")
    pub backend: Option<String>,
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Accept terminal connections while running
    pub active: bool,
    pub mode: TerminalMode,
    /// Expose the endpoint to every local user
    pub global: bool,
    /// Start the service when a terminal finds it not running
    pub start_with_terminal: bool,
}

impl ServiceConfig {
    /// $SVCRT_CONFIG or ~/.config/<service>/service.toml
    pub fn config_path(service_name: &str) -> PathBuf {
        clienv::config_path_override()
            .unwrap_or_else(|| clienv::config_dir(service_name).join("service.toml"))
    }

    pub fn load(service_name: &str) -> Result<Self> {
        Self::load_from(&Self::config_path(service_name))
    }

    /// Missing file means defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading service config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            ServiceError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        tracing::trace!(backend = ?config.backend, terminal = ?config.terminal, "Service config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ServiceError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        tracing::trace!(path = %path.display(), "Service config saved");
        Ok(())
    }

    /// Backend to use: CLI flag > $SVCRT_BACKEND > file > "standard".
    pub fn resolve_backend(&self, cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(clienv::backend)
            .or_else(|| self.backend.clone())
            .unwrap_or_else(|| clienv::DEFAULT_BACKEND.to_string())
    }
}
