//! Configuration management for watchplus
//!
//! A run is described by a TOML file listing the observers to create, the
//! handler options they share and how their execution units are started.
//! Environment variables override the handler and start method settings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::handler::{HandlerConfig, LogFormat};
use crate::manager::ObserverManager;
use crate::observer::{ObserverInfo, PathEntry};
use crate::unit::{StartMethod, WatchOptions, WatcherBackend, DEFAULT_POLL_INTERVAL};

/// Description of a manager run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchPlusConfig {
    /// How observers are executed
    pub start_method: StartMethod,
    /// Watch subdirectories too
    pub recursive: bool,
    /// Change notification mechanism
    pub backend: WatcherBackend,
    /// Scan interval for the polling backend, in milliseconds
    pub poll_interval_ms: u64,
    /// Shared event handler options
    pub handler: HandlerConfig,
    /// Directories to watch
    pub observers: Vec<PathEntry>,
}

impl Default for WatchPlusConfig {
    fn default() -> Self {
        Self {
            start_method: StartMethod::Thread,
            recursive: true,
            backend: WatcherBackend::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            handler: HandlerConfig::default(),
            observers: Vec::new(),
        }
    }
}

impl WatchPlusConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Override with environment variables if present
    pub fn apply_env(mut self) -> Self {
        let handler = &self.handler;
        let mut filter_modified = handler.filter_modified();
        let mut log_file = handler.log_file().map(Path::to_path_buf);
        let mut format = handler.format();

        if let Ok(val) = std::env::var("WATCHPLUS_FILTER_MODIFIED") {
            if let Ok(flag) = val.parse::<bool>() {
                filter_modified = flag;
            }
        }

        if let Ok(val) = std::env::var("WATCHPLUS_LOG_FILE") {
            log_file = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
        }

        if let Ok(val) = std::env::var("WATCHPLUS_LOG_FORMAT") {
            if let Ok(parsed) = <LogFormat as clap::ValueEnum>::from_str(&val, true) {
                format = parsed;
            }
        }

        if let Ok(val) = std::env::var("WATCHPLUS_START_METHOD") {
            if let Ok(parsed) = <StartMethod as clap::ValueEnum>::from_str(&val, true) {
                self.start_method = parsed;
            }
        }

        if let Ok(val) = std::env::var("WATCHPLUS_BACKEND") {
            if let Ok(parsed) = <WatcherBackend as clap::ValueEnum>::from_str(&val, true) {
                self.backend = parsed;
            }
        }

        self.handler = HandlerConfig::from_parts(filter_modified, log_file, format);
        self
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            recursive: self.recursive,
            backend: self.backend,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.observers.is_empty() {
            return Err("at least one observer must be configured".to_string());
        }

        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }

        let mut names = HashSet::new();
        for entry in &self.observers {
            if entry.name.is_empty() {
                return Err(format!("observer for {} has an empty name", entry.path.display()));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(format!("observer name '{}' is used more than once", entry.name));
            }
        }

        self.handler.validate().map_err(|e| e.to_string())
    }

    /// Configures `manager` and creates every listed observer.
    pub fn apply(&self, manager: &ObserverManager) -> Result<Vec<ObserverInfo>> {
        manager.handler_config_with(self.handler.clone())?;
        manager.set_start_method(self.start_method);
        manager.set_recursive(self.recursive);
        manager.set_backend(self.backend);
        manager.set_poll_interval(Duration::from_millis(self.poll_interval_ms))?;
        let created = manager.create_observers(&self.observers)?;
        Ok(created)
    }
}
