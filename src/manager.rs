//! The facade for creating and driving named observers.
//!
//! All registry access goes through one lock, so an [`ObserverManager`] can be
//! shared between threads. Filesystem events never pass through the manager;
//! they are handled on each observer's own thread or worker process.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ManagerError, Result};
use crate::handler::{log_handler_factory, HandlerConfig, HandlerFactory};
use crate::observer::{ObserverFactory, ObserverInfo, ObserverState, PathEntry};
use crate::registry::ObserverRegistry;
use crate::unit::{StartMethod, WatchOptions, WatcherBackend};

/// Outcome of a bulk start or stop.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// Observers already in the requested state when targeting all of them
    pub skipped: Vec<String>,
    pub failed: Vec<(String, ManagerError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, name: String, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(name),
            Err(err) => {
                tracing::warn!("{}", err);
                self.failed.push((name, err));
            }
        }
    }
}

struct ManagerState {
    handler_config: HandlerConfig,
    handler_factory: HandlerFactory,
    start_method: StartMethod,
    watch: WatchOptions,
    worker_program: Option<PathBuf>,
    registry: ObserverRegistry,
}

impl ManagerState {
    fn factory(&self) -> ObserverFactory {
        ObserverFactory {
            handler_config: self.handler_config.clone(),
            handler_factory: self.handler_factory.clone(),
            start_method: self.start_method,
            watch: self.watch,
            worker_program: self.worker_program.clone(),
        }
    }
}

pub struct ObserverManager {
    state: Mutex<ManagerState>,
}

impl Default for ObserverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverManager {
    /// A manager creating recursive, thread backed observers that log every
    /// event to standard output.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState {
                handler_config: HandlerConfig::default(),
                handler_factory: log_handler_factory(),
                start_method: StartMethod::default(),
                watch: WatchOptions::default(),
                worker_program: None,
                registry: ObserverRegistry::new(),
            }),
        }
    }

    /// Replaces the handler used by thread backed observers created from now
    /// on. Worker processes always log.
    pub fn with_handler_factory(self, factory: HandlerFactory) -> Self {
        self.state.lock().handler_factory = factory;
        self
    }

    /// Executable launched for process backed observers; it must provide the
    /// `worker` subcommand. Without one, creating process observers fails
    /// with [`ManagerError::Configuration`].
    pub fn with_worker_program(self, program: impl Into<PathBuf>) -> Self {
        self.state.lock().worker_program = Some(program.into());
        self
    }

    pub fn set_start_method(&self, method: StartMethod) {
        self.state.lock().start_method = method;
    }

    pub fn set_recursive(&self, recursive: bool) {
        self.state.lock().watch.recursive = recursive;
    }

    pub fn set_backend(&self, backend: WatcherBackend) {
        self.state.lock().watch.backend = backend;
    }

    /// Scan interval used by observers on the polling backend.
    pub fn set_poll_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(ManagerError::Configuration {
                reason: "poll interval must be greater than 0".to_string(),
            });
        }
        self.state.lock().watch.poll_interval = interval;
        Ok(())
    }

    pub fn watch_options(&self) -> WatchOptions {
        self.state.lock().watch
    }

    /// Sets the handler configuration for observers created after this call.
    ///
    /// A log file is checked for writability but not created here; the
    /// first observer handler that opens it creates it.
    pub fn handler_config(&self, filter_modified: bool, log_file: Option<PathBuf>) -> Result<HandlerConfig> {
        let config = HandlerConfig::new(filter_modified, log_file)?;
        self.state.lock().handler_config = config.clone();
        Ok(config)
    }

    pub fn handler_config_with(&self, config: HandlerConfig) -> Result<()> {
        config.validate()?;
        self.state.lock().handler_config = config;
        Ok(())
    }

    pub fn current_handler_config(&self) -> HandlerConfig {
        self.state.lock().handler_config.clone()
    }

    pub fn create_observer(&self, path: impl Into<PathBuf>, name: impl Into<String>) -> Result<ObserverInfo> {
        let mut created = self.create_observers(&[PathEntry::new(path, name)])?;
        created.pop().ok_or_else(|| ManagerError::Resource {
            reason: "observer was not created".to_string(),
        })
    }

    /// Creates one observer per entry, in input order.
    ///
    /// Creation is all-or-nothing: every entry is validated and built before
    /// any of them is registered, so a failing call leaves the registry as it
    /// was.
    pub fn create_observers(&self, items: &[PathEntry]) -> Result<Vec<ObserverInfo>> {
        let mut state = self.state.lock();

        let mut seen = HashSet::new();
        for entry in items {
            entry.validate()?;
            if state.registry.contains(&entry.name) || !seen.insert(entry.name.as_str()) {
                return Err(ManagerError::NameConflict {
                    name: entry.name.clone(),
                });
            }
        }

        let factory = state.factory();
        let observers = items
            .iter()
            .map(|entry| factory.build(entry))
            .collect::<Result<Vec<_>>>()?;

        let mut created = Vec::with_capacity(observers.len());
        for mut observer in observers {
            created.push(observer.info());
            state.registry.insert(observer)?;
        }

        tracing::info!("Created {} observer(s)", created.len());
        Ok(created)
    }

    pub fn start_observer(&self, name: &str) -> Result<()> {
        self.state.lock().registry.get_mut(name)?.start()
    }

    /// Starts the named observers, or with `None` every observer that is not
    /// already running. Failures are collected per observer.
    pub fn start_observers(&self, names: Option<&[&str]>) -> BatchReport {
        let mut state = self.state.lock();
        let mut report = BatchReport::default();

        match names {
            Some(names) => {
                for name in names {
                    let result = state.registry.get_mut(name).and_then(|observer| observer.start());
                    report.record(name.to_string(), result);
                }
            }
            None => {
                for name in state.registry.names() {
                    let observer = state.registry.get_mut(&name);
                    let result = observer.and_then(|observer| {
                        if observer.state() == ObserverState::Started {
                            return Ok(false);
                        }
                        observer.start().map(|_| true)
                    });
                    match result {
                        Ok(false) => report.skipped.push(name),
                        other => report.record(name, other.map(|_| ())),
                    }
                }
            }
        }

        report
    }

    pub fn stop_observer(&self, name: &str) -> Result<()> {
        self.state.lock().registry.get_mut(name)?.stop()
    }

    /// Stops the named observers, or with `None` every running observer.
    pub fn stop_observers(&self, names: Option<&[&str]>) -> BatchReport {
        let mut state = self.state.lock();
        let mut report = BatchReport::default();

        match names {
            Some(names) => {
                for name in names {
                    let result = state.registry.get_mut(name).and_then(|observer| observer.stop());
                    report.record(name.to_string(), result);
                }
            }
            None => {
                for name in state.registry.names() {
                    let observer = state.registry.get_mut(&name);
                    let result = observer.and_then(|observer| {
                        if observer.state() != ObserverState::Started {
                            return Ok(false);
                        }
                        observer.stop().map(|_| true)
                    });
                    match result {
                        Ok(false) => report.skipped.push(name),
                        other => report.record(name, other.map(|_| ())),
                    }
                }
            }
        }

        report
    }

    /// Starts observers, keeps them alive for `duration`, then stops the ones
    /// that started. The lock is not held while waiting.
    pub fn run_observers(&self, names: Option<&[&str]>, duration: Duration) -> (BatchReport, BatchReport) {
        let started = self.start_observers(names);
        thread::sleep(duration);

        let names: Vec<&str> = started.succeeded.iter().map(String::as_str).collect();
        let stopped = self.stop_observers(Some(names.as_slice()));
        (started, stopped)
    }

    /// Stops the observer if it is running and forgets it.
    pub fn remove_observer(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let observer = state.registry.get_mut(name)?;
        if observer.state() == ObserverState::Started {
            observer.stop()?;
        }
        state.registry.remove(name)?;
        tracing::info!("Removed observer '{}'", name);
        Ok(())
    }

    pub fn observer(&self, name: &str) -> Result<ObserverInfo> {
        Ok(self.state.lock().registry.get_mut(name)?.info())
    }

    /// Snapshot of every observer, sorted by name.
    pub fn list_observers(&self) -> Vec<ObserverInfo> {
        let mut state = self.state.lock();
        let mut infos = Vec::with_capacity(state.registry.len());
        for name in state.registry.names() {
            if let Ok(observer) = state.registry.get_mut(&name) {
                infos.push(observer.info());
            }
        }
        infos
    }

    pub fn len(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().registry.is_empty()
    }
}

impl fmt::Debug for ObserverManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObserverManager")
            .field("handler_config", &state.handler_config)
            .field("start_method", &state.start_method)
            .field("watch", &state.watch)
            .field("registry", &state.registry)
            .finish()
    }
}

impl Drop for ObserverManager {
    fn drop(&mut self) {
        let report = self.stop_observers(None);
        if !report.succeeded.is_empty() {
            tracing::debug!("Stopped {} observer(s) on shutdown", report.succeeded.len());
        }
    }
}
