use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::handler::{HandlerConfig, HandlerFactory};
use crate::unit::{ExecutionUnit, ProcessUnit, StartMethod, ThreadUnit, WatchOptions, WatcherBackend};

/// Rejects names that cannot label a thread or a command line argument.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(ManagerError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// A directory to watch and the name its observer is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: PathBuf,
    pub name: String,
}

impl PathEntry {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }

    /// Checks the name, then that the path is an existing, readable
    /// directory.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if !self.path.exists() {
            return Err(ManagerError::PathNotFound {
                path: self.path.clone(),
            });
        }

        if !self.path.is_dir() {
            return Err(ManagerError::NotADirectory {
                path: self.path.clone(),
            });
        }

        std::fs::read_dir(&self.path).map_err(|e| ManagerError::PathUnreadable {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}

/// Parses `PATH=NAME`, or a bare `PATH` named after its last component.
impl FromStr for PathEntry {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some((path, name)) = s.rsplit_once('=') {
            if path.is_empty() || name.is_empty() {
                return Err(format!("Expected PATH=NAME, got '{}'", s));
            }
            return Ok(PathEntry::new(path, name));
        }

        let path = PathBuf::from(s);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| format!("Cannot derive an observer name from '{}', use PATH=NAME", s))?;
        Ok(PathEntry { path, name })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObserverState {
    Created,
    Started,
    Stopped,
}

impl fmt::Display for ObserverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ObserverState::Created => "Created",
            ObserverState::Started => "Started",
            ObserverState::Stopped => "Stopped",
        };
        f.write_str(label)
    }
}

/// Read-only snapshot of an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObserverInfo {
    pub name: String,
    pub path: PathBuf,
    pub state: ObserverState,
    pub start_method: StartMethod,
    pub backend: WatcherBackend,
}

pub struct Observer {
    name: String,
    path: PathBuf,
    state: ObserverState,
    unit: Box<dyn ExecutionUnit>,
}

impl Observer {
    pub fn new(entry: &PathEntry, unit: Box<dyn ExecutionUnit>) -> Self {
        Self {
            name: entry.name.clone(),
            path: entry.path.clone(),
            state: ObserverState::Created,
            unit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&mut self) -> Result<()> {
        self.refresh();
        match self.state {
            ObserverState::Started => Err(ManagerError::AlreadyRunning {
                name: self.name.clone(),
            }),
            ObserverState::Stopped if !self.unit.restartable() => Err(ManagerError::NotRestartable {
                name: self.name.clone(),
            }),
            _ => {
                self.unit.start()?;
                self.state = ObserverState::Started;
                tracing::info!("Started observer '{}' on {}", self.name, self.path.display());
                Ok(())
            }
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        self.refresh();
        if self.state != ObserverState::Started {
            return Err(ManagerError::NotRunning {
                name: self.name.clone(),
            });
        }

        self.unit.stop()?;
        self.state = ObserverState::Stopped;
        tracing::info!("Stopped observer '{}'", self.name);
        Ok(())
    }

    /// Current state; a unit that died on its own reads as stopped.
    pub fn state(&mut self) -> ObserverState {
        self.refresh();
        self.state
    }

    pub fn info(&mut self) -> ObserverInfo {
        ObserverInfo {
            name: self.name.clone(),
            path: self.path.clone(),
            state: self.state(),
            start_method: self.unit.start_method(),
            backend: self.unit.backend(),
        }
    }

    fn refresh(&mut self) {
        if self.state == ObserverState::Started && !self.unit.is_alive() {
            tracing::warn!("Observer '{}' exited unexpectedly", self.name);
            if let Err(err) = self.unit.stop() {
                tracing::warn!("Failed to clean up observer '{}': {}", self.name, err);
            }
            self.state = ObserverState::Stopped;
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("start_method", &self.unit.start_method())
            .finish()
    }
}

/// Everything needed to build observers, captured from the manager at the
/// moment `create_observers` is called.
pub struct ObserverFactory {
    pub handler_config: HandlerConfig,
    pub handler_factory: HandlerFactory,
    pub start_method: StartMethod,
    pub watch: WatchOptions,
    pub worker_program: Option<PathBuf>,
}

impl ObserverFactory {
    /// Builds an observer in the `Created` state. The entry is expected to
    /// be validated already.
    pub fn build(&self, entry: &PathEntry) -> Result<Observer> {
        let unit: Box<dyn ExecutionUnit> = match self.start_method {
            StartMethod::Thread => {
                let handler = (self.handler_factory)(&self.handler_config)?;
                Box::new(ThreadUnit::new(&entry.name, &entry.path, self.watch, handler))
            }
            StartMethod::Process => Box::new(ProcessUnit::new(
                &entry.name,
                &entry.path,
                self.watch,
                self.handler_config.clone(),
                self.worker_program()?,
            )),
        };

        tracing::debug!(
            "Created observer '{}' for {} ({:?})",
            entry.name,
            entry.path.display(),
            self.start_method
        );
        Ok(Observer::new(entry, unit))
    }

    /// The program launched for process observers. It must be set
    /// explicitly.
    fn worker_program(&self) -> Result<PathBuf> {
        self.worker_program.clone().ok_or_else(|| ManagerError::Configuration {
            reason: "process observers need a worker program that provides the `worker` subcommand".to_string(),
        })
    }
}
