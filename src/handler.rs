//! Event handlers and the configuration they are built from.
//!
//! A [`HandlerConfig`] is a plain value captured by every observer at
//! creation time. Each observer then builds its own [`EventHandler`] from it,
//! so replacing the manager's configuration never reaches observers that
//! already exist.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::events::{WatchEvent, WatchEventKind};

/// Layout of the lines written by [`LogEventHandler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Timestamped human readable line
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// Single letter kind, observer name and path
    Compact,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    filter_modified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_file: Option<PathBuf>,
    format: LogFormat,
}

impl HandlerConfig {
    /// Builds a configuration, failing if `log_file` could not be opened for
    /// appending. The file itself is not created until a handler opens it.
    pub fn new(filter_modified: bool, log_file: Option<PathBuf>) -> Result<Self> {
        let config = Self {
            filter_modified,
            log_file,
            format: LogFormat::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration without touching the log file; callers are
    /// expected to `validate` before use.
    pub(crate) fn from_parts(filter_modified: bool, log_file: Option<PathBuf>, format: LogFormat) -> Self {
        Self {
            filter_modified,
            log_file,
            format,
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn filter_modified(&self) -> bool {
        self.filter_modified
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.log_file {
            check_log_file(path)?;
        }
        Ok(())
    }

    /// Arguments that reproduce this configuration on the `worker`
    /// subcommand of a child process.
    pub fn to_worker_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if self.filter_modified {
            args.push(OsString::from("--filter-modified"));
        }
        if let Some(path) = &self.log_file {
            args.push(OsString::from("--log-file"));
            args.push(path.as_os_str().to_os_string());
        }
        args.push(OsString::from("--format"));
        args.push(OsString::from(match self.format {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Compact => "compact",
        }));
        args
    }
}

fn not_writable(path: &Path, reason: impl std::fmt::Display) -> ManagerError {
    ManagerError::Configuration {
        reason: format!("log file {} is not writable: {}", path.display(), reason),
    }
}

/// Checks that `path` can be appended to without creating it: an existing
/// file must open for appending, a new one needs a writable parent directory.
fn check_log_file(path: &Path) -> Result<()> {
    if path.exists() {
        return OpenOptions::new()
            .append(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| not_writable(path, e));
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let metadata = fs::metadata(parent).map_err(|e| not_writable(path, e))?;
    if !metadata.is_dir() {
        return Err(not_writable(path, format!("{} is not a directory", parent.display())));
    }
    if metadata.permissions().readonly() {
        return Err(not_writable(path, format!("{} is read-only", parent.display())));
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| not_writable(path, e))
}

/// Logic invoked for every event an observer sees.
///
/// Handlers run on the observer's own thread and may be shared, so they must
/// be `Send + Sync`.
pub trait EventHandler: Send + Sync {
    fn dispatch(&self, event: &WatchEvent);
}

/// Builds the handler for a newly created observer.
pub type HandlerFactory = Arc<dyn Fn(&HandlerConfig) -> Result<Arc<dyn EventHandler>> + Send + Sync>;

/// Writes one line per event to a log file or standard output.
pub struct LogEventHandler {
    filter_modified: bool,
    format: LogFormat,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl LogEventHandler {
    pub fn new(config: &HandlerConfig) -> Result<Self> {
        let sink: Box<dyn Write + Send> = match config.log_file() {
            Some(path) => Box::new(open_log_file(path)?),
            None => Box::new(io::stdout()),
        };
        Ok(Self::with_writer(config, sink))
    }

    pub fn with_writer(config: &HandlerConfig, sink: Box<dyn Write + Send>) -> Self {
        Self {
            filter_modified: config.filter_modified(),
            format: config.format(),
            sink: Mutex::new(sink),
        }
    }

    pub fn should_log(&self, event: &WatchEvent) -> bool {
        !(self.filter_modified && event.kind.is_modification())
    }
}

impl EventHandler for LogEventHandler {
    fn dispatch(&self, event: &WatchEvent) {
        if !self.should_log(event) {
            return;
        }

        let Some(line) = format_line(self.format, event) else {
            return;
        };
        let mut sink = self.sink.lock();
        if let Err(err) = writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
            tracing::warn!("Failed to write event for observer {}: {}", event.observer, err);
        }
    }
}

/// The default factory: a [`LogEventHandler`] per observer.
pub fn log_handler_factory() -> HandlerFactory {
    Arc::new(|config: &HandlerConfig| -> Result<Arc<dyn EventHandler>> {
        let handler: Arc<dyn EventHandler> = Arc::new(LogEventHandler::new(config)?);
        Ok(handler)
    })
}

/// Renders one log line, or `None` when the event cannot be serialized.
pub fn format_line(format: LogFormat, event: &WatchEvent) -> Option<String> {
    let line = match format {
        LogFormat::Text => {
            let time_str = event.timestamp.format("%H:%M:%S");
            match &event.kind {
                WatchEventKind::Moved { from, to } => format!(
                    "[{}] <{}> watched {:?} got moved -> {:?}",
                    time_str,
                    event.observer,
                    from.display().to_string(),
                    to.display().to_string()
                ),
                kind => format!(
                    "[{}] <{}> watched {:?} got {}",
                    time_str,
                    event.observer,
                    event.path.display().to_string(),
                    kind
                ),
            }
        }
        LogFormat::Compact => format!(
            "{} {} {}",
            event.kind.short_code(),
            event.observer,
            event.path.display()
        ),
        LogFormat::Json => match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!("Failed to serialize event for observer {}: {}", event.observer, err);
                return None;
            }
        },
    };
    Some(line)
}
