use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::error::Result;
use crate::handler::{HandlerConfig, LogFormat};
use crate::observer::PathEntry;
use crate::unit::{StartMethod, WatchOptions, WatcherBackend};

#[derive(Parser)]
#[command(name = "watchplus")]
#[command(version)]
#[command(about = "Watch many directories at once, one named observer per directory")]
#[command(long_about = "watchplus creates a named filesystem observer for every directory given, runs each one on its own thread or worker process, and logs the events they see to the console or a file.")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Watch the given directories until interrupted
    Watch(WatchArgs),
    /// Create and run the observers described by a config file
    Run(RunArgs),
    /// Run a single observer in the foreground (used by process observers)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HandlerArgs {
    /// Drop modified events, keeping create, delete and move
    #[arg(long, help = "Do not log modified events")]
    pub filter_modified: bool,

    /// Append event lines to this file instead of standard output
    #[arg(long, value_name = "FILE", help = "Log file for events")]
    pub log_file: Option<PathBuf>,

    /// Layout of event lines
    #[arg(long, default_value = "text", help = "Event line format")]
    pub format: LogFormat,
}

impl HandlerArgs {
    pub fn to_config(&self) -> Result<HandlerConfig> {
        Ok(HandlerConfig::new(self.filter_modified, self.log_file.clone())?.with_format(self.format))
    }
}

#[derive(Args, Debug, Clone)]
pub struct WatcherArgs {
    /// Only watch the top level of each directory
    #[arg(long, help = "Do not watch subdirectories")]
    pub non_recursive: bool,

    /// File watching backend
    #[arg(long, default_value = "native", help = "Watching backend")]
    pub backend: WatcherBackend,

    /// Polling interval in milliseconds (for the polling backend)
    #[arg(long, default_value = "1000", value_name = "MS", help = "Polling interval in milliseconds")]
    pub poll_interval: u64,
}

impl WatcherArgs {
    pub fn to_options(&self) -> WatchOptions {
        WatchOptions {
            recursive: !self.non_recursive,
            backend: self.backend,
            poll_interval: Duration::from_millis(self.poll_interval),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Directories to watch, optionally named with PATH=NAME
    #[arg(required = true, value_name = "PATH[=NAME]")]
    pub entries: Vec<PathEntry>,

    #[command(flatten)]
    pub handler: HandlerArgs,

    #[command(flatten)]
    pub watcher: WatcherArgs,

    /// How each observer is executed
    #[arg(long, default_value = "thread", help = "Run observers on threads or worker processes")]
    pub start_method: StartMethod,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long, value_name = "SECS", help = "Seconds to keep observers alive")]
    pub duration: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// TOML file describing the observers
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long, value_name = "SECS", help = "Seconds to keep observers alive")]
    pub duration: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Directory to watch
    pub path: PathBuf,

    /// Observer name used in event lines
    #[arg(long)]
    pub name: String,

    #[command(flatten)]
    pub handler: HandlerArgs,

    #[command(flatten)]
    pub watcher: WatcherArgs,
}

impl Cli {
    pub fn duration(&self) -> Option<Duration> {
        match &self.command {
            Command::Watch(args) => args.duration.map(Duration::from_secs),
            Command::Run(args) => args.duration.map(Duration::from_secs),
            Command::Worker(_) => None,
        }
    }

    fn watcher(&self) -> Option<&WatcherArgs> {
        match &self.command {
            Command::Watch(args) => Some(&args.watcher),
            Command::Run(_) => None,
            Command::Worker(args) => Some(&args.watcher),
        }
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        // Diagnostics go to stderr so event lines on stdout stay clean.
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(duration) = self.duration() {
            if duration.is_zero() {
                return Err("Duration must be greater than 0".to_string());
            }
        }

        if let Some(watcher) = self.watcher() {
            if watcher.poll_interval == 0 {
                return Err("Poll interval must be greater than 0".to_string());
            }
        }

        match &self.command {
            Command::Run(args) if !args.config.exists() => {
                Err(format!("Config file does not exist: {}", args.config.display()))
            }
            Command::Worker(args) => PathEntry::new(&args.path, &args.name)
                .validate()
                .map_err(|e| e.to_string()),
            _ => Ok(()),
        }
    }
}
