//! Background execution units that run an observer's watcher loop.
//!
//! The observer state machine only talks to [`ExecutionUnit`], so a thread
//! backed observer and a process backed observer are driven identically.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::ValueEnum;
use notify::{Event, PollWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::events::WatchEvent;
use crate::handler::{EventHandler, HandlerConfig};

/// Concurrency primitive backing newly created observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StartMethod {
    /// A named thread in this process; can be restarted
    #[default]
    Thread,
    /// A worker child process; one-shot
    Process,
}

/// Mechanism an observer's watcher uses to learn about changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatcherBackend {
    /// Native file system events, falling back to polling if they fail
    Auto,
    /// Native file system events
    #[default]
    Native,
    /// Periodic scans of the watched tree
    Polling,
}

impl WatcherBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherBackend::Auto => "auto",
            WatcherBackend::Native => "native",
            WatcherBackend::Polling => "polling",
        }
    }
}

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How an observer watches its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub recursive: bool,
    pub backend: WatcherBackend,
    /// Scan interval for the polling backend
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            backend: WatcherBackend::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WatchOptions {
    fn recursive_mode(&self) -> RecursiveMode {
        if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }

    /// Arguments that reproduce these options on the `worker` subcommand.
    pub fn to_worker_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--backend"),
            OsString::from(self.backend.as_str()),
            OsString::from("--poll-interval"),
            OsString::from(self.poll_interval.as_millis().to_string()),
        ];
        if !self.recursive {
            args.push(OsString::from("--non-recursive"));
        }
        args
    }
}

/// Something that can be started, stopped, and queried for liveness.
pub trait ExecutionUnit: Send {
    fn start(&mut self) -> Result<()>;

    /// Stops the unit and releases its resources. Stopping a unit that has
    /// already exited on its own only reaps it.
    fn stop(&mut self) -> Result<()>;

    fn is_alive(&mut self) -> bool;

    /// Whether `start` may be called again after `stop`.
    fn restartable(&self) -> bool;

    fn start_method(&self) -> StartMethod;

    fn backend(&self) -> WatcherBackend;
}

enum Message {
    Fs(notify::Result<Event>),
    Stop,
}

struct RunningThread {
    watcher: Box<dyn Watcher + Send>,
    control: Sender<Message>,
    handle: JoinHandle<()>,
}

/// Runs the watcher loop on a dedicated thread named after the observer.
pub struct ThreadUnit {
    name: String,
    path: PathBuf,
    options: WatchOptions,
    handler: Arc<dyn EventHandler>,
    running: Option<RunningThread>,
}

impl ThreadUnit {
    pub fn new(name: &str, path: &Path, options: WatchOptions, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            options,
            handler,
            running: None,
        }
    }

    fn native_watcher<F>(&self, on_event: F) -> notify::Result<Box<dyn Watcher + Send>>
    where
        F: notify::EventHandler,
    {
        let mut watcher = notify::recommended_watcher(on_event)?;
        watcher.watch(&self.path, self.options.recursive_mode())?;
        Ok(Box::new(watcher))
    }

    fn poll_watcher<F>(&self, on_event: F) -> notify::Result<Box<dyn Watcher + Send>>
    where
        F: notify::EventHandler,
    {
        let config = notify::Config::default().with_poll_interval(self.options.poll_interval);
        let mut watcher = PollWatcher::new(on_event, config)?;
        watcher.watch(&self.path, self.options.recursive_mode())?;
        Ok(Box::new(watcher))
    }

    fn watcher<F>(&self, on_event: F) -> Result<Box<dyn Watcher + Send>>
    where
        F: notify::EventHandler + Clone,
    {
        let watcher = match self.options.backend {
            WatcherBackend::Native => self.native_watcher(on_event)?,
            WatcherBackend::Polling => self.poll_watcher(on_event)?,
            WatcherBackend::Auto => match self.native_watcher(on_event.clone()) {
                Ok(watcher) => watcher,
                Err(err) => {
                    tracing::warn!(
                        "Native watcher failed for observer '{}' ({}), falling back to polling",
                        self.name,
                        err
                    );
                    self.poll_watcher(on_event)?
                }
            },
        };
        Ok(watcher)
    }
}

impl ExecutionUnit for ThreadUnit {
    fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(ManagerError::AlreadyRunning {
                name: self.name.clone(),
            });
        }

        let (tx, rx) = mpsc::channel::<Message>();
        let fs_tx = tx.clone();

        let watcher = self.watcher(move |res: notify::Result<Event>| {
            // The loop may already be gone while the watcher shuts down.
            let _ = fs_tx.send(Message::Fs(res));
        })?;

        let name = self.name.clone();
        let handler = Arc::clone(&self.handler);
        // Thread names cannot carry NUL bytes.
        let handle = thread::Builder::new()
            .name(self.name.replace('\0', ""))
            .spawn(move || run_event_loop(&name, rx, handler.as_ref()))
            .map_err(|e| ManagerError::Resource {
                reason: format!("failed to spawn thread for observer '{}': {}", self.name, e),
            })?;

        tracing::debug!(
            "Observer '{}' thread watching {} ({})",
            self.name,
            self.path.display(),
            self.options.backend.as_str()
        );

        self.running = Some(RunningThread {
            watcher,
            control: tx,
            handle,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        // Dropping the watcher unregisters the path before the loop exits.
        drop(running.watcher);
        let _ = running.control.send(Message::Stop);

        running.handle.join().map_err(|_| ManagerError::Resource {
            reason: format!("observer thread '{}' panicked", self.name),
        })
    }

    fn is_alive(&mut self) -> bool {
        self.running
            .as_ref()
            .map_or(false, |running| !running.handle.is_finished())
    }

    fn restartable(&self) -> bool {
        true
    }

    fn start_method(&self) -> StartMethod {
        StartMethod::Thread
    }

    fn backend(&self) -> WatcherBackend {
        self.options.backend
    }
}

impl Drop for ThreadUnit {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!("{}", err);
        }
    }
}

/// Delivers watcher events to `handler` until a stop message arrives.
///
/// This is also the body of a worker process, which blocks here for its
/// whole life.
fn run_event_loop(name: &str, rx: Receiver<Message>, handler: &dyn EventHandler) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Fs(Ok(event)) => {
                for watch_event in WatchEvent::from_notify(name, &event) {
                    handler.dispatch(&watch_event);
                }
            }
            Message::Fs(Err(err)) => {
                tracing::error!("Observer '{}' watcher error: {}", name, err);
            }
            Message::Stop => break,
        }
    }
    tracing::debug!("Observer '{}' event loop finished", name);
}

/// Runs a worker child process executing `<program> worker PATH --name NAME`.
///
/// A child process cannot be resumed once killed, so this unit is one-shot.
pub struct ProcessUnit {
    name: String,
    path: PathBuf,
    options: WatchOptions,
    config: HandlerConfig,
    program: PathBuf,
    child: Option<Child>,
    launched: bool,
}

impl ProcessUnit {
    pub fn new(name: &str, path: &Path, options: WatchOptions, config: HandlerConfig, program: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            options,
            config,
            program,
            child: None,
            launched: false,
        }
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg(&self.path)
            .arg("--name")
            .arg(&self.name)
            .args(self.config.to_worker_args())
            .args(self.options.to_worker_args());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl ExecutionUnit for ProcessUnit {
    fn start(&mut self) -> Result<()> {
        if self.launched {
            return Err(ManagerError::NotRestartable {
                name: self.name.clone(),
            });
        }

        let child = self.command().spawn().map_err(|e| ManagerError::Resource {
            reason: format!(
                "failed to launch worker {} for observer '{}': {}",
                self.program.display(),
                self.name,
                e
            ),
        })?;

        tracing::debug!("Observer '{}' worker running as pid {}", self.name, child.id());
        self.child = Some(child);
        self.launched = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        let status = child.wait()?;
        tracing::debug!("Observer '{}' worker exited with {}", self.name, status);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn restartable(&self) -> bool {
        false
    }

    fn start_method(&self) -> StartMethod {
        StartMethod::Process
    }

    fn backend(&self) -> WatcherBackend {
        self.options.backend
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!("Failed to stop worker for observer '{}': {}", self.name, err);
        }
    }
}

/// Runs a single observer in the foreground until `shutdown` receives a
/// message or is disconnected. Used by the `worker` subcommand.
pub fn run_worker(
    name: &str,
    path: &Path,
    options: WatchOptions,
    handler: Arc<dyn EventHandler>,
    shutdown: Receiver<()>,
) -> Result<()> {
    let mut unit = ThreadUnit::new(name, path, options, handler);
    unit.start()?;
    let _ = shutdown.recv();
    unit.stop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WatchEventKind;
    use parking_lot::Mutex;
    use std::fs;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CollectingHandler {
        events: Mutex<Vec<WatchEvent>>,
    }

    impl EventHandler for CollectingHandler {
        fn dispatch(&self, event: &WatchEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn test_thread_unit_delivers_events_and_restarts() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let handler = Arc::new(CollectingHandler::default());
        let mut unit = ThreadUnit::new("docs", temp_dir.path(), WatchOptions::default(), handler.clone());

        assert!(!unit.is_alive());
        unit.start().unwrap();
        assert!(unit.is_alive());

        fs::write(temp_dir.path().join("first.txt"), "hello").unwrap();
        assert!(wait_for(|| handler
            .events
            .lock()
            .iter()
            .any(|e| e.kind == WatchEventKind::Created && e.observer == "docs")));

        unit.stop().unwrap();
        assert!(!unit.is_alive());

        unit.start().unwrap();
        assert!(unit.is_alive());
        unit.stop().unwrap();
    }

    #[test]
    fn test_thread_unit_rejects_double_start() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let handler = Arc::new(CollectingHandler::default());
        let options = WatchOptions {
            recursive: false,
            ..WatchOptions::default()
        };
        let mut unit = ThreadUnit::new("docs", temp_dir.path(), options, handler);

        unit.start().unwrap();
        assert!(matches!(unit.start(), Err(ManagerError::AlreadyRunning { .. })));
        unit.stop().unwrap();
        // Stopping twice is a no-op for the unit itself.
        unit.stop().unwrap();
    }

    #[test]
    fn test_polling_backend_delivers_events() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let handler = Arc::new(CollectingHandler::default());
        let options = WatchOptions {
            backend: WatcherBackend::Polling,
            poll_interval: Duration::from_millis(100),
            ..WatchOptions::default()
        };
        let mut unit = ThreadUnit::new("scan", temp_dir.path(), options, handler.clone());
        assert_eq!(unit.backend(), WatcherBackend::Polling);

        unit.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        fs::write(temp_dir.path().join("scanned.txt"), "hello").unwrap();

        assert!(wait_for(|| handler
            .events
            .lock()
            .iter()
            .any(|e| e.kind == WatchEventKind::Created && e.path.ends_with("scanned.txt"))));
        unit.stop().unwrap();
    }

    #[test]
    fn test_thread_name_with_nul_byte_still_starts() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let handler = Arc::new(CollectingHandler::default());
        let mut unit = ThreadUnit::new("a\0b", temp_dir.path(), WatchOptions::default(), handler);

        unit.start().unwrap();
        assert!(unit.is_alive());
        unit.stop().unwrap();
    }

    #[test]
    fn test_process_unit_command_line() {
        let config = HandlerConfig::new(true, None).unwrap();
        let options = WatchOptions {
            recursive: false,
            backend: WatcherBackend::Polling,
            poll_interval: Duration::from_millis(250),
        };
        let unit = ProcessUnit::new(
            "docs",
            Path::new("/tmp/docs"),
            options,
            config,
            PathBuf::from("/usr/local/bin/watchplus"),
        );

        let command = unit.command();
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(command.get_program(), "/usr/local/bin/watchplus");
        assert_eq!(
            args,
            vec![
                "worker",
                "/tmp/docs",
                "--name",
                "docs",
                "--filter-modified",
                "--format",
                "text",
                "--backend",
                "polling",
                "--poll-interval",
                "250",
                "--non-recursive"
            ]
        );
        assert!(!unit.restartable());
    }

    #[test]
    fn test_process_unit_missing_program_is_resource_error() {
        let config = HandlerConfig::default();
        let mut unit = ProcessUnit::new(
            "docs",
            Path::new("/tmp"),
            WatchOptions::default(),
            config,
            PathBuf::from("/nonexistent/watchplus-worker"),
        );

        assert!(matches!(unit.start(), Err(ManagerError::Resource { .. })));
        assert!(!unit.is_alive());
    }
}
