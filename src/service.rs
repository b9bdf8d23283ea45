//! Detached background services.
//!
//! A service is a `watchplus run` process launched from a config file that
//! the [`ServiceManager`] writes into the service's directory. Its output is
//! appended to an output file next to it and its pid is recorded in a pid
//! file. Services keep running when the manager is dropped; stop them with
//! [`ServiceManager::stop`] or [`ServiceManager::clean_stop`].

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::WatchPlusConfig;
use crate::error::{ManagerError, Result};
use crate::handler::HandlerConfig;
use crate::observer::{validate_name, PathEntry};
use crate::unit::{StartMethod, WatchOptions};

/// Signals that can be sent to a running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSignal {
    Hangup,
    Interrupt,
    Terminate,
    Kill,
}

impl ServiceSignal {
    /// Name accepted by `kill -s`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceSignal::Hangup => "HUP",
            ServiceSignal::Interrupt => "INT",
            ServiceSignal::Terminate => "TERM",
            ServiceSignal::Kill => "KILL",
        }
    }
}

impl fmt::Display for ServiceSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.as_str())
    }
}

/// Read-only snapshot of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub path: PathBuf,
    pub service_dir: PathBuf,
    pub service_file: PathBuf,
    pub output_file: PathBuf,
    /// Set while the service process is running
    pub pid: Option<u32>,
}

struct Service {
    entry: PathEntry,
    service_dir: PathBuf,
    child: Option<Child>,
}

impl Service {
    fn file_name(&self, suffix: &str) -> PathBuf {
        self.service_dir
            .join(format!("{}{}", self.entry.name.to_lowercase(), suffix))
    }

    fn service_file(&self) -> PathBuf {
        self.file_name("_service.toml")
    }

    fn output_file(&self) -> PathBuf {
        self.file_name("_output.txt")
    }

    fn pid_file(&self) -> PathBuf {
        self.file_name(".pid")
    }

    /// Pid of the service process, or `None` once it has exited.
    fn running_pid(&mut self) -> Option<u32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(None) => Some(child.id()),
            Ok(Some(status)) => {
                tracing::debug!("Service '{}' exited with {}", self.entry.name, status);
                self.child = None;
                None
            }
            Err(err) => {
                tracing::warn!("Cannot query service '{}': {}", self.entry.name, err);
                None
            }
        }
    }

    fn write_service_file(&self, handler: &HandlerConfig, options: WatchOptions) -> Result<()> {
        let path = fs::canonicalize(&self.entry.path)?;
        let config = WatchPlusConfig {
            start_method: StartMethod::Thread,
            recursive: options.recursive,
            backend: options.backend,
            poll_interval_ms: options.poll_interval.as_millis() as u64,
            handler: handler.clone(),
            observers: vec![PathEntry::new(path, self.entry.name.clone())],
        };
        let contents = toml::to_string(&config).map_err(|e| ManagerError::Configuration {
            reason: format!("cannot write service file for '{}': {}", self.entry.name, e),
        })?;
        fs::write(self.service_file(), contents)?;
        Ok(())
    }

    fn info(&mut self) -> ServiceInfo {
        ServiceInfo {
            name: self.entry.name.clone(),
            path: self.entry.path.clone(),
            service_dir: self.service_dir.clone(),
            service_file: self.service_file(),
            output_file: self.output_file(),
            pid: self.running_pid(),
        }
    }
}

/// Creates, launches and signals detached watcher services.
pub struct ServiceManager {
    program: PathBuf,
    services: Mutex<HashMap<String, Service>>,
}

impl ServiceManager {
    /// `program` is the watchplus executable; services run its `run`
    /// subcommand.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a service watching `entry` and writes its service file.
    ///
    /// Without `service_dir` the files go to `"<name> watchplus-service"` in
    /// the current directory. The directory is created if needed.
    pub fn create_service(
        &self,
        entry: &PathEntry,
        service_dir: Option<PathBuf>,
        handler: &HandlerConfig,
        options: WatchOptions,
    ) -> Result<ServiceInfo> {
        validate_service_name(&entry.name)?;
        entry.validate()?;
        handler.validate()?;

        let mut services = self.services.lock();
        if services.contains_key(&entry.name) {
            return Err(ManagerError::ServiceExists {
                name: entry.name.clone(),
            });
        }

        let service_dir =
            service_dir.unwrap_or_else(|| PathBuf::from(format!("{} watchplus-service", entry.name)));
        fs::create_dir_all(&service_dir)?;

        let mut service = Service {
            entry: entry.clone(),
            service_dir,
            child: None,
        };
        service.write_service_file(handler, options)?;

        let info = service.info();
        services.insert(entry.name.clone(), service);
        tracing::info!("Created service '{}' in {}", entry.name, info.service_dir.display());
        Ok(info)
    }

    /// Launches the service in the background and returns its pid.
    pub fn start_service(&self, name: &str) -> Result<u32> {
        let mut services = self.services.lock();
        let service = lookup(&mut services, name)?;
        if service.running_pid().is_some() {
            return Err(ManagerError::AlreadyRunning { name: name.to_string() });
        }

        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(service.output_file())?;
        let errors = output.try_clone()?;

        let mut child = Command::new(&self.program)
            .arg("run")
            .arg("--config")
            .arg(service.service_file())
            .stdin(Stdio::null())
            .stdout(output)
            .stderr(errors)
            .spawn()
            .map_err(|e| ManagerError::Resource {
                reason: format!(
                    "failed to launch {} for service '{}': {}",
                    self.program.display(),
                    name,
                    e
                ),
            })?;

        let pid = child.id();
        if let Err(err) = fs::write(service.pid_file(), format!("{}\n", pid)) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }

        service.child = Some(child);
        tracing::info!("Started service '{}' as pid {}", name, pid);
        Ok(pid)
    }

    pub fn pid(&self, name: &str) -> Result<u32> {
        let mut services = self.services.lock();
        running_pid(lookup(&mut services, name)?)
    }

    pub fn is_running(&self, name: &str) -> Result<bool> {
        let mut services = self.services.lock();
        Ok(lookup(&mut services, name)?.running_pid().is_some())
    }

    pub fn send_signal(&self, name: &str, signal: ServiceSignal) -> Result<()> {
        let mut services = self.services.lock();
        let pid = running_pid(lookup(&mut services, name)?)?;
        deliver(pid, signal)?;
        tracing::debug!("Sent {} to service '{}' (pid {})", signal, name, pid);
        Ok(())
    }

    /// Kills the service process and waits for it to exit.
    pub fn stop(&self, name: &str) -> Result<()> {
        let mut services = self.services.lock();
        let service = lookup(&mut services, name)?;
        let pid = running_pid(service)?;
        deliver(pid, ServiceSignal::Kill)?;

        if let Some(mut child) = service.child.take() {
            let status = child.wait()?;
            tracing::debug!("Service '{}' exited with {}", name, status);
        }
        remove_if_exists(&service.pid_file())?;
        tracing::info!("Stopped service '{}'", name);
        Ok(())
    }

    /// Deletes the files a service created, and its directory once empty.
    pub fn clean_files(&self, name: &str) -> Result<()> {
        let mut services = self.services.lock();
        let service = lookup(&mut services, name)?;
        for file in [service.service_file(), service.output_file(), service.pid_file()] {
            remove_if_exists(&file)?;
        }
        if fs::remove_dir(&service.service_dir).is_err() {
            tracing::debug!("Keeping non-empty service directory {}", service.service_dir.display());
        }
        Ok(())
    }

    pub fn clean_stop(&self, name: &str) -> Result<()> {
        self.stop(name)?;
        self.clean_files(name)
    }

    pub fn service(&self, name: &str) -> Result<ServiceInfo> {
        let mut services = self.services.lock();
        Ok(lookup(&mut services, name)?.info())
    }

    /// Snapshot of every service, sorted by name.
    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let mut services = self.services.lock();
        let mut infos: Vec<ServiceInfo> = services.values_mut().map(Service::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Waits up to `timeout` for the service process to exit on its own.
    pub fn wait_for_exit(&self, name: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running(name)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.services.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("ServiceManager")
            .field("program", &self.program)
            .field("services", &names)
            .finish()
    }
}

fn lookup<'a>(services: &'a mut HashMap<String, Service>, name: &str) -> Result<&'a mut Service> {
    services.get_mut(name).ok_or_else(|| ManagerError::UnknownService {
        name: name.to_string(),
    })
}

fn running_pid(service: &mut Service) -> Result<u32> {
    service.running_pid().ok_or_else(|| ManagerError::ServiceNotRunning {
        name: service.entry.name.clone(),
    })
}

/// Service names become file names, so path separators are rejected too.
fn validate_service_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name.contains(|c| c == '/' || c == '\\') {
        return Err(ManagerError::InvalidName {
            name: name.to_string(),
            reason: "service names cannot contain path separators".to_string(),
        });
    }
    Ok(())
}

fn deliver(pid: u32, signal: ServiceSignal) -> Result<()> {
    let status = Command::new("kill")
        .arg("-s")
        .arg(signal.as_str())
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| ManagerError::Resource {
            reason: format!("cannot run kill for pid {}: {}", pid, e),
        })?;

    if !status.success() {
        return Err(ManagerError::Resource {
            reason: format!("kill -s {} {} exited with {}", signal.as_str(), pid, status),
        });
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
