pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod manager;
pub mod observer;
pub mod registry;
pub mod service;
pub mod unit;

pub use config::WatchPlusConfig;
pub use error::{ManagerError, Result};
pub use events::{WatchEvent, WatchEventKind};
pub use handler::{EventHandler, HandlerConfig, HandlerFactory, LogEventHandler, LogFormat};
pub use manager::{BatchReport, ObserverManager};
pub use observer::{Observer, ObserverInfo, ObserverState, PathEntry};
pub use registry::ObserverRegistry;
pub use service::{ServiceInfo, ServiceManager, ServiceSignal};
pub use unit::{ExecutionUnit, ProcessUnit, StartMethod, ThreadUnit, WatchOptions, WatcherBackend};
