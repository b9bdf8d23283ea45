use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use watchplus::{
    cli::{Cli, Command, RunArgs, WatchArgs, WorkerArgs},
    unit::run_worker,
    BatchReport, LogEventHandler, ObserverManager, ObserverState, WatchPlusConfig,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    match &cli.command {
        Command::Watch(args) => run_watch_mode(args, cli.duration()),
        Command::Run(args) => run_config_mode(args, cli.duration()),
        Command::Worker(args) => run_worker_mode(args),
    }
}

/// A manager whose process observers re-run this binary's `worker`
/// subcommand.
fn new_manager() -> Result<ObserverManager> {
    let program = std::env::current_exe().context("Failed to locate the watchplus executable")?;
    Ok(ObserverManager::new().with_worker_program(program))
}

fn run_watch_mode(args: &WatchArgs, duration: Option<Duration>) -> Result<()> {
    let options = args.watcher.to_options();
    let manager = new_manager()?;
    manager.handler_config_with(args.handler.to_config()?)?;
    manager.set_start_method(args.start_method);
    manager.set_recursive(options.recursive);
    manager.set_backend(options.backend);
    manager.set_poll_interval(options.poll_interval)?;

    manager
        .create_observers(&args.entries)
        .context("Failed to create observers")?;

    drive(&manager, duration)
}

fn run_config_mode(args: &RunArgs, duration: Option<Duration>) -> Result<()> {
    let config = WatchPlusConfig::load(&args.config)?.apply_env();
    if let Err(err) = config.validate() {
        bail!("Invalid config {}: {}", args.config.display(), err);
    }

    let manager = new_manager()?;
    config
        .apply(&manager)
        .context("Failed to create observers")?;

    drive(&manager, duration)
}

fn run_worker_mode(args: &WorkerArgs) -> Result<()> {
    let config = args.handler.to_config()?;
    let handler = Arc::new(LogEventHandler::new(&config)?);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    tracing::debug!("Worker for observer '{}' watching {}", args.name, args.path.display());
    run_worker(&args.name, &args.path, args.watcher.to_options(), handler, rx)?;
    Ok(())
}

/// Starts every observer and keeps them alive for `duration`, or until
/// Ctrl+C when no duration is given.
fn drive(manager: &ObserverManager, duration: Option<Duration>) -> Result<()> {
    if let Some(duration) = duration {
        let (started, stopped) = manager.run_observers(None, duration);
        print_report("start", "Started", &started);
        print_report("stop", "Stopped", &stopped);
        return Ok(());
    }

    let started = manager.start_observers(None);
    print_report("start", "Started", &started);
    if started.succeeded.is_empty() {
        bail!("No observer could be started");
    }

    for info in manager.list_observers() {
        tracing::info!(
            "<{}> {} ({:?}, {}) {}",
            info.name,
            info.path.display(),
            info.start_method,
            info.backend.as_str(),
            info.state
        );
    }
    tracing::info!("Press Ctrl+C to quit");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        let any_running = manager
            .list_observers()
            .iter()
            .any(|info| info.state == ObserverState::Started);
        if !any_running {
            tracing::warn!("All observers have stopped");
            break;
        }
    }

    let stopped = manager.stop_observers(None);
    print_report("stop", "Stopped", &stopped);
    Ok(())
}

fn print_report(action: &str, done: &str, report: &BatchReport) {
    if !report.succeeded.is_empty() {
        tracing::info!("{} observer(s): {}", done, report.succeeded.join(", "));
    }
    for (name, err) in &report.failed {
        tracing::error!("Failed to {} observer '{}': {}", action, name, err);
    }
}
