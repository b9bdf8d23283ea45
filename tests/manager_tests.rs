use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use watchplus::{
    EventHandler, HandlerConfig, HandlerFactory, ManagerError, ObserverManager, ObserverState, PathEntry,
    Result, StartMethod, WatchEvent, WatchEventKind, WatcherBackend,
};

#[derive(Default)]
struct CollectingHandler {
    events: Mutex<Vec<WatchEvent>>,
}

impl EventHandler for CollectingHandler {
    fn dispatch(&self, event: &WatchEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn collecting_factory(handler: Arc<CollectingHandler>) -> HandlerFactory {
    Arc::new(move |_config: &HandlerConfig| -> Result<Arc<dyn EventHandler>> {
        let handler: Arc<dyn EventHandler> = handler.clone();
        Ok(handler)
    })
}

fn make_dirs(root: &Path, names: &[&str]) -> Vec<PathEntry> {
    names
        .iter()
        .map(|name| {
            let dir = root.join(name);
            fs::create_dir_all(&dir).expect("Failed to create watch dir");
            PathEntry::new(dir, *name)
        })
        .collect()
}

fn states(manager: &ObserverManager) -> Vec<(String, ObserverState)> {
    manager
        .list_observers()
        .into_iter()
        .map(|info| (info.name, info.state))
        .collect()
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
fn test_start_stop_scenario() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a", "b"]);
    let manager = ObserverManager::new();
    let log_file = temp_dir.path().join("events.log");

    manager.handler_config(true, Some(log_file)).unwrap();
    let created = manager.create_observers(&entries).unwrap();

    assert_eq!(created.len(), 2);
    assert_eq!(created[0].name, "a");
    assert_eq!(created[1].name, "b");
    assert!(created.iter().all(|info| info.state == ObserverState::Created));

    manager.start_observer("a").unwrap();
    assert_eq!(
        states(&manager),
        vec![("a".to_string(), ObserverState::Started), ("b".to_string(), ObserverState::Created)]
    );

    manager.stop_observer("a").unwrap();
    assert_eq!(
        states(&manager),
        vec![("a".to_string(), ObserverState::Stopped), ("b".to_string(), ObserverState::Created)]
    );
}

#[test]
fn test_duplicate_names_leave_registry_unchanged() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a", "b"]);
    let manager = ObserverManager::new();

    let duplicate = vec![entries[0].clone(), PathEntry::new(&entries[1].path, "a")];
    let result = manager.create_observers(&duplicate);
    assert!(matches!(result, Err(ManagerError::NameConflict { ref name }) if name == "a"));
    assert!(manager.is_empty());

    manager.create_observers(&entries[..1]).unwrap();
    let result = manager.create_observer(&entries[1].path, "a");
    assert!(matches!(result, Err(ManagerError::NameConflict { .. })));
    assert_eq!(manager.len(), 1);
}

#[test]
fn test_invalid_entry_fails_whole_batch() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut entries = make_dirs(temp_dir.path(), &["a", "b"]);
    let file_path = temp_dir.path().join("plain.txt");
    fs::write(&file_path, "not a dir").unwrap();

    entries.insert(1, PathEntry::new(temp_dir.path().join("missing"), "missing"));
    let manager = ObserverManager::new();
    assert!(matches!(
        manager.create_observers(&entries),
        Err(ManagerError::PathNotFound { .. })
    ));
    assert!(manager.is_empty());

    entries[1] = PathEntry::new(file_path, "plain");
    assert!(matches!(
        manager.create_observers(&entries),
        Err(ManagerError::NotADirectory { .. })
    ));
    assert!(manager.is_empty());
}

#[test]
fn test_process_observers_need_a_worker_program() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a", "b"]);
    let manager = ObserverManager::new();
    manager.set_start_method(StartMethod::Process);

    assert!(matches!(
        manager.create_observers(&entries),
        Err(ManagerError::Configuration { .. })
    ));
    assert!(manager.is_empty());

    // Thread observers are unaffected.
    manager.set_start_method(StartMethod::Thread);
    manager.create_observers(&entries).unwrap();
    assert_eq!(manager.len(), 2);
}

#[test]
fn test_names_with_nul_bytes_are_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a"]);
    let manager = ObserverManager::new();

    let result = manager.create_observer(&entries[0].path, "a\0b");
    assert!(matches!(result, Err(ManagerError::InvalidName { .. })));

    let batch = vec![entries[0].clone(), PathEntry::new(&entries[0].path, "")];
    assert!(matches!(
        manager.create_observers(&batch),
        Err(ManagerError::InvalidName { .. })
    ));
    assert!(manager.is_empty());
}

#[test]
fn test_invalid_transitions() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a"]);
    let manager = ObserverManager::new();
    manager.create_observers(&entries).unwrap();

    assert!(matches!(manager.stop_observer("a"), Err(ManagerError::NotRunning { .. })));
    assert_eq!(manager.observer("a").unwrap().state, ObserverState::Created);

    manager.start_observer("a").unwrap();
    assert!(matches!(manager.start_observer("a"), Err(ManagerError::AlreadyRunning { .. })));
    assert_eq!(manager.observer("a").unwrap().state, ObserverState::Started);

    assert!(matches!(manager.start_observer("zzz"), Err(ManagerError::UnknownObserver { .. })));
    assert!(matches!(manager.observer("zzz"), Err(ManagerError::UnknownObserver { .. })));

    manager.stop_observer("a").unwrap();
    manager.start_observer("a").unwrap();
    assert_eq!(manager.observer("a").unwrap().state, ObserverState::Started);
}

#[test]
fn test_start_all_skips_running_observers() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a", "b", "c"]);
    let manager = ObserverManager::new();
    manager.create_observers(&entries).unwrap();

    manager.start_observer("a").unwrap();
    manager.start_observer("c").unwrap();
    manager.stop_observer("c").unwrap();

    let report = manager.start_observers(None);
    assert!(report.is_success());
    assert_eq!(report.succeeded, vec!["b", "c"]);
    assert_eq!(report.skipped, vec!["a"]);
    assert!(states(&manager).iter().all(|(_, state)| *state == ObserverState::Started));

    let report = manager.start_observers(None);
    assert!(report.succeeded.is_empty());
    assert_eq!(report.skipped.len(), 3);

    let report = manager.stop_observers(None);
    assert_eq!(report.succeeded, vec!["a", "b", "c"]);
    assert!(states(&manager).iter().all(|(_, state)| *state == ObserverState::Stopped));
}

#[test]
fn test_named_batch_collects_failures() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a", "b"]);
    let manager = ObserverManager::new();
    manager.create_observers(&entries).unwrap();
    manager.start_observer("a").unwrap();

    let report = manager.start_observers(Some(&["a", "ghost", "b"][..]));
    assert_eq!(report.succeeded, vec!["b"]);
    assert_eq!(report.failed.len(), 2);
    assert!(matches!(report.failed[0], (ref name, ManagerError::AlreadyRunning { .. }) if name == "a"));
    assert!(matches!(report.failed[1], (ref name, ManagerError::UnknownObserver { .. }) if name == "ghost"));

    let report = manager.stop_observers(Some(&["b"][..]));
    assert!(report.is_success());
    assert_eq!(manager.observer("b").unwrap().state, ObserverState::Stopped);
    assert_eq!(manager.observer("a").unwrap().state, ObserverState::Started);
}

#[test]
fn test_events_reach_handler_from_observer_thread() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["docs"]);
    let handler = Arc::new(CollectingHandler::default());
    let manager = ObserverManager::new().with_handler_factory(collecting_factory(handler.clone()));

    manager.create_observers(&entries).unwrap();
    manager.start_observer("docs").unwrap();

    let nested = entries[0].path.join("nested");
    fs::create_dir(&nested).unwrap();
    thread::sleep(Duration::from_millis(100));
    fs::write(nested.join("deep.txt"), "hello").unwrap();

    let received = wait_for(|| {
        handler.events.lock().unwrap().iter().any(|event| {
            event.observer == "docs" && event.kind == WatchEventKind::Created && event.path.ends_with("deep.txt")
        })
    });
    assert!(received, "Should have received a create event from a subdirectory");

    manager.stop_observer("docs").unwrap();
}

#[test]
fn test_polling_observer_reports_backend_and_events() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["scan"]);
    let handler = Arc::new(CollectingHandler::default());
    let manager = ObserverManager::new().with_handler_factory(collecting_factory(handler.clone()));
    manager.set_backend(WatcherBackend::Polling);
    manager.set_poll_interval(Duration::from_millis(100)).unwrap();

    let created = manager.create_observers(&entries).unwrap();
    assert_eq!(created[0].backend, WatcherBackend::Polling);
    manager.start_observer("scan").unwrap();

    thread::sleep(Duration::from_millis(300));
    fs::write(entries[0].path.join("scanned.txt"), "hello").unwrap();

    let received = wait_for(|| {
        handler
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|event| event.kind == WatchEventKind::Created && event.path.ends_with("scanned.txt"))
    });
    assert!(received, "Polling observer should report the new file");
    manager.stop_observer("scan").unwrap();
}

#[test]
fn test_handler_config_does_not_create_log_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let log_file = temp_dir.path().join("later.log");
    let manager = ObserverManager::new();

    manager.handler_config(false, Some(log_file.clone())).unwrap();
    assert!(!log_file.exists());

    let entries = make_dirs(temp_dir.path(), &["a"]);
    manager.create_observers(&entries).unwrap();
    assert!(log_file.exists());
}

#[test]
fn test_handler_config_is_captured_at_creation() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a", "b"]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let factory: HandlerFactory = Arc::new(move |config: &HandlerConfig| -> Result<Arc<dyn EventHandler>> {
        recorder.lock().unwrap().push(config.filter_modified());
        let handler: Arc<dyn EventHandler> = Arc::new(CollectingHandler::default());
        Ok(handler)
    });
    let manager = ObserverManager::new().with_handler_factory(factory);

    manager.create_observers(&entries[..1]).unwrap();
    manager.handler_config(true, None).unwrap();
    manager.create_observers(&entries[1..]).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
}

#[test]
fn test_log_file_filters_modified_events() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["src"]);
    let log_file = temp_dir.path().join("events.log");

    let existing = entries[0].path.join("existing.txt");
    fs::write(&existing, "before").unwrap();

    let manager = ObserverManager::new();
    manager.handler_config(true, Some(log_file.clone())).unwrap();
    manager.create_observers(&entries).unwrap();
    manager.start_observer("src").unwrap();

    fs::write(&existing, "after").unwrap();
    fs::write(entries[0].path.join("fresh.txt"), "new").unwrap();

    let logged = wait_for(|| {
        fs::read_to_string(&log_file)
            .map(|contents| contents.contains("fresh.txt") && contents.contains("got created"))
            .unwrap_or(false)
    });
    assert!(logged, "Create event should be logged");

    manager.stop_observer("src").unwrap();
    let contents = fs::read_to_string(&log_file).unwrap();
    assert!(contents.lines().all(|line| line.contains("<src>")));
    assert!(!contents.contains("got modified"));
}

#[test]
fn test_remove_and_run_for_duration() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let entries = make_dirs(temp_dir.path(), &["a", "b"]);
    let manager = ObserverManager::new();
    manager.create_observers(&entries).unwrap();

    manager.start_observer("a").unwrap();
    manager.remove_observer("a").unwrap();
    assert_eq!(manager.len(), 1);
    assert!(matches!(manager.remove_observer("a"), Err(ManagerError::UnknownObserver { .. })));

    let (started, stopped) = manager.run_observers(None, Duration::from_millis(100));
    assert_eq!(started.succeeded, vec!["b"]);
    assert_eq!(stopped.succeeded, vec!["b"]);
    assert_eq!(manager.observer("b").unwrap().state, ObserverState::Stopped);

    // The name is free again after removal.
    manager.create_observer(&entries[0].path, "a").unwrap();
    assert_eq!(manager.len(), 2);
}

#[test]
fn test_manager_shared_between_threads() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let names = ["w0", "w1", "w2", "w3"];
    let entries = make_dirs(temp_dir.path(), &names);
    let manager = Arc::new(ObserverManager::new());

    let handles: Vec<_> = entries
        .into_iter()
        .map(|entry| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.create_observers(&[entry.clone()]).unwrap();
                manager.start_observer(&entry.name).unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Worker thread panicked");
    }

    assert_eq!(manager.len(), 4);
    assert!(states(&manager).iter().all(|(_, state)| *state == ObserverState::Started));
    let report = manager.stop_observers(None);
    assert_eq!(report.succeeded.len(), 4);
}
