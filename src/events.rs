use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
    Moved { from: PathBuf, to: PathBuf },
    Closed,
}

impl WatchEventKind {
    /// Modified and close-after-write events are the ones suppressed by
    /// `filter_modified`.
    pub fn is_modification(&self) -> bool {
        matches!(self, WatchEventKind::Modified | WatchEventKind::Closed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            WatchEventKind::Created => "created",
            WatchEventKind::Modified => "modified",
            WatchEventKind::Deleted => "deleted",
            WatchEventKind::Moved { .. } => "moved",
            WatchEventKind::Closed => "closed",
        }
    }

    pub fn short_code(&self) -> char {
        match self {
            WatchEventKind::Created => 'C',
            WatchEventKind::Modified => 'M',
            WatchEventKind::Deleted => 'D',
            WatchEventKind::Moved { .. } => 'V',
            WatchEventKind::Closed => 'X',
        }
    }
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub observer: String,
    pub path: PathBuf,
    pub kind: WatchEventKind,
    pub timestamp: DateTime<Local>,
}

impl WatchEvent {
    pub fn new(observer: impl Into<String>, path: PathBuf, kind: WatchEventKind) -> Self {
        Self {
            observer: observer.into(),
            path,
            kind,
            timestamp: Local::now(),
        }
    }

    /// Converts a raw notify event into zero or more events for `observer`.
    ///
    /// A rename reported with both paths becomes a single `Moved` event. Half
    /// renames are reported by notify as separate `From`/`To` events and map
    /// to `Deleted`/`Created`. Access events other than close-after-write
    /// carry no change and are dropped.
    pub fn from_notify(observer: &str, event: &Event) -> Vec<WatchEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => WatchEventKind::Created,
            EventKind::Remove(_) => WatchEventKind::Deleted,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to, ..] = event.paths.as_slice() {
                    return vec![WatchEvent::new(
                        observer,
                        to.clone(),
                        WatchEventKind::Moved {
                            from: from.clone(),
                            to: to.clone(),
                        },
                    )];
                }
                WatchEventKind::Modified
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => WatchEventKind::Deleted,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => WatchEventKind::Created,
            EventKind::Modify(_) => WatchEventKind::Modified,
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => WatchEventKind::Closed,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
        };

        event
            .paths
            .iter()
            .map(|path| WatchEvent::new(observer, path.clone(), kind.clone()))
            .collect()
    }
}
