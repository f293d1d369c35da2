//! File watcher with debouncing for the sync root.
//!
//! Uses notify-debouncer-mini and turns its "something happened here" events
//! into created/modified/removed events for the change detector.

use anyhow::Result;
use cloudsync_core::fs::LocalEntry;
use cloudsync_core::watcher::{LocalEvent, LocalEventKind};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// What the watcher knows about one path.
#[derive(Debug, Clone, Copy)]
struct Known {
    is_dir: bool,
    mtime: Option<SystemTime>,
}

/// Paths seen so far, keyed by relative path.
type KnownPaths = Arc<Mutex<HashMap<String, Known>>>;

/// Watches the sync root recursively.
pub struct FileWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<LocalEvent>,
}

struct EventMapper {
    root: PathBuf,
    /// Relative directory whose contents are never reported (record storage).
    skip: Option<String>,
    known: KnownPaths,
}

impl FileWatcher {
    /// Start watching `root`.
    ///
    /// `existing` seeds the set of known paths so that the first event for an
    /// existing file is reported as a modification. Events under `skip` are
    /// dropped.
    pub fn new(root: PathBuf, skip: Option<String>, existing: &[LocalEntry]) -> Result<Self> {
        // On macOS, /var/folders/... is really /private/var/folders/..., and
        // FSEvents reports the real path.
        let root = root.canonicalize().unwrap_or(root);

        let known: HashMap<String, Known> = existing
            .iter()
            .map(|entry| {
                let mtime = std::fs::metadata(root.join(&entry.path))
                    .and_then(|m| m.modified())
                    .ok();
                (
                    entry.path.clone(),
                    Known {
                        is_dir: entry.is_dir,
                        mtime,
                    },
                )
            })
            .collect();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mapper = EventMapper {
            root: root.clone(),
            skip,
            known: Arc::new(Mutex::new(known)),
        };

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        for local_event in mapper.map(&event.path) {
                            if event_tx.send(local_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<LocalEvent> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl EventMapper {
    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative = relative.to_str()?.replace('\\', "/");
        if relative.is_empty() {
            return None;
        }
        if let Some(skip) = &self.skip {
            if relative == *skip || relative.starts_with(&format!("{}/", skip)) {
                return None;
            }
        }
        Some(relative)
    }

    /// Turn one debounced path into zero or more local events.
    fn map(&self, path: &Path) -> Vec<LocalEvent> {
        let Some(relative) = self.relative(path) else {
            return Vec::new();
        };
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());

        let events = match std::fs::metadata(path) {
            Ok(metadata) => {
                let mtime = metadata.modified().ok();
                let is_dir = metadata.is_dir();
                match known.insert(relative.clone(), Known { is_dir, mtime }) {
                    None => vec![LocalEvent::new(relative, LocalEventKind::Created, is_dir)],
                    // Unchanged mtime: spurious event (seen on Docker volumes).
                    Some(previous) if previous.mtime.is_some() && previous.mtime == mtime => {
                        Vec::new()
                    }
                    Some(_) => vec![LocalEvent::new(relative, LocalEventKind::Modified, is_dir)],
                }
            }
            Err(_) => {
                let Some(removed) = known.remove(&relative) else {
                    return Vec::new();
                };
                let mut events = Vec::new();
                if removed.is_dir {
                    // Children of a removed directory may not get their own event.
                    let prefix = format!("{}/", relative);
                    let mut children: Vec<(String, bool)> = known
                        .iter()
                        .filter(|(p, _)| p.starts_with(&prefix))
                        .map(|(p, k)| (p.clone(), k.is_dir))
                        .collect();
                    // Deepest first.
                    children.sort_by(|a, b| b.0.cmp(&a.0));
                    for (child, is_dir) in children {
                        known.remove(&child);
                        events.push(LocalEvent::new(child, LocalEventKind::Removed, is_dir));
                    }
                }
                events.push(LocalEvent::new(relative, LocalEventKind::Removed, removed.is_dir));
                events
            }
        };

        for event in &events {
            debug!("File event: {:?} - {}", event.kind, event.path);
        }
        events
    }
}
