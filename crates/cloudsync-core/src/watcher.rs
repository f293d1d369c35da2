//! Local change detection.
//!
//! Filesystem events are folded into each record's `local_change` state
//! machine. Events for one path go through that path's own lane (an unbounded
//! channel drained by a dedicated task) so they are applied in arrival order,
//! while unrelated paths proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::PathFilter;
use crate::events::{EventBus, SyncEvent};
use crate::fs::LocalEntry;
use crate::record::{FileRecord, SharedStore};
use crate::types::{is_hidden, normalize_path, ChangeState};

/// Kind of filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEventKind {
    Created,
    Modified,
    Removed,
}

/// Filesystem event for one path relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub path: String,
    pub kind: LocalEventKind,
    pub is_dir: bool,
}

impl LocalEvent {
    pub fn new(path: impl Into<String>, kind: LocalEventKind, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            kind,
            is_dir,
        }
    }
}

/// What an event did to the record for its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `local_change` is now this state.
    Changed(ChangeState),
    /// The record never reached the remote and was dropped.
    Discarded,
    /// Echo of the engine's own write; only `watcher_synced` was restored.
    Absorbed,
    /// Filtered out or irrelevant.
    Ignored,
}

/// Paths touched by the startup scan.
#[derive(Debug, Default)]
pub struct BaselineReport {
    /// Present locally without a record.
    pub created: Vec<String>,
    /// Synchronized before but missing now.
    pub deleted: Vec<String>,
    /// Created locally, never uploaded, and gone again; their records are dropped.
    pub discarded: Vec<String>,
}

impl BaselineReport {
    pub fn has_changes(&self) -> bool {
        !self.created.is_empty() || !self.deleted.is_empty() || !self.discarded.is_empty()
    }
}

type LaneMessage = (LocalEvent, oneshot::Sender<Transition>);
type Lanes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<LaneMessage>>>>;

struct DetectorCore {
    store: SharedStore,
    filter: PathFilter,
    events: Arc<EventBus>,
}

impl DetectorCore {
    fn apply(&self, event: &LocalEvent) -> Transition {
        let path = normalize_path(&event.path);
        if !self.filter.accepts(&path) {
            return Transition::Ignored;
        }

        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = store.find_by_path(&path) else {
            return match event.kind {
                _ if is_hidden(&path) => Transition::Ignored,
                LocalEventKind::Removed => Transition::Ignored,
                LocalEventKind::Created | LocalEventKind::Modified => {
                    let mut record = FileRecord::new(path.clone(), event.is_dir);
                    record.local_change = ChangeState::Create;
                    record.watcher_synced = true;
                    match store.insert(record) {
                        Ok(_) => {
                            drop(store);
                            self.announce(&path, ChangeState::Create);
                            Transition::Changed(ChangeState::Create)
                        }
                        Err(e) => {
                            warn!("Failed to track {}: {}", path, e);
                            Transition::Ignored
                        }
                    }
                }
            };
        };

        let id = record.id;
        let current = record.local_change;
        let has_remote = record.remote_id.is_some();
        let is_folder = record.is_folder;

        if !record.watcher_synced {
            if let Some(record) = store.get_mut(id) {
                record.watcher_synced = true;
            }
            debug!("Absorbed {:?} for {}", event.kind, path);
            return Transition::Absorbed;
        }

        // Hidden records only exist because the remote has them.
        if is_hidden(&path) {
            return Transition::Ignored;
        }

        // Directory mtimes move whenever children change.
        if is_folder && event.kind == LocalEventKind::Modified {
            return Transition::Ignored;
        }

        let next = match (current, event.kind) {
            (_, LocalEventKind::Removed) if !has_remote => None,
            (_, LocalEventKind::Removed) => Some(ChangeState::Delete),
            (ChangeState::No, LocalEventKind::Created) if !has_remote => {
                Some(ChangeState::Create)
            }
            (ChangeState::Create, _) => Some(ChangeState::Create),
            (ChangeState::No | ChangeState::Update | ChangeState::Delete, _) => {
                Some(ChangeState::Update)
            }
        };

        match next {
            None => {
                store.remove(id);
                drop(store);
                self.announce(&path, ChangeState::No);
                Transition::Discarded
            }
            Some(state) => {
                if let Some(record) = store.get_mut(id) {
                    record.local_change = state;
                    record.local_seq += 1;
                }
                drop(store);
                if current != state {
                    self.announce(&path, state);
                }
                Transition::Changed(state)
            }
        }
    }

    fn announce(&self, path: &str, change: ChangeState) {
        debug!("Local change: {} -> {}", path, change);
        self.events.emit(SyncEvent::ChangeDetected {
            path: path.to_string(),
            change,
        });
    }
}

/// Maintains `local_change` for every tracked path.
pub struct LocalChangeDetector {
    core: Arc<DetectorCore>,
    lanes: Lanes,
}

impl LocalChangeDetector {
    pub fn new(store: SharedStore, filter: PathFilter, events: Arc<EventBus>) -> Self {
        Self {
            core: Arc::new(DetectorCore {
                store,
                filter,
                events,
            }),
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Apply one event synchronously, bypassing the lanes.
    pub fn apply(&self, event: &LocalEvent) -> Transition {
        self.core.apply(event)
    }

    /// Queue an event on its path's lane.
    ///
    /// The receiver resolves once the event has been applied; dropping it is
    /// fine. Must be called from within a tokio runtime.
    pub fn submit(&self, event: LocalEvent) -> oneshot::Receiver<Transition> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let path = normalize_path(&event.path);
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());

        let message = match lanes.get(&path) {
            Some(lane) => match lane.send((event, reply_tx)) {
                Ok(()) => return reply_rx,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => (event, reply_tx),
        };

        let lane = self.spawn_lane(path.clone());
        // A freshly spawned lane holds its receiver, so this cannot fail.
        let _ = lane.send(message);
        lanes.insert(path, lane);
        reply_rx
    }

    /// Spawn the task draining one path's lane.
    ///
    /// The lane retires once its queue is empty. Senders only enqueue while
    /// holding the `lanes` lock, so checking for emptiness under that lock
    /// cannot lose an event.
    fn spawn_lane(&self, path: String) -> mpsc::UnboundedSender<LaneMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneMessage>();
        let core = Arc::clone(&self.core);
        let lanes = Arc::clone(&self.lanes);
        let own = tx.clone();
        tokio::spawn(async move {
            while let Some((event, reply)) = rx.recv().await {
                let transition = core.apply(&event);
                let _ = reply.send(transition);
                if !rx.is_empty() {
                    continue;
                }
                let mut lanes = lanes.lock().unwrap_or_else(|e| e.into_inner());
                if rx.is_empty() {
                    if lanes.get(&path).is_some_and(|lane| lane.same_channel(&own)) {
                        lanes.remove(&path);
                    }
                    return;
                }
            }
        });
        tx
    }

    /// Number of paths with a live lane.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Establish baseline knowledge from the current local listing.
    ///
    /// Records at listed paths become `watcher_synced`; unknown paths become
    /// `create` records; records that were synchronized locally but are now
    /// missing become `delete`.
    pub fn baseline(&self, entries: &[LocalEntry]) -> BaselineReport {
        let mut report = BaselineReport::default();
        let mut store = self.core.store.lock().unwrap_or_else(|e| e.into_inner());
        let mut present = std::collections::HashSet::new();

        for entry in entries {
            let path = normalize_path(&entry.path);
            if !self.core.filter.accepts(&path) {
                continue;
            }
            present.insert(path.clone());
            if let Some(record) = store.find_by_path(&path) {
                let id = record.id;
                if let Some(record) = store.get_mut(id) {
                    record.watcher_synced = true;
                }
                continue;
            }
            if is_hidden(&path) {
                continue;
            }
            let mut record = FileRecord::new(path.clone(), entry.is_dir);
            record.local_change = ChangeState::Create;
            record.watcher_synced = true;
            match store.insert(record) {
                Ok(_) => report.created.push(path),
                Err(e) => warn!("Failed to track {}: {}", path, e),
            }
        }

        let mut never_uploaded = Vec::new();
        for record in store.iter_mut() {
            if present.contains(&record.relative_path) {
                continue;
            }
            record.watcher_synced = true;
            if is_hidden(&record.relative_path) {
                continue;
            }
            if record.remote_id.is_none() && record.local_change == ChangeState::Create {
                never_uploaded.push(record.id);
            } else if record.is_materialized() && record.local_change != ChangeState::Delete {
                record.local_change = ChangeState::Delete;
                record.local_seq += 1;
                report.deleted.push(record.relative_path.clone());
            }
        }
        for id in never_uploaded {
            if let Some(record) = store.remove(id) {
                report.discarded.push(record.relative_path);
            }
        }
        drop(store);

        for path in &report.created {
            self.core.announce(path, ChangeState::Create);
        }
        for path in &report.deleted {
            self.core.announce(path, ChangeState::Delete);
        }
        for path in &report.discarded {
            self.core.announce(path, ChangeState::No);
        }
        if report.has_changes() {
            info!(
                "Baseline: {} new, {} deleted, {} dropped before upload",
                report.created.len(),
                report.deleted.len(),
                report.discarded.len()
            );
        }
        report
    }
}
