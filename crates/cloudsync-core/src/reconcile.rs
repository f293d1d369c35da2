//! Remote change detection and change-location classification.
//!
//! `reconcile` diffs a freshly fetched remote listing against the records'
//! last-known remote state and sets `remote_change`. `classify` then derives
//! `change_location` from both change states.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::error;

use crate::backend::RemoteEntry;
use crate::record::{FileRecord, RecordId, RecordStore, StoreError};
use crate::types::{normalize_path, ChangeLocation, ChangeState, Key};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Remote listing contains {0} twice")]
    DuplicateRemoteId(Key),

    #[error("Remote entry {0} has an empty path")]
    EmptyPath(Key),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What a reconciliation pass found.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Records created for remote-only entries (or attached to same-path local records).
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    /// Remote renames expressed as delete + create, `(from, to)`.
    pub renamed: Vec<(String, String)>,
    /// Unsupported situations, one message each.
    pub anomalies: Vec<String>,
    /// Records the planner must leave alone this session.
    pub held: HashSet<RecordId>,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        !self.created.is_empty()
            || !self.updated.is_empty()
            || !self.deleted.is_empty()
            || !self.renamed.is_empty()
    }
}

fn record_from_entry(entry: &RemoteEntry, path: String) -> FileRecord {
    let mut record = FileRecord::new(path, entry.is_folder);
    record.remote_id = Some(entry.remote_id.clone());
    record.remote_revision = entry.revision.clone();
    record.url = entry.url.clone();
    record.remote_change = ChangeState::Create;
    // Nothing is written locally yet, so no echo is pending.
    record.watcher_synced = true;
    record
}

/// Diff the remote listing against the store, setting `remote_change`.
pub fn reconcile(
    store: &mut RecordStore,
    listing: &[RemoteEntry],
) -> Result<ReconcileReport, ReconcileError> {
    let mut remote_ids: HashMap<&Key, &RemoteEntry> = HashMap::with_capacity(listing.len());
    for entry in listing {
        if normalize_path(&entry.relative_path).is_empty() {
            return Err(ReconcileError::EmptyPath(entry.remote_id.clone()));
        }
        if remote_ids.insert(&entry.remote_id, entry).is_some() {
            return Err(ReconcileError::DuplicateRemoteId(entry.remote_id.clone()));
        }
    }

    for record in store.iter_mut() {
        record.remote_change = ChangeState::No;
        record.change_location = ChangeLocation::No;
    }

    let mut report = ReconcileReport::default();

    // Entries gone from the listing go first, so their paths are free to be
    // claimed by entries created or renamed in the same listing. A synced,
    // unedited record without a remote id is a local delete that failed in
    // an earlier session.
    let vanished: Vec<RecordId> = store
        .iter()
        .filter(|r| match &r.remote_id {
            Some(key) => !remote_ids.contains_key(key),
            None => r.local_change == ChangeState::No && r.is_materialized(),
        })
        .map(|r| r.id)
        .collect();
    for id in vanished {
        let path = store.update(id, |record| {
            record.remote_change = ChangeState::Delete;
            record.remote_id = None;
            record.relative_path.clone()
        })?;
        report.deleted.push(path);
    }

    // Remote to local
    for entry in listing {
        let path = normalize_path(&entry.relative_path);
        let Some(record) = store.find_by_remote_id(&entry.remote_id) else {
            on_remote_only(store, entry, path, &mut report)?;
            continue;
        };
        let id = record.id;
        let local_change = record.local_change;
        let revision_changed = record.local_revision != entry.revision;
        let old_path = record.relative_path.clone();

        store.update(id, |record| {
            record.remote_revision = entry.revision.clone();
            record.url = entry.url.clone();
        })?;

        if revision_changed {
            store.update(id, |record| record.remote_change = ChangeState::Update)?;
            report.updated.push(old_path);
        } else if old_path != path {
            on_remote_rename(store, entry, id, local_change, old_path, path, &mut report)?;
        }
    }

    Ok(report)
}

/// How a remote entry took ownership of a local path.
enum Claim {
    Inserted,
    /// Attached to a record that has no remote entry of its own.
    Attached,
    /// Another record with a live remote entry (or a different kind) owns it.
    Occupied(RecordId),
}

fn claim_path(
    store: &mut RecordStore,
    entry: &RemoteEntry,
    path: &str,
) -> Result<Claim, ReconcileError> {
    let owner = store
        .find_by_path(path)
        .map(|r| (r.id, r.remote_id.is_none() && r.is_folder == entry.is_folder));
    match owner {
        None => {
            store.insert(record_from_entry(entry, path.to_string()))?;
            Ok(Claim::Inserted)
        }
        // Created on both sides, or deleted remotely and recreated at the
        // same path.
        Some((id, true)) => {
            store.update(id, |record| {
                record.remote_id = Some(entry.remote_id.clone());
                record.remote_revision = entry.revision.clone();
                record.url = entry.url.clone();
                record.remote_change = ChangeState::Create;
            })?;
            Ok(Claim::Attached)
        }
        Some((id, false)) => Ok(Claim::Occupied(id)),
    }
}

fn on_remote_only(
    store: &mut RecordStore,
    entry: &RemoteEntry,
    path: String,
    report: &mut ReconcileReport,
) -> Result<(), ReconcileError> {
    match claim_path(store, entry, &path)? {
        Claim::Inserted => {}
        Claim::Attached => report.deleted.retain(|deleted| *deleted != path),
        Claim::Occupied(id) => {
            let message = format!(
                "Unsupported situation is detected: remote file is created at a path already in use: {}",
                path
            );
            error!("{}", message);
            report.anomalies.push(message);
            report.held.insert(id);
            return Ok(());
        }
    }
    report.created.push(path);
    Ok(())
}

fn on_remote_rename(
    store: &mut RecordStore,
    entry: &RemoteEntry,
    id: RecordId,
    local_change: ChangeState,
    old_path: String,
    new_path: String,
    report: &mut ReconcileReport,
) -> Result<(), ReconcileError> {
    let situation = match local_change {
        ChangeState::No => None,
        ChangeState::Create => Some("created"),
        ChangeState::Update => Some("updated"),
        ChangeState::Delete => Some("deleted"),
    };
    if let Some(situation) = situation {
        let message = format!(
            "Unsupported situation is detected: remote file is renamed and local file is {}: {}",
            situation, old_path
        );
        error!("{}", message);
        report.anomalies.push(message);
        report.held.insert(id);
        return Ok(());
    }

    let occupied = store
        .find_by_path(&new_path)
        .is_some_and(|r| r.remote_id.is_some() || r.is_folder != entry.is_folder);
    if occupied {
        let message = format!(
            "Unsupported situation is detected: remote file is renamed onto an existing path: {} -> {}",
            old_path, new_path
        );
        error!("{}", message);
        report.anomalies.push(message);
        report.held.insert(id);
        return Ok(());
    }

    // Express the rename as deleting the original and creating the renamed file.
    store.update(id, |record| {
        record.remote_change = ChangeState::Delete;
        record.remote_id = None;
    })?;
    if let Claim::Attached = claim_path(store, entry, &new_path)? {
        report.deleted.retain(|deleted| *deleted != new_path);
    }
    report.renamed.push((old_path, new_path));
    Ok(())
}

/// Records deleted on both sides; they are fully reconciled.
pub fn agreed_deletions(store: &RecordStore) -> Vec<RecordId> {
    store
        .iter()
        .filter(|r| r.local_change == ChangeState::Delete && r.remote_change == ChangeState::Delete)
        .map(|r| r.id)
        .collect()
}

/// Recompute `change_location` for every record.
pub fn classify(store: &mut RecordStore) {
    for record in store.iter_mut() {
        record.classify();
    }
}

/// Paths of records changed on both sides.
pub fn conflicting_paths(store: &RecordStore) -> Vec<String> {
    store
        .with_location(ChangeLocation::Both)
        .map(|r| r.relative_path.clone())
        .collect()
}
