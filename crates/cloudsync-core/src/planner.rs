//! Turns classified records into prioritized tasks.
//!
//! Every record yields at most one task. Priorities order creates top-down
//! (shallow paths first) and deletes bottom-up (deep paths first).

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::record::{FileRecord, RecordId, RecordStore};
use crate::types::{is_hidden, path_depth, ChangeLocation, ChangeState, SyncMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTaskKind {
    Download,
    CreateLocalFolder,
    DeleteLocal,
    Upload,
    CreateRemoteFolder,
    UpdateRemote,
    DeleteRemote,
}

impl SyncTaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncTaskKind::Download => "download",
            SyncTaskKind::CreateLocalFolder => "createLocalFolder",
            SyncTaskKind::DeleteLocal => "deleteLocal",
            SyncTaskKind::Upload => "upload",
            SyncTaskKind::CreateRemoteFolder => "createRemoteFolder",
            SyncTaskKind::UpdateRemote => "updateRemote",
            SyncTaskKind::DeleteRemote => "deleteRemote",
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, SyncTaskKind::DeleteLocal | SyncTaskKind::DeleteRemote)
    }
}

impl fmt::Display for SyncTaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Band priority for a task on `relative_path`. Higher runs earlier.
pub fn priority(kind: SyncTaskKind, relative_path: &str) -> i64 {
    let depth = path_depth(relative_path) as i64;
    if kind.is_delete() { depth } else { -depth }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    pub kind: SyncTaskKind,
    pub record_id: RecordId,
    pub path: String,
    pub priority: i64,
    pub is_folder: bool,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: Vec<PlannedTask>,
    /// Records dropped because both sides already agree they are gone.
    pub removed: Vec<String>,
    /// True if at least one non-folder task was planned.
    pub file_changed: bool,
}

enum Decision {
    Task(SyncTaskKind),
    Remove,
    Skip,
}

fn remote_wins(record: &FileRecord) -> Decision {
    match record.remote_change {
        ChangeState::Create | ChangeState::Update if record.is_folder => {
            Decision::Task(SyncTaskKind::CreateLocalFolder)
        }
        ChangeState::Create | ChangeState::Update => Decision::Task(SyncTaskKind::Download),
        ChangeState::Delete if record.local_change == ChangeState::Delete => Decision::Remove,
        ChangeState::Delete => Decision::Task(SyncTaskKind::DeleteLocal),
        ChangeState::No => Decision::Skip,
    }
}

fn local_wins(record: &FileRecord) -> Decision {
    if is_hidden(&record.relative_path) {
        return Decision::Skip;
    }
    let recreate = match record.local_change {
        ChangeState::Create => record.remote_id.is_none(),
        ChangeState::Update => {
            record.remote_change == ChangeState::Delete || record.remote_id.is_none()
        }
        ChangeState::Delete if record.remote_change == ChangeState::Delete => {
            return Decision::Remove;
        }
        ChangeState::Delete => return Decision::Task(SyncTaskKind::DeleteRemote),
        ChangeState::No => return Decision::Skip,
    };
    match (recreate, record.is_folder) {
        (true, true) => Decision::Task(SyncTaskKind::CreateRemoteFolder),
        (true, false) => Decision::Task(SyncTaskKind::Upload),
        (false, _) => Decision::Task(SyncTaskKind::UpdateRemote),
    }
}

/// Build the task list for one session.
///
/// `mode` is the direction chosen for `both` records; `None` leaves them
/// untouched. Records in `held` are skipped.
pub fn plan(store: &mut RecordStore, mode: Option<SyncMode>, held: &HashSet<RecordId>) -> Plan {
    let mut result = Plan::default();
    let mut removals = Vec::new();

    for record in store.iter() {
        if held.contains(&record.id) {
            continue;
        }
        let decision = match (record.change_location, mode) {
            (ChangeLocation::Remote, _) | (ChangeLocation::Both, Some(SyncMode::Download)) => {
                remote_wins(record)
            }
            (ChangeLocation::Local, _) | (ChangeLocation::Both, Some(SyncMode::Upload)) => {
                local_wins(record)
            }
            (ChangeLocation::No, _) | (ChangeLocation::Both, None) => Decision::Skip,
        };
        match decision {
            Decision::Task(kind) => {
                if !record.is_folder {
                    result.file_changed = true;
                }
                result.tasks.push(PlannedTask {
                    kind,
                    record_id: record.id,
                    path: record.relative_path.clone(),
                    priority: priority(kind, &record.relative_path),
                    is_folder: record.is_folder,
                });
            }
            Decision::Remove => removals.push(record.id),
            Decision::Skip => {}
        }
    }

    for id in removals {
        if let Some(record) = store.remove(id) {
            result.removed.push(record.relative_path);
        }
    }

    debug!(
        "Planned {} tasks, removed {} records",
        result.tasks.len(),
        result.removed.len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Key;

    fn record(
        path: &str,
        is_folder: bool,
        local: ChangeState,
        remote: ChangeState,
        remote_id: Option<i64>,
    ) -> FileRecord {
        let mut record = FileRecord::new(path, is_folder);
        record.local_change = local;
        record.remote_change = remote;
        record.remote_id = remote_id.map(Key::Number);
        record.classify();
        record
    }

    fn plan_one(record: FileRecord, mode: Option<SyncMode>) -> (Plan, RecordStore) {
        let mut store = RecordStore::new();
        store.insert(record).unwrap();
        let plan = plan(&mut store, mode, &HashSet::new());
        (plan, store)
    }

    fn kinds(plan: &Plan) -> Vec<SyncTaskKind> {
        plan.tasks.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_remote_changes_map_to_local_tasks() {
        use ChangeState::*;
        let cases = [
            (false, Create, SyncTaskKind::Download),
            (false, Update, SyncTaskKind::Download),
            (true, Create, SyncTaskKind::CreateLocalFolder),
            (false, Delete, SyncTaskKind::DeleteLocal),
        ];
        for (is_folder, remote, expected) in cases {
            let (plan, _) = plan_one(record("a/b.tex", is_folder, No, remote, Some(1)), None);
            assert_eq!(kinds(&plan), vec![expected], "remote={}", remote);
        }
    }

    #[test]
    fn test_local_changes_map_to_remote_tasks() {
        use ChangeState::*;
        let cases = [
            (false, Create, None, SyncTaskKind::Upload),
            (true, Create, None, SyncTaskKind::CreateRemoteFolder),
            (false, Create, Some(4), SyncTaskKind::UpdateRemote),
            (false, Update, Some(4), SyncTaskKind::UpdateRemote),
            (false, Delete, Some(4), SyncTaskKind::DeleteRemote),
        ];
        for (is_folder, local, remote_id, expected) in cases {
            let (plan, _) = plan_one(record("b.tex", is_folder, local, No, remote_id), None);
            assert_eq!(kinds(&plan), vec![expected], "local={}", local);
        }
    }

    #[test]
    fn test_upload_recreates_remotely_deleted_file() {
        let (plan, _) = plan_one(
            record("b.tex", false, ChangeState::Update, ChangeState::Delete, None),
            Some(SyncMode::Upload),
        );
        assert_eq!(kinds(&plan), vec![SyncTaskKind::Upload]);
    }

    #[test]
    fn test_both_follows_mode() {
        let conflicted = || record("b.tex", false, ChangeState::Update, ChangeState::Update, Some(1));

        let (download, _) = plan_one(conflicted(), Some(SyncMode::Download));
        let (upload, _) = plan_one(conflicted(), Some(SyncMode::Upload));
        let (undecided, _) = plan_one(conflicted(), None);

        assert_eq!(kinds(&download), vec![SyncTaskKind::Download]);
        assert_eq!(kinds(&upload), vec![SyncTaskKind::UpdateRemote]);
        assert!(undecided.tasks.is_empty());
    }

    #[test]
    fn test_agreed_deletion_removes_record() {
        for mode in [SyncMode::Upload, SyncMode::Download] {
            let (plan, store) = plan_one(
                record("b.tex", false, ChangeState::Delete, ChangeState::Delete, None),
                Some(mode),
            );
            assert!(plan.tasks.is_empty());
            assert_eq!(plan.removed, vec!["b.tex".to_string()]);
            assert!(store.is_empty());
        }
    }

    #[test]
    fn test_hidden_local_file_skipped() {
        let (plan, store) = plan_one(
            record("dir/.hidden", false, ChangeState::Create, ChangeState::No, None),
            None,
        );
        assert!(plan.tasks.is_empty());
        assert!(!plan.file_changed);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_changed_ignores_folders() {
        let (folder_only, _) = plan_one(
            record("dir", true, ChangeState::Create, ChangeState::No, None),
            None,
        );
        assert!(!folder_only.file_changed);

        let (with_file, _) = plan_one(
            record("dir/a.tex", false, ChangeState::Create, ChangeState::No, None),
            None,
        );
        assert!(with_file.file_changed);
    }

    #[test]
    fn test_held_records_skipped() {
        let mut store = RecordStore::new();
        let id = store
            .insert(record("a.tex", false, ChangeState::Update, ChangeState::No, Some(1)))
            .unwrap();

        let plan = plan(&mut store, None, &HashSet::from([id]));

        assert!(plan.tasks.is_empty());
    }

    #[test]
    fn test_priorities() {
        assert_eq!(priority(SyncTaskKind::CreateRemoteFolder, "a"), 0);
        assert_eq!(priority(SyncTaskKind::Upload, "a/b/c.tex"), -2);
        assert_eq!(priority(SyncTaskKind::DeleteLocal, "a/b/c.tex"), 2);
        assert_eq!(priority(SyncTaskKind::DeleteRemote, "a"), 0);
    }
}
