//! Executes planned tasks against the local tree and the remote.
//!
//! Each task re-reads its record from the shared store when it starts, so it
//! sees parent remote ids assigned by earlier bands, and writes the outcome
//! back when it finishes. The store lock is never held across IO.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::PathFilter;
use crate::error::{error_chain, Result, SyncError};
use crate::executor::PriorityTask;
use crate::fs::{FileSystem, LocalEntry};
use crate::planner::{PlannedTask, SyncTaskKind};
use crate::record::{FileRecord, RecordId, RecordStore, SharedStore};
use crate::types::{is_hidden, parent_path, path_depth, ChangeLocation, ChangeState, Key};

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub kind: SyncTaskKind,
    pub path: String,
    pub success: bool,
    /// `"{task} : '{path}' : {url} : {detail}"` for failures.
    pub message: Option<String>,
}

pub struct FileAdapter {
    fs: Arc<dyn FileSystem>,
    backend: Arc<dyn Backend>,
    store: SharedStore,
    filter: PathFilter,
}

impl FileAdapter {
    pub fn new(fs: Arc<dyn FileSystem>, backend: Arc<dyn Backend>, store: SharedStore) -> Self {
        Self {
            fs,
            backend,
            store,
            filter: PathFilter::allow_all(),
        }
    }

    /// Paths the filter rejects count as leftovers when a folder is removed.
    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Wrap a planned task for the banded executor.
    pub fn priority_task(self: &Arc<Self>, task: PlannedTask) -> PriorityTask<TaskReport> {
        let adapter = Arc::clone(self);
        let name = format!("{} {}", task.kind, task.path);
        let priority = task.priority;
        PriorityTask::new(name, priority, move || {
            async move { adapter.run(task).await }.boxed()
        })
    }

    /// Run one task, converting errors and panics into a failed report.
    pub async fn run(&self, task: PlannedTask) -> TaskReport {
        let outcome = AssertUnwindSafe(self.dispatch(&task)).catch_unwind().await;
        let detail = match outcome {
            Ok(Ok(())) => {
                debug!("{} succeeded: {}", task.kind, task.path);
                return TaskReport {
                    kind: task.kind,
                    path: task.path,
                    success: true,
                    message: None,
                };
            }
            Ok(Err(e)) => error_chain(&e),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let url = self
            .with_store(|store| store.get(task.record_id).map(|r| r.url.clone()))
            .unwrap_or_default();
        let message = format!("{} : '{}' : {} : {}", task.kind, task.path, url, detail);
        warn!("{}", message);
        TaskReport {
            kind: task.kind,
            path: task.path,
            success: false,
            message: Some(message),
        }
    }

    async fn dispatch(&self, task: &PlannedTask) -> Result<()> {
        match task.kind {
            SyncTaskKind::Download => self.download(task).await,
            SyncTaskKind::CreateLocalFolder => self.create_local_folder(task).await,
            SyncTaskKind::DeleteLocal => self.delete_local(task).await,
            SyncTaskKind::Upload => self.upload(task).await,
            SyncTaskKind::CreateRemoteFolder => self.create_remote_folder(task).await,
            SyncTaskKind::UpdateRemote => self.update_remote(task).await,
            SyncTaskKind::DeleteRemote => self.delete_remote(task).await,
        }
    }

    async fn download(&self, task: &PlannedTask) -> Result<()> {
        let record = self.snapshot(task)?;
        let content = self.backend.download(&record).await?;
        self.set_watcher_synced(record.id, false);
        if let Err(e) = self.fs.write(&record.relative_path, &content).await {
            self.set_watcher_synced(record.id, true);
            return Err(e.into());
        }
        let revision = record.remote_revision.clone();
        self.mark_synced(&record, revision)
    }

    async fn create_local_folder(&self, task: &PlannedTask) -> Result<()> {
        let record = self.snapshot(task)?;
        if !self.fs.exists(&record.relative_path).await? {
            self.set_watcher_synced(record.id, false);
            if let Err(e) = self.fs.mkdir(&record.relative_path).await {
                self.set_watcher_synced(record.id, true);
                return Err(e.into());
            }
        }
        let revision = record.remote_revision.clone();
        self.mark_synced(&record, revision)
    }

    async fn delete_local(&self, task: &PlannedTask) -> Result<()> {
        let record = self.snapshot(task)?;
        if self.fs.exists(&record.relative_path).await? {
            if record.is_folder {
                self.clear_leftovers(&record.relative_path).await?;
            }
            self.set_watcher_synced(record.id, false);
            if let Err(e) = self.fs.delete(&record.relative_path).await {
                self.set_watcher_synced(record.id, true);
                return Err(e.into());
            }
        }
        self.with_store(|store| store.remove(record.id));
        Ok(())
    }

    /// Remove ignored and hidden entries below `folder` so the folder itself
    /// can go. Leaves everything in place if anything tracked or syncable
    /// is still there; the folder delete then fails on its own.
    async fn clear_leftovers(&self, folder: &str) -> Result<()> {
        let prefix = format!("{}/", folder);
        let mut leftovers: Vec<LocalEntry> = self
            .fs
            .walk()
            .await?
            .into_iter()
            .filter(|entry| entry.path.starts_with(&prefix))
            .collect();
        if leftovers.is_empty() {
            return Ok(());
        }
        let keeps_content = self.with_store(|store| {
            leftovers.iter().any(|entry| {
                store.find_by_path(&entry.path).is_some()
                    || (!entry.is_dir
                        && self.filter.accepts(&entry.path)
                        && !is_hidden(&entry.path))
            })
        });
        if keeps_content {
            return Ok(());
        }
        leftovers.sort_by_key(|entry| std::cmp::Reverse(path_depth(&entry.path)));
        for entry in &leftovers {
            self.fs.delete(&entry.path).await?;
        }
        debug!("Removed {} ignored entries under '{}'", leftovers.len(), folder);
        Ok(())
    }

    async fn upload(&self, task: &PlannedTask) -> Result<()> {
        let record = self.snapshot(task)?;
        let content = self.fs.read(&record.relative_path).await?;
        let stamp = self.backend.upload(&record, content).await?;
        self.with_store(|store| {
            store.update(record.id, |r| r.remote_id = Some(stamp.remote_id.clone()))
        })?;
        self.mark_synced(&record, stamp.revision)
    }

    async fn create_remote_folder(&self, task: &PlannedTask) -> Result<()> {
        let record = self.snapshot(task)?;
        let parent = match parent_path(&record.relative_path) {
            Some(parent) => {
                let parent = self
                    .with_store(|store| store.find_by_path(parent).cloned())
                    .ok_or_else(|| SyncError::Untracked(parent.to_string()))?;
                if parent.remote_id.is_none() {
                    return Err(SyncError::Other(format!(
                        "Parent folder has no remote id: {}",
                        parent.relative_path
                    )));
                }
                Some(parent)
            }
            None => None,
        };
        let stamp = self
            .backend
            .create_remote_folder(&record, parent.as_ref())
            .await?;
        self.with_store(|store| {
            store.update(record.id, |r| r.remote_id = Some(stamp.remote_id.clone()))
        })?;
        self.mark_synced(&record, stamp.revision)
    }

    async fn update_remote(&self, task: &PlannedTask) -> Result<()> {
        let record = self.snapshot(task)?;
        if record.is_folder {
            // Folders carry no content; there is nothing to push.
            let revision = record.remote_revision.clone();
            return self.mark_synced(&record, revision);
        }
        let content = self.fs.read(&record.relative_path).await?;
        let revision = self.backend.update_remote(&record, content).await?;
        self.mark_synced(&record, revision)
    }

    async fn delete_remote(&self, task: &PlannedTask) -> Result<()> {
        let record = self.snapshot(task)?;
        if record.remote_id.is_some() {
            self.backend.delete_remote(&record).await?;
        }
        self.with_store(|store| store.remove(record.id));
        Ok(())
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut RecordStore) -> R) -> R {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut store)
    }

    fn snapshot(&self, task: &PlannedTask) -> Result<FileRecord> {
        self.with_store(|store| store.get(task.record_id).cloned())
            .ok_or_else(|| SyncError::Untracked(task.path.clone()))
    }

    fn set_watcher_synced(&self, id: RecordId, synced: bool) {
        self.with_store(|store| {
            if let Some(record) = store.get_mut(id) {
                record.watcher_synced = synced;
            }
        });
    }

    /// Both sides now agree at `revision`.
    ///
    /// A local change that arrived while the task ran is kept for the next
    /// session.
    fn mark_synced(&self, before: &FileRecord, revision: Option<Key>) -> Result<()> {
        self.with_store(|store| {
            let record = store
                .get_mut(before.id)
                .ok_or_else(|| SyncError::Untracked(before.relative_path.clone()))?;
            record.local_revision = revision.clone();
            record.remote_revision = revision;
            record.remote_change = ChangeState::No;
            if record.local_seq == before.local_seq {
                record.local_change = ChangeState::No;
            }
            record.classify();
            if record.change_location != ChangeLocation::No {
                debug!(
                    "{} changed locally during sync, keeping {}",
                    record.relative_path, record.local_change
                );
            }
            Ok(())
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
