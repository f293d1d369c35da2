//! Sync orchestration.
//!
//! `SyncManager::sync` runs one session: fetch the remote listing, reconcile,
//! classify, ask the conflict policy if needed, plan, execute band by band,
//! and persist. `SyncManager::start` spawns a driver that coalesces bursts of
//! sync requests into a leading run and one trailing run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adapter::FileAdapter;
use crate::backend::Backend;
use crate::config::PathFilter;
use crate::conflict::ConflictPolicy;
use crate::error::{error_chain, Result};
use crate::events::{EventBus, SyncEvent};
use crate::executor::execute;
use crate::fs::FileSystem;
use crate::planner::plan;
use crate::reconcile::{agreed_deletions, classify, conflicting_paths, reconcile};
use crate::record::{RecordPersistence, RecordStore, SharedStore};
use crate::types::SyncResult;

pub struct SyncManager {
    store: SharedStore,
    backend: Arc<dyn Backend>,
    persistence: Arc<dyn RecordPersistence>,
    policy: Arc<dyn ConflictPolicy>,
    events: Arc<EventBus>,
    adapter: Arc<FileAdapter>,
    session: tokio::sync::Mutex<()>,
    syncing: AtomicBool,
}

impl SyncManager {
    pub fn new(
        store: SharedStore,
        fs: Arc<dyn FileSystem>,
        backend: Arc<dyn Backend>,
        persistence: Arc<dyn RecordPersistence>,
        policy: Arc<dyn ConflictPolicy>,
        events: Arc<EventBus>,
        filter: PathFilter,
    ) -> Self {
        let adapter = Arc::new(
            FileAdapter::new(fs, Arc::clone(&backend), Arc::clone(&store)).with_filter(filter),
        );
        Self {
            store,
            backend,
            persistence,
            policy,
            events,
            adapter,
            session: tokio::sync::Mutex::new(()),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// True while a session is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Run one session. Never fails; problems are reported in the result.
    pub async fn sync(&self) -> SyncResult {
        let _session = self.session.lock().await;
        self.syncing.store(true, Ordering::SeqCst);
        info!("Synchronizing files with remote");
        self.events.emit(SyncEvent::SessionStarted);

        let result = match self.run_session().await {
            Ok(result) => result,
            Err(e) => {
                let chain = error_chain(&e);
                error!("Failed to sync: {}", chain);
                SyncResult::failed(false, vec![chain])
            }
        };

        self.syncing.store(false, Ordering::SeqCst);
        if result.success {
            info!("Successfully synchronized");
        } else if result.canceled {
            info!("Synchronization canceled");
        } else {
            warn!("Synchronization finished with {} errors", result.errors.len());
        }
        self.events.emit(SyncEvent::SessionFinished {
            result: result.clone(),
        });
        result
    }

    async fn run_session(&self) -> Result<SyncResult> {
        let listing = self.backend.load_file_list().await?;
        debug!("Fetched {} remote entries", listing.len());

        let (report, conflicts) = {
            let mut store = self.lock_store();
            let report = reconcile(&mut store, &listing)?;
            for id in agreed_deletions(&store) {
                if let Some(record) = store.remove(id) {
                    debug!("Deleted on both sides: {}", record.relative_path);
                }
            }
            classify(&mut store);
            let conflicts = conflicting_paths(&store);
            (report, conflicts)
        };
        if report.has_changes() {
            info!(
                "Remote changes: {} created, {} updated, {} deleted, {} renamed",
                report.created.len(),
                report.updated.len(),
                report.deleted.len(),
                report.renamed.len()
            );
        }
        for message in &report.anomalies {
            self.events.emit(SyncEvent::Error {
                message: message.clone(),
            });
        }
        self.persist()?;

        let mode = if conflicts.is_empty() {
            None
        } else {
            info!("{} files changed on both sides", conflicts.len());
            self.events.emit(SyncEvent::ConflictDetected {
                paths: conflicts.clone(),
            });
            match self.policy.decide(conflicts).await {
                Ok(mode) => Some(mode),
                Err(_) => return Ok(SyncResult::canceled(false)),
            }
        };

        let plan = {
            let mut store = self.lock_store();
            plan(&mut store, mode, &report.held)
        };
        let tasks: Vec<_> = plan
            .tasks
            .into_iter()
            .map(|task| self.adapter.priority_task(task))
            .collect();
        let reports = execute(tasks).await;
        self.persist()?;

        let mut errors = report.anomalies;
        errors.extend(reports.into_iter().filter_map(|r| r.message));
        Ok(SyncResult {
            success: errors.is_empty(),
            canceled: false,
            file_changed: plan.file_changed,
            errors,
        })
    }

    /// Forget every record and persist the empty table.
    pub async fn reset_local(&self) -> Result<()> {
        let _session = self.session.lock().await;
        self.lock_store().clear();
        self.persist()?;
        info!("Local sync state was reset");
        Ok(())
    }

    /// Spawn the coalescing driver. It stops once every handle is dropped.
    pub fn start(self: &Arc<Self>, quiet_period: Duration) -> SyncHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(Arc::clone(self), rx, quiet_period));
        SyncHandle { tx }
    }

    fn persist(&self) -> Result<()> {
        let records = self.lock_store().snapshot();
        self.persistence.save(&records)?;
        Ok(())
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, RecordStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Requests sessions from a running driver.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl SyncHandle {
    pub fn request(&self) {
        if self.tx.send(()).is_err() {
            debug!("Sync driver has stopped");
        }
    }
}

/// Leading run on the first request, then one trailing run per quiet window
/// that saw more requests. The window restarts on every request.
async fn drive(manager: Arc<SyncManager>, mut rx: mpsc::UnboundedReceiver<()>, quiet: Duration) {
    while rx.recv().await.is_some() {
        manager.sync().await;
        let mut pending = drain(&mut rx);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(()) => pending = true,
                    None => return,
                },
                _ = tokio::time::sleep(quiet) => {
                    if !pending {
                        break;
                    }
                    manager.sync().await;
                    pending = drain(&mut rx);
                }
            }
        }
    }
    debug!("Sync driver stopped");
}

/// Consume requests queued while a session ran.
fn drain(rx: &mut mpsc::UnboundedReceiver<()>) -> bool {
    let mut any = false;
    while rx.try_recv().is_ok() {
        any = true;
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, InMemoryBackend, RemoteEntry, RemoteStamp};
    use crate::config::SyncConfig;
    use crate::conflict::{CancelPolicy, FixedPolicy};
    use crate::fs::InMemoryFs;
    use crate::record::{FileRecord, MemoryPersistence};
    use crate::types::{ChangeLocation, ChangeState, Key, SyncMode};
    use crate::watcher::{LocalChangeDetector, LocalEvent, LocalEventKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Fixture {
        fs: Arc<InMemoryFs>,
        backend: Arc<InMemoryBackend>,
        store: SharedStore,
        persistence: Arc<MemoryPersistence>,
        detector: LocalChangeDetector,
        manager: Arc<SyncManager>,
        seen: Arc<Mutex<Vec<SyncEvent>>>,
        _subscription: crate::events::Subscription,
    }

    fn fixture(policy: impl ConflictPolicy + 'static) -> Fixture {
        fixture_with_backend(Arc::new(InMemoryBackend::new()), policy)
    }

    fn fixture_with_backend(
        backend: Arc<InMemoryBackend>,
        policy: impl ConflictPolicy + 'static,
    ) -> Fixture {
        fixture_with_filter(backend, policy, PathFilter::allow_all())
    }

    fn fixture_with_filter(
        backend: Arc<InMemoryBackend>,
        policy: impl ConflictPolicy + 'static,
        filter: PathFilter,
    ) -> Fixture {
        let fs = Arc::new(InMemoryFs::new());
        let store = RecordStore::new().into_shared();
        let persistence = Arc::new(MemoryPersistence::new());
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let subscription = events.subscribe(move |event| seen_clone.lock().unwrap().push(event));
        let detector =
            LocalChangeDetector::new(Arc::clone(&store), filter.clone(), Arc::clone(&events));
        let manager = Arc::new(SyncManager::new(
            Arc::clone(&store),
            Arc::clone(&fs) as Arc<dyn FileSystem>,
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::clone(&persistence) as Arc<dyn RecordPersistence>,
            Arc::new(policy),
            events,
            filter,
        ));
        Fixture {
            fs,
            backend,
            store,
            persistence,
            detector,
            manager,
            seen,
            _subscription: subscription,
        }
    }

    impl Fixture {
        async fn write_local(&self, path: &str, content: &[u8]) {
            let kind = if self.fs.exists(path).await.unwrap() {
                LocalEventKind::Modified
            } else {
                LocalEventKind::Created
            };
            self.fs.write(path, content).await.unwrap();
            self.detector.apply(&LocalEvent::new(path, kind, false));
        }

        async fn mkdir_local(&self, path: &str) {
            self.fs.mkdir(path).await.unwrap();
            self.detector
                .apply(&LocalEvent::new(path, LocalEventKind::Created, true));
        }

        async fn delete_local(&self, path: &str, is_dir: bool) {
            self.fs.delete(path).await.unwrap();
            self.detector
                .apply(&LocalEvent::new(path, LocalEventKind::Removed, is_dir));
        }

        /// Deliver the filesystem events caused by the engine's own writes.
        fn flush_echoes(&self) {
            let pending: Vec<(String, bool)> = self
                .store
                .lock()
                .unwrap()
                .iter()
                .filter(|r| !r.watcher_synced)
                .map(|r| (r.relative_path.clone(), r.is_folder))
                .collect();
            for (path, is_dir) in pending {
                self.detector
                    .apply(&LocalEvent::new(path, LocalEventKind::Modified, is_dir));
            }
        }

        async fn sync(&self) -> SyncResult {
            let result = self.manager.sync().await;
            self.flush_echoes();
            result
        }

        fn record(&self, path: &str) -> Option<FileRecord> {
            self.store.lock().unwrap().find_by_path(path).cloned()
        }

        fn count(&self, matches: impl Fn(&SyncEvent) -> bool) -> usize {
            self.seen.lock().unwrap().iter().filter(|&e| matches(e)).count()
        }
    }

    #[tokio::test]
    async fn test_initial_download_of_remote_tree() {
        let f = fixture(CancelPolicy);
        f.backend.put_folder("chapters");
        f.backend.put_folder("chapters/intro");
        f.backend.put_file("chapters/intro/a.tex", b"intro");
        f.backend.put_file("main.tex", b"main");

        let result = f.sync().await;

        assert!(result.success, "{:?}", result.errors);
        assert!(result.file_changed);
        assert_eq!(f.fs.read("chapters/intro/a.tex").await.unwrap(), b"intro");
        assert_eq!(f.fs.read("main.tex").await.unwrap(), b"main");
        let record = f.record("chapters/intro/a.tex").unwrap();
        assert!(record.watcher_synced);
        assert_eq!(record.local_revision, record.remote_revision);

        let operations = f.backend.operation_count();
        let again = f.sync().await;
        assert!(again.success);
        assert!(!again.file_changed);
        assert_eq!(f.backend.operation_count(), operations);
    }

    #[tokio::test]
    async fn test_remote_delete_and_recreate_converges_in_one_session() {
        let f = fixture(CancelPolicy);
        f.backend.put_file("main.tex", b"v1");
        assert!(f.sync().await.success);

        f.backend.remove("main.tex");
        let stamp = f.backend.put_file("main.tex", b"v2");
        let result = f.sync().await;

        assert!(result.success, "{:?}", result.errors);
        assert!(result.file_changed);
        assert_eq!(f.fs.read("main.tex").await.unwrap(), b"v2");
        let record = f.record("main.tex").unwrap();
        assert_eq!(record.remote_id, Some(stamp.remote_id));
        assert_eq!(record.local_change, ChangeState::No);
        assert_eq!(record.change_location, ChangeLocation::No);
        assert_eq!(f.store.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nested_local_creates_upload_top_down() {
        let f = fixture(CancelPolicy);
        f.mkdir_local("a").await;
        f.mkdir_local("a/b").await;
        f.mkdir_local("a/b/c").await;
        f.write_local("a/b/c/deep.tex", b"deep").await;

        let result = f.sync().await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(f.backend.paths(), vec!["a", "a/b", "a/b/c", "a/b/c/deep.tex"]);
        assert!(f.record("a/b/c").unwrap().remote_id.is_some());
    }

    #[tokio::test]
    async fn test_nested_remote_deletes_run_bottom_up() {
        let f = fixture(CancelPolicy);
        f.backend.put_folder("a");
        f.backend.put_folder("a/b");
        f.backend.put_file("a/b/c.tex", b"c");
        assert!(f.sync().await.success);

        f.backend.remove("a/b/c.tex");
        f.backend.remove("a/b");
        f.backend.remove("a");
        let result = f.sync().await;

        // The in-memory tree refuses to delete non-empty folders.
        assert!(result.success, "{:?}", result.errors);
        assert!(!f.fs.exists("a").await.unwrap());
        assert!(f.store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_folder_delete_clears_ignored_leftovers() {
        let filter = SyncConfig::default().path_filter().unwrap();
        let f = fixture_with_filter(Arc::new(InMemoryBackend::new()), CancelPolicy, filter);
        f.backend.put_folder("chapters");
        f.backend.put_file("chapters/intro.tex", b"intro");
        assert!(f.sync().await.success);
        // Build output and editor droppings are never tracked.
        f.write_local("chapters/intro.aux", b"aux").await;
        f.write_local("chapters/.DS_Store", b"").await;
        assert!(f.record("chapters/intro.aux").is_none());

        f.backend.remove("chapters/intro.tex");
        f.backend.remove("chapters");
        let result = f.sync().await;

        assert!(result.success, "{:?}", result.errors);
        assert!(!f.fs.exists("chapters").await.unwrap());
        assert!(f.store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_folder_delete_keeps_untracked_content() {
        let f = fixture(CancelPolicy);
        f.backend.put_folder("chapters");
        assert!(f.sync().await.success);
        // Written behind the detector's back.
        f.fs.write("chapters/notes.tex", b"notes").await.unwrap();

        f.backend.remove("chapters");
        let result = f.sync().await;

        assert!(!result.success);
        assert_eq!(f.fs.read("chapters/notes.tex").await.unwrap(), b"notes");
        let record = f.record("chapters").unwrap();
        assert!(record.remote_id.is_none());

        // Once the file is gone, the next session finishes the delete.
        f.fs.delete("chapters/notes.tex").await.unwrap();
        let retried = f.sync().await;
        assert!(retried.success, "{:?}", retried.errors);
        assert!(!f.fs.exists("chapters").await.unwrap());
        assert!(f.store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_delete_propagates() {
        let f = fixture(CancelPolicy);
        f.write_local("main.tex", b"x").await;
        assert!(f.sync().await.success);

        f.delete_local("main.tex", false).await;
        let result = f.sync().await;

        assert!(result.success);
        assert!(f.backend.paths().is_empty());
        assert!(f.record("main.tex").is_none());
    }

    #[tokio::test]
    async fn test_agreed_deletion_needs_no_task() {
        let f = fixture(CancelPolicy);
        f.backend.put_file("main.tex", b"x");
        assert!(f.sync().await.success);
        let operations = f.backend.operation_count();

        f.backend.remove("main.tex");
        f.delete_local("main.tex", false).await;
        let result = f.sync().await;

        assert!(result.success);
        assert!(!result.file_changed);
        assert_eq!(f.backend.operation_count(), operations);
        assert!(f.record("main.tex").is_none());
        assert_eq!(f.count(|e| matches!(e, SyncEvent::ConflictDetected { .. })), 0);

        assert!(f.sync().await.success);
        assert!(f.record("main.tex").is_none());
    }

    #[tokio::test]
    async fn test_canceled_conflict_touches_nothing() {
        let f = fixture(CancelPolicy);
        f.backend.put_file("main.tex", b"base");
        assert!(f.sync().await.success);
        let operations = f.backend.operation_count();

        f.write_local("main.tex", b"local").await;
        f.backend.modify("main.tex", b"remote");
        let result = f.sync().await;

        assert_eq!(
            result,
            SyncResult {
                success: false,
                canceled: true,
                file_changed: false,
                errors: Vec::new(),
            }
        );
        assert_eq!(f.backend.operation_count(), operations);
        assert_eq!(f.fs.read("main.tex").await.unwrap(), b"local");
        assert_eq!(f.backend.content("main.tex").unwrap(), b"remote");
        assert_eq!(f.count(|e| matches!(e, SyncEvent::ConflictDetected { .. })), 1);
        assert_eq!(
            f.record("main.tex").unwrap().change_location,
            ChangeLocation::Both
        );
    }

    #[tokio::test]
    async fn test_conflict_resolved_by_policy() {
        for (mode, expected) in [(SyncMode::Download, b"remote"), (SyncMode::Upload, b"local!")] {
            let f = fixture(FixedPolicy(mode));
            f.backend.put_file("main.tex", b"base");
            assert!(f.sync().await.success);

            f.write_local("main.tex", b"local!").await;
            f.backend.modify("main.tex", b"remote");
            let result = f.sync().await;

            assert!(result.success, "{:?}", result.errors);
            assert_eq!(f.fs.read("main.tex").await.unwrap(), expected);
            assert_eq!(f.backend.content("main.tex").unwrap(), expected);
            let record = f.record("main.tex").unwrap();
            assert_eq!(record.local_change, ChangeState::No);
            assert_eq!(record.remote_change, ChangeState::No);
        }
    }

    #[tokio::test]
    async fn test_hidden_file_is_not_uploaded() {
        let f = fixture(CancelPolicy);
        f.write_local(".latexmkrc", b"x").await;

        let result = f.sync().await;

        assert!(result.success);
        assert!(!result.file_changed);
        assert!(f.backend.paths().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_others() {
        let f = fixture(CancelPolicy);
        f.write_local("a/broken.tex", b"x").await;
        f.write_local("fine.tex", b"y").await;
        f.write_local("a/b/deeper.tex", b"z").await;
        // Gone from disk before the watcher reported it.
        f.fs.delete("a/broken.tex").await.unwrap();

        let result = f.sync().await;

        assert!(!result.success);
        assert!(!result.canceled);
        assert_eq!(result.errors.len(), 1);
        assert!(
            result.errors[0].starts_with("upload : 'a/broken.tex' : "),
            "{}",
            result.errors[0]
        );
        assert!(f.backend.contains("fine.tex"));
        assert!(f.backend.contains("a/b/deeper.tex"));
        assert_eq!(f.record("a/broken.tex").unwrap().local_change, ChangeState::Create);
    }

    #[tokio::test]
    async fn test_listing_failure_reported_with_chain() {
        let f = fixture(CancelPolicy);
        f.backend.set_offline(true);

        let result = f.sync().await;

        assert!(!result.success);
        assert_eq!(result.errors, vec!["Remote error: Remote is offline".to_string()]);
        assert!(!f.manager.is_syncing());
        assert_eq!(f.count(|e| matches!(e, SyncEvent::SessionFinished { .. })), 1);
    }

    #[tokio::test]
    async fn test_remote_rename_moves_local_file() {
        let f = fixture(CancelPolicy);
        f.backend.put_file("old.tex", b"content");
        assert!(f.sync().await.success);

        f.backend.rename("old.tex", "new.tex");
        let result = f.sync().await;

        assert!(result.success, "{:?}", result.errors);
        assert!(!f.fs.exists("old.tex").await.unwrap());
        assert_eq!(f.fs.read("new.tex").await.unwrap(), b"content");
        assert!(f.record("old.tex").is_none());
        assert!(f.record("new.tex").unwrap().remote_id.is_some());
    }

    #[tokio::test]
    async fn test_rename_collision_is_reported_and_held() {
        let f = fixture(CancelPolicy);
        f.backend.put_file("old.tex", b"content");
        assert!(f.sync().await.success);

        f.write_local("old.tex", b"edited").await;
        f.backend.rename("old.tex", "new.tex");
        let result = f.sync().await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("remote file is renamed and local file is updated"));
        assert_eq!(f.count(|e| matches!(e, SyncEvent::Error { .. })), 1);
        assert_eq!(f.backend.content("old.tex"), None);
        assert_eq!(f.fs.read("old.tex").await.unwrap(), b"edited");
    }

    #[tokio::test]
    async fn test_both_sides_create_same_path() {
        let f = fixture(FixedPolicy(SyncMode::Upload));
        f.backend.put_file("main.tex", b"remote");
        f.write_local("main.tex", b"local").await;

        let result = f.sync().await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(f.backend.paths(), vec!["main.tex"]);
        assert_eq!(f.backend.content("main.tex").unwrap(), b"local");
        assert_eq!(f.store.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_persist_twice() {
        let f = fixture(CancelPolicy);
        f.write_local("main.tex", b"x").await;

        f.sync().await;

        assert_eq!(f.persistence.save_count(), 2);
        let saved = f.persistence.load().unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].remote_id.is_some());
    }

    #[tokio::test]
    async fn test_reset_local_forgets_records() {
        let f = fixture(CancelPolicy);
        f.write_local("main.tex", b"x").await;
        f.sync().await;

        f.manager.reset_local().await.unwrap();

        assert!(f.store.lock().unwrap().is_empty());
        assert!(f.persistence.load().unwrap().is_empty());
    }

    /// Delays the listing so sessions take measurable time.
    struct SlowBackend {
        inner: InMemoryBackend,
        delay: Duration,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        async fn load_file_list(&self) -> std::result::Result<Vec<RemoteEntry>, BackendError> {
            tokio::time::sleep(self.delay).await;
            self.inner.load_file_list().await
        }

        async fn upload(
            &self,
            record: &FileRecord,
            content: Vec<u8>,
        ) -> std::result::Result<RemoteStamp, BackendError> {
            self.inner.upload(record, content).await
        }

        async fn create_remote_folder(
            &self,
            record: &FileRecord,
            parent: Option<&FileRecord>,
        ) -> std::result::Result<RemoteStamp, BackendError> {
            self.inner.create_remote_folder(record, parent).await
        }

        async fn download(&self, record: &FileRecord) -> std::result::Result<Vec<u8>, BackendError> {
            self.inner.download(record).await
        }

        async fn update_remote(
            &self,
            record: &FileRecord,
            content: Vec<u8>,
        ) -> std::result::Result<Option<Key>, BackendError> {
            self.inner.update_remote(record, content).await
        }

        async fn delete_remote(&self, record: &FileRecord) -> std::result::Result<(), BackendError> {
            self.inner.delete_remote(record).await
        }
    }

    struct Driven {
        manager: Arc<SyncManager>,
        started: Arc<Mutex<usize>>,
        _subscription: crate::events::Subscription,
    }

    fn driven(delay: Duration) -> Driven {
        let events = Arc::new(EventBus::new());
        let started = Arc::new(Mutex::new(0));
        let started_clone = Arc::clone(&started);
        let subscription = events.subscribe(move |event| {
            if matches!(event, SyncEvent::SessionStarted) {
                *started_clone.lock().unwrap() += 1;
            }
        });
        let manager = Arc::new(SyncManager::new(
            RecordStore::new().into_shared(),
            Arc::new(InMemoryFs::new()),
            Arc::new(SlowBackend {
                inner: InMemoryBackend::new(),
                delay,
            }),
            Arc::new(MemoryPersistence::new()),
            Arc::new(CancelPolicy),
            events,
            PathFilter::allow_all(),
        ));
        Driven {
            manager,
            started,
            _subscription: subscription,
        }
    }

    impl Driven {
        fn sessions(&self) -> usize {
            *self.started.lock().unwrap()
        }
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    const QUIET: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn test_single_request_runs_once_immediately() {
        let d = driven(Duration::ZERO);
        let handle = d.manager.start(QUIET);

        handle.request();
        sleep_ms(1).await;
        assert_eq!(d.sessions(), 1);

        sleep_ms(5000).await;
        assert_eq!(d.sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_leading_and_trailing_run() {
        let d = driven(Duration::ZERO);
        let handle = d.manager.start(QUIET);

        handle.request();
        handle.request();
        handle.request();
        sleep_ms(1).await;
        assert_eq!(d.sessions(), 1);

        sleep_ms(2000).await;
        assert_eq!(d.sessions(), 2);

        sleep_ms(5000).await;
        assert_eq!(d.sessions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_window_restarts_on_each_request() {
        let d = driven(Duration::ZERO);
        let handle = d.manager.start(QUIET);

        handle.request();
        sleep_ms(500).await;
        handle.request();
        sleep_ms(500).await;
        handle.request();
        // Last request at 1000ms; the window closes at 2000ms.
        sleep_ms(900).await;
        assert_eq!(d.sessions(), 1);

        sleep_ms(200).await;
        assert_eq!(d.sessions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_during_session_queues_one_rerun() {
        let d = driven(Duration::from_millis(100));
        let handle = d.manager.start(QUIET);

        handle.request();
        sleep_ms(50).await;
        assert!(d.manager.is_syncing());
        handle.request();
        handle.request();

        sleep_ms(60).await;
        assert!(!d.manager.is_syncing());
        assert_eq!(d.sessions(), 1);

        sleep_ms(3000).await;
        assert_eq!(d.sessions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_driver() {
        let d = driven(Duration::ZERO);
        let handle = d.manager.start(QUIET);
        handle.request();
        sleep_ms(1).await;

        drop(handle);
        sleep_ms(5000).await;

        assert_eq!(Arc::strong_count(&d.manager), 1);
    }
}
