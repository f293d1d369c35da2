//! Wires the engine to the native filesystem, the directory remote and the
//! on-disk record table.

use anyhow::{Context, Result};
use cloudsync_core::events::{EventBus, Subscription, SyncEvent};
use cloudsync_core::fs::{FileSystem, LocalEntry};
use cloudsync_core::manager::SyncManager;
use cloudsync_core::record::{RecordPersistence, SharedStore};
use cloudsync_core::types::SyncResult;
use cloudsync_core::watcher::{BaselineReport, LocalChangeDetector, LocalEvent, Transition};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::native_fs::NativeFs;
use crate::persistence::RecordStorage;
use crate::remote_dir::{DirectoryBackend, BACKEND_NAME};
use crate::watcher::FileWatcher;

/// Every component of a running daemon.
pub struct Daemon {
    config: Config,
    fs: Arc<NativeFs>,
    store: SharedStore,
    detector: LocalChangeDetector,
    manager: Arc<SyncManager>,
    _logger: Subscription,
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::SessionStarted => debug!("Session started"),
        SyncEvent::SessionFinished { result } => {
            for message in &result.errors {
                warn!("Sync error: {}", message);
            }
        }
        SyncEvent::Error { message } => error!("{}", message),
        SyncEvent::ConflictDetected { paths } => {
            info!("Changed on both sides: {}", paths.join(", "))
        }
        SyncEvent::ChangeDetected { path, change } => debug!("{}: {}", path, change),
    }
}

impl Daemon {
    /// Open the record table and build the engine.
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(RecordStorage::new(
            &config.storage,
            &config.project_id,
            BACKEND_NAME,
        ));
        let store = storage.open_store()?.into_shared();
        info!("Record table: {}", storage.path().display());

        let events = Arc::new(EventBus::new());
        let logger = events.subscribe(log_event);
        let filter = config.sync.path_filter()?;
        let detector =
            LocalChangeDetector::new(Arc::clone(&store), filter.clone(), Arc::clone(&events));

        let fs = Arc::new(NativeFs::new(config.root.clone()));
        let backend = Arc::new(DirectoryBackend::new(config.remote.clone()));
        let manager = Arc::new(SyncManager::new(
            Arc::clone(&store),
            Arc::clone(&fs) as Arc<dyn FileSystem>,
            backend,
            storage as Arc<dyn RecordPersistence>,
            config.on_conflict.policy(),
            events,
            filter,
        ));

        Ok(Self {
            config,
            fs,
            store,
            detector,
            manager,
            _logger: logger,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn detector(&self) -> &LocalChangeDetector {
        &self.detector
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    /// Current local tree.
    pub async fn walk(&self) -> Result<Vec<LocalEntry>> {
        self.fs
            .walk()
            .await
            .with_context(|| format!("Failed to scan {}", self.config.root.display()))
    }

    /// Fold changes made while the daemon was not running into the records.
    pub async fn baseline(&self) -> Result<(Vec<LocalEntry>, BaselineReport)> {
        let entries = self.walk().await?;
        let report = self.detector.baseline(&entries);
        Ok((entries, report))
    }

    pub async fn reset(&self) -> Result<()> {
        self.manager.reset_local().await?;
        Ok(())
    }

    pub async fn sync_once(&self) -> SyncResult {
        self.manager.sync().await
    }

    /// Watch the root and sync until Ctrl+C.
    pub async fn run(&self, existing: &[LocalEntry]) -> Result<()> {
        let mut watcher = FileWatcher::new(
            self.config.root.clone(),
            self.config.storage_in_root(),
            existing,
        )?;
        info!("Watching {}", watcher.root().display());

        let handle = self.manager.start(self.config.sync.quiet_period);
        handle.request();

        loop {
            tokio::select! {
                Some(event) = watcher.event_rx().recv() => {
                    if self.on_local_event(event).await {
                        handle.request();
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Feed one event to the detector. True if a sync should follow.
    async fn on_local_event(&self, event: LocalEvent) -> bool {
        let path = event.path.clone();
        match self.detector.submit(event).await {
            Ok(Transition::Changed(_)) | Ok(Transition::Discarded) => true,
            Ok(Transition::Absorbed) | Ok(Transition::Ignored) => false,
            Err(_) => {
                warn!("Change detector dropped event for {}", path);
                false
            }
        }
    }
}
