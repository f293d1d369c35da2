//! cloudsync-core: bidirectional synchronization between a local tree and a
//! remote project store.
//!
//! This crate provides:
//! - The per-path record table and its persistence seam
//! - Local change detection from filesystem events
//! - Remote reconciliation and change classification
//! - Conflict policies, task planning and banded execution
//! - `SyncManager`, which runs sessions and coalesces sync requests
//! - `FileSystem` and `Backend` trait abstractions with in-memory versions

pub mod adapter;
pub mod backend;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod executor;
pub mod fs;
pub mod manager;
pub mod planner;
pub mod reconcile;
pub mod record;
pub mod types;
pub mod watcher;

pub use adapter::{FileAdapter, TaskReport};
pub use backend::{Backend, BackendError, InMemoryBackend, RemoteEntry, RemoteStamp};
pub use config::{PathFilter, SyncConfig};
pub use conflict::{CancelPolicy, Canceled, ConflictPolicy, FixedPolicy};
pub use error::SyncError;
pub use events::{EventBus, Subscription, SyncEvent};
pub use fs::{FileSystem, FsError, InMemoryFs, LocalEntry};
pub use manager::{SyncHandle, SyncManager};
pub use planner::{Plan, PlannedTask, SyncTaskKind};
pub use record::{
    FileRecord, MemoryPersistence, RecordId, RecordPersistence, RecordStore, SharedStore,
    StoreError,
};
pub use types::{ChangeLocation, ChangeState, Key, SyncMode, SyncResult};
pub use watcher::{LocalChangeDetector, LocalEvent, LocalEventKind, Transition};
