//! cloudsync-daemon library: Exposes the daemon components for testing.
//!
//! This is a thin library layer over the native filesystem, the directory
//! remote, the record table and the file watcher.

pub mod config;
pub mod daemon;
pub mod native_fs;
pub mod persistence;
pub mod remote_dir;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Args, Config, ConfigError, ConflictChoice};
pub use daemon::Daemon;
pub use native_fs::NativeFs;
pub use persistence::RecordStorage;
pub use remote_dir::DirectoryBackend;
pub use watcher::FileWatcher;
