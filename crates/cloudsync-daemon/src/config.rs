//! Command line arguments and the sanitized daemon configuration.

use clap::{Parser, ValueEnum};
use cloudsync_core::config::{ConfigError as FilterError, SyncConfig};
use cloudsync_core::conflict::{CancelPolicy, ConflictPolicy, FixedPolicy};
use cloudsync_core::types::SyncMode;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "cloudsync")]
#[command(about = "Keep a local directory in sync with a remote project store")]
pub struct Args {
    /// Local directory to synchronize
    #[arg(short, long)]
    pub root: PathBuf,

    /// Directory acting as the remote project store
    #[arg(long)]
    pub remote: PathBuf,

    /// Directory for the record table (defaults to <root>/.cloudsync)
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Project id used to name the record table (defaults to the remote directory name)
    #[arg(long)]
    pub project_id: Option<String>,

    /// Quiet window in milliseconds used to coalesce sync requests
    #[arg(long, default_value_t = 5000)]
    pub quiet_ms: u64,

    /// Extra glob pattern to ignore (repeatable)
    #[arg(long = "ignore")]
    pub ignore: Vec<String>,

    /// Direction applied to files changed on both sides
    #[arg(long, value_enum, default_value_t = ConflictChoice::Upload)]
    pub on_conflict: ConflictChoice,

    /// Run a single session and exit
    #[arg(long)]
    pub once: bool,

    /// Forget all sync state before starting
    #[arg(long)]
    pub reset: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConflictChoice {
    Upload,
    Download,
    Cancel,
}

impl ConflictChoice {
    pub fn policy(self) -> Arc<dyn ConflictPolicy> {
        match self {
            ConflictChoice::Upload => Arc::new(FixedPolicy(SyncMode::Upload)),
            ConflictChoice::Download => Arc::new(FixedPolicy(SyncMode::Download)),
            ConflictChoice::Cancel => Arc::new(CancelPolicy),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Root directory does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("Remote directory must differ from the root: {0}")]
    RemoteIsRoot(PathBuf),

    #[error("Invalid project id: {0:?}")]
    InvalidProjectId(String),

    #[error("Quiet period must be positive")]
    ZeroQuietPeriod,

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Sanitized daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub remote: PathBuf,
    pub storage: PathBuf,
    pub project_id: String,
    pub sync: SyncConfig,
    pub on_conflict: ConflictChoice,
}

/// Posix form of a path, for consistent logging and matching.
fn posix(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().replace('\\', "/"))
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if !args.root.is_dir() {
            return Err(ConfigError::RootNotFound(args.root.clone()));
        }
        let root = posix(&args.root.canonicalize().unwrap_or_else(|_| args.root.clone()));
        let remote = posix(&args.remote);
        if remote == root {
            return Err(ConfigError::RemoteIsRoot(remote));
        }
        if args.quiet_ms == 0 {
            return Err(ConfigError::ZeroQuietPeriod);
        }

        let storage = match &args.storage {
            Some(storage) if storage.is_absolute() => posix(storage),
            Some(storage) => root.join(posix(storage)),
            None => root.join(".cloudsync"),
        };

        let project_id = match &args.project_id {
            Some(id) => id.clone(),
            None => remote
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string()),
        };
        if project_id.is_empty()
            || !project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ConfigError::InvalidProjectId(project_id));
        }

        let mut sync = SyncConfig {
            quiet_period: Duration::from_millis(args.quiet_ms),
            ..SyncConfig::default()
        };
        sync.ignore.extend(args.ignore.iter().cloned());
        // The record table never takes part in synchronization.
        if let Some(relative) = relative_to(&storage, &root) {
            sync.exclude.push(relative);
        }
        // Surface bad patterns now rather than at the first event.
        sync.path_filter()?;

        Ok(Self {
            root,
            remote,
            storage,
            project_id,
            sync,
            on_conflict: args.on_conflict,
        })
    }

    /// Storage directory relative to the root, if it lies inside it.
    pub fn storage_in_root(&self) -> Option<String> {
        relative_to(&self.storage, &self.root)
    }
}

fn relative_to(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    let relative = relative.to_string_lossy().replace('\\', "/");
    (!relative.is_empty()).then_some(relative)
}
