use std::error::Error as StdError;

use thiserror::Error;

use crate::backend::BackendError;
use crate::fs::FsError;
use crate::reconcile::ReconcileError;
use crate::record::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Remote error: {0}")]
    Backend(#[from] BackendError),

    #[error("Record error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid remote listing: {0}")]
    Listing(#[from] ReconcileError),

    #[error("Record is no longer tracked: {0}")]
    Untracked(String),

    #[error("Sync error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Render an error with every source that adds information.
pub fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let message = cause.to_string();
        if !rendered.ends_with(&message) {
            rendered.push_str(": ");
            rendered.push_str(&message);
        }
        source = cause.source();
    }
    rendered
}
