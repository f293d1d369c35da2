//! Conflict policy gateway.
//!
//! When records changed on both sides, the session asks a `ConflictPolicy`
//! for one direction that applies to all of them, or for cancellation.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::SyncMode;

/// The policy declined to pick a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Conflict resolution canceled")]
pub struct Canceled;

#[async_trait]
pub trait ConflictPolicy: Send + Sync {
    /// Choose a direction for every conflicting path, or cancel the session.
    async fn decide(&self, paths: Vec<String>) -> Result<SyncMode, Canceled>;
}

/// Always resolves in the same direction.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub SyncMode);

#[async_trait]
impl ConflictPolicy for FixedPolicy {
    async fn decide(&self, _paths: Vec<String>) -> Result<SyncMode, Canceled> {
        Ok(self.0)
    }
}

/// Always cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelPolicy;

#[async_trait]
impl ConflictPolicy for CancelPolicy {
    async fn decide(&self, _paths: Vec<String>) -> Result<SyncMode, Canceled> {
        Err(Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_policies() {
        let paths = vec!["main.tex".to_string()];
        assert_eq!(
            FixedPolicy(SyncMode::Download).decide(paths.clone()).await,
            Ok(SyncMode::Download)
        );
        assert_eq!(CancelPolicy.decide(paths).await, Err(Canceled));
    }
}
