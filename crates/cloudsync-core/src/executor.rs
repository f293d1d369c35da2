//! Banded task execution.
//!
//! Tasks are grouped by priority. Each band runs concurrently and bands run
//! strictly one after another, highest priority first.

use futures::future::{join_all, BoxFuture};
use tracing::debug;

/// A deferred unit of work with its band priority.
pub struct PriorityTask<R> {
    pub name: String,
    pub priority: i64,
    run: Box<dyn FnOnce() -> BoxFuture<'static, R> + Send>,
}

impl<R> PriorityTask<R> {
    pub fn new(
        name: impl Into<String>,
        priority: i64,
        run: impl FnOnce() -> BoxFuture<'static, R> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            run: Box::new(run),
        }
    }
}

/// Run every task, band by band, returning outputs in execution order.
///
/// Failures are the caller's to encode in `R`; one task's result never stops
/// the others.
pub async fn execute<R: Send + 'static>(mut tasks: Vec<PriorityTask<R>>) -> Vec<R> {
    // Stable sort keeps insertion order within a band.
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut results = Vec::with_capacity(tasks.len());
    let mut pending = tasks.into_iter().peekable();
    while let Some(first) = pending.next() {
        let priority = first.priority;
        let mut band = vec![first];
        while let Some(task) = pending.next_if(|t| t.priority == priority) {
            band.push(task);
        }
        debug!("Running band {} with {} tasks", priority, band.len());
        let futures = band.into_iter().map(|task| (task.run)());
        results.extend(join_all(futures).await);
    }
    results
}
