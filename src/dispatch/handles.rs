//! Worker task-handle registry.
//!
//! One handle slot per source. The dispatcher consults the registry before
//! launching (a still-running handle means the previous worker has not
//! finished) and joins every handle on shutdown so no worker outlives the run
//! unsupervised.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::sources::SourceKind;

#[derive(Debug, Default)]
pub struct WorkerHandles {
    inner: Mutex<HashMap<SourceKind, JoinHandle<()>>>,
}

impl WorkerHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while the source's previous worker task is still running.
    pub fn is_active(&self, source: SourceKind) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(&source)
            .is_some_and(|h| !h.is_finished())
    }

    /// Track a newly-spawned worker, replacing any finished predecessor.
    pub fn insert(&self, source: SourceKind, handle: JoinHandle<()>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.insert(source, handle) {
            if !old.is_finished() {
                // Launch paths check is_active first, so this indicates a bug
                // upstream; the old task keeps running but is no longer joined.
                warn!("worker handle for '{}' replaced while still running", source);
            }
        }
    }

    /// Drop entries whose task has finished.
    pub fn reap(&self) {
        self.inner.lock().unwrap().retain(|_, h| !h.is_finished());
    }

    /// Request cancellation of every tracked worker. Only used when the drain
    /// window closes with sources still running; a cancelled task surfaces as
    /// an abnormal join in [`WorkerHandles::join_all`].
    pub fn abort_all(&self) {
        for handle in self.inner.lock().unwrap().values() {
            handle.abort();
        }
    }

    /// Await every tracked worker. Called once on shutdown, after the run flag
    /// is already false, so workers are on their way out.
    pub async fn join_all(&self) {
        let drained: Vec<(SourceKind, JoinHandle<()>)> =
            self.inner.lock().unwrap().drain().collect();
        for (source, handle) in drained {
            if let Err(e) = handle.await {
                warn!("worker for '{}' ended abnormally: {}", source, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn is_active_tracks_task_lifetime() {
        let handles = WorkerHandles::new();
        assert!(!handles.is_active(SourceKind::Feed));

        handles.insert(
            SourceKind::Feed,
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }),
        );
        assert!(handles.is_active(SourceKind::Feed));

        handles.join_all().await;
        assert!(!handles.is_active(SourceKind::Feed));
    }

    #[tokio::test]
    async fn reap_drops_only_finished_entries() {
        let handles = WorkerHandles::new();
        handles.insert(SourceKind::Feed, tokio::spawn(async {}));
        handles.insert(
            SourceKind::Invite,
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }),
        );

        // Give the no-op task a moment to finish.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handles.reap();

        assert!(!handles.is_active(SourceKind::Feed));
        assert!(handles.is_active(SourceKind::Invite));
        handles.join_all().await;
    }
}
