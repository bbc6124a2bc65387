//! Per-source locks and the global execution-context gate.
//!
//! The claim protocol for launching a worker is deliberately two-phase:
//!
//! 1. take the source's own lock, re-check `running_sources`, insert, release
//!    the lock — membership is decided while holding the lock so two racing
//!    launch attempts cannot both win;
//! 2. only then wait on the context gate, so the source lock is never held
//!    across a potentially long semaphore wait.
//!
//! A successful claim is a guard value: dropping it removes the source from
//! `running_sources`, on every exit path including panics.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::RunState;
use crate::sources::SourceKind;

// ── Global concurrency gate ──────────────────────────────────────────────────

/// Counting limiter bounding simultaneous heavyweight execution contexts.
#[derive(Debug)]
pub struct ContextGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ContextGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. The permit is held for the whole worker run and
    /// released unconditionally on drop.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .expect("context gate is never closed")
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

// ── Per-source locks ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SourceLocks {
    locks: HashMap<SourceKind, Mutex<()>>,
}

impl Default for SourceLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceLocks {
    pub fn new() -> Self {
        Self {
            locks: SourceKind::ALL
                .iter()
                .map(|&k| (k, Mutex::new(())))
                .collect(),
        }
    }

    /// Try to claim a source for one worker run.
    ///
    /// Returns `None` when the source is already running — the duplicate
    /// launch attempt simply backs off.
    pub async fn claim(&self, run_state: &Arc<RunState>, source: SourceKind) -> Option<SourceClaim> {
        let lock = self
            .locks
            .get(&source)
            .expect("every SourceKind has a lock");
        let _guard = lock.lock().await;
        if !run_state.mark_running(source) {
            return None;
        }
        Some(SourceClaim {
            run_state: run_state.clone(),
            source,
        })
        // _guard drops here — before the caller waits on the context gate
    }
}

/// Exclusive claim on one source; the source stays in `running_sources` for
/// exactly as long as this guard lives.
#[derive(Debug)]
pub struct SourceClaim {
    run_state: Arc<RunState>,
    source: SourceKind,
}

impl SourceClaim {
    pub fn source(&self) -> SourceKind {
        self.source
    }
}

impl Drop for SourceClaim {
    fn drop(&mut self) {
        self.run_state.unmark_running(self.source);
    }
}
