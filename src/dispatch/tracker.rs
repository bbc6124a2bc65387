//! Task lifecycle tracking.
//!
//! One [`TaskRecord`] per observed work item, keyed by the portal's numeric
//! id. Records are created when a worker first takes an item on, mutated only
//! by that worker (ownership transfers, never shared), and cleared only by an
//! explicit bulk [`TaskTracker::reset`]. A worker whose record was cleared
//! mid-flight re-creates it on its next write instead of failing — that is the
//! contract the control API's reset endpoint relies on.
//!
//! Submission flows are bounded by a small counting limiter that is distinct
//! from the execution-context gate: many submissions may be pending while only
//! one heavyweight context exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::sources::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Lifecycle record for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub owner: SourceKind,
    pub kind: String,
    pub proof_required: bool,
    pub state: TaskState,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Identity of a task, carried by the owning worker so any write can re-create
/// the record after a reset.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub owner: SourceKind,
    pub kind: String,
    pub proof_required: bool,
}

impl TaskSpec {
    fn fresh_record(&self, state: TaskState, message: String) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            owner: self.owner,
            kind: self.kind.clone(),
            proof_required: self.proof_required,
            state,
            message,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct TaskTracker {
    records: Mutex<HashMap<String, TaskRecord>>,
    submit_limit: Arc<Semaphore>,
}

impl TaskTracker {
    pub fn new(submit_capacity: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            submit_limit: Arc::new(Semaphore::new(submit_capacity.max(1))),
        }
    }

    /// Create the record in `pending`. Idempotent: an existing record for the
    /// same id is left untouched.
    pub fn register(&self, spec: &TaskSpec) {
        let mut records = self.records.lock().unwrap();
        records.entry(spec.id.clone()).or_insert_with(|| {
            spec.fresh_record(
                TaskState::Pending,
                "queued for submission".to_string(),
            )
        });
    }

    pub fn mark_in_progress(&self, spec: &TaskSpec) {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(spec.id.clone())
            .or_insert_with(|| spec.fresh_record(TaskState::Pending, String::new()));
        record.state = TaskState::InProgress;
        record.message = "submission in progress".to_string();
        record.updated_at = Utc::now();
    }

    /// Record the terminal outcome, re-creating the record if a reset cleared
    /// it while the submission was in flight.
    pub fn complete(&self, spec: &TaskSpec, success: bool, message: impl Into<String>) {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(spec.id.clone())
            .or_insert_with(|| spec.fresh_record(TaskState::Pending, String::new()));
        record.state = if success {
            TaskState::Done
        } else {
            TaskState::Failed
        };
        record.message = message.into();
        record.updated_at = Utc::now();
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.records.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Bulk reset. In-flight workers are unaffected; their next write
    /// re-creates the record.
    pub fn reset(&self) {
        self.records.lock().unwrap().clear();
    }

    /// Ordered snapshot for the control API.
    pub fn snapshot(&self) -> BTreeMap<String, TaskRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Acquire a submission slot; held for the duration of one submission
    /// flow and released on drop.
    pub async fn acquire_submit_slot(&self) -> OwnedSemaphorePermit {
        self.submit_limit
            .clone()
            .acquire_owned()
            .await
            .expect("submit limiter is never closed")
    }

    pub fn available_submit_slots(&self) -> usize {
        self.submit_limit.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            owner: SourceKind::Feed,
            kind: "FEED/Post".to_string(),
            proof_required: true,
        }
    }

    #[test]
    fn lifecycle_pending_to_done() {
        let tracker = TaskTracker::new(5);
        let s = spec("101");

        tracker.register(&s);
        assert!(tracker.is_tracked("101"));
        assert_eq!(tracker.snapshot()["101"].state, TaskState::Pending);

        tracker.mark_in_progress(&s);
        assert_eq!(tracker.snapshot()["101"].state, TaskState::InProgress);

        tracker.complete(&s, true, "task submitted successfully");
        let record = &tracker.snapshot()["101"];
        assert_eq!(record.state, TaskState::Done);
        assert_eq!(record.message, "task submitted successfully");
    }

    #[test]
    fn register_is_idempotent() {
        let tracker = TaskTracker::new(5);
        let s = spec("7");
        tracker.register(&s);
        tracker.complete(&s, false, "rejected");
        tracker.register(&s);
        // A second register must not wipe the terminal outcome.
        assert_eq!(tracker.snapshot()["7"].state, TaskState::Failed);
    }

    #[test]
    fn reset_clears_everything_and_inflight_writes_recreate() {
        let tracker = TaskTracker::new(5);
        let a = spec("1");
        let b = spec("2");
        tracker.register(&a);
        tracker.register(&b);
        tracker.mark_in_progress(&a);

        tracker.reset();
        assert!(tracker.is_empty());

        // Worker for "1" is still running and reports its outcome after the
        // reset — the record comes back instead of panicking.
        tracker.complete(&a, true, "done late");
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.snapshot()["1"].state, TaskState::Done);
    }

    #[tokio::test]
    async fn submit_limiter_bounds_concurrent_flows() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let tracker = Arc::new(TaskTracker::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            let running = running.clone();
            let high_water = high_water.clone();
            handles.push(tokio::spawn(async move {
                let _slot = tracker.acquire_submit_slot().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(high_water.load(Ordering::SeqCst) <= 2);
    }
}
