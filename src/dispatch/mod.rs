//! The dispatcher — top-level polling cycle and run supervision.
//!
//! One process owns exactly one [`Dispatcher`]. A run goes
//! `Idle -> Running -> Idle`: activation is an idempotent flag flip, each
//! cycle probes every eligible source in parallel and launches at most one
//! worker per source, and the transition back to idle is cooperative — an
//! external stop, repeated authentication failure, or a prober signalling
//! session invalidation all just clear the active flag, which every loop and
//! worker checks at its own boundaries. Sleeps are broken into ≤1 s increments
//! so a stop request is honored within about a second.

pub mod blacklist;
pub mod gate;
pub mod handles;
pub mod tracker;

pub use blacklist::Blacklist;
pub use gate::{ContextGate, SourceClaim, SourceLocks};
pub use handles::WorkerHandles;
pub use tracker::{TaskRecord, TaskSpec, TaskState, TaskTracker};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::config::{self, Credentials, Settings, SourceSettings};
use crate::core::types::{SourceStatus, StatusResponse};
use crate::features::blob_store::BlobStore;
use crate::features::metrics::format_uptime;
use crate::features::session_store::{self, CookieRecord};
use crate::portal::probe::{probe, ProbeOutcome};
use crate::portal::submit::{submit, SubmitOutcome};
use crate::portal::{PortalClient, SessionCheck};
use crate::session::{ExecutionContext, FetchedPage};
use crate::sources::{Interaction, ItemState, SourceKind, WorkRef, Worker, WorkerError};

// ── Run state ────────────────────────────────────────────────────────────────

/// Process-wide run state: one instance, owned by the dispatcher, exposed
/// read-only to collaborators. All mutation goes through dispatcher-owned
/// methods; the active flag is a plain atomic so the control API thread can
/// read and clear it without any hand-off ceremony.
#[derive(Debug, Default)]
pub struct RunState {
    active: AtomicBool,
    start_time: RwLock<Option<DateTime<Utc>>>,
    running: Mutex<HashSet<SourceKind>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Flip idle → running. `false` when a run is already active.
    pub(crate) fn try_activate(&self) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.start_time.write().unwrap() = Some(Utc::now());
        true
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.deactivate();
        *self.start_time.write().unwrap() = None;
    }

    /// Add a source to the running set. `false` if it was already there —
    /// the caller must back off, a worker is live.
    pub(crate) fn mark_running(&self, source: SourceKind) -> bool {
        self.running.lock().unwrap().insert(source)
    }

    pub(crate) fn unmark_running(&self, source: SourceKind) {
        self.running.lock().unwrap().remove(&source);
    }

    pub fn is_running(&self, source: SourceKind) -> bool {
        self.running.lock().unwrap().contains(&source)
    }

    pub fn running_sources(&self) -> Vec<SourceKind> {
        let mut v: Vec<SourceKind> = self.running.lock().unwrap().iter().copied().collect();
        v.sort_by_key(|k| k.as_str());
        v
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.start_time.read().unwrap()
    }

    pub fn uptime_seconds(&self) -> u64 {
        if !self.is_active() {
            return 0;
        }
        self.started_at()
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Cooperative sleep: the full interval is taken in ≤1 s increments, each one
/// re-checking the active flag, so a stop lands within about a second.
pub(crate) async fn idle_sleep(run_state: &RunState, total: Duration) {
    let deadline = Instant::now() + total;
    while run_state.is_active() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Signalled,
    AlreadyIdle,
}

pub struct Dispatcher {
    /// Back-reference for handing owned `Arc`s to spawned tasks.
    self_ref: Weak<Dispatcher>,
    settings: Arc<Settings>,
    run_state: Arc<RunState>,
    tracker: TaskTracker,
    blacklist: Blacklist,
    gate: ContextGate,
    locks: SourceLocks,
    handles: WorkerHandles,
    http: reqwest::Client,
    portal: RwLock<Option<Arc<PortalClient>>>,
    credentials: RwLock<Option<Credentials>>,
    session: Mutex<Vec<CookieRecord>>,
    posted_total: Mutex<Option<u64>>,
    session_synced: AtomicBool,
    auth_failures: AtomicU32,
}

impl Dispatcher {
    pub fn new(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(settings.portal.http_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            gate: ContextGate::new(settings.dispatch.context_capacity),
            tracker: TaskTracker::new(settings.dispatch.submit_capacity),
            blacklist: Blacklist::new(),
            locks: SourceLocks::new(),
            handles: WorkerHandles::new(),
            run_state: Arc::new(RunState::new()),
            settings: Arc::new(settings),
            http,
            portal: RwLock::new(None),
            credentials: RwLock::new(None),
            session: Mutex::new(Vec::new()),
            posted_total: Mutex::new(None),
            session_synced: AtomicBool::new(false),
            auth_failures: AtomicU32::new(0),
        }))
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("dispatcher outlives its tasks")
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn posted_total(&self) -> Option<u64> {
        *self.posted_total.lock().unwrap()
    }

    /// Start an automation run. Idempotent — a second start while active is a
    /// no-op.
    pub fn start(&self) -> StartOutcome {
        if !self.run_state.try_activate() {
            return StartOutcome::AlreadyActive;
        }
        let dispatcher = self.arc();
        tokio::spawn(async move { dispatcher.run().await });
        StartOutcome::Started
    }

    /// Signal the run to stop. Cooperative: in-flight steps finish, then the
    /// loop exits.
    pub fn stop(&self) -> StopOutcome {
        if !self.run_state.is_active() {
            return StopOutcome::AlreadyIdle;
        }
        info!("stop requested — run will exit at the next boundary");
        self.run_state.deactivate();
        StopOutcome::Signalled
    }

    /// External enable/disable signal for one source. `false` for an unknown
    /// source name (the API layer reports it).
    pub fn set_source_enabled(&self, kind: SourceKind, enabled: bool) -> bool {
        match self.settings.source(kind) {
            Some(source) => {
                source.set_enabled(enabled);
                info!(
                    "source '{}' {}",
                    kind,
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> StatusResponse {
        let running = self.run_state.running_sources();
        StatusResponse {
            status: if self.run_state.is_active() {
                "active"
            } else {
                "inactive"
            }
            .to_string(),
            started_at: self.run_state.started_at(),
            uptime: format_uptime(self.run_state.uptime_seconds()),
            running_sources: running.iter().map(|k| k.to_string()).collect(),
            sources: self
                .settings
                .sources
                .iter()
                .map(|s| SourceStatus {
                    name: s.kind.to_string(),
                    enabled: s.is_enabled(),
                    running: running.contains(&s.kind),
                })
                .collect(),
            tasks_tracked: self.tracker.len(),
            blacklisted: self.blacklist.len(),
            posted_total: self.posted_total(),
        }
    }

    // ── Run lifecycle ────────────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        info!("🚀 automation run starting");
        match self.sync_startup().await {
            Ok(()) => self.run_loop().await,
            Err(e) => error!("startup failed — aborting run: {:#}", e),
        }

        // Teardown, in the original order: stop signal, drain running
        // sources, join workers, persist the session.
        self.run_state.deactivate();
        if !self.drain().await {
            self.handles.abort_all();
        }
        self.handles.join_all().await;
        self.persist_session().await;

        self.session_synced.store(false, Ordering::SeqCst);
        self.auth_failures.store(0, Ordering::SeqCst);
        *self.portal.write().unwrap() = None;
        *self.posted_total.lock().unwrap() = None;
        self.run_state.clear();
        info!("🛑 shutting down — dispatcher idle");
    }

    /// Pre-run sync: refresh session artifacts from the blob store
    /// (best-effort), load required credentials (unrecoverable when missing),
    /// seed the shared portal session from the stored snapshot.
    async fn sync_startup(&self) -> anyhow::Result<()> {
        let state_dir = &self.settings.storage.state_dir;
        let _ = tokio::fs::create_dir_all(state_dir).await;

        if let Some(blob) = self.blob_store() {
            blob.fetch(config::CREDENTIALS_FILE).await;
            blob.fetch(session_store::SESSION_FILE).await;
        }

        let credentials = config::load_credentials(state_dir)?;
        *self.credentials.write().unwrap() = Some(credentials);

        let seed = session_store::load(state_dir).unwrap_or_default();
        *self.session.lock().unwrap() = seed.clone();

        let portal = PortalClient::new(self.settings.portal.clone(), &seed, state_dir)?;
        *self.portal.write().unwrap() = Some(Arc::new(portal));
        Ok(())
    }

    async fn run_loop(&self) {
        let poll = self.settings.dispatch.poll_interval;
        while self.run_state.is_active() {
            if let Some(limit) = self.settings.dispatch.run_duration_limit {
                if self.run_state.uptime_seconds() >= limit.as_secs() {
                    info!("run duration limit reached — going idle");
                    break;
                }
            }

            if !self.session_synced.load(Ordering::SeqCst) {
                if !self.initialize_session().await {
                    if self.auth_failures.load(Ordering::SeqCst)
                        >= self.settings.dispatch.auth_failure_limit
                    {
                        warn!("repeated authentication failures — going idle");
                        break;
                    }
                    idle_sleep(&self.run_state, poll).await;
                    continue;
                }
            }

            self.cycle().await;
            if !self.run_state.is_active() {
                break;
            }
            idle_sleep(&self.run_state, poll).await;
        }
    }

    /// Validate the shared portal session. Expired sessions count toward the
    /// repeated-auth-failure limit; plain unreachability only retries.
    async fn initialize_session(&self) -> bool {
        let Some(portal) = self.portal_client() else {
            return false;
        };
        match portal.validate_session().await {
            SessionCheck::Valid => {
                info!("session initialized successfully");
                self.session_synced.store(true, Ordering::SeqCst);
                self.auth_failures.store(0, Ordering::SeqCst);
                self.absorb_cookies(portal.observed_cookies());
                true
            }
            SessionCheck::Expired => {
                let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("online session expired (attempt {})", failures);
                false
            }
            SessionCheck::Unreachable => false,
        }
    }

    /// One polling cycle: refresh the posted-total gauge, probe every
    /// eligible source in parallel, launch workers for the available ones.
    async fn cycle(&self) {
        let Some(portal) = self.portal_client() else {
            return;
        };
        self.handles.reap();

        if let Some(total) = portal.posted_total().await {
            *self.posted_total.lock().unwrap() = Some(total);
        }

        let eligible: Vec<&SourceSettings> = self
            .settings
            .sources
            .iter()
            .filter(|s| s.is_enabled())
            .filter(|s| !self.run_state.is_running(s.kind))
            .filter(|s| !self.handles.is_active(s.kind))
            .collect();

        let outcomes = join_all(
            eligible
                .iter()
                .map(|s| probe(&portal, s, &self.tracker, &self.blacklist)),
        )
        .await;

        let mut any_available = false;
        for (source, outcome) in eligible.iter().zip(outcomes) {
            match outcome {
                ProbeOutcome::Available(refs) => {
                    any_available = true;
                    self.launch(source.kind, refs);
                }
                ProbeOutcome::SessionInvalid => {
                    warn!("session invalidated — taking the run idle");
                    self.session_synced.store(false, Ordering::SeqCst);
                    self.run_state.deactivate();
                    return; // no further sources this cycle
                }
                ProbeOutcome::NoWork | ProbeOutcome::Unreachable(_) => {}
            }
        }

        if !any_available {
            info!("tasks: none available this cycle");
        }
    }

    fn launch(&self, kind: SourceKind, refs: Vec<WorkRef>) {
        if self.handles.is_active(kind) {
            return;
        }
        info!("launching worker for '{}' ({} references)", kind, refs.len());
        let dispatcher = self.arc();
        self.handles.insert(
            kind,
            tokio::spawn(async move { dispatcher.run_worker(kind, refs).await }),
        );
    }

    // ── Worker execution ─────────────────────────────────────────────────────

    async fn run_worker(self: Arc<Self>, kind: SourceKind, refs: Vec<WorkRef>) {
        // Source lock first: membership decided under the lock, lock released
        // before the (potentially slow) gate wait below.
        let Some(_claim) = self.locks.claim(&self.run_state, kind).await else {
            debug!("'{}' already running — duplicate launch backed off", kind);
            return;
        };
        let _permit = self.gate.acquire().await;

        let Some(source) = self.settings.source(kind) else {
            return;
        };
        let Some(account) = self.account_for(kind) else {
            warn!(
                "source '{}' disabled: account id missing or invalid — re-enable after fixing credentials",
                kind
            );
            source.set_enabled(false);
            return;
        };

        let ctx = match ExecutionContext::new(
            &self.settings.portal.base,
            &self.session_snapshot(),
            &self.settings.storage.state_dir,
            self.settings.portal.http_timeout,
        ) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                error!("'{}': execution context creation failed: {:#}", kind, e);
                return;
            }
        };

        let worker = kind.worker();
        let mut submissions: JoinSet<()> = JoinSet::new();

        for reference in &refs {
            if !self.run_state.is_active() {
                break;
            }
            if self.blacklist.contains(&reference.url) || self.tracker.is_tracked(&reference.id) {
                continue;
            }
            if let Err(WorkerError::Auth) = self
                .process_reference(worker, &ctx, source, reference, &account, &mut submissions)
                .await
            {
                warn!(
                    "source '{}' authentication failure — disabled until re-enabled",
                    kind
                );
                source.set_enabled(false);
                break;
            }
        }

        while let Some(joined) = submissions.join_next().await {
            if let Err(e) = joined {
                warn!("submission task for '{}' ended abnormally: {}", kind, e);
            }
        }

        worker.teardown(ctx.as_ref()).await;
        self.absorb_cookies(ctx.observed_cookies());
        self.persist_session().await;
        info!("worker '{}' finished", kind);
        // _permit and _claim drop here: gate slot and running-set membership
        // are released on every exit path.
    }

    /// Handle one reference end-to-end up to queueing its submission. Only
    /// authentication failures propagate; every other condition is resolved
    /// here (blacklist, benign completion, logged skip).
    async fn process_reference(
        &self,
        worker: &'static dyn Worker,
        ctx: &Arc<ExecutionContext>,
        source: &SourceSettings,
        reference: &WorkRef,
        account: &str,
        submissions: &mut JoinSet<()>,
    ) -> Result<(), WorkerError> {
        let detail = match self.fetch_detail(ctx, &reference.url).await {
            Ok(page) => page,
            Err(WorkerError::Auth) => return Err(WorkerError::Auth),
            Err(WorkerError::InvalidReference) => {
                self.blacklist.insert(reference.url.clone());
                info!("🚫 reference {} gone — blacklisted", reference.id);
                return Ok(());
            }
            Err(e) => {
                warn!("detail fetch for {} failed: {}", reference.id, e);
                return Ok(());
            }
        };

        match worker.classify(&source.kinds, reference, &detail.body) {
            ItemState::NotRecognized | ItemState::Gone => {
                self.blacklist.insert(reference.url.clone());
                info!("🚫 reference {} not executable — blacklisted", reference.id);
            }
            ItemState::AlreadyDone => {
                let spec = TaskSpec {
                    id: reference.id.clone(),
                    owner: source.kind,
                    kind: "unspecified".to_string(),
                    proof_required: false,
                };
                self.tracker.register(&spec);
                self.tracker
                    .complete(&spec, true, "already completed upstream");
            }
            ItemState::Actionable(item) => {
                let spec = TaskSpec {
                    id: reference.id.clone(),
                    owner: source.kind,
                    kind: item.kind.clone(),
                    proof_required: item.proof_required,
                };
                match worker.interact(ctx, &item).await {
                    Ok(interaction) => {
                        debug!(
                            "task {} confirmation: {}",
                            reference.id, interaction.confirmation
                        );
                        self.tracker.register(&spec);
                        let dispatcher = self.arc();
                        let ctx = Arc::clone(ctx);
                        let account = account.to_string();
                        submissions.spawn(async move {
                            dispatcher
                                .run_submission(ctx, spec, interaction, account)
                                .await;
                        });
                    }
                    Err(WorkerError::Auth) => return Err(WorkerError::Auth),
                    Err(WorkerError::InvalidReference) => {
                        self.blacklist.insert(reference.url.clone());
                        info!(
                            "🚫 reference {} permanently invalid — blacklisted",
                            reference.id
                        );
                    }
                    Err(WorkerError::Network(msg)) => {
                        warn!(
                            "task {} transient failure: {} — left for a later cycle",
                            reference.id, msg
                        );
                    }
                    Err(WorkerError::Unexpected(e)) => {
                        error!(
                            "worker '{}' unexpected failure on {}: {:#}",
                            source.kind, reference.id, e
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Bounded-retry fetch of a detail view. Transient failures (network,
    /// 5xx) retry with jitter; 404/410 is a permanent invalid-reference
    /// signal; a sign-in redirect is an authentication failure.
    async fn fetch_detail(
        &self,
        ctx: &ExecutionContext,
        url: &str,
    ) -> Result<FetchedPage, WorkerError> {
        use rand::Rng;

        let retries = self.settings.dispatch.detail_retries;
        let mut last: Option<WorkerError> = None;
        for attempt in 0..=retries {
            if attempt > 0 {
                let jitter = rand::rng().random_range(250..750);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            match ctx.fetch(url).await {
                Ok(page) => {
                    if self.settings.portal.is_signin(&page.final_url) {
                        return Err(WorkerError::Auth);
                    }
                    match page.status {
                        404 | 410 => return Err(WorkerError::InvalidReference),
                        s if (200..300).contains(&s) => return Ok(page),
                        s if s >= 500 => {
                            last = Some(WorkerError::Network(format!("detail returned {}", s)));
                        }
                        s => return Err(WorkerError::Network(format!("detail returned {}", s))),
                    }
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| WorkerError::Network("detail fetch failed".to_string())))
    }

    /// One submission flow, bounded by the tracker's submit limiter.
    async fn run_submission(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        spec: TaskSpec,
        interaction: Interaction,
        account: String,
    ) {
        let _slot = self.tracker.acquire_submit_slot().await;
        self.tracker.mark_in_progress(&spec);

        match submit(
            ctx.as_ref(),
            &self.settings.portal,
            &spec.id,
            &account,
            interaction.proof_path.as_deref(),
        )
        .await
        {
            Ok(SubmitOutcome::Accepted(message)) => {
                self.tracker.complete(&spec, true, message);
            }
            Ok(SubmitOutcome::AlreadyRecorded(message)) => {
                self.tracker.complete(&spec, true, message);
            }
            Ok(SubmitOutcome::Rejected(message)) => {
                self.tracker.complete(&spec, false, message);
            }
            Ok(SubmitOutcome::NoResponse) => {
                self.tracker
                    .complete(&spec, false, "no visible response from portal");
            }
            Err(WorkerError::Auth) => {
                self.tracker
                    .complete(&spec, false, "session expired during submission");
                if let Some(source) = self.settings.source(spec.owner) {
                    source.set_enabled(false);
                }
            }
            Err(e) => {
                self.tracker.complete(&spec, false, e.to_string());
            }
        }
    }

    // ── Teardown helpers ─────────────────────────────────────────────────────

    /// Wait for running sources to clear, bounded by the drain timeout.
    /// Workers observe the inactive flag and finish on their own; `false`
    /// means the window closed with sources still running.
    async fn drain(&self) -> bool {
        let deadline = Instant::now() + self.settings.dispatch.drain_timeout;
        while !self.run_state.running_sources().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let leftover = self.run_state.running_sources();
        if leftover.is_empty() {
            return true;
        }
        warn!(
            "drain timeout — cancelling {} source(s) still running: {:?}",
            leftover.len(),
            leftover
        );
        false
    }

    /// Write the in-memory session snapshot to disk and mirror it to the blob
    /// store, best-effort.
    async fn persist_session(&self) {
        if let Some(portal) = self.portal_client() {
            self.absorb_cookies(portal.observed_cookies());
        }
        let snapshot = self.session.lock().unwrap().clone();
        if snapshot.is_empty() {
            return;
        }
        if let Err(e) = session_store::save(&self.settings.storage.state_dir, &snapshot) {
            warn!("session snapshot save failed: {:#}", e);
            return;
        }
        if let Some(blob) = self.blob_store() {
            blob.store(session_store::SESSION_FILE).await;
        }
    }

    fn absorb_cookies(&self, observed: Vec<CookieRecord>) {
        if observed.is_empty() {
            return;
        }
        let mut session = self.session.lock().unwrap();
        session_store::merge(&mut session, observed);
    }

    fn session_snapshot(&self) -> Vec<CookieRecord> {
        self.session.lock().unwrap().clone()
    }

    fn portal_client(&self) -> Option<Arc<PortalClient>> {
        self.portal.read().unwrap().clone()
    }

    fn blob_store(&self) -> Option<BlobStore> {
        self.settings
            .storage
            .blob_base_url
            .clone()
            .map(|base| BlobStore::new(base, self.http.clone(), &self.settings.storage.state_dir))
    }

    /// Account id for a source, validated the way the portal expects it
    /// (numeric, non-empty). `None` disables the source upstream.
    fn account_for(&self, kind: SourceKind) -> Option<String> {
        let credentials = self.credentials.read().unwrap();
        let account = credentials.as_ref()?.account_for(kind)?.to_string();
        if account.is_empty() || !account.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(account)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("active", &self.run_state.is_active())
            .field("tracked", &self.tracker.len())
            .field("blacklisted", &self.blacklist.len())
            .field("gate_capacity", &self.gate.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_is_exclusive_and_clears_cleanly() {
        let rs = RunState::new();
        assert!(!rs.is_active());
        assert!(rs.try_activate());
        assert!(!rs.try_activate(), "second activation must be a no-op");
        assert!(rs.is_active());
        assert!(rs.started_at().is_some());

        rs.clear();
        assert!(!rs.is_active());
        assert!(rs.started_at().is_none());
        assert_eq!(rs.uptime_seconds(), 0);
    }

    #[test]
    fn running_set_holds_a_source_at_most_once() {
        let rs = RunState::new();
        assert!(rs.mark_running(SourceKind::Feed));
        assert!(!rs.mark_running(SourceKind::Feed));
        assert!(rs.is_running(SourceKind::Feed));
        rs.unmark_running(SourceKind::Feed);
        assert!(!rs.is_running(SourceKind::Feed));
        assert!(rs.mark_running(SourceKind::Feed));
    }

    #[tokio::test]
    async fn stop_during_sleep_exits_within_one_increment() {
        let rs = Arc::new(RunState::new());
        assert!(rs.try_activate());

        let rs2 = rs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            rs2.deactivate();
        });

        let started = Instant::now();
        idle_sleep(&rs, Duration::from_secs(30)).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_secs(2),
            "stop honored in {:?}, expected ≤ ~1s increment",
            elapsed
        );
    }

    #[tokio::test]
    async fn idle_sleep_runs_full_interval_when_active() {
        let rs = Arc::new(RunState::new());
        assert!(rs.try_activate());
        let started = Instant::now();
        idle_sleep(&rs, Duration::from_millis(300)).await;
        assert!(started.elapsed() >= Duration::from_millis(280));
    }
}
