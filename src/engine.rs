//! Enforcement engine
//!
//! One explicitly constructed instance per server process. It owns the cache,
//! the write coordinator and the propagation task, and exposes the query
//! interface used on the gameplay path and the administrative interface used
//! by command handlers.

use crate::cache::{CacheEntry, CacheStats, EnforcementCache, SweepReport};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, FailSafePolicy};
use crate::coordinator::{Mutation, MutationOutcome, WriteCoordinator};
use crate::enforcement::{
    ActiveSet, ActorId, ChangeNotice, EnforcementAction, EnforcementError, EnforcementHook,
    EnforcementKind, EnforcementRecord, EnforcementResult, EscalationLadder, HookRegistry, NodeId,
    RecordId, SubjectId, ViolationPoints,
};
use crate::propagation::{ChangePropagator, PollReport, PropagationRequest};
use crate::store::{self, RecordStore};
use crate::{CONSOLE_TARGET, ENGINE_NAME};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const NOTICE_CAPACITY: usize = 1024;
const REQUEST_CAPACITY: usize = 32;

/// Where an answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    Store,
    /// The store did not answer in time; the answer is the fail-safe default
    FailSafe,
}

/// A subject's active records and where they were read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRecords {
    pub records: ActiveSet,
    pub source: ReadSource,
}

impl ActiveRecords {
    #[must_use]
    pub fn is_fail_safe(&self) -> bool {
        self.source == ReadSource::FailSafe
    }
}

/// A recorded violation and what the escalation ladder made of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationOutcome {
    /// The subject's tally after this violation
    pub tally: ViolationPoints,
    /// Issued when the new tally reached a ladder step
    pub issued: Option<EnforcementRecord>,
}

struct Running {
    tx: mpsc::Sender<PropagationRequest>,
    task: JoinHandle<()>,
}

pub struct EnforcementEngine {
    config: EngineConfig,
    store: Arc<dyn RecordStore>,
    cache: Arc<EnforcementCache>,
    clock: Arc<dyn Clock>,
    hooks: HookRegistry,
    ladder: EscalationLadder,
    notices: broadcast::Sender<ChangeNotice>,
    coordinator: WriteCoordinator,
    propagator: Arc<ChangePropagator>,
    started: AtomicBool,
    running: parking_lot::Mutex<Option<Running>>,
    /// Subjects with a background refresh in flight
    refreshing: Arc<DashMap<SubjectId, ()>>,
}

/// Fetch a subject from the store and cache the result unless it was
/// invalidated while the fetch was in flight
async fn load_subject(
    store: Arc<dyn RecordStore>,
    cache: Arc<EnforcementCache>,
    subject: SubjectId,
    now: DateTime<Utc>,
) -> EnforcementResult<CacheEntry> {
    let ticket = cache.begin_load(subject, now);
    let records = store.fetch_active(subject, now).await?;
    Ok(cache.complete_load(ticket, records))
}

impl EnforcementEngine {
    /// Build an engine over an already opened store
    ///
    /// # Errors
    /// Returns `Config` if the configuration does not validate
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> EnforcementResult<Self> {
        config.validate()?;
        let ladder = config.escalation_ladder()?;
        let cache = Arc::new(EnforcementCache::new(
            config.cache.capacity,
            config.cache.max_staleness(),
        ));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let hooks = HookRegistry::new();
        let (coordinator, propagator) =
            Self::wire(&config, &store, &cache, &clock, &hooks, &notices);

        Ok(Self {
            config,
            store,
            cache,
            clock,
            hooks,
            ladder,
            notices,
            coordinator,
            propagator,
            started: AtomicBool::new(false),
            running: parking_lot::Mutex::new(None),
            refreshing: Arc::new(DashMap::new()),
        })
    }

    /// Open the configured store and build an engine on the system clock
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the store cannot be opened
    pub async fn connect(config: EngineConfig) -> EnforcementResult<Self> {
        config.validate()?;
        let store = store::connect(&config.database, config.node_id.clone()).await?;
        Self::new(config, store, Arc::new(SystemClock))
    }

    fn wire(
        config: &EngineConfig,
        store: &Arc<dyn RecordStore>,
        cache: &Arc<EnforcementCache>,
        clock: &Arc<dyn Clock>,
        hooks: &HookRegistry,
        notices: &broadcast::Sender<ChangeNotice>,
    ) -> (WriteCoordinator, Arc<ChangePropagator>) {
        let hooks = Arc::new(hooks.clone());
        let coordinator = WriteCoordinator::new(
            Arc::clone(store),
            Arc::clone(cache),
            Arc::clone(clock),
            Arc::clone(&hooks),
            notices.clone(),
        );
        let propagator = ChangePropagator::new(
            Arc::clone(store),
            Arc::clone(cache),
            Arc::clone(clock),
            hooks,
            notices.clone(),
            config.node_id.clone(),
            config.propagation.clone(),
        )
        .with_decay(config.escalation.decay_policy());
        (coordinator, Arc::new(propagator))
    }

    /// Register a host hook
    ///
    /// # Errors
    /// Returns `Lifecycle` once the engine has started; the background task
    /// would never see the hook
    pub fn register_hook(
        &mut self,
        kind: EnforcementKind,
        hook: Arc<dyn EnforcementHook>,
    ) -> EnforcementResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(EnforcementError::Lifecycle(
                "hooks must be registered before start".to_string(),
            ));
        }
        self.hooks.register(kind, hook);
        let (coordinator, propagator) = Self::wire(
            &self.config,
            &self.store,
            &self.cache,
            &self.clock,
            &self.hooks,
            &self.notices,
        );
        self.coordinator = coordinator;
        self.propagator = propagator;
        debug!(kind = %kind, "Hook registered");
        Ok(())
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Check the store, seed the propagation watermark, warm the cache and
    /// spawn the background propagation task.
    ///
    /// # Errors
    /// Returns `Lifecycle` if already started, or the store error if the store
    /// cannot be reached
    pub async fn start(&self) -> EnforcementResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EnforcementError::Lifecycle("engine already started".to_string()));
        }

        if let Err(e) = self.prepare().await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let task = tokio::spawn(Arc::clone(&self.propagator).run(rx));
        *self.running.lock() = Some(Running { tx, task });

        info!(
            target: CONSOLE_TARGET,
            engine = ENGINE_NAME,
            node = %self.config.node_id,
            watermark = self.propagator.watermark(),
            cached = self.cache.len(),
            "Enforcement engine started"
        );
        Ok(())
    }

    async fn prepare(&self) -> EnforcementResult<()> {
        self.store.health_check().await?;
        // Seed before warming so anything written meanwhile is replayed by the first poll
        self.propagator.seed().await?;
        if self.config.cache.warm_on_start {
            match self.warm_up().await {
                Ok(subjects) => info!(subjects = subjects, "Cache warmed"),
                Err(e) => warn!(error = %e, "Cache warm-up failed; starting cold"),
            }
        }
        Ok(())
    }

    /// Load active records into the cache, grouped by subject
    async fn warm_up(&self) -> EnforcementResult<usize> {
        let now = self.clock.now();
        let limit = self.config.cache.warm_limit;
        let records = self.store.list_active(now, limit).await?;
        let truncated = records.len() >= limit as usize;

        let mut by_subject: HashMap<SubjectId, Vec<EnforcementRecord>> = HashMap::new();
        for record in records {
            by_subject.entry(record.subject_id).or_default().push(record);
        }
        let subjects = by_subject.len();

        if truncated {
            // Some subject's records may have been cut off; load each one whole
            for subject in by_subject.into_keys() {
                load_subject(Arc::clone(&self.store), Arc::clone(&self.cache), subject, now).await?;
            }
        } else {
            for (subject, records) in by_subject {
                self.cache.put(subject, CacheEntry::new(records, now));
            }
        }
        Ok(subjects)
    }

    /// Stop the propagation task, wait for it, and close the store
    ///
    /// # Errors
    /// Returns `Lifecycle` if the engine is not running
    pub async fn stop(&self) -> EnforcementResult<()> {
        let Some(running) = self.running.lock().take() else {
            return Err(EnforcementError::Lifecycle("engine is not running".to_string()));
        };

        if running.tx.send(PropagationRequest::Shutdown).await.is_err() {
            debug!("Propagation task already gone");
        }
        if let Err(e) = running.task.await {
            warn!(error = %e, "Propagation task ended abnormally");
        }
        self.store.close().await;
        self.started.store(false, Ordering::Release);

        info!(target: CONSOLE_TARGET, engine = ENGINE_NAME, node = %self.config.node_id, "Enforcement engine stopped");
        Ok(())
    }

    fn fail_safe(&self, kind: EnforcementKind) -> bool {
        self.config.query.fail_safe == FailSafePolicy::Restrict && kind.fails_closed()
    }

    /// Whether a record of `kind` is in effect for the subject.
    ///
    /// Answers within the fast-path timeout. If the store cannot answer in time
    /// the fail-safe policy decides.
    pub async fn is_restricted(&self, subject: SubjectId, kind: EnforcementKind) -> bool {
        let active = self.active_records(subject).await;
        if active.is_fail_safe() {
            return self.fail_safe(kind);
        }
        active.records.is_restricted(kind)
    }

    /// Active records of a subject, one per kind, most severe first.
    ///
    /// On a cache miss the store is asked with the fast-path timeout. A load
    /// that times out keeps running in the background and fills the cache when
    /// it finishes, unless the subject changed meanwhile.
    pub async fn active_records(&self, subject: SubjectId) -> ActiveRecords {
        let now = self.clock.now();
        if let Some(entry) = self.cache.get(subject) {
            return ActiveRecords {
                records: entry.active(now),
                source: ReadSource::Cache,
            };
        }

        let load = tokio::spawn(load_subject(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            subject,
            now,
        ));
        let timeout = self.config.query.fast_path_timeout();
        let failure = match tokio::time::timeout(timeout, load).await {
            Ok(Ok(Ok(entry))) => {
                return ActiveRecords {
                    records: entry.active(now),
                    source: ReadSource::Store,
                };
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {}ms", timeout.as_millis()),
        };

        warn!(
            subject_id = %subject,
            policy = ?self.config.query.fail_safe,
            reason = %failure,
            "Store unavailable on fast path; answering with fail-safe"
        );
        ActiveRecords {
            records: ActiveSet::default(),
            source: ReadSource::FailSafe,
        }
    }

    /// Non-blocking check for callers that cannot await. A miss schedules one
    /// background refresh for the subject and answers with the fail-safe
    /// default until it lands.
    pub fn check_restricted(&self, subject: SubjectId, kind: EnforcementKind) -> bool {
        let now = self.clock.now();
        if let Some(entry) = self.cache.get(subject) {
            return entry.is_restricted(kind, now);
        }
        self.schedule_refresh(subject, now);
        self.fail_safe(kind)
    }

    fn schedule_refresh(&self, subject: SubjectId, now: DateTime<Utc>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.refreshing.insert(subject, ()).is_some() {
            return;
        }

        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let refreshing = Arc::clone(&self.refreshing);
        runtime.spawn(async move {
            if let Err(e) = load_subject(store, cache, subject, now).await {
                debug!(subject_id = %subject, error = %e, "Background refresh failed");
            }
            refreshing.remove(&subject);
        });
    }

    /// Load a subject into the cache ahead of its first query
    ///
    /// # Errors
    /// Returns the store error
    pub async fn prefetch(&self, subject: SubjectId) -> EnforcementResult<()> {
        if self.cache.get(subject).is_some() {
            return Ok(());
        }
        load_subject(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            subject,
            self.clock.now(),
        )
        .await
        .map(|_| ())
    }

    /// Issue a record, superseding any active one of the same kind.
    /// `None` duration means permanent.
    ///
    /// # Errors
    /// Returns `ValidationFailed` for a non-positive duration, or the store error
    pub async fn issue(
        &self,
        subject: SubjectId,
        kind: EnforcementKind,
        reason: impl Into<String>,
        issuer: impl Into<ActorId>,
        duration: Option<Duration>,
    ) -> EnforcementResult<EnforcementRecord> {
        if duration.is_some_and(|d| d <= Duration::zero()) {
            return Err(EnforcementError::ValidationFailed(
                "duration must be positive".to_string(),
            ));
        }
        self.coordinator
            .issue(subject, kind, reason.into(), issuer.into(), duration)
            .await
    }

    /// Issue a parsed action such as `mute:10m`
    ///
    /// # Errors
    /// Same as [`issue`](Self::issue)
    pub async fn issue_action(
        &self,
        subject: SubjectId,
        action: &EnforcementAction,
        reason: impl Into<String>,
        issuer: impl Into<ActorId>,
    ) -> EnforcementResult<EnforcementRecord> {
        self.issue(subject, action.kind, reason, issuer, action.duration)
            .await
    }

    /// Revoke a record. False if it is unknown, already revoked or already expired.
    ///
    /// # Errors
    /// Returns the store error
    pub async fn revoke(&self, record_id: RecordId, revoker: impl Into<ActorId>) -> EnforcementResult<bool> {
        Ok(self
            .coordinator
            .revoke_record(record_id, revoker.into())
            .await?
            .is_some())
    }

    /// Revoke the subject's active record of `kind`, if any
    ///
    /// # Errors
    /// Returns the store error
    pub async fn revoke_active(
        &self,
        subject: SubjectId,
        kind: EnforcementKind,
        revoker: impl Into<ActorId>,
    ) -> EnforcementResult<Option<EnforcementRecord>> {
        self.coordinator
            .revoke_active(subject, kind, revoker.into())
            .await
    }

    /// Change when an active record runs out
    ///
    /// # Errors
    /// Returns `RecordNotFound` if the record is not in effect, or the store error
    pub async fn amend_expiry(
        &self,
        record_id: RecordId,
        expires_at: Option<DateTime<Utc>>,
    ) -> EnforcementResult<EnforcementRecord> {
        self.coordinator.amend_expiry(record_id, expires_at).await
    }

    /// Run a custom mutation under the subject's lock
    ///
    /// # Errors
    /// Returns the error from `plan` or from the store
    pub async fn apply_mutation<F>(
        &self,
        subject: SubjectId,
        operation: &str,
        plan: F,
    ) -> EnforcementResult<MutationOutcome>
    where
        F: FnOnce(&[EnforcementRecord], DateTime<Utc>) -> EnforcementResult<Mutation> + Send,
    {
        self.coordinator.apply_mutation(subject, operation, plan).await
    }

    /// Issue whatever the escalation ladder prescribes for `points`.
    /// `None` if no threshold is reached.
    ///
    /// # Errors
    /// Returns the store error
    pub async fn escalate(
        &self,
        subject: SubjectId,
        points: u32,
        reason: impl Into<String>,
        issuer: impl Into<ActorId>,
    ) -> EnforcementResult<Option<EnforcementRecord>> {
        let Some(action) = self.ladder.action_for(points).copied() else {
            return Ok(None);
        };
        info!(subject_id = %subject, points = points, action = %action, "Escalating");
        self.issue_action(subject, &action, reason, issuer)
            .await
            .map(Some)
    }

    /// Add `weight` points to the subject's tally and issue whatever the
    /// ladder prescribes for the new total
    ///
    /// # Errors
    /// Returns `ValidationFailed` for a zero weight, or the store error. A
    /// failed escalation leaves the points recorded.
    pub async fn record_violation(
        &self,
        subject: SubjectId,
        weight: u32,
        reason: impl Into<String>,
        issuer: impl Into<ActorId>,
    ) -> EnforcementResult<ViolationOutcome> {
        if weight == 0 {
            return Err(EnforcementError::ValidationFailed(
                "violation weight must be positive".to_string(),
            ));
        }
        let tally = self
            .store
            .add_violation_points(subject, weight, self.clock.now())
            .await?;
        info!(
            subject_id = %subject,
            weight = weight,
            points = tally.points,
            violations = tally.total_violations,
            "Violation recorded"
        );
        let issued = self.escalate(subject, tally.points, reason, issuer).await?;
        Ok(ViolationOutcome { tally, issued })
    }

    /// Points a violation of `category` is worth
    #[must_use]
    pub fn violation_weight(&self, category: &str) -> u32 {
        self.config.escalation.weight_for(category)
    }

    /// The subject's current tally, if it ever had a violation
    ///
    /// # Errors
    /// Returns the store error
    pub async fn violation_points(&self, subject: SubjectId) -> EnforcementResult<Option<ViolationPoints>> {
        self.store.violation_points(subject).await
    }

    /// Clear the subject's points. False if there were none.
    ///
    /// # Errors
    /// Returns the store error
    pub async fn reset_violation_points(&self, subject: SubjectId) -> EnforcementResult<bool> {
        let reset = self.store.reset_violation_points(subject).await?;
        if reset {
            info!(subject_id = %subject, "Violation points reset");
        }
        Ok(reset)
    }

    /// Run the violation point decay pass now instead of waiting for the
    /// background task. Zero when decay is switched off.
    ///
    /// # Errors
    /// Returns the store error
    pub async fn decay_violation_points(&self) -> EnforcementResult<u64> {
        self.propagator.decay_points().await
    }

    /// Every record of a subject, newest first
    ///
    /// # Errors
    /// Returns the store error
    pub async fn history(&self, subject: SubjectId, limit: u32) -> EnforcementResult<Vec<EnforcementRecord>> {
        self.store.history(subject, limit).await
    }

    /// Time left on the subject's mute: `None` when not muted, `Some(None)`
    /// for a permanent mute. A fail-safe answer counts as not muted.
    pub async fn mute_remaining(&self, subject: SubjectId) -> Option<Option<Duration>> {
        let now = self.clock.now();
        let active = self.active_records(subject).await;
        active
            .records
            .get(EnforcementKind::Mute)
            .map(|mute| mute.remaining(now))
    }

    /// Delete revoked and expired records older than the retention window.
    /// Does nothing when no window is configured.
    ///
    /// # Errors
    /// Returns the store error
    pub async fn purge_history(&self) -> EnforcementResult<u64> {
        let Some(days) = self.config.retention.keep_days else {
            debug!("No retention window configured; history kept");
            return Ok(0);
        };
        let cutoff = self.clock.now() - Duration::days(i64::from(days));
        let purged = self.store.purge_terminal_before(cutoff).await?;
        info!(purged = purged, cutoff = %cutoff, "Purged enforcement history");
        Ok(purged)
    }

    /// Receive every change made locally, observed remotely, or found expired
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notices.subscribe()
    }

    /// Ask the background task to poll now. False if the engine is not
    /// running; a poll already queued counts as success.
    pub fn notify_changed(&self) -> bool {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return false;
        };
        match running.tx.try_send(PropagationRequest::PollNow) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Poll for changes from other processes right away
    ///
    /// # Errors
    /// Returns the store error; the watermark does not advance
    pub async fn poll_changes(&self) -> EnforcementResult<PollReport> {
        self.propagator.poll_once().await
    }

    /// Sweep the cache for stale entries and records that ran out
    pub async fn sweep_expired(&self) -> SweepReport {
        self.propagator.sweep_expired().await
    }

    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.propagator.watermark()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Subjects with a mutation in progress
    #[must_use]
    pub fn mutations_in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }
}
