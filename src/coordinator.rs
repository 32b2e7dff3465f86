//! Write coordinator
//!
//! Every change to enforcement state goes through [`WriteCoordinator::apply_mutation`]:
//! take the subject's lock, read current state from the store, persist the
//! planned change, release the lock, invalidate the cache, announce the change.
//! Mutations of different subjects never wait on each other.
//!
//! A caller may drop the mutation future at any await. The cache entry is
//! still invalidated, and once the store has answered, notices are already
//! sent and any hook calls not yet made finish on a background task.

use crate::cache::EnforcementCache;
use crate::clock::Clock;
use crate::enforcement::{
    ActorId, ChangeKind, ChangeNotice, EnforcementError, EnforcementKind, EnforcementRecord,
    EnforcementResult, HookRegistry, LiftReason, RecordId, SubjectId,
};
use crate::logging;
use crate::store::RecordStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, warn};

/// A change planned against a subject's current active records
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Persist a new record, superseding any live one of the same kind
    Issue(EnforcementRecord),
    /// Rewrite the mutable fields of an existing record
    Amend(EnforcementRecord),
    Revoke { record_id: RecordId, revoker: ActorId },
    Nothing,
}

/// What a mutation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Issued {
        record: EnforcementRecord,
        superseded: Vec<EnforcementRecord>,
    },
    Amended(EnforcementRecord),
    Revoked(EnforcementRecord),
    Unchanged,
}

impl MutationOutcome {
    /// The record written, if any
    #[must_use]
    pub fn record(&self) -> Option<&EnforcementRecord> {
        match self {
            Self::Issued { record, .. } | Self::Amended(record) | Self::Revoked(record) => Some(record),
            Self::Unchanged => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Issued { .. } => "issued",
            Self::Amended(_) => "amended",
            Self::Revoked(_) => "revoked",
            Self::Unchanged => "unchanged",
        }
    }
}

type LockMap = DashMap<SubjectId, Arc<Mutex<()>>>;

/// A claim on one subject's lock; removes the lock from the map when the last claim goes
struct LockLease {
    locks: Arc<LockMap>,
    subject: SubjectId,
    lock: Arc<Mutex<()>>,
}

impl LockLease {
    async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        // Two handles left means the map's and ours
        self.locks.remove_if(&self.subject, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 2
        });
    }
}

/// Invalidates a subject's cache entry when dropped
struct InvalidateOnDrop {
    cache: Arc<EnforcementCache>,
    subject: SubjectId,
}

impl Drop for InvalidateOnDrop {
    fn drop(&mut self) {
        self.cache.invalidate(self.subject);
    }
}

enum HookCall {
    Applied(EnforcementRecord),
    Lifted(EnforcementRecord, LiftReason),
}

impl HookCall {
    async fn dispatch(&self, hooks: &HookRegistry) {
        match self {
            Self::Applied(record) => hooks.dispatch_applied(record).await,
            Self::Lifted(record, reason) => hooks.dispatch_lifted(record, *reason).await,
        }
    }
}

/// Hook calls owed for a committed change, run in order. A call is removed
/// only after it returns, so one interrupted by a drop runs again in full on
/// the background task that takes over the rest.
struct PendingHooks {
    hooks: Arc<HookRegistry>,
    calls: VecDeque<HookCall>,
}

impl PendingHooks {
    async fn run(mut self) {
        while let Some(call) = self.calls.front() {
            call.dispatch(&self.hooks).await;
            self.calls.pop_front();
        }
    }
}

impl Drop for PendingHooks {
    fn drop(&mut self) {
        if self.calls.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(pending = self.calls.len(), "Runtime gone; hook calls dropped");
            return;
        };
        debug!(pending = self.calls.len(), "Mutation dropped; finishing hook calls in the background");
        let rest = Self {
            hooks: Arc::clone(&self.hooks),
            calls: std::mem::take(&mut self.calls),
        };
        runtime.spawn(rest.run());
    }
}

pub struct WriteCoordinator {
    store: Arc<dyn RecordStore>,
    cache: Arc<EnforcementCache>,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookRegistry>,
    notices: broadcast::Sender<ChangeNotice>,
    locks: Arc<LockMap>,
}

impl WriteCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<EnforcementCache>,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookRegistry>,
        notices: broadcast::Sender<ChangeNotice>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            hooks,
            notices,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Number of subjects with a mutation holding or waiting for their lock
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    fn lease(&self, subject: SubjectId) -> LockLease {
        let lock = self.locks.entry(subject).or_default().clone();
        LockLease {
            locks: Arc::clone(&self.locks),
            subject,
            lock,
        }
    }

    /// Run `plan` against the subject's current active records (read from the
    /// store, not the cache) while holding the subject's lock, and persist what
    /// it returns.
    ///
    /// The cache entry is invalidated afterwards whether the write succeeded,
    /// failed, or the returned future was dropped part way, so no outcome
    /// leaves a value cached as valid.
    ///
    /// # Errors
    /// Returns the store error, or the error returned by `plan`
    pub async fn apply_mutation<F>(
        &self,
        subject: SubjectId,
        operation: &str,
        plan: F,
    ) -> EnforcementResult<MutationOutcome>
    where
        F: FnOnce(&[EnforcementRecord], DateTime<Utc>) -> EnforcementResult<Mutation> + Send,
    {
        let started = logging::log_mutation_start(subject, operation);

        // Declared before the lease so a drop releases the lock first
        let invalidate = InvalidateOnDrop {
            cache: Arc::clone(&self.cache),
            subject,
        };
        let lease = self.lease(subject);
        let result = {
            let _guard = lease.acquire().await;
            self.apply_locked(subject, plan).await
        };
        drop(lease);
        drop(invalidate);

        match &result {
            Ok(outcome) => {
                logging::log_mutation_end(subject, operation, started, outcome.label());
                self.publish(outcome).await;
            }
            Err(e) => logging::log_mutation_error(subject, operation, started, e),
        }
        result
    }

    async fn apply_locked<F>(&self, subject: SubjectId, plan: F) -> EnforcementResult<MutationOutcome>
    where
        F: FnOnce(&[EnforcementRecord], DateTime<Utc>) -> EnforcementResult<Mutation> + Send,
    {
        let now = self.clock.now();
        let current = self.store.fetch_active(subject, now).await?;

        match plan(&current, now)? {
            Mutation::Nothing => Ok(MutationOutcome::Unchanged),
            Mutation::Issue(record) => {
                if record.subject_id != subject || record.id.is_assigned() {
                    return Err(EnforcementError::ValidationFailed(
                        "issue needs an unsaved record of the locked subject".to_string(),
                    ));
                }
                let upserted = self.store.upsert(record).await?;
                Ok(MutationOutcome::Issued {
                    record: upserted.record,
                    superseded: upserted.superseded,
                })
            }
            Mutation::Amend(record) => {
                if record.subject_id != subject || !record.id.is_assigned() {
                    return Err(EnforcementError::ValidationFailed(
                        "amend needs a saved record of the locked subject".to_string(),
                    ));
                }
                let upserted = self.store.upsert(record).await?;
                Ok(MutationOutcome::Amended(upserted.record))
            }
            Mutation::Revoke { record_id, revoker } => {
                let Some(target) = current.iter().find(|r| r.id == record_id) else {
                    return Ok(MutationOutcome::Unchanged);
                };
                target.clone().revoke(revoker.clone(), now)?;

                Ok(match self.store.revoke(record_id, now, &revoker).await? {
                    Some(stored) => MutationOutcome::Revoked(stored),
                    None => MutationOutcome::Unchanged,
                })
            }
        }
    }

    /// Send every notice, then run the hooks. Nothing before the first hook awaits.
    async fn publish(&self, outcome: &MutationOutcome) {
        let mut calls = VecDeque::new();
        match outcome {
            MutationOutcome::Issued { record, superseded } => {
                for prior in superseded {
                    self.notify(ChangeNotice::local(prior, ChangeKind::Superseded));
                    calls.push_back(HookCall::Lifted(prior.clone(), LiftReason::Superseded));
                }
                self.notify(ChangeNotice::local(record, ChangeKind::Issued));
                calls.push_back(HookCall::Applied(record.clone()));
            }
            MutationOutcome::Amended(record) => {
                self.notify(ChangeNotice::local(record, ChangeKind::Amended));
            }
            MutationOutcome::Revoked(record) => {
                self.notify(ChangeNotice::local(record, ChangeKind::Revoked));
                calls.push_back(HookCall::Lifted(record.clone(), LiftReason::Revoked));
            }
            MutationOutcome::Unchanged => {}
        }

        PendingHooks {
            hooks: Arc::clone(&self.hooks),
            calls,
        }
        .run()
        .await;
    }

    fn notify(&self, notice: ChangeNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// Issue a new record, superseding any live one of the same kind
    ///
    /// # Errors
    /// Returns the store error if the record could not be persisted
    pub async fn issue(
        &self,
        subject: SubjectId,
        kind: EnforcementKind,
        reason: String,
        issuer: ActorId,
        duration: Option<Duration>,
    ) -> EnforcementResult<EnforcementRecord> {
        let outcome = self
            .apply_mutation(subject, "issue", move |_, now| {
                Ok(Mutation::Issue(EnforcementRecord::draft(
                    subject, kind, reason, issuer, now, duration,
                )))
            })
            .await?;

        match outcome {
            MutationOutcome::Issued { record, .. } => Ok(record),
            other => Err(EnforcementError::Other(format!(
                "issue finished as {}",
                other.label()
            ))),
        }
    }

    /// Revoke one record by id. `None` if it is unknown or no longer in effect.
    ///
    /// # Errors
    /// Returns the store error if the lookup or write failed
    pub async fn revoke_record(
        &self,
        record_id: RecordId,
        revoker: ActorId,
    ) -> EnforcementResult<Option<EnforcementRecord>> {
        // Subject never changes, so reading it outside the lock is safe
        let Some(record) = self.store.fetch_record(record_id).await? else {
            return Ok(None);
        };

        let outcome = self
            .apply_mutation(record.subject_id, "revoke", move |_, _| {
                Ok(Mutation::Revoke { record_id, revoker })
            })
            .await?;
        Ok(match outcome {
            MutationOutcome::Revoked(record) => Some(record),
            _ => None,
        })
    }

    /// Revoke whatever record of `kind` is in effect for the subject
    ///
    /// # Errors
    /// Returns the store error if the lookup or write failed
    pub async fn revoke_active(
        &self,
        subject: SubjectId,
        kind: EnforcementKind,
        revoker: ActorId,
    ) -> EnforcementResult<Option<EnforcementRecord>> {
        let outcome = self
            .apply_mutation(subject, "revoke_active", move |current, _| {
                let target = current
                    .iter()
                    .filter(|r| r.kind == kind)
                    .max_by_key(|r| (r.issued_at, r.change_seq));
                Ok(match target {
                    Some(record) => Mutation::Revoke {
                        record_id: record.id,
                        revoker,
                    },
                    None => Mutation::Nothing,
                })
            })
            .await?;
        Ok(match outcome {
            MutationOutcome::Revoked(record) => Some(record),
            _ => None,
        })
    }

    /// Replace a live record's expiry
    ///
    /// # Errors
    /// Returns `RecordNotFound` if the record is not in effect, or the store error
    pub async fn amend_expiry(
        &self,
        record_id: RecordId,
        expires_at: Option<DateTime<Utc>>,
    ) -> EnforcementResult<EnforcementRecord> {
        let record = self
            .store
            .fetch_record(record_id)
            .await?
            .ok_or_else(|| EnforcementError::RecordNotFound(record_id.to_string()))?;

        let outcome = self
            .apply_mutation(record.subject_id, "amend_expiry", move |current, now| {
                let mut live = current
                    .iter()
                    .find(|r| r.id == record_id)
                    .cloned()
                    .ok_or_else(|| EnforcementError::RecordNotFound(record_id.to_string()))?;
                if expires_at.is_some_and(|at| at <= live.issued_at) {
                    return Err(EnforcementError::ValidationFailed(
                        "expiry must fall after issue".to_string(),
                    ));
                }
                live.expires_at = expires_at;
                live.updated_at = now;
                Ok(Mutation::Amend(live))
            })
            .await?;

        outcome.record().cloned().ok_or_else(|| {
            warn!(record_id = %record_id, "Amend produced no record");
            EnforcementError::RecordNotFound(record_id.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::clock::ManualClock;
    use crate::enforcement::{EnforcementHook, EnforcementState, NodeId, ViolationPoints};
    use crate::store::{MemoryStore, MockRecordStore, StoreFault, Upserted};
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;
    use tokio::sync::Semaphore;

    fn coordinator(store: Arc<dyn RecordStore>) -> (Arc<WriteCoordinator>, Arc<EnforcementCache>) {
        coordinator_with_hooks(store, HookRegistry::new())
    }

    fn coordinator_with_hooks(
        store: Arc<dyn RecordStore>,
        hooks: HookRegistry,
    ) -> (Arc<WriteCoordinator>, Arc<EnforcementCache>) {
        let cache = Arc::new(EnforcementCache::new(100, StdDuration::from_secs(60)));
        let (notices, _) = broadcast::channel(64);
        let coordinator = WriteCoordinator::new(
            store,
            Arc::clone(&cache),
            Arc::new(ManualClock::default()),
            Arc::new(hooks),
            notices,
        );
        (Arc::new(coordinator), cache)
    }

    #[tokio::test]
    async fn test_issue_supersedes_and_notifies() {
        let store = MemoryStore::default();
        let (coordinator, _) = coordinator(Arc::new(store.clone()));
        let mut notices = coordinator.notices.subscribe();
        let subject = SubjectId::random();

        let first = coordinator
            .issue(subject, EnforcementKind::Ban, "cheating".into(), "mod".into(), Some(Duration::hours(24)))
            .await
            .unwrap();
        let second = coordinator
            .issue(subject, EnforcementKind::Ban, "cheating again".into(), "mod".into(), None)
            .await
            .unwrap();

        let now = Utc::now();
        let records = store.get_for_subject(subject);
        let stored_first = records.iter().find(|r| r.id == first.id).unwrap();
        assert_eq!(stored_first.status(now), EnforcementState::Revoked);
        assert_eq!(second.status(now), EnforcementState::Active);

        let kinds: Vec<_> = std::iter::from_fn(|| notices.try_recv().ok())
            .map(|n| n.change)
            .collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Issued, ChangeKind::Superseded, ChangeKind::Issued]
        );
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_issues_leave_one_active() {
        let store = MemoryStore::default();
        let (coordinator, _) = coordinator(Arc::new(store.clone()));
        let subject = SubjectId::random();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator
                        .issue(subject, EnforcementKind::Ban, format!("report {i}"), "mod".into(), None)
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let now = Utc::now();
        let records = store.get_for_subject(subject);
        assert_eq!(records.len(), 16);
        let active = records.iter().filter(|r| r.is_active_at(now)).count();
        let revoked = records
            .iter()
            .filter(|r| r.status(now) == EnforcementState::Revoked)
            .count();
        assert_eq!(active, 1);
        assert_eq!(revoked, 15);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_releases_lock_and_invalidates() {
        let mut store = MockRecordStore::new();
        store.expect_fetch_active().returning(|_, _| Ok(Vec::new()));
        store
            .expect_upsert()
            .times(1)
            .returning(|_| Err(EnforcementError::StoreUnavailable("pool timed out".into())));
        let (coordinator, cache) = coordinator(Arc::new(store));
        let subject = SubjectId::random();
        cache.put(subject, CacheEntry::new(Vec::new(), Utc::now()));

        let err = coordinator
            .issue(subject, EnforcementKind::Mute, "spam".into(), "mod".into(), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(coordinator.in_flight(), 0);
        assert!(cache.get(subject).is_none());
    }

    #[tokio::test]
    async fn test_conflict_is_surfaced() {
        let mut store = MockRecordStore::new();
        store.expect_fetch_active().returning(|_, _| Ok(Vec::new()));
        store
            .expect_upsert()
            .returning(|_| Err(EnforcementError::ConflictViolation("ux_enforcement_live".into())));
        let (coordinator, _) = coordinator(Arc::new(store));

        let err = coordinator
            .issue(SubjectId::random(), EnforcementKind::Ban, "x".into(), "mod".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::ConflictViolation(_)));
    }

    #[tokio::test]
    async fn test_plan_sees_store_state_not_cache() {
        let mut store = MockRecordStore::new();
        let subject = SubjectId::random();
        let mut live = EnforcementRecord::draft(subject, EnforcementKind::Mute, "spam", "mod", Utc::now(), None);
        live.id = RecordId::generate();
        live.change_seq = 7;
        let from_store = live.clone();
        store
            .expect_fetch_active()
            .returning(move |_, _| Ok(vec![from_store.clone()]));
        store.expect_upsert().never();
        let (coordinator, cache) = coordinator(Arc::new(store));
        // The cache claims nothing is active
        cache.put(subject, CacheEntry::new(Vec::new(), Utc::now()));

        let seen = coordinator
            .apply_mutation(subject, "inspect", |current, _| {
                assert_eq!(current.len(), 1);
                Ok(Mutation::Nothing)
            })
            .await
            .unwrap();
        assert_eq!(seen, MutationOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_revoke_paths() {
        let store = MemoryStore::default();
        let (coordinator, _) = coordinator(Arc::new(store.clone()));
        let subject = SubjectId::random();

        let mute = coordinator
            .issue(subject, EnforcementKind::Mute, "spam".into(), "mod".into(), None)
            .await
            .unwrap();
        let revoked = coordinator.revoke_record(mute.id, "admin".into()).await.unwrap().unwrap();
        assert_eq!(revoked.revoker_id, Some(ActorId::from("admin")));
        assert!(revoked.change_seq > mute.change_seq);

        // Already revoked and unknown ids are not errors
        assert!(coordinator.revoke_record(mute.id, "admin".into()).await.unwrap().is_none());
        assert!(coordinator.revoke_record(RecordId::generate(), "admin".into()).await.unwrap().is_none());

        coordinator
            .issue(subject, EnforcementKind::Ban, "grief".into(), "mod".into(), None)
            .await
            .unwrap();
        assert!(coordinator
            .revoke_active(subject, EnforcementKind::Ban, "admin".into())
            .await
            .unwrap()
            .is_some());
        assert!(coordinator
            .revoke_active(subject, EnforcementKind::Ban, "admin".into())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_amend_expiry() {
        let store = MemoryStore::default();
        let (coordinator, _) = coordinator(Arc::new(store.clone()));
        let subject = SubjectId::random();
        let ban = coordinator
            .issue(subject, EnforcementKind::Ban, "x".into(), "mod".into(), Some(Duration::hours(1)))
            .await
            .unwrap();

        let extended = ban.issued_at + Duration::days(7);
        let amended = coordinator.amend_expiry(ban.id, Some(extended)).await.unwrap();
        assert_eq!(amended.expires_at, Some(extended));

        let before_issue = ban.issued_at - Duration::hours(1);
        assert!(matches!(
            coordinator.amend_expiry(ban.id, Some(before_issue)).await,
            Err(EnforcementError::ValidationFailed(_))
        ));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_issue_rejects_foreign_subject() {
        let (coordinator, _) = coordinator(Arc::new(MemoryStore::default()));
        let subject = SubjectId::random();
        let other = SubjectId::random();
        let result = coordinator
            .apply_mutation(subject, "issue", move |_, now| {
                Ok(Mutation::Issue(EnforcementRecord::draft(
                    other,
                    EnforcementKind::Ban,
                    "x",
                    "mod",
                    now,
                    None,
                )))
            })
            .await;
        assert!(matches!(result, Err(EnforcementError::ValidationFailed(_))));
    }

    /// Store whose amends race a revoke from another process: the other
    /// process commits its revoke just before each amend reaches the store
    struct RevokedUnderfoot {
        local: MemoryStore,
        remote: MemoryStore,
    }

    #[async_trait]
    impl RecordStore for RevokedUnderfoot {
        async fn fetch_active(
            &self,
            subject: SubjectId,
            now: DateTime<Utc>,
        ) -> EnforcementResult<Vec<EnforcementRecord>> {
            self.local.fetch_active(subject, now).await
        }

        async fn fetch_record(&self, id: RecordId) -> EnforcementResult<Option<EnforcementRecord>> {
            self.local.fetch_record(id).await
        }

        async fn upsert(&self, record: EnforcementRecord) -> EnforcementResult<Upserted> {
            if record.id.is_assigned() {
                self.remote
                    .revoke(record.id, record.updated_at, &ActorId::from("remote-admin"))
                    .await?;
            }
            self.local.upsert(record).await
        }

        async fn revoke(
            &self,
            id: RecordId,
            revoked_at: DateTime<Utc>,
            revoker: &ActorId,
        ) -> EnforcementResult<Option<EnforcementRecord>> {
            self.local.revoke(id, revoked_at, revoker).await
        }

        async fn list_changed_since(&self, watermark: u64, limit: u32) -> EnforcementResult<Vec<EnforcementRecord>> {
            self.local.list_changed_since(watermark, limit).await
        }

        async fn list_active(&self, now: DateTime<Utc>, limit: u32) -> EnforcementResult<Vec<EnforcementRecord>> {
            self.local.list_active(now, limit).await
        }

        async fn history(&self, subject: SubjectId, limit: u32) -> EnforcementResult<Vec<EnforcementRecord>> {
            self.local.history(subject, limit).await
        }

        async fn latest_change_seq(&self) -> EnforcementResult<u64> {
            self.local.latest_change_seq().await
        }

        async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> EnforcementResult<u64> {
            self.local.purge_terminal_before(cutoff).await
        }

        async fn add_violation_points(
            &self,
            subject: SubjectId,
            weight: u32,
            at: DateTime<Utc>,
        ) -> EnforcementResult<ViolationPoints> {
            self.local.add_violation_points(subject, weight, at).await
        }

        async fn violation_points(&self, subject: SubjectId) -> EnforcementResult<Option<ViolationPoints>> {
            self.local.violation_points(subject).await
        }

        async fn reset_violation_points(&self, subject: SubjectId) -> EnforcementResult<bool> {
            self.local.reset_violation_points(subject).await
        }

        async fn decay_violation_points(
            &self,
            idle_before: DateTime<Utc>,
            decayed_before: DateTime<Utc>,
            now: DateTime<Utc>,
            amount: u32,
        ) -> EnforcementResult<u64> {
            self.local
                .decay_violation_points(idle_before, decayed_before, now, amount)
                .await
        }

        async fn health_check(&self) -> EnforcementResult<()> {
            self.local.health_check().await
        }

        async fn close(&self) {
            self.local.close().await;
        }
    }

    #[tokio::test]
    async fn test_amend_loses_to_remote_revoke() {
        let local = MemoryStore::new(NodeId::from("a"));
        let remote = local.with_node(NodeId::from("b"));
        let store = RevokedUnderfoot {
            local: local.clone(),
            remote,
        };
        let (coordinator, cache) = coordinator(Arc::new(store));
        let subject = SubjectId::random();
        let ban = coordinator
            .issue(subject, EnforcementKind::Ban, "x".into(), "mod".into(), Some(Duration::hours(1)))
            .await
            .unwrap();
        cache.put(subject, CacheEntry::new(vec![ban.clone()], Utc::now()));

        let result = coordinator
            .amend_expiry(ban.id, Some(ban.issued_at + Duration::days(30)))
            .await;
        assert!(matches!(result, Err(EnforcementError::RecordNotFound(_))));

        let stored = local.fetch_record(ban.id).await.unwrap().unwrap();
        assert_eq!(stored.status(Utc::now()), EnforcementState::Revoked);
        assert_eq!(stored.revoker_id, Some(ActorId::from("remote-admin")));
        assert_eq!(stored.expires_at, ban.expires_at);
        assert!(cache.get(subject).is_none());
    }

    /// Ban hook that waits for a permit before recording the call
    struct Gated {
        gate: Semaphore,
        applied: parking_lot::Mutex<Vec<RecordId>>,
    }

    #[async_trait]
    impl EnforcementHook for Gated {
        async fn applied(&self, record: &EnforcementRecord) -> EnforcementResult<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| EnforcementError::Other(e.to_string()))?;
            self.applied.lock().push(record.id);
            Ok(())
        }

        async fn lifted(&self, _record: &EnforcementRecord, _reason: LiftReason) -> EnforcementResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dropped_mutation_finishes_publishing() {
        let gated = Arc::new(Gated {
            gate: Semaphore::new(0),
            applied: parking_lot::Mutex::new(Vec::new()),
        });
        let mut hooks = HookRegistry::new();
        hooks.register(EnforcementKind::Ban, gated.clone());
        let store = MemoryStore::default();
        let (coordinator, cache) = coordinator_with_hooks(Arc::new(store.clone()), hooks);
        let mut notices = coordinator.notices.subscribe();
        let subject = SubjectId::random();
        cache.put(subject, CacheEntry::new(Vec::new(), Utc::now()));

        // The hook blocks, so the caller gives up after the commit
        let issue = coordinator.issue(subject, EnforcementKind::Ban, "x".into(), "mod".into(), None);
        assert!(tokio::time::timeout(StdDuration::from_millis(50), issue).await.is_err());

        let issued = store.get_for_subject(subject).remove(0);
        assert!(cache.get(subject).is_none());
        assert_eq!(coordinator.in_flight(), 0);
        let notice = notices.try_recv().unwrap();
        assert_eq!((notice.change, notice.record_id), (ChangeKind::Issued, issued.id));
        assert!(gated.applied.lock().is_empty());

        // The hook call runs to completion on its own once unblocked
        gated.gate.add_permits(1);
        for _ in 0..100 {
            if !gated.applied.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*gated.applied.lock(), vec![issued.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_mutation_during_store_call_invalidates() {
        let store = MemoryStore::default();
        let (coordinator, cache) = coordinator(Arc::new(store.clone()));
        let subject = SubjectId::random();
        let mute = coordinator
            .issue(subject, EnforcementKind::Mute, "spam".into(), "mod".into(), None)
            .await
            .unwrap();
        cache.put(subject, CacheEntry::new(vec![mute], Utc::now()));

        store.set_fault(Some(StoreFault::Stall(StdDuration::from_secs(10))));
        let revoke = coordinator.revoke_active(subject, EnforcementKind::Mute, "admin".into());
        assert!(tokio::time::timeout(StdDuration::from_millis(50), revoke).await.is_err());
        assert!(cache.get(subject).is_none());
        assert_eq!(coordinator.in_flight(), 0);

        // The lock was released with the dropped future
        store.set_fault(None);
        assert!(coordinator
            .revoke_active(subject, EnforcementKind::Mute, "admin".into())
            .await
            .unwrap()
            .is_some());
    }
}
