//! In-memory record store
//!
//! Keeps records in a shared map. Handles created with [`MemoryStore::with_node`]
//! share the same records and sequence, which is how tests model several
//! server processes on one database.

use crate::enforcement::{
    ActorId, EnforcementError, EnforcementRecord, EnforcementResult, NodeId, RecordId, SubjectId,
    ViolationPoints,
};
use crate::store::{RecordStore, Upserted};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Failure to inject into a [`MemoryStore`] handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Every call fails with `StoreUnavailable`
    Unavailable,
    /// Every call waits this long before running
    Stall(Duration),
}

/// Store for enforcement records
#[derive(Clone)]
pub struct MemoryStore {
    /// Single map containing all records
    records: Arc<DashMap<RecordId, EnforcementRecord>>,
    points: Arc<DashMap<SubjectId, ViolationPoints>>,
    sequence: Arc<AtomicU64>,
    /// Serializes writers the way a database transaction would
    write_lock: Arc<Mutex<()>>,
    fault: Arc<RwLock<Option<StoreFault>>>,
    closed: Arc<AtomicBool>,
    node: NodeId,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(NodeId::random())
    }
}

impl MemoryStore {
    /// Create a new, empty store
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            points: Arc::new(DashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            write_lock: Arc::new(Mutex::new(())),
            fault: Arc::new(RwLock::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            node,
        }
    }

    /// Another handle on the same records, writing as a different node.
    /// Faults and closing are per handle.
    #[must_use]
    pub fn with_node(&self, node: NodeId) -> Self {
        Self {
            records: Arc::clone(&self.records),
            points: Arc::clone(&self.points),
            sequence: Arc::clone(&self.sequence),
            write_lock: Arc::clone(&self.write_lock),
            fault: Arc::new(RwLock::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            node,
        }
    }

    pub fn set_fault(&self, fault: Option<StoreFault>) {
        *self.fault.write() = fault;
    }

    /// Number of records, in any state
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get all records of a subject regardless of state
    #[must_use]
    pub fn get_for_subject(&self, subject: SubjectId) -> Vec<EnforcementRecord> {
        self.records
            .iter()
            .filter(|entry| entry.value().subject_id == subject)
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn check_fault(&self) -> EnforcementResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnforcementError::StoreUnavailable("store closed".into()));
        }
        let fault = *self.fault.read();
        match fault {
            Some(StoreFault::Unavailable) => {
                Err(EnforcementError::StoreUnavailable("injected fault".into()))
            }
            Some(StoreFault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn live_ids(&self, subject: SubjectId, record: &EnforcementRecord) -> Vec<RecordId> {
        self.records
            .iter()
            .filter(|entry| {
                let existing = entry.value();
                existing.subject_id == subject
                    && existing.kind == record.kind
                    && existing.revoked_at.is_none()
                    && existing.id != record.id
            })
            .map(|entry| *entry.key())
            .collect()
    }

    fn insert(&self, mut record: EnforcementRecord) -> Upserted {
        let mut superseded = Vec::new();
        for id in self.live_ids(record.subject_id, &record) {
            if let Some(mut prior) = self.records.get_mut(&id) {
                prior.close(record.issuer_id.clone(), record.issued_at);
                prior.change_seq = self.next_seq();
                prior.changed_by = self.node.clone();
                superseded.push(prior.clone());
            }
        }

        record.id = RecordId::generate();
        record.change_seq = self.next_seq();
        record.changed_by = self.node.clone();
        self.records.insert(record.id, record.clone());

        Upserted { record, superseded }
    }

    /// Rewrite the expiry of a record that is unrevoked and unexpired at `record.updated_at`
    fn update(&self, record: EnforcementRecord) -> EnforcementResult<Upserted> {
        let now = record.updated_at;
        let mut existing = self
            .records
            .get_mut(&record.id)
            .filter(|existing| {
                existing.revoked_at.is_none() && existing.expires_at.is_none_or(|at| at > now)
            })
            .ok_or_else(|| EnforcementError::RecordNotFound(record.id.to_string()))?;
        existing.expires_at = record.expires_at;
        existing.updated_at = record.updated_at;
        existing.change_seq = self.next_seq();
        existing.changed_by = self.node.clone();

        Ok(Upserted {
            record: existing.clone(),
            superseded: Vec::new(),
        })
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_active(
        &self,
        subject: SubjectId,
        now: DateTime<Utc>,
    ) -> EnforcementResult<Vec<EnforcementRecord>> {
        self.check_fault().await?;
        Ok(self
            .get_for_subject(subject)
            .into_iter()
            .filter(|r| r.revoked_at.is_none() && r.expires_at.is_none_or(|at| at > now))
            .collect())
    }

    async fn fetch_record(&self, id: RecordId) -> EnforcementResult<Option<EnforcementRecord>> {
        self.check_fault().await?;
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, record: EnforcementRecord) -> EnforcementResult<Upserted> {
        self.check_fault().await?;
        let _tx = self.write_lock.lock();
        if record.id.is_assigned() {
            self.update(record)
        } else {
            Ok(self.insert(record))
        }
    }

    async fn revoke(
        &self,
        id: RecordId,
        revoked_at: DateTime<Utc>,
        revoker: &ActorId,
    ) -> EnforcementResult<Option<EnforcementRecord>> {
        self.check_fault().await?;
        let _tx = self.write_lock.lock();
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(None);
        };
        if record.revoked_at.is_some() || record.expires_at.is_some_and(|at| at <= revoked_at) {
            return Ok(None);
        }
        record.close(revoker.clone(), revoked_at);
        record.change_seq = self.next_seq();
        record.changed_by = self.node.clone();
        Ok(Some(record.clone()))
    }

    async fn list_changed_since(
        &self,
        watermark: u64,
        limit: u32,
    ) -> EnforcementResult<Vec<EnforcementRecord>> {
        self.check_fault().await?;
        let mut changed: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.value().change_seq > watermark)
            .map(|entry| entry.value().clone())
            .collect();
        changed.sort_by_key(|r| r.change_seq);
        changed.truncate(limit as usize);
        Ok(changed)
    }

    async fn list_active(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> EnforcementResult<Vec<EnforcementRecord>> {
        self.check_fault().await?;
        let mut active: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_active_at(now))
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by_key(|r| std::cmp::Reverse(r.issued_at));
        active.truncate(limit as usize);
        Ok(active)
    }

    async fn history(
        &self,
        subject: SubjectId,
        limit: u32,
    ) -> EnforcementResult<Vec<EnforcementRecord>> {
        self.check_fault().await?;
        let mut records = self.get_for_subject(subject);
        records.sort_by_key(|r| std::cmp::Reverse((r.issued_at, r.change_seq)));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn latest_change_seq(&self) -> EnforcementResult<u64> {
        self.check_fault().await?;
        Ok(self.sequence.load(Ordering::Acquire))
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> EnforcementResult<u64> {
        self.check_fault().await?;
        let _tx = self.write_lock.lock();
        let before = self.records.len();
        self.records.retain(|_, r| {
            let ended = r.revoked_at.or(r.expires_at);
            !ended.is_some_and(|at| at < cutoff)
        });
        Ok((before - self.records.len()) as u64)
    }

    async fn add_violation_points(
        &self,
        subject: SubjectId,
        weight: u32,
        at: DateTime<Utc>,
    ) -> EnforcementResult<ViolationPoints> {
        self.check_fault().await?;
        let mut tally = self.points.entry(subject).or_insert_with(|| ViolationPoints {
            subject_id: subject,
            points: 0,
            total_violations: 0,
            last_violation: at,
            decayed_at: None,
        });
        tally.points = tally.points.saturating_add(weight);
        tally.total_violations = tally.total_violations.saturating_add(1);
        tally.last_violation = at;
        Ok(tally.clone())
    }

    async fn violation_points(&self, subject: SubjectId) -> EnforcementResult<Option<ViolationPoints>> {
        self.check_fault().await?;
        Ok(self.points.get(&subject).map(|entry| entry.value().clone()))
    }

    async fn reset_violation_points(&self, subject: SubjectId) -> EnforcementResult<bool> {
        self.check_fault().await?;
        Ok(self
            .points
            .get_mut(&subject)
            .filter(|tally| tally.points > 0)
            .map(|mut tally| tally.points = 0)
            .is_some())
    }

    async fn decay_violation_points(
        &self,
        idle_before: DateTime<Utc>,
        decayed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        amount: u32,
    ) -> EnforcementResult<u64> {
        self.check_fault().await?;
        let mut lowered = 0;
        for mut tally in self.points.iter_mut() {
            let due = tally.points > 0
                && tally.last_violation < idle_before
                && tally.decayed_at.is_none_or(|at| at <= decayed_before);
            if due {
                tally.points = tally.points.saturating_sub(amount);
                tally.decayed_at = Some(now);
                lowered += 1;
            }
        }
        Ok(lowered)
    }

    async fn health_check(&self) -> EnforcementResult<()> {
        self.check_fault().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
