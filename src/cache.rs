//! Cache layer
//!
//! Holds each hot subject's active records in a bounded LRU. Entries are
//! replaced wholesale, never edited, and are dropped once older than the
//! staleness window.
//!
//! Loads are ticketed: a ticket taken before the store read remembers the
//! invalidation epoch, and the result is thrown away if the subject was
//! invalidated while the read was in flight. A slow read that a caller gave up
//! on can therefore finish late without putting pre-write state back.

use crate::enforcement::{ActiveSet, EnforcementKind, EnforcementRecord, SubjectId};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One subject's active records as of a fetch. An empty entry means "no restriction".
#[derive(Debug, Clone)]
pub struct CacheEntry {
    records: Arc<[EnforcementRecord]>,
    fetched_at: Instant,
    fetched_wall: DateTime<Utc>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(records: Vec<EnforcementRecord>, fetched_wall: DateTime<Utc>) -> Self {
        Self::at(records, Instant::now(), fetched_wall)
    }

    fn at(records: Vec<EnforcementRecord>, fetched_at: Instant, fetched_wall: DateTime<Utc>) -> Self {
        Self {
            records: records.into(),
            fetched_at,
            fetched_wall,
        }
    }

    /// Records as fetched; some may have expired since
    #[must_use]
    pub fn records(&self) -> &[EnforcementRecord] {
        &self.records
    }

    /// Records in effect at `now` after precedence
    #[must_use]
    pub fn active(&self, now: DateTime<Utc>) -> ActiveSet {
        ActiveSet::resolve(self.records.iter().cloned(), now)
    }

    #[must_use]
    pub fn is_restricted(&self, kind: EnforcementKind, now: DateTime<Utc>) -> bool {
        self.records
            .iter()
            .any(|r| r.kind == kind && r.is_active_at(now))
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    #[must_use]
    pub fn fetched_wall(&self) -> DateTime<Utc> {
        self.fetched_wall
    }
}

/// Proof that a load began at a given invalidation epoch
#[derive(Debug)]
pub struct LoadTicket {
    subject: SubjectId,
    epoch: u64,
    started: Instant,
    started_wall: DateTime<Utc>,
}

impl LoadTicket {
    #[must_use]
    pub fn subject(&self) -> SubjectId {
        self.subject
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_evictions: u64,
    pub capacity_evictions: u64,
    pub invalidations: u64,
    /// Loads thrown away because the subject changed while they were in flight
    pub discarded_loads: u64,
}

/// What a sweep found
#[derive(Debug, Default)]
pub struct SweepReport {
    pub stale_evicted: usize,
    /// Records that ran out since the previous sweep
    pub expired: Vec<EnforcementRecord>,
}

struct CacheInner {
    entries: LruCache<SubjectId, CacheEntry>,
    /// Epoch of each subject's most recent invalidation
    invalidated: HashMap<SubjectId, (u64, Instant)>,
    epoch: u64,
    /// Loads begun before this epoch are discarded
    cleared_epoch: u64,
    last_sweep: Option<DateTime<Utc>>,
}

pub struct EnforcementCache {
    inner: Mutex<CacheInner>,
    max_staleness: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_evictions: AtomicU64,
    capacity_evictions: AtomicU64,
    invalidations: AtomicU64,
    discarded_loads: AtomicU64,
}

impl EnforcementCache {
    #[must_use]
    pub fn new(capacity: usize, max_staleness: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                invalidated: HashMap::new(),
                epoch: 0,
                cleared_epoch: 0,
                last_sweep: None,
            }),
            max_staleness,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_evictions: AtomicU64::new(0),
            capacity_evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            discarded_loads: AtomicU64::new(0),
        }
    }

    /// Fresh entry for a subject, if any. Never touches the store.
    pub fn get(&self, subject: SubjectId) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        match inner.entries.get(&subject) {
            Some(entry) if entry.age() <= self.max_staleness => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
            Some(_) => {}
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        inner.entries.pop(&subject);
        self.stale_evictions.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(subject_id = %subject, "Evicted stale cache entry");
        None
    }

    /// Store an entry unconditionally
    pub fn put(&self, subject: SubjectId, entry: CacheEntry) {
        let mut inner = self.inner.lock();
        Self::insert(&mut *inner, subject, entry, &self.capacity_evictions);
    }

    fn insert(inner: &mut CacheInner, subject: SubjectId, entry: CacheEntry, evictions: &AtomicU64) {
        if let Some((evicted, _)) = inner.entries.push(subject, entry) {
            if evicted != subject {
                evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start a load; take the ticket before reading the store
    pub fn begin_load(&self, subject: SubjectId, now: DateTime<Utc>) -> LoadTicket {
        let inner = self.inner.lock();
        LoadTicket {
            subject,
            epoch: inner.epoch,
            started: Instant::now(),
            started_wall: now,
        }
    }

    /// Finish a load. The entry is returned either way; it is cached only if
    /// nothing invalidated the subject since the ticket was taken and the load
    /// itself is still within the staleness window.
    pub fn complete_load(&self, ticket: LoadTicket, records: Vec<EnforcementRecord>) -> CacheEntry {
        let entry = CacheEntry::at(records, ticket.started, ticket.started_wall);
        let mut inner = self.inner.lock();

        let invalidated_since = ticket.epoch < inner.cleared_epoch
            || inner
                .invalidated
                .get(&ticket.subject)
                .is_some_and(|(epoch, _)| *epoch > ticket.epoch);
        if invalidated_since || entry.age() > self.max_staleness {
            self.discarded_loads.fetch_add(1, Ordering::Relaxed);
            debug!(subject_id = %ticket.subject, "Discarded load that raced an invalidation");
            return entry;
        }

        Self::insert(&mut *inner, ticket.subject, entry.clone(), &self.capacity_evictions);
        entry
    }

    /// Drop a subject's entry and fence off loads already in flight.
    /// Invalidating an absent subject is a no-op apart from the fence.
    pub fn invalidate(&self, subject: SubjectId) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.invalidated.insert(subject, (epoch, Instant::now()));
        inner.entries.pop(&subject);
        self.invalidations.fetch_add(1, Ordering::Relaxed);

        // Marks older than the staleness window cannot matter: loads that old are discarded anyway
        if inner.invalidated.len() > inner.entries.cap().get() * 4 {
            let max_staleness = self.max_staleness;
            inner
                .invalidated
                .retain(|_, (_, at)| at.elapsed() <= max_staleness);
        }
    }

    /// Drop everything and fence off every load in flight
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.cleared_epoch = inner.epoch;
        inner.entries.clear();
        inner.invalidated.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict stale entries and collect records that expired since the last sweep
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut inner = self.inner.lock();
        let since = inner.last_sweep.replace(now);

        let mut stale = Vec::new();
        let mut expired = Vec::new();
        for (subject, entry) in inner.entries.iter() {
            if entry.age() > self.max_staleness {
                stale.push(*subject);
                continue;
            }
            expired.extend(
                entry
                    .records
                    .iter()
                    .filter(|r| r.revoked_at.is_none())
                    .filter(|r| {
                        r.expires_at
                            .is_some_and(|at| at <= now && since.is_none_or(|since| at > since))
                    })
                    .cloned(),
            );
        }

        for subject in &stale {
            inner.entries.pop(subject);
        }
        let max_staleness = self.max_staleness;
        inner
            .invalidated
            .retain(|_, (_, at)| at.elapsed() <= max_staleness);

        self.stale_evictions
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        SweepReport {
            stale_evicted: stale.len(),
            expired,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            capacity_evictions: self.capacity_evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            discarded_loads: self.discarded_loads.load(Ordering::Relaxed),
        }
    }
}
