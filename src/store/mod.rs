//! Record store adapter
//!
//! One async trait over the durable record table, with an implementation per
//! backend. Every operation borrows a pooled connection; when none is free
//! within the configured timeout the call fails with `StoreUnavailable`.

mod memory;
mod sql;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::{MemoryStore, StoreFault};
#[cfg(feature = "mysql")]
pub use mysql::MySqlStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::config::{Backend, DatabaseConfig};
use crate::enforcement::{
    ActorId, EnforcementError, EnforcementRecord, EnforcementResult, NodeId, RecordId, SubjectId,
    ViolationPoints,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Result of persisting a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// The record as stored, with id, change sequence and node filled in
    pub record: EnforcementRecord,
    /// Prior live records of the same subject and kind closed in the same transaction
    pub superseded: Vec<EnforcementRecord>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records of a subject that are neither revoked nor expired at `now`
    async fn fetch_active(
        &self,
        subject: SubjectId,
        now: DateTime<Utc>,
    ) -> EnforcementResult<Vec<EnforcementRecord>>;

    async fn fetch_record(&self, id: RecordId) -> EnforcementResult<Option<EnforcementRecord>>;

    /// Insert a new record (unassigned id) or amend an existing one.
    ///
    /// Inserting closes every other unrevoked record of the same subject and
    /// kind atomically. Amending rewrites `expires_at` only, and only while the
    /// stored row is still in effect at `record.updated_at`; otherwise it fails
    /// with `RecordNotFound` and nothing is written.
    async fn upsert(&self, record: EnforcementRecord) -> EnforcementResult<Upserted>;

    /// Revoke a record that is in effect at `revoked_at` and return it as
    /// stored. `None` if it was already revoked, already expired, or does not exist.
    async fn revoke(
        &self,
        id: RecordId,
        revoked_at: DateTime<Utc>,
        revoker: &ActorId,
    ) -> EnforcementResult<Option<EnforcementRecord>>;

    /// Row changes with a sequence above `watermark`, oldest first
    async fn list_changed_since(
        &self,
        watermark: u64,
        limit: u32,
    ) -> EnforcementResult<Vec<EnforcementRecord>>;

    /// Records in effect at `now` across all subjects, newest first
    async fn list_active(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> EnforcementResult<Vec<EnforcementRecord>>;

    /// All records of a subject, newest first
    async fn history(
        &self,
        subject: SubjectId,
        limit: u32,
    ) -> EnforcementResult<Vec<EnforcementRecord>>;

    /// Highest committed change sequence
    async fn latest_change_seq(&self) -> EnforcementResult<u64>;

    /// Physically delete revoked or expired records last changed before `cutoff`
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> EnforcementResult<u64>;

    /// Add `weight` points to the subject's tally and return the new tally
    async fn add_violation_points(
        &self,
        subject: SubjectId,
        weight: u32,
        at: DateTime<Utc>,
    ) -> EnforcementResult<ViolationPoints>;

    async fn violation_points(&self, subject: SubjectId) -> EnforcementResult<Option<ViolationPoints>>;

    /// Zero the subject's points. False if there were none.
    async fn reset_violation_points(&self, subject: SubjectId) -> EnforcementResult<bool>;

    /// Lower by `amount` (not below zero) every tally whose last violation is
    /// before `idle_before` and that was not decayed after `decayed_before`.
    /// Returns the number of subjects lowered.
    async fn decay_violation_points(
        &self,
        idle_before: DateTime<Utc>,
        decayed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        amount: u32,
    ) -> EnforcementResult<u64>;

    async fn health_check(&self) -> EnforcementResult<()>;

    async fn close(&self);
}

/// Open the store selected by configuration
///
/// # Errors
/// Returns an error if the backend is not compiled in or cannot be reached
pub async fn connect(
    config: &DatabaseConfig,
    node: NodeId,
) -> EnforcementResult<Arc<dyn RecordStore>> {
    info!(backend = ?config.backend, node = %node, "Opening record store");
    match config.backend {
        Backend::Memory => Ok(Arc::new(MemoryStore::new(node))),
        #[cfg(feature = "sqlite")]
        Backend::Sqlite => Ok(Arc::new(SqliteStore::connect(config, node).await?)),
        #[cfg(feature = "mysql")]
        Backend::Mysql => Ok(Arc::new(MySqlStore::connect(config, node).await?)),
        #[allow(unreachable_patterns)]
        other => Err(EnforcementError::Config(format!(
            "backend {other:?} is not compiled into this build"
        ))),
    }
}
