//! Change notifications
//!
//! Every committed mutation, every change observed from another process, and
//! every expiry found by the sweep is announced as a [`ChangeNotice`] on the
//! engine's broadcast channel.

use crate::enforcement::{EnforcementKind, EnforcementRecord, EnforcementState, RecordId, SubjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Issued,
    /// Closed because a newer record of the same kind was issued
    Superseded,
    Amended,
    Revoked,
    Expired,
}

/// A change to one subject's enforcement state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub subject_id: SubjectId,
    pub kind: EnforcementKind,
    pub record_id: RecordId,
    pub change: ChangeKind,
    /// Made by another process and observed through propagation
    pub remote: bool,
    pub change_seq: u64,
}

impl ChangeNotice {
    /// A change this process made
    #[must_use]
    pub fn local(record: &EnforcementRecord, change: ChangeKind) -> Self {
        Self {
            subject_id: record.subject_id,
            kind: record.kind,
            record_id: record.id,
            change,
            remote: false,
            change_seq: record.change_seq,
        }
    }

    /// A change read back from the store that another process made
    #[must_use]
    pub fn observed(record: &EnforcementRecord, now: DateTime<Utc>) -> Self {
        let change = match record.status(now) {
            EnforcementState::Revoked => ChangeKind::Revoked,
            EnforcementState::Expired => ChangeKind::Expired,
            EnforcementState::Active if record.updated_at == record.issued_at => ChangeKind::Issued,
            EnforcementState::Active | EnforcementState::Pending => ChangeKind::Amended,
        };
        Self {
            remote: true,
            ..Self::local(record, change)
        }
    }
}
