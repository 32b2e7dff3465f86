//! Enforcement record and state management
//!
//! This module defines the enforcement record structure, the identifiers it is
//! keyed by, and the state machine for its lifecycle. Status is never stored:
//! it is derived from the record's timestamps each time it is asked for.

use crate::enforcement::{EnforcementAction, EnforcementError, EnforcementKind, EnforcementResult};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use derive_more::{Display, From, FromStr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Stable identity of the restricted player or account
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, FromStr,
)]
#[serde(transparent)]
pub struct SubjectId(Uuid);

impl SubjectId {
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// Identity of a single enforcement record; nil until the store assigns one
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, FromStr,
)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub const UNASSIGNED: Self = Self(Uuid::nil());

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !self.0.is_nil()
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// Moderator, console or automated system that issued or revoked a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Name of the server process that last wrote a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    #[must_use]
    pub fn random() -> Self {
        Self(format!("node-{}", Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Enforcement lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnforcementState {
    /// Not yet persisted
    Pending,
    /// In effect
    Active,
    /// Ran past its expiry
    Expired,
    /// Explicitly lifted, or superseded by a newer record of the same kind
    Revoked,
}

impl EnforcementState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }
}

impl std::fmt::Display for EnforcementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Expired => write!(f, "Expired"),
            Self::Revoked => write!(f, "Revoked"),
        }
    }
}

/// Record of an enforcement action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementRecord {
    /// Unique ID of this enforcement
    pub id: RecordId,
    /// Who is being enforced
    pub subject_id: SubjectId,
    pub kind: EnforcementKind,
    pub reason: String,
    pub issuer_id: ActorId,
    pub issued_at: DateTime<Utc>,
    /// `None` is permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoker_id: Option<ActorId>,
    /// Last time the row changed in the store
    pub updated_at: DateTime<Utc>,
    /// Store-assigned change sequence; 0 while pending
    pub change_seq: u64,
    /// Process that made the last change
    pub changed_by: NodeId,
}

impl EnforcementRecord {
    /// Create an unsaved record. The store assigns its id and change sequence.
    ///
    /// Timestamps are kept at millisecond precision, the precision they are stored at.
    pub fn draft(
        subject_id: SubjectId,
        kind: EnforcementKind,
        reason: impl Into<String>,
        issuer_id: impl Into<ActorId>,
        issued_at: DateTime<Utc>,
        duration: Option<Duration>,
    ) -> Self {
        let issued_at = issued_at.trunc_subsecs(3);
        Self {
            id: RecordId::UNASSIGNED,
            subject_id,
            kind,
            reason: reason.into(),
            issuer_id: issuer_id.into(),
            issued_at,
            expires_at: duration.map(|d| issued_at + d),
            revoked_at: None,
            revoker_id: None,
            updated_at: issued_at,
            change_seq: 0,
            changed_by: NodeId::default(),
        }
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.id.is_assigned() && self.change_seq > 0
    }

    /// Derive the lifecycle state at `now`.
    ///
    /// A record that expired before it was revoked reports `Expired`.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> EnforcementState {
        if !self.is_persisted() {
            return EnforcementState::Pending;
        }

        let revoked_at = self.revoked_at.filter(|at| *at <= now);
        match (self.expires_at, revoked_at) {
            (Some(expires_at), Some(revoked_at)) if expires_at <= revoked_at => {
                EnforcementState::Expired
            }
            (_, Some(_)) => EnforcementState::Revoked,
            (Some(expires_at), None) if expires_at <= now => EnforcementState::Expired,
            _ => EnforcementState::Active,
        }
    }

    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == EnforcementState::Active
    }

    /// Time left before expiry. `None` means permanent.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).max(Duration::zero()))
    }

    /// The action this record was issued for
    #[must_use]
    pub fn action(&self) -> EnforcementAction {
        EnforcementAction {
            kind: self.kind,
            duration: self.expires_at.map(|expires_at| expires_at - self.issued_at),
        }
    }

    /// Revoke this enforcement, transitioning to Revoked
    ///
    /// # Errors
    /// Returns an error if the record is not Active at `at`
    pub fn revoke(&mut self, revoker_id: impl Into<ActorId>, at: DateTime<Utc>) -> EnforcementResult<()> {
        if self.status(at) != EnforcementState::Active {
            return Err(EnforcementError::InvalidStateTransition);
        }

        self.close(revoker_id.into(), at);

        info!(
            record_id = %self.id,
            subject_id = %self.subject_id,
            kind = %self.kind,
            revoker_id = ?self.revoker_id,
            "Enforcement revoked"
        );

        Ok(())
    }

    /// Stamp revocation fields without checking state; used when a newer
    /// record supersedes this one, including one that already expired.
    pub(crate) fn close(&mut self, revoker_id: ActorId, at: DateTime<Utc>) {
        let at = at.trunc_subsecs(3);
        if self.revoked_at.is_none() {
            self.revoked_at = Some(at);
            self.revoker_id = Some(revoker_id);
            self.updated_at = at;
        }
    }
}

/// Active records of one subject after precedence is applied: at most one per
/// kind, ordered from most to least severe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSet {
    records: Vec<EnforcementRecord>,
}

impl ActiveSet {
    /// Keep the records active at `now`. If two of the same kind slip through
    /// (a read racing a supersede), the most recently issued wins.
    pub fn resolve(records: impl IntoIterator<Item = EnforcementRecord>, now: DateTime<Utc>) -> Self {
        let mut by_kind: HashMap<EnforcementKind, EnforcementRecord> = HashMap::new();
        for record in records.into_iter().filter(|r| r.is_active_at(now)) {
            match by_kind.get(&record.kind) {
                Some(existing) => {
                    warn!(
                        subject_id = %record.subject_id,
                        kind = %record.kind,
                        first = %existing.id,
                        second = %record.id,
                        "Multiple active records of one kind"
                    );
                    if (record.issued_at, record.change_seq) > (existing.issued_at, existing.change_seq) {
                        by_kind.insert(record.kind, record);
                    }
                }
                None => {
                    by_kind.insert(record.kind, record);
                }
            }
        }

        let mut records: Vec<_> = by_kind.into_values().collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.kind.severity()));
        Self { records }
    }

    #[must_use]
    pub fn get(&self, kind: EnforcementKind) -> Option<&EnforcementRecord> {
        self.records.iter().find(|r| r.kind == kind)
    }

    #[must_use]
    pub fn is_restricted(&self, kind: EnforcementKind) -> bool {
        self.get(kind).is_some()
    }

    /// Most severe active record
    #[must_use]
    pub fn strongest(&self) -> Option<&EnforcementRecord> {
        self.records.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnforcementRecord> {
        self.records.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<EnforcementRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(kind: EnforcementKind, issued_at: DateTime<Utc>, duration: Option<Duration>) -> EnforcementRecord {
        let mut record =
            EnforcementRecord::draft(SubjectId::random(), kind, "cheating", "console", issued_at, duration);
        record.id = RecordId::generate();
        record.change_seq = 1;
        record
    }

    #[test]
    fn test_enforcement_state_transitions() {
        let now = Utc::now().trunc_subsecs(3);
        let draft = EnforcementRecord::draft(
            SubjectId::random(),
            EnforcementKind::Ban,
            "cheating",
            "console",
            now,
            Some(Duration::hours(24)),
        );
        assert_eq!(draft.status(now), EnforcementState::Pending);
        assert_eq!(draft.expires_at, Some(now + Duration::hours(24)));

        let mut record = persisted(EnforcementKind::Ban, now, Some(Duration::hours(24)));
        assert_eq!(record.status(now), EnforcementState::Active);
        assert_eq!(record.status(now + Duration::hours(23)), EnforcementState::Active);
        assert_eq!(record.status(now + Duration::hours(24)), EnforcementState::Expired);

        record.revoke("moderator", now + Duration::hours(1)).unwrap();
        assert_eq!(record.status(now + Duration::hours(2)), EnforcementState::Revoked);
        assert_eq!(record.revoker_id, Some(ActorId::from("moderator")));
        assert!(record.status(now + Duration::hours(2)).is_terminal());

        // Cannot revoke again
        assert!(record.revoke("moderator", now + Duration::hours(3)).is_err());
    }

    #[test]
    fn test_expired_before_revoked() {
        let now = Utc::now().trunc_subsecs(3);
        let mut record = persisted(EnforcementKind::Mute, now, Some(Duration::minutes(10)));

        // An expired record cannot be revoked through the state machine
        assert!(record.revoke("moderator", now + Duration::minutes(11)).is_err());

        // Superseding still closes it, but it keeps reporting Expired
        record.close(ActorId::from("moderator"), now + Duration::minutes(11));
        assert_eq!(record.status(now + Duration::minutes(12)), EnforcementState::Expired);
    }

    #[test]
    fn test_permanent_and_remaining() {
        let now = Utc::now().trunc_subsecs(3);
        let record = persisted(EnforcementKind::Ban, now, None);
        assert_eq!(record.status(now + Duration::weeks(520)), EnforcementState::Active);
        assert_eq!(record.remaining(now), None);
        assert_eq!(record.action(), EnforcementAction::ban(None));

        let record = persisted(EnforcementKind::Mute, now, Some(Duration::minutes(10)));
        assert_eq!(record.remaining(now + Duration::minutes(4)), Some(Duration::minutes(6)));
        assert_eq!(record.remaining(now + Duration::hours(1)), Some(Duration::zero()));
        assert_eq!(record.action(), EnforcementAction::mute(Duration::minutes(10)));
    }

    #[test]
    fn test_active_set_precedence() {
        let now = Utc::now().trunc_subsecs(3);
        let subject = SubjectId::random();
        let mut older = persisted(EnforcementKind::Mute, now - Duration::minutes(5), None);
        older.subject_id = subject;
        let mut newer = persisted(EnforcementKind::Mute, now - Duration::minutes(1), None);
        newer.subject_id = subject;
        let mut ban = persisted(EnforcementKind::Ban, now - Duration::minutes(2), None);
        ban.subject_id = subject;
        let mut expired = persisted(EnforcementKind::Warning, now - Duration::hours(2), Some(Duration::hours(1)));
        expired.subject_id = subject;

        let set = ActiveSet::resolve(vec![older, newer.clone(), expired, ban.clone()], now);
        assert_eq!(set.len(), 2);
        assert_eq!(set.strongest(), Some(&ban));
        assert_eq!(set.get(EnforcementKind::Mute), Some(&newer));
        assert!(!set.is_restricted(EnforcementKind::Warning));
    }

    #[test]
    fn test_identifier_parsing() {
        let uuid = Uuid::new_v4();
        let subject: SubjectId = uuid.to_string().parse().unwrap();
        assert_eq!(subject.as_uuid(), uuid);
        assert_eq!(subject.to_string(), uuid.to_string());
        assert!("not-a-uuid".parse::<SubjectId>().is_err());
        assert!(!RecordId::UNASSIGNED.is_assigned());
        assert!(RecordId::generate().is_assigned());
    }
}
