//! Row mapping and statements shared by the SQL backends.
//!
//! Timestamps are stored as epoch milliseconds and identifiers as text so the
//! same statements run unchanged on SQLite and MySQL; only DDL, row locking and
//! the points upsert differ per backend. `impl_sql_record_store!` expands the
//! whole `RecordStore` implementation for each backend.

use crate::enforcement::{
    ActorId, EnforcementError, EnforcementRecord, EnforcementResult, NodeId, RecordId, SubjectId,
    ViolationPoints,
};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

pub(super) const RECORD_COLUMNS: &str = "id, subject_id, kind, reason, issuer_id, issued_at_ms, \
     expires_at_ms, revoked_at_ms, revoker_id, updated_at_ms, change_seq, changed_by";

pub(super) const INSERT_RECORD: &str = r#"
INSERT INTO enforcement_records
    (id, subject_id, kind, reason, issuer_id, issued_at_ms, expires_at_ms,
     revoked_at_ms, revoker_id, updated_at_ms, change_seq, changed_by)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// Expiry only, and only while the row is still in effect. Revocation goes
/// through [`REVOKE_RECORD`] so a stale copy can never reopen a revoked row.
pub(super) const UPDATE_RECORD: &str = r#"
UPDATE enforcement_records
SET expires_at_ms = ?, updated_at_ms = ?, change_seq = ?, changed_by = ?
WHERE id = ? AND revoked_at_ms IS NULL AND (expires_at_ms IS NULL OR expires_at_ms > ?)
"#;

pub(super) const CLOSE_RECORD: &str = r#"
UPDATE enforcement_records
SET revoked_at_ms = ?, revoker_id = ?, updated_at_ms = ?, change_seq = ?, changed_by = ?
WHERE id = ? AND revoked_at_ms IS NULL
"#;

pub(super) const REVOKE_RECORD: &str = r#"
UPDATE enforcement_records
SET revoked_at_ms = ?, revoker_id = ?, updated_at_ms = ?, change_seq = ?, changed_by = ?
WHERE id = ? AND revoked_at_ms IS NULL AND (expires_at_ms IS NULL OR expires_at_ms > ?)
"#;

pub(super) const BUMP_SEQUENCE: &str = "UPDATE enforcement_sequence SET last_seq = last_seq + 1 WHERE id = 1";
pub(super) const READ_SEQUENCE: &str = "SELECT last_seq FROM enforcement_sequence WHERE id = 1";

pub(super) const PURGE_TERMINAL: &str = r#"
DELETE FROM enforcement_records
WHERE (revoked_at_ms IS NOT NULL AND revoked_at_ms < ?)
   OR (expires_at_ms IS NOT NULL AND expires_at_ms < ?)
"#;

pub(super) const POINTS_COLUMNS: &str =
    "subject_id, points, total_violations, last_violation_ms, decayed_at_ms";

pub(super) const RESET_POINTS: &str =
    "UPDATE violation_points SET points = 0 WHERE subject_id = ? AND points > 0";

/// Lower idle tallies by a fixed amount, at most once per decay interval
/// however many processes run the pass
pub(super) const DECAY_POINTS: &str = r#"
UPDATE violation_points
SET points = CASE WHEN points > ? THEN points - ? ELSE 0 END, decayed_at_ms = ?
WHERE points > 0 AND last_violation_ms < ?
  AND (decayed_at_ms IS NULL OR decayed_at_ms <= ?)
"#;

pub(super) fn select_points() -> String {
    format!("SELECT {POINTS_COLUMNS} FROM violation_points WHERE subject_id = ?")
}

pub(super) fn select_active_for_subject() -> String {
    format!(
        "SELECT {RECORD_COLUMNS} FROM enforcement_records \
         WHERE subject_id = ? AND revoked_at_ms IS NULL \
         AND (expires_at_ms IS NULL OR expires_at_ms > ?)"
    )
}

pub(super) fn select_by_id() -> String {
    format!("SELECT {RECORD_COLUMNS} FROM enforcement_records WHERE id = ?")
}

/// Unrevoked rows of one subject and kind; `suffix` adds row locking where supported
pub(super) fn select_live(suffix: &str) -> String {
    format!(
        "SELECT {RECORD_COLUMNS} FROM enforcement_records \
         WHERE subject_id = ? AND kind = ? AND revoked_at_ms IS NULL ORDER BY change_seq{suffix}"
    )
}

pub(super) fn select_changed_since() -> String {
    format!(
        "SELECT {RECORD_COLUMNS} FROM enforcement_records \
         WHERE change_seq > ? ORDER BY change_seq LIMIT ?"
    )
}

pub(super) fn select_all_active() -> String {
    format!(
        "SELECT {RECORD_COLUMNS} FROM enforcement_records \
         WHERE revoked_at_ms IS NULL AND (expires_at_ms IS NULL OR expires_at_ms > ?) \
         ORDER BY issued_at_ms DESC LIMIT ?"
    )
}

pub(super) fn select_history() -> String {
    format!(
        "SELECT {RECORD_COLUMNS} FROM enforcement_records \
         WHERE subject_id = ? ORDER BY issued_at_ms DESC, change_seq DESC LIMIT ?"
    )
}

/// Row shape of `enforcement_records`
#[derive(Debug, Clone, FromRow)]
pub(super) struct RecordRow {
    id: String,
    subject_id: String,
    kind: String,
    reason: String,
    issuer_id: String,
    issued_at_ms: i64,
    expires_at_ms: Option<i64>,
    revoked_at_ms: Option<i64>,
    revoker_id: Option<String>,
    updated_at_ms: i64,
    change_seq: i64,
    changed_by: String,
}

impl TryFrom<RecordRow> for EnforcementRecord {
    type Error = EnforcementError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, value: &str| {
            EnforcementError::Database(format!("corrupt {field} '{value}' in record {}", row.id))
        };

        Ok(Self {
            id: row.id.parse::<RecordId>().map_err(|_| corrupt("id", &row.id))?,
            subject_id: row
                .subject_id
                .parse::<SubjectId>()
                .map_err(|_| corrupt("subject_id", &row.subject_id))?,
            kind: row.kind.parse().map_err(|_| corrupt("kind", &row.kind))?,
            issued_at: from_millis(row.issued_at_ms)?,
            expires_at: row.expires_at_ms.map(from_millis).transpose()?,
            revoked_at: row.revoked_at_ms.map(from_millis).transpose()?,
            updated_at: from_millis(row.updated_at_ms)?,
            change_seq: u64::try_from(row.change_seq)
                .map_err(|_| corrupt("change_seq", &row.change_seq.to_string()))?,
            reason: row.reason,
            issuer_id: ActorId::from(row.issuer_id),
            revoker_id: row.revoker_id.map(ActorId::from),
            changed_by: NodeId::from(row.changed_by),
        })
    }
}

/// Row shape of `violation_points`
#[derive(Debug, Clone, FromRow)]
pub(super) struct PointsRow {
    subject_id: String,
    points: i64,
    total_violations: i64,
    last_violation_ms: i64,
    decayed_at_ms: Option<i64>,
}

impl TryFrom<PointsRow> for ViolationPoints {
    type Error = EnforcementError;

    fn try_from(row: PointsRow) -> Result<Self, Self::Error> {
        let count = |field: &str, value: i64| {
            u32::try_from(value).map_err(|_| {
                EnforcementError::Database(format!(
                    "corrupt {field} {value} for subject {}",
                    row.subject_id
                ))
            })
        };

        Ok(Self {
            subject_id: row.subject_id.parse::<SubjectId>().map_err(|_| {
                EnforcementError::Database(format!("corrupt subject_id '{}'", row.subject_id))
            })?,
            points: count("points", row.points)?,
            total_violations: count("total_violations", row.total_violations)?,
            last_violation: from_millis(row.last_violation_ms)?,
            decayed_at: row.decayed_at_ms.map(from_millis).transpose()?,
        })
    }
}

pub(super) fn into_records(rows: Vec<RecordRow>) -> EnforcementResult<Vec<EnforcementRecord>> {
    rows.into_iter().map(EnforcementRecord::try_from).collect()
}

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(ms: i64) -> EnforcementResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EnforcementError::Database(format!("timestamp out of range: {ms}")))
}

pub(super) fn seq_to_db(seq: u64) -> EnforcementResult<i64> {
    i64::try_from(seq).map_err(|_| EnforcementError::Database(format!("sequence overflow: {seq}")))
}

pub(super) fn seq_from_db(seq: i64) -> EnforcementResult<u64> {
    u64::try_from(seq).map_err(|_| EnforcementError::Database(format!("negative sequence: {seq}")))
}

/// Implements [`RecordStore`](super::RecordStore) for a store struct with
/// `pool` and `node` fields.
///
/// `live_lock` is appended to the read of a subject's live rows inside the
/// insert transaction; `add_points` is the backend's upsert of one violation
/// into `violation_points`, bound as (subject, weight, at).
macro_rules! impl_sql_record_store {
    ($store:ty, $db:ty, live_lock = $live_lock:expr, add_points = $add_points:expr $(,)?) => {
        impl $store {
            /// Draw the next change sequence. The UPDATE comes first so the
            /// transaction takes the write lock before it reads anything.
            async fn next_seq(
                tx: &mut ::sqlx::Transaction<'_, $db>,
            ) -> $crate::enforcement::EnforcementResult<i64> {
                ::sqlx::query($crate::store::sql::BUMP_SEQUENCE)
                    .execute(&mut **tx)
                    .await?;
                let seq: i64 = ::sqlx::query_scalar($crate::store::sql::READ_SEQUENCE)
                    .fetch_one(&mut **tx)
                    .await?;
                Ok(seq)
            }

            async fn insert(
                &self,
                mut record: $crate::enforcement::EnforcementRecord,
            ) -> $crate::enforcement::EnforcementResult<$crate::store::Upserted> {
                use $crate::store::sql;

                let mut tx = self.pool.begin().await?;
                let subject = record.subject_id.to_string();

                let mut seq = Self::next_seq(&mut tx).await?;
                let live: Vec<sql::RecordRow> = ::sqlx::query_as(&sql::select_live($live_lock))
                    .bind(&subject)
                    .bind(record.kind.as_str())
                    .fetch_all(&mut *tx)
                    .await?;

                let mut superseded = Vec::with_capacity(live.len());
                for mut prior in sql::into_records(live)? {
                    prior.close(record.issuer_id.clone(), record.issued_at);
                    prior.change_seq = sql::seq_from_db(seq)?;
                    prior.changed_by = self.node.clone();
                    ::sqlx::query(sql::CLOSE_RECORD)
                        .bind(prior.revoked_at.map(sql::to_millis))
                        .bind(prior.revoker_id.as_ref().map($crate::enforcement::ActorId::as_str))
                        .bind(sql::to_millis(prior.updated_at))
                        .bind(seq)
                        .bind(self.node.as_str())
                        .bind(prior.id.to_string())
                        .execute(&mut *tx)
                        .await?;
                    superseded.push(prior);
                    seq = Self::next_seq(&mut tx).await?;
                }

                record.id = $crate::enforcement::RecordId::generate();
                record.change_seq = sql::seq_from_db(seq)?;
                record.changed_by = self.node.clone();
                ::sqlx::query(sql::INSERT_RECORD)
                    .bind(record.id.to_string())
                    .bind(&subject)
                    .bind(record.kind.as_str())
                    .bind(&record.reason)
                    .bind(record.issuer_id.as_str())
                    .bind(sql::to_millis(record.issued_at))
                    .bind(record.expires_at.map(sql::to_millis))
                    .bind(record.revoked_at.map(sql::to_millis))
                    .bind(record.revoker_id.as_ref().map($crate::enforcement::ActorId::as_str))
                    .bind(sql::to_millis(record.updated_at))
                    .bind(seq)
                    .bind(self.node.as_str())
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok($crate::store::Upserted { record, superseded })
            }

            async fn update(
                &self,
                record: $crate::enforcement::EnforcementRecord,
            ) -> $crate::enforcement::EnforcementResult<$crate::store::Upserted> {
                use $crate::store::sql;

                let mut tx = self.pool.begin().await?;
                let seq = Self::next_seq(&mut tx).await?;
                let at = sql::to_millis(record.updated_at);
                let result = ::sqlx::query(sql::UPDATE_RECORD)
                    .bind(record.expires_at.map(sql::to_millis))
                    .bind(at)
                    .bind(seq)
                    .bind(self.node.as_str())
                    .bind(record.id.to_string())
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() == 0 {
                    // Gone, revoked or run out since the caller read it
                    tx.rollback().await?;
                    return Err($crate::enforcement::EnforcementError::RecordNotFound(
                        record.id.to_string(),
                    ));
                }

                let row: sql::RecordRow = ::sqlx::query_as(&sql::select_by_id())
                    .bind(record.id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok($crate::store::Upserted {
                    record: $crate::enforcement::EnforcementRecord::try_from(row)?,
                    superseded: Vec::new(),
                })
            }
        }

        #[::async_trait::async_trait]
        impl $crate::store::RecordStore for $store {
            async fn fetch_active(
                &self,
                subject: $crate::enforcement::SubjectId,
                now: ::chrono::DateTime<::chrono::Utc>,
            ) -> $crate::enforcement::EnforcementResult<Vec<$crate::enforcement::EnforcementRecord>> {
                use $crate::store::sql;

                let rows: Vec<sql::RecordRow> = ::sqlx::query_as(&sql::select_active_for_subject())
                    .bind(subject.to_string())
                    .bind(sql::to_millis(now))
                    .fetch_all(&self.pool)
                    .await?;
                sql::into_records(rows)
            }

            async fn fetch_record(
                &self,
                id: $crate::enforcement::RecordId,
            ) -> $crate::enforcement::EnforcementResult<Option<$crate::enforcement::EnforcementRecord>> {
                use $crate::store::sql;

                let row: Option<sql::RecordRow> = ::sqlx::query_as(&sql::select_by_id())
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
                row.map($crate::enforcement::EnforcementRecord::try_from).transpose()
            }

            async fn upsert(
                &self,
                record: $crate::enforcement::EnforcementRecord,
            ) -> $crate::enforcement::EnforcementResult<$crate::store::Upserted> {
                if record.id.is_assigned() {
                    self.update(record).await
                } else {
                    self.insert(record).await
                }
            }

            async fn revoke(
                &self,
                id: $crate::enforcement::RecordId,
                revoked_at: ::chrono::DateTime<::chrono::Utc>,
                revoker: &$crate::enforcement::ActorId,
            ) -> $crate::enforcement::EnforcementResult<Option<$crate::enforcement::EnforcementRecord>> {
                use $crate::store::sql;

                let mut tx = self.pool.begin().await?;
                let seq = Self::next_seq(&mut tx).await?;
                let at = sql::to_millis(revoked_at);
                let result = ::sqlx::query(sql::REVOKE_RECORD)
                    .bind(at)
                    .bind(revoker.as_str())
                    .bind(at)
                    .bind(seq)
                    .bind(self.node.as_str())
                    .bind(id.to_string())
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;

                if result.rows_affected() == 0 {
                    // Nothing changed; give the sequence value back
                    tx.rollback().await?;
                    return Ok(None);
                }

                // Read back inside the transaction so commit is the last round trip
                let row: sql::RecordRow = ::sqlx::query_as(&sql::select_by_id())
                    .bind(id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;
                $crate::enforcement::EnforcementRecord::try_from(row).map(Some)
            }

            async fn list_changed_since(
                &self,
                watermark: u64,
                limit: u32,
            ) -> $crate::enforcement::EnforcementResult<Vec<$crate::enforcement::EnforcementRecord>> {
                use $crate::store::sql;

                let rows: Vec<sql::RecordRow> = ::sqlx::query_as(&sql::select_changed_since())
                    .bind(sql::seq_to_db(watermark)?)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?;
                sql::into_records(rows)
            }

            async fn list_active(
                &self,
                now: ::chrono::DateTime<::chrono::Utc>,
                limit: u32,
            ) -> $crate::enforcement::EnforcementResult<Vec<$crate::enforcement::EnforcementRecord>> {
                use $crate::store::sql;

                let rows: Vec<sql::RecordRow> = ::sqlx::query_as(&sql::select_all_active())
                    .bind(sql::to_millis(now))
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?;
                sql::into_records(rows)
            }

            async fn history(
                &self,
                subject: $crate::enforcement::SubjectId,
                limit: u32,
            ) -> $crate::enforcement::EnforcementResult<Vec<$crate::enforcement::EnforcementRecord>> {
                use $crate::store::sql;

                let rows: Vec<sql::RecordRow> = ::sqlx::query_as(&sql::select_history())
                    .bind(subject.to_string())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?;
                sql::into_records(rows)
            }

            async fn latest_change_seq(&self) -> $crate::enforcement::EnforcementResult<u64> {
                use $crate::store::sql;

                let seq: i64 = ::sqlx::query_scalar(sql::READ_SEQUENCE)
                    .fetch_one(&self.pool)
                    .await?;
                sql::seq_from_db(seq)
            }

            async fn purge_terminal_before(
                &self,
                cutoff: ::chrono::DateTime<::chrono::Utc>,
            ) -> $crate::enforcement::EnforcementResult<u64> {
                use $crate::store::sql;

                let cutoff = sql::to_millis(cutoff);
                let result = ::sqlx::query(sql::PURGE_TERMINAL)
                    .bind(cutoff)
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?;
                Ok(result.rows_affected())
            }

            async fn add_violation_points(
                &self,
                subject: $crate::enforcement::SubjectId,
                weight: u32,
                at: ::chrono::DateTime<::chrono::Utc>,
            ) -> $crate::enforcement::EnforcementResult<$crate::enforcement::ViolationPoints> {
                use $crate::store::sql;

                let mut tx = self.pool.begin().await?;
                ::sqlx::query($add_points)
                    .bind(subject.to_string())
                    .bind(i64::from(weight))
                    .bind(sql::to_millis(at))
                    .execute(&mut *tx)
                    .await?;
                let row: sql::PointsRow = ::sqlx::query_as(&sql::select_points())
                    .bind(subject.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;
                $crate::enforcement::ViolationPoints::try_from(row)
            }

            async fn violation_points(
                &self,
                subject: $crate::enforcement::SubjectId,
            ) -> $crate::enforcement::EnforcementResult<Option<$crate::enforcement::ViolationPoints>> {
                use $crate::store::sql;

                let row: Option<sql::PointsRow> = ::sqlx::query_as(&sql::select_points())
                    .bind(subject.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
                row.map($crate::enforcement::ViolationPoints::try_from).transpose()
            }

            async fn reset_violation_points(
                &self,
                subject: $crate::enforcement::SubjectId,
            ) -> $crate::enforcement::EnforcementResult<bool> {
                let result = ::sqlx::query($crate::store::sql::RESET_POINTS)
                    .bind(subject.to_string())
                    .execute(&self.pool)
                    .await?;
                Ok(result.rows_affected() > 0)
            }

            async fn decay_violation_points(
                &self,
                idle_before: ::chrono::DateTime<::chrono::Utc>,
                decayed_before: ::chrono::DateTime<::chrono::Utc>,
                now: ::chrono::DateTime<::chrono::Utc>,
                amount: u32,
            ) -> $crate::enforcement::EnforcementResult<u64> {
                use $crate::store::sql;

                let amount = i64::from(amount);
                let result = ::sqlx::query(sql::DECAY_POINTS)
                    .bind(amount)
                    .bind(amount)
                    .bind(sql::to_millis(now))
                    .bind(sql::to_millis(idle_before))
                    .bind(sql::to_millis(decayed_before))
                    .execute(&self.pool)
                    .await?;
                Ok(result.rows_affected())
            }

            async fn health_check(&self) -> $crate::enforcement::EnforcementResult<()> {
                ::sqlx::query("SELECT 1").execute(&self.pool).await?;
                Ok(())
            }

            async fn close(&self) {
                self.pool.close().await;
            }
        }
    };
}

#[cfg(any(feature = "sqlite", feature = "mysql"))]
pub(super) use impl_sql_record_store;
