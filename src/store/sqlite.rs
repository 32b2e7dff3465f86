//! SQLite record store
//!
//! WAL journal, `synchronous = NORMAL`, and a busy timeout so several server
//! processes can share one database file. A partial unique index keeps at most
//! one unrevoked record per subject and kind.

use crate::config::DatabaseConfig;
use crate::enforcement::{EnforcementResult, NodeId};
use crate::store::sql;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool};
use std::path::Path;
use tracing::info;

/// SQL to create the records table
const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enforcement_records (
    id            TEXT PRIMARY KEY NOT NULL,
    subject_id    TEXT NOT NULL,
    kind          TEXT NOT NULL,
    reason        TEXT NOT NULL,
    issuer_id     TEXT NOT NULL,
    issued_at_ms  INTEGER NOT NULL,
    expires_at_ms INTEGER,
    revoked_at_ms INTEGER,
    revoker_id    TEXT,
    updated_at_ms INTEGER NOT NULL,
    change_seq    INTEGER NOT NULL,
    changed_by    TEXT NOT NULL
)
"#;

/// At most one unrevoked record per subject and kind
const CREATE_LIVE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ux_enforcement_live
ON enforcement_records (subject_id, kind) WHERE revoked_at_ms IS NULL
"#;

const CREATE_CHANGE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS ix_enforcement_change_seq ON enforcement_records (change_seq)";

const CREATE_SUBJECT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS ix_enforcement_subject ON enforcement_records (subject_id, issued_at_ms)";

/// One-row counter bumped inside every writing transaction
const CREATE_SEQUENCE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enforcement_sequence (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    last_seq INTEGER NOT NULL
)
"#;

const SEED_SEQUENCE: &str = "INSERT OR IGNORE INTO enforcement_sequence (id, last_seq) VALUES (1, 0)";

/// Running violation tally per subject
const CREATE_POINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS violation_points (
    subject_id        TEXT PRIMARY KEY NOT NULL,
    points            INTEGER NOT NULL,
    total_violations  INTEGER NOT NULL,
    last_violation_ms INTEGER NOT NULL,
    decayed_at_ms     INTEGER
)
"#;

const ADD_POINTS: &str = r#"
INSERT INTO violation_points (subject_id, points, total_violations, last_violation_ms)
VALUES (?, ?, 1, ?)
ON CONFLICT (subject_id) DO UPDATE SET
    points = points + excluded.points,
    total_violations = total_violations + 1,
    last_violation_ms = excluded.last_violation_ms
"#;

/// SQLite-backed record store
pub struct SqliteStore {
    pool: SqlitePool,
    node: NodeId,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `config.path` and apply the schema
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the schema cannot be applied
    pub async fn connect(config: &DatabaseConfig, node: NodeId) -> EnforcementResult<Self> {
        Self::open(&config.path, config, node).await
    }

    /// Like [`connect`](Self::connect) with an explicit path
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the schema cannot be applied
    pub async fn open(path: &Path, config: &DatabaseConfig, node: NodeId) -> EnforcementResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .max_lifetime(Some(config.max_lifetime()))
            .connect_with(options)
            .await?;

        let store = Self { pool, node };
        store.migrate().await?;
        info!(path = %path.display(), pool_size = config.pool_size, "SQLite record store ready");
        Ok(store)
    }

    /// Get a reference to the connection pool
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> EnforcementResult<()> {
        for statement in [
            CREATE_RECORDS_TABLE,
            CREATE_LIVE_INDEX,
            CREATE_CHANGE_INDEX,
            CREATE_SUBJECT_INDEX,
            CREATE_SEQUENCE_TABLE,
            SEED_SEQUENCE,
            CREATE_POINTS_TABLE,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

sql::impl_sql_record_store!(SqliteStore, Sqlite, live_lock = "", add_points = ADD_POINTS);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::{
        ActorId, EnforcementError, EnforcementKind, EnforcementRecord, EnforcementState, RecordId,
        SubjectId,
    };
    use crate::store::RecordStore;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir, node: &str) -> SqliteStore {
        let config = DatabaseConfig {
            connection_timeout_ms: 200,
            ..DatabaseConfig::default()
        };
        SqliteStore::open(&dir.path().join("enforcement.db"), &config, NodeId::from(node))
            .await
            .unwrap()
    }

    fn draft(subject: SubjectId, kind: EnforcementKind, duration: Option<Duration>) -> EnforcementRecord {
        EnforcementRecord::draft(subject, kind, "cheating", "moderator", Utc::now(), duration)
    }

    #[tokio::test]
    async fn test_issue_and_supersede() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "lobby-1").await;
        let subject = SubjectId::random();

        let first = store
            .upsert(draft(subject, EnforcementKind::Ban, Some(Duration::hours(24))))
            .await
            .unwrap()
            .record;
        assert!(first.is_persisted());
        assert_eq!(first.changed_by, NodeId::from("lobby-1"));

        let second = store
            .upsert(draft(subject, EnforcementKind::Ban, None))
            .await
            .unwrap();
        assert_eq!(second.superseded.len(), 1);
        assert_eq!(second.superseded[0].id, first.id);

        let now = Utc::now();
        let active = store.fetch_active(subject, now).await.unwrap();
        assert_eq!(active, vec![second.record.clone()]);

        let stored_first = store.fetch_record(first.id).await.unwrap().unwrap();
        assert_eq!(stored_first.status(now), EnforcementState::Revoked);
        assert_eq!(stored_first.revoker_id, Some(ActorId::from("moderator")));
        assert!(stored_first.change_seq < second.record.change_seq);
    }

    #[tokio::test]
    async fn test_unique_index_backstop() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "lobby-1").await;
        let subject = SubjectId::random();
        let live = store.upsert(draft(subject, EnforcementKind::Mute, None)).await.unwrap().record;

        // Bypass the supersede logic and write a second live row directly
        let result = sqlx::query(sql::INSERT_RECORD)
            .bind(RecordId::generate().to_string())
            .bind(subject.to_string())
            .bind("mute")
            .bind("spam")
            .bind("rogue")
            .bind(sql::to_millis(live.issued_at))
            .bind(None::<i64>)
            .bind(None::<i64>)
            .bind(None::<String>)
            .bind(sql::to_millis(live.issued_at))
            .bind(999_i64)
            .bind("rogue-node")
            .execute(store.pool())
            .await;
        let err = EnforcementError::from(result.unwrap_err());
        assert!(matches!(err, EnforcementError::ConflictViolation(_)));
    }

    #[tokio::test]
    async fn test_revoke_and_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "lobby-1").await;
        let subject = SubjectId::random();
        let record = store
            .upsert(draft(subject, EnforcementKind::Mute, Some(Duration::minutes(10))))
            .await
            .unwrap()
            .record;
        let watermark = store.latest_change_seq().await.unwrap();
        assert_eq!(watermark, record.change_seq);

        let admin = ActorId::from("admin");
        let revoked = store.revoke(record.id, Utc::now(), &admin).await.unwrap().unwrap();
        assert_eq!(revoked.revoker_id, Some(admin.clone()));
        assert_eq!(revoked.change_seq, watermark + 1);
        assert!(store.revoke(record.id, Utc::now(), &admin).await.unwrap().is_none());
        assert!(store.revoke(RecordId::generate(), Utc::now(), &admin).await.unwrap().is_none());
        // The failed revokes did not consume sequence values
        assert_eq!(store.latest_change_seq().await.unwrap(), watermark + 1);

        let changes = store.list_changed_since(watermark, 100).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, record.id);
        assert!(changes[0].revoked_at.is_some());
        assert!(store.fetch_active(subject, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_amend_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "lobby-1").await;
        let subject = SubjectId::random();
        let mut record = store
            .upsert(draft(subject, EnforcementKind::Ban, Some(Duration::hours(1))))
            .await
            .unwrap()
            .record;

        record.expires_at = record.expires_at.map(|at| at + Duration::hours(1));
        record.reason = "ignored on update".to_string();
        let amended = store.upsert(record.clone()).await.unwrap().record;
        assert_eq!(amended.expires_at, record.expires_at);
        assert_eq!(amended.reason, "cheating");
        assert!(amended.change_seq > record.change_seq);

        store.upsert(draft(subject, EnforcementKind::Warning, None)).await.unwrap();
        let history = store.history(subject, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(store.list_active(Utc::now(), 10).await.unwrap().len(), 2);

        let mut missing = amended;
        missing.id = RecordId::generate();
        assert!(matches!(
            store.upsert(missing).await,
            Err(EnforcementError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let lobby = open_store(&dir, "lobby").await;
        let survival = open_store(&dir, "survival").await;
        let subject = SubjectId::random();

        let record = survival.upsert(draft(subject, EnforcementKind::Ban, None)).await.unwrap().record;
        let seen = lobby.list_changed_since(0, 10).await.unwrap();
        assert_eq!(seen, vec![record]);
        assert_eq!(seen[0].changed_by, NodeId::from("survival"));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            pool_size: 1,
            connection_timeout_ms: 50,
            ..DatabaseConfig::default()
        };
        let store = SqliteStore::open(&dir.path().join("busy.db"), &config, NodeId::from("lobby"))
            .await
            .unwrap();

        let _held = store.pool().acquire().await.unwrap();
        let err = store
            .fetch_active(SubjectId::random(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::StoreUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_amend_does_not_reopen_remote_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let lobby = open_store(&dir, "lobby").await;
        let survival = open_store(&dir, "survival").await;
        let subject = SubjectId::random();
        let ban = lobby
            .upsert(draft(subject, EnforcementKind::Ban, Some(Duration::hours(1))))
            .await
            .unwrap()
            .record;

        // Lobby reads the ban, survival revokes it, then lobby writes its amended copy
        let mut amended = lobby.fetch_active(subject, Utc::now()).await.unwrap().remove(0);
        let revoked = survival
            .revoke(ban.id, Utc::now(), &ActorId::from("admin"))
            .await
            .unwrap()
            .unwrap();
        amended.expires_at = amended.expires_at.map(|at| at + Duration::days(7));
        amended.updated_at = Utc::now();

        assert!(matches!(
            lobby.upsert(amended).await,
            Err(EnforcementError::RecordNotFound(_))
        ));
        let stored = lobby.fetch_record(ban.id).await.unwrap().unwrap();
        assert_eq!(stored.status(Utc::now()), EnforcementState::Revoked);
        assert_eq!(stored, revoked);
        assert_eq!(lobby.latest_change_seq().await.unwrap(), revoked.change_seq);
    }

    #[tokio::test]
    async fn test_lock_contention_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let holder = open_store(&dir, "lobby").await;
        let config = DatabaseConfig {
            busy_timeout_ms: 0,
            connection_timeout_ms: 200,
            ..DatabaseConfig::default()
        };
        let impatient = SqliteStore::open(
            &dir.path().join("enforcement.db"),
            &config,
            NodeId::from("survival"),
        )
        .await
        .unwrap();

        // Hold the write lock from an open transaction
        let mut tx = holder.pool().begin().await.unwrap();
        sqlx::query(sql::BUMP_SEQUENCE).execute(&mut *tx).await.unwrap();

        let subject = SubjectId::random();
        let err = impatient
            .upsert(draft(subject, EnforcementKind::Mute, None))
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::StoreUnavailable(_)), "{err:?}");
        assert!(err.is_retryable());

        tx.rollback().await.unwrap();
        impatient.upsert(draft(subject, EnforcementKind::Mute, None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_violation_points_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let lobby = open_store(&dir, "lobby").await;
        let survival = open_store(&dir, "survival").await;
        let subject = SubjectId::random();
        let start = Utc::now();

        assert!(lobby.violation_points(subject).await.unwrap().is_none());
        lobby.add_violation_points(subject, 2, start).await.unwrap();
        let tally = survival.add_violation_points(subject, 3, start).await.unwrap();
        assert_eq!(tally.points, 5);
        assert_eq!(tally.total_violations, 2);

        // Idle for a day: both processes run the pass, points drop once
        let later = start + Duration::hours(25);
        let idle_before = later - Duration::hours(24);
        let decayed_before = later - Duration::hours(1);
        assert_eq!(lobby.decay_violation_points(idle_before, decayed_before, later, 2).await.unwrap(), 1);
        assert_eq!(survival.decay_violation_points(idle_before, decayed_before, later, 2).await.unwrap(), 0);
        let tally = lobby.violation_points(subject).await.unwrap().unwrap();
        assert_eq!(tally.points, 3);
        assert_eq!(tally.total_violations, 2);

        // Never below zero
        let much_later = later + Duration::hours(2);
        lobby
            .decay_violation_points(much_later - Duration::hours(24), much_later - Duration::hours(1), much_later, 10)
            .await
            .unwrap();
        assert_eq!(lobby.violation_points(subject).await.unwrap().unwrap().points, 0);

        lobby.add_violation_points(subject, 4, much_later).await.unwrap();
        assert!(survival.reset_violation_points(subject).await.unwrap());
        assert!(!survival.reset_violation_points(subject).await.unwrap());
        assert_eq!(lobby.violation_points(subject).await.unwrap().unwrap().points, 0);
    }
}
