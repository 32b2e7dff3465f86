//! MySQL / MariaDB record store
//!
//! MySQL has no partial indexes, so the one-live-record rule is enforced by a
//! unique index on a generated `live_key` column that is NULL once a row is
//! revoked.

use crate::config::DatabaseConfig;
use crate::enforcement::{EnforcementResult, NodeId};
use crate::store::sql;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySql, MySqlPool};
use std::str::FromStr;
use tracing::info;

const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enforcement_records (
    id            VARCHAR(36)  NOT NULL PRIMARY KEY,
    subject_id    VARCHAR(36)  NOT NULL,
    kind          VARCHAR(32)  NOT NULL,
    reason        TEXT         NOT NULL,
    issuer_id     VARCHAR(64)  NOT NULL,
    issued_at_ms  BIGINT       NOT NULL,
    expires_at_ms BIGINT       NULL,
    revoked_at_ms BIGINT       NULL,
    revoker_id    VARCHAR(64)  NULL,
    updated_at_ms BIGINT       NOT NULL,
    change_seq    BIGINT       NOT NULL,
    changed_by    VARCHAR(64)  NOT NULL,
    live_key      VARCHAR(80)  AS (IF(revoked_at_ms IS NULL, CONCAT(subject_id, ':', kind), NULL)) STORED,
    UNIQUE KEY ux_enforcement_live (live_key),
    KEY ix_enforcement_change_seq (change_seq),
    KEY ix_enforcement_subject (subject_id, issued_at_ms)
) ENGINE = InnoDB
"#;

const CREATE_SEQUENCE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enforcement_sequence (
    id       TINYINT NOT NULL PRIMARY KEY,
    last_seq BIGINT  NOT NULL
) ENGINE = InnoDB
"#;

const SEED_SEQUENCE: &str = "INSERT IGNORE INTO enforcement_sequence (id, last_seq) VALUES (1, 0)";

const CREATE_POINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS violation_points (
    subject_id        VARCHAR(36) NOT NULL PRIMARY KEY,
    points            BIGINT      NOT NULL,
    total_violations  BIGINT      NOT NULL,
    last_violation_ms BIGINT      NOT NULL,
    decayed_at_ms     BIGINT      NULL
) ENGINE = InnoDB
"#;

const ADD_POINTS: &str = r#"
INSERT INTO violation_points (subject_id, points, total_violations, last_violation_ms)
VALUES (?, ?, 1, ?)
ON DUPLICATE KEY UPDATE
    points = points + VALUES(points),
    total_violations = total_violations + 1,
    last_violation_ms = VALUES(last_violation_ms)
"#;

/// MySQL-backed record store
pub struct MySqlStore {
    pool: MySqlPool,
    node: NodeId,
}

impl MySqlStore {
    /// Connect using `config.url`, or the discrete host settings when no URL is given
    ///
    /// # Errors
    /// Returns an error if the server cannot be reached or the schema cannot be applied
    pub async fn connect(config: &DatabaseConfig, node: NodeId) -> EnforcementResult<Self> {
        let options = match &config.url {
            Some(url) => MySqlConnectOptions::from_str(url)?,
            None => MySqlConnectOptions::new()
                .host(&config.host)
                .port(config.port)
                .username(&config.username)
                .password(&config.password)
                .database(&config.database),
        };

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .max_lifetime(Some(config.max_lifetime()))
            .connect_with(options)
            .await?;

        let store = Self { pool, node };
        store.migrate().await?;
        info!(host = %config.host, database = %config.database, pool_size = config.pool_size, "MySQL record store ready");
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn migrate(&self) -> EnforcementResult<()> {
        for statement in [
            CREATE_RECORDS_TABLE,
            CREATE_SEQUENCE_TABLE,
            SEED_SEQUENCE,
            CREATE_POINTS_TABLE,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

// Bumping the counter row locks it, so writers across processes commit in sequence order
sql::impl_sql_record_store!(MySqlStore, MySql, live_lock = " FOR UPDATE", add_points = ADD_POINTS);
