//! Engine configuration
//!
//! Loaded from a YAML file. Every field has a default so a partial file (or no
//! file at all) yields a working configuration.

use crate::enforcement::{EnforcementError, EnforcementResult, EscalationLadder, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const CONFIG_FILE: &str = "config/warden.yaml";
/// Environment variable that overrides [`CONFIG_FILE`]
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";

/// What fast-path queries answer when the store cannot be reached in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailSafePolicy {
    /// Treat bans and mutes as in effect
    #[default]
    Restrict,
    /// Treat the subject as unrestricted
    Permit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Sqlite,
    Mysql,
    /// Process-local store, nothing survives a restart
    Memory,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: Backend,
    /// SQLite database file
    pub path: PathBuf,
    /// Full MySQL URL; overrides host/port/database/username/password
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub pool_size: u32,
    /// How long to wait for a pooled connection before failing with `StoreUnavailable`
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    /// SQLite lock wait
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: PathBuf::from("data/enforcement.db"),
            url: None,
            host: "localhost".to_string(),
            port: 3306,
            database: "warden".to_string(),
            username: "root".to_string(),
            password: String::new(),
            pool_size: 10,
            connection_timeout_ms: 5_000,
            idle_timeout_ms: 600_000,
            max_lifetime_ms: 1_800_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

// Keeps the password out of logs
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("backend", &self.backend)
            .field("path", &self.path)
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("pool_size", &self.pool_size)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of subjects held
    pub capacity: usize,
    /// Entries older than this are refetched regardless of invalidations
    pub max_staleness_ms: u64,
    /// Load active records into the cache on start
    pub warm_on_start: bool,
    pub warm_limit: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_staleness_ms: 300_000,
            warm_on_start: true,
            warm_limit: 1_000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Upper bound on a gameplay-path query that misses the cache
    pub fast_path_timeout_ms: u64,
    pub fail_safe: FailSafePolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            fast_path_timeout_ms: 50,
            fail_safe: FailSafePolicy::Restrict,
        }
    }
}

impl QueryConfig {
    #[must_use]
    pub fn fast_path_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_path_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub poll_interval_ms: u64,
    /// Rows fetched per `list_changed_since` call
    pub batch_size: u32,
    /// Changes first seen later than this after they were made raise a lag warning
    pub lag_threshold_ms: u64,
    /// How often cached entries are swept for expiry and staleness
    pub sweep_interval_ms: u64,
    pub max_batches_per_cycle: u32,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            batch_size: 500,
            lag_threshold_ms: 30_000,
            sweep_interval_ms: 1_000,
            max_batches_per_cycle: 8,
        }
    }
}

impl PropagationConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn lag_threshold(&self) -> Duration {
        Duration::from_millis(self.lag_threshold_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Revoked and expired records older than this are purged; `None` keeps history forever
    pub keep_days: Option<u32>,
}

/// How idle violation tallies shrink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayPolicy {
    /// Quiet time after the last violation before a tally decays
    pub after: chrono::Duration,
    /// Decay pass period; one tally is lowered at most once per period
    pub interval: Duration,
    pub amount: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Violation points mapped to action strings such as `mute:10m`
    pub thresholds: BTreeMap<u32, String>,
    /// Points charged per violation category; unlisted categories weigh 1
    pub category_weights: BTreeMap<String, u32>,
    pub decay_after_ms: u64,
    /// Zero disables decay
    pub decay_interval_ms: u64,
    pub decay_amount: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            thresholds: BTreeMap::new(),
            category_weights: BTreeMap::new(),
            decay_after_ms: 86_400_000,
            decay_interval_ms: 3_600_000,
            decay_amount: 1,
        }
    }
}

impl EscalationConfig {
    /// Points one violation of `category` is worth
    #[must_use]
    pub fn weight_for(&self, category: &str) -> u32 {
        self.category_weights
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(category))
            .map_or(1, |(_, weight)| *weight)
    }

    /// `None` when decay is switched off
    #[must_use]
    pub fn decay_policy(&self) -> Option<DecayPolicy> {
        if self.decay_interval_ms == 0 || self.decay_amount == 0 {
            return None;
        }
        Some(DecayPolicy {
            after: chrono::Duration::milliseconds(i64::try_from(self.decay_after_ms).unwrap_or(i64::MAX)),
            interval: Duration::from_millis(self.decay_interval_ms),
            amount: self.decay_amount,
        })
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of this server process, recorded on every row it writes
    pub node_id: NodeId,
    pub log_dir: PathBuf,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub propagation: PropagationConfig,
    pub retention: RetentionConfig,
    pub escalation: EscalationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::random(),
            log_dir: PathBuf::from("logs"),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            query: QueryConfig::default(),
            propagation: PropagationConfig::default(),
            retention: RetentionConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or fails validation
    pub async fn load(path: impl AsRef<Path>) -> EnforcementResult<Self> {
        let config = match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(contents) => serde_yaml::from_str::<Self>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file, creating its directory if needed
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the file written
    pub async fn save(&self, path: impl AsRef<Path>) -> EnforcementResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let yaml = serde_yaml::to_string(self)?;
        tokio::fs::write(path, yaml).await?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    /// Returns `Config` naming the first offending field
    pub fn validate(&self) -> EnforcementResult<()> {
        let fail = |msg: &str| Err(EnforcementError::Config(msg.to_string()));

        if self.node_id.as_str().is_empty() {
            return fail("node_id must not be empty");
        }
        if self.database.pool_size == 0 {
            return fail("database.pool_size must be at least 1");
        }
        if self.cache.capacity == 0 {
            return fail("cache.capacity must be at least 1");
        }
        if self.query.fast_path_timeout_ms == 0 {
            return fail("query.fast_path_timeout_ms must be positive");
        }
        if self.propagation.batch_size == 0 || self.propagation.max_batches_per_cycle == 0 {
            return fail("propagation.batch_size and max_batches_per_cycle must be at least 1");
        }
        if self.propagation.poll_interval_ms == 0 || self.propagation.sweep_interval_ms == 0 {
            return fail("propagation intervals must be positive");
        }
        if self.cache.max_staleness_ms < self.propagation.poll_interval_ms {
            return fail("cache.max_staleness_ms must not be shorter than propagation.poll_interval_ms");
        }
        if self.escalation.category_weights.values().any(|weight| *weight == 0) {
            return fail("escalation.category_weights must be at least 1");
        }
        if i64::try_from(self.escalation.decay_after_ms).is_err() {
            return fail("escalation.decay_after_ms is out of range");
        }
        self.escalation_ladder()?;
        Ok(())
    }

    /// Parsed escalation ladder
    ///
    /// # Errors
    /// Returns `ValidationFailed` if an action string does not parse
    pub fn escalation_ladder(&self) -> EnforcementResult<EscalationLadder> {
        EscalationLadder::from_config(&self.escalation.thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::{EnforcementAction, EnforcementKind};

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.database.pool_size, 10);
        assert_eq!(config.database.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache.capacity, 1_000);
        assert_eq!(config.query.fail_safe, FailSafePolicy::Restrict);
        assert!(config.node_id.as_str().starts_with("node-"));
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
node_id: lobby-1
database:
  backend: mysql
  host: db.internal
  password: hunter2
query:
  fail_safe: permit
escalation:
  thresholds:
    3: warn
    10: "ban:1d"
  category_weights:
    hate: 3
  decay_interval_ms: 0
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_id, NodeId::from("lobby-1"));
        assert_eq!(config.database.backend, Backend::Mysql);
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.query.fail_safe, FailSafePolicy::Permit);
        assert_eq!(config.cache, CacheConfig::default());
        assert!(!format!("{:?}", config.database).contains("hunter2"));

        let ladder = config.escalation_ladder().unwrap();
        assert_eq!(ladder.action_for(4).unwrap().kind, EnforcementKind::Warning);
        assert_eq!(
            ladder.action_for(11),
            Some(&EnforcementAction::ban(chrono::Duration::days(1)))
        );

        assert_eq!(config.escalation.weight_for("HATE"), 3);
        assert_eq!(config.escalation.weight_for("spam"), 1);
        assert_eq!(config.escalation.decay_amount, 1);
        assert!(config.escalation.decay_policy().is_none());
    }

    #[test]
    fn test_default_decay_policy() {
        let policy = EngineConfig::default().escalation.decay_policy().unwrap();
        assert_eq!(policy.after, chrono::Duration::hours(24));
        assert_eq!(policy.interval, Duration::from_secs(3_600));
        assert_eq!(policy.amount, 1);
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.cache.capacity = 0;
        assert!(matches!(config.validate(), Err(EnforcementError::Config(_))));

        let mut config = EngineConfig::default();
        config.cache.max_staleness_ms = 500;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.escalation.thresholds.insert(5, "banish".to_string());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.escalation.category_weights.insert("spam".to_string(), 0);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warden.yaml");

        // Missing file falls back to defaults
        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded.database, DatabaseConfig::default());

        let mut config = EngineConfig::default();
        config.propagation.poll_interval_ms = 500;
        config.save(&path).await.unwrap();

        let reloaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(reloaded, config);

        tokio::fs::write(&path, "cache: [not, a, map]").await.unwrap();
        assert!(matches!(
            EngineConfig::load(&path).await,
            Err(EnforcementError::Yaml(_))
        ));
    }
}
