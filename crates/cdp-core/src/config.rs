//! Configuration types for the engine, the profile lock and the merge engine.
//!
//! Every struct deserializes with defaults for missing fields, so a partial
//! JSON/TOML document is enough. [`PlatformConfig::from_env`] reads the
//! `PROFILEFLOW_*` environment variables on top of the defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    Invalid { var: String, value: String },
}

// ============================================================================
// ENGINE
// ============================================================================

/// Configuration for flow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout per node invocation in milliseconds (0 disables it).
    ///
    /// An expired invocation is dropped mid-flight, so only enable this for
    /// actions that tolerate being cut off.
    pub node_timeout_ms: u64,
    /// Persist the trace even when the flow is not in debug mode.
    pub always_persist_trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 0,
            always_persist_trace: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.node_timeout_ms = timeout_ms;
        self
    }

    pub fn with_always_persist_trace(mut self, enabled: bool) -> Self {
        self.always_persist_trace = enabled;
        self
    }

    /// Node timeout, `None` when disabled.
    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_ms > 0).then(|| Duration::from_millis(self.node_timeout_ms))
    }
}

// ============================================================================
// LOCK
// ============================================================================

/// Configuration for the distributed mutex.
///
/// Deserialization rejects a zero lifetime (`lock_ttl_ms + default_tolerance_ms`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LockConfigDoc")]
pub struct LockConfig {
    /// TTL of the lock record in milliseconds.
    pub lock_ttl_ms: u64,
    /// Extra time a contender waits past the TTL before breaking in.
    pub default_tolerance_ms: u64,
    /// Explicit break-in grace; overrides `lock_ttl_ms + default_tolerance_ms`.
    pub break_after_ms: Option<u64>,
    /// Sleep between polls while waiting for a held lock.
    pub poll_interval_ms: u64,
    /// Fail immediately instead of waiting when the key is held.
    pub raise_error_when_locked: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 5_000,
            default_tolerance_ms: 1_000,
            break_after_ms: None,
            poll_interval_ms: 50,
            raise_error_when_locked: false,
        }
    }
}

impl LockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.lock_ttl_ms = ttl_ms;
        self
    }

    pub fn with_tolerance_ms(mut self, tolerance_ms: u64) -> Self {
        self.default_tolerance_ms = tolerance_ms;
        self
    }

    pub fn with_break_after_ms(mut self, break_after_ms: u64) -> Self {
        self.break_after_ms = Some(break_after_ms);
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_ms: u64) -> Self {
        self.poll_interval_ms = poll_ms;
        self
    }

    pub fn with_raise_error_when_locked(mut self, enabled: bool) -> Self {
        self.raise_error_when_locked = enabled;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.default_tolerance_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Check that a lock written with this config can live at all.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when TTL and tolerance are both zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_ttl_ms.saturating_add(self.default_tolerance_ms) == 0 {
            return Err(ConfigError::Invalid {
                var: "lock_ttl_ms + default_tolerance_ms".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct LockConfigDoc {
    lock_ttl_ms: u64,
    default_tolerance_ms: u64,
    break_after_ms: Option<u64>,
    poll_interval_ms: u64,
    raise_error_when_locked: bool,
}

impl Default for LockConfigDoc {
    fn default() -> Self {
        let d = LockConfig::default();
        Self {
            lock_ttl_ms: d.lock_ttl_ms,
            default_tolerance_ms: d.default_tolerance_ms,
            break_after_ms: d.break_after_ms,
            poll_interval_ms: d.poll_interval_ms,
            raise_error_when_locked: d.raise_error_when_locked,
        }
    }
}

impl TryFrom<LockConfigDoc> for LockConfig {
    type Error = ConfigError;

    fn try_from(doc: LockConfigDoc) -> Result<Self, Self::Error> {
        let config = Self {
            lock_ttl_ms: doc.lock_ttl_ms,
            default_tolerance_ms: doc.default_tolerance_ms,
            break_after_ms: doc.break_after_ms,
            poll_interval_ms: doc.poll_interval_ms,
            raise_error_when_locked: doc.raise_error_when_locked,
        };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// MERGE
// ============================================================================

/// How conflicting scalar leaves are resolved during a profile merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The later profile in merge order wins.
    #[default]
    LastWins,
    /// The earlier profile in merge order wins.
    FirstWins,
}

/// How list-valued fields are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListMergeRule {
    /// Concatenate and drop repeated items (JSON equality).
    #[default]
    Unique,
    /// Concatenate and keep every item.
    KeepAll,
}

/// Configuration for profile deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Dot-paths into the profile used to find duplicates.
    pub merge_keys: Vec<String>,
    /// Maximum number of candidates fetched per merge.
    pub max_candidates: usize,
    pub conflict_strategy: ConflictStrategy,
    pub list_rule: ListMergeRule,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_keys: vec!["data.contact.email".into()],
            max_candidates: 1_000,
            conflict_strategy: ConflictStrategy::LastWins,
            list_rule: ListMergeRule::Unique,
        }
    }
}

impl MergeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merge_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_list_rule(mut self, rule: ListMergeRule) -> Self {
        self.list_rule = rule;
        self
    }
}

// ============================================================================
// PLATFORM
// ============================================================================

/// Top-level configuration of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Name this worker writes into lock records.
    pub worker_name: String,
    /// Redis URL for the shared lock store.
    pub redis_url: Option<String>,
    pub engine: EngineConfig,
    pub lock: LockConfig,
    pub merge: MergeConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            worker_name: format!("worker-{}", std::process::id()),
            redis_url: None,
            engine: EngineConfig::default(),
            lock: LockConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl PlatformConfig {
    /// Load from `PROFILEFLOW_*` environment variables on top of defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric or boolean variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("PROFILEFLOW_WORKER_NAME") {
            config.worker_name = name;
        }
        config.redis_url = lookup("PROFILEFLOW_REDIS_URL").or(config.redis_url);

        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_NODE_TIMEOUT_MS")? {
            config.engine.node_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_ALWAYS_PERSIST_TRACE")? {
            config.engine.always_persist_trace = v;
        }
        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_LOCK_TTL_MS")? {
            config.lock.lock_ttl_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_LOCK_TOLERANCE_MS")? {
            config.lock.default_tolerance_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_LOCK_BREAK_AFTER_MS")? {
            config.lock.break_after_ms = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_LOCK_POLL_MS")? {
            config.lock.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_LOCK_FAIL_FAST")? {
            config.lock.raise_error_when_locked = v;
        }
        if let Some(keys) = lookup("PROFILEFLOW_MERGE_KEYS") {
            config.merge.merge_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = parse_var(&lookup, "PROFILEFLOW_MERGE_MAX_CANDIDATES")? {
            config.merge.max_candidates = v;
        }

        config.lock.validate()?;
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
