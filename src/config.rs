use std::str::FromStr;
use std::time::Duration;

use crate::keys::{
    DEFAULT_PENDING_PREFIX, DEFAULT_RESERVATION_PREFIX, DEFAULT_RESERVED_PREFIX, Keyspace,
};
use crate::limits::{DEFAULT_RELEASE_CONCURRENCY, DEFAULT_TASK_QUEUE, SCAN_PAGE_SIZE};

/// What `reserve` does when the child collection cannot be written after
/// the reservation itself was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildWritePolicy {
    /// Release the fresh reservation and surface the store error.
    #[default]
    Rollback,
    /// Keep the reservation; children are best-effort.
    KeepParent,
}

impl FromStr for ChildWritePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rollback" => Ok(Self::Rollback),
            "keep_parent" | "keep-parent" | "keep" => Ok(Self::KeepParent),
            other => Err(ConfigError::Invalid {
                var: "HOLDTREE_CHILD_WRITE_POLICY",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Tuning for the reservation engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Extra TTL beyond the requested duration, absorbing clock/network skew.
    pub grace: Duration,
    /// Children live `grace * child_grace_multiplier` past their duration so
    /// the root always expires first.
    pub child_grace_multiplier: u32,
    pub child_write_policy: ChildWritePolicy,
    pub scan_page_size: usize,
    /// How long a release may run before another caller can take it over.
    /// A failed release keeps its lease until it lapses if the store could
    /// not be reached to drop it.
    pub release_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(15),
            child_grace_multiplier: 3,
            child_write_policy: ChildWritePolicy::default(),
            scan_page_size: SCAN_PAGE_SIZE,
            release_lease: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn child_grace(&self) -> Duration {
        self.grace * self.child_grace_multiplier.max(1)
    }
}

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub keyspace: Keyspace,
    pub engine: EngineConfig,
    /// Default hold time for resource kinds that do not pick their own.
    pub reservation_time: Duration,
    pub release_concurrency: usize,
    pub task_queue: usize,
    /// Issue `CONFIG SET notify-keyspace-events Ex` at startup.
    pub configure_notifications: bool,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".into(),
            keyspace: Keyspace::default(),
            engine: EngineConfig::default(),
            reservation_time: Duration::from_secs(20 * 60),
            release_concurrency: DEFAULT_RELEASE_CONCURRENCY,
            task_queue: DEFAULT_TASK_QUEUE,
            configure_notifications: false,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unparsable numbers fall back to the
    /// defaults; an unknown child-write policy is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        let keyspace = Keyspace::new(
            lookup("HOLDTREE_RESERVATION_PREFIX").unwrap_or_else(|| DEFAULT_RESERVATION_PREFIX.into()),
            lookup("HOLDTREE_RESERVED_PREFIX").unwrap_or_else(|| DEFAULT_RESERVED_PREFIX.into()),
            lookup("HOLDTREE_PENDING_PREFIX").unwrap_or_else(|| DEFAULT_PENDING_PREFIX.into()),
        );

        let child_write_policy = match lookup("HOLDTREE_CHILD_WRITE_POLICY") {
            Some(s) => s.parse()?,
            None => defaults.engine.child_write_policy,
        };

        let engine = EngineConfig {
            grace: parsed("HOLDTREE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.engine.grace),
            child_grace_multiplier: parsed("HOLDTREE_CHILD_GRACE_MULTIPLIER")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.engine.child_grace_multiplier),
            child_write_policy,
            scan_page_size: defaults.engine.scan_page_size,
            release_lease: parsed("HOLDTREE_RELEASE_LEASE_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.engine.release_lease),
        };

        Ok(Self {
            redis_url: lookup("HOLDTREE_REDIS_URL").unwrap_or(defaults.redis_url),
            keyspace,
            engine,
            reservation_time: parsed("RESERVATION_DURATION")
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(defaults.reservation_time),
            release_concurrency: parsed("HOLDTREE_RELEASE_CONCURRENCY")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.release_concurrency),
            task_queue: parsed("HOLDTREE_TASK_QUEUE")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.task_queue),
            configure_notifications: lookup("HOLDTREE_CONFIGURE_NOTIFICATIONS")
                .is_some_and(|s| matches!(s.trim(), "1" | "true" | "yes")),
            metrics_port: lookup("HOLDTREE_METRICS_PORT").and_then(|s| s.parse().ok()),
        })
    }
}
