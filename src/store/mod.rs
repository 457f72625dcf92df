mod memory;
mod redis_store;

pub use memory::{Failure, MemoryStore};
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of expired key names.
pub type ExpiryStream = BoxStream<'static, Result<String, StoreError>>;

/// The commands the engine issues. Kept closed so both adapters can agree
/// on reply shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Get(String),
    Set(String, String),
    /// Swap in a value and return the previous one.
    GetSet(String, String),
    /// Set with a TTL in milliseconds.
    SetPx(String, String, u64),
    /// Set with a TTL in milliseconds only if the key is absent. `Ok` when
    /// set, `Nil` when the key was already there.
    SetNxPx(String, String, u64),
    IncrBy(String, i64),
    Del(String),
    /// Remaining TTL in ms; -1 when the key has none, -2 when it is missing.
    PTtl(String),
    HSet(String, Vec<(String, String)>),
}

impl Cmd {
    pub fn ttl_ms(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Str(String),
    Ok,
}

impl Reply {
    pub fn into_string(self) -> Option<String> {
        match self {
            Reply::Str(s) => Some(s),
            Reply::Int(n) => Some(n.to_string()),
            Reply::Nil | Reply::Ok => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            Reply::Str(s) => s.parse().ok(),
            Reply::Nil | Reply::Ok => None,
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Connection(String),
    Command(String),
    UnexpectedReply(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connection(e) => write!(f, "store unavailable: {e}"),
            StoreError::Command(e) => write!(f, "store command failed: {e}"),
            StoreError::UnexpectedReply(what) => write!(f, "unexpected store reply: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A remote key-value store with TTLs, transactions, pipelines, hash scans
/// and expiry notifications. Shared by every service instance, so it is the
/// only source of truth.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Apply all commands atomically. One reply per command.
    async fn transaction(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError>;

    /// Send all commands in one round trip, without atomicity.
    async fn pipeline(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError>;

    /// One page of a hash scan. A returned cursor of 0 ends the scan; an
    /// empty page with a non-zero cursor does not.
    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<(String, String)>), StoreError>;

    /// Subscribe to expiry events for every key.
    async fn expired_keys(&self) -> Result<ExpiryStream, StoreError>;
}

/// Walk a hash to completion, tolerating empty intermediate pages.
pub async fn hscan_all<S: Store + ?Sized>(
    store: &S,
    key: &str,
    count: usize,
) -> Result<Vec<(String, String)>, StoreError> {
    let mut cursor = 0;
    let mut entries = Vec::new();
    loop {
        let (next, page) = store.hscan(key, cursor, count).await?;
        entries.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(entries)
}
