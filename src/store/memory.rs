use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::notify::ExpiryHub;

use super::{Cmd, ExpiryStream, Reply, Store, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn string(value: String, expires_at: Option<Instant>) -> Self {
        Self {
            value: Value::Str(value),
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Failure injected into the in-process store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Every call fails as if the connection dropped.
    Unavailable,
    /// Only commands writing hash collections fail.
    HashWrites,
}

/// In-process store with the same semantics as the Redis adapter. One lock
/// over the keyspace makes every transaction atomic. TTLs run on tokio time,
/// so tests can drive expiry with a paused clock.
pub struct MemoryStore {
    keys: Mutex<HashMap<String, Entry>>,
    hub: ExpiryHub,
    failure: StdMutex<Option<Failure>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            hub: ExpiryHub::new(),
            failure: StdMutex::new(None),
        }
    }

    pub fn inject_failure(&self, failure: Failure) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = Some(failure);
        }
    }

    pub fn clear_failure(&self) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = None;
        }
    }

    fn failure(&self) -> Option<Failure> {
        self.failure.lock().ok().and_then(|slot| *slot)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        match self.failure() {
            Some(Failure::Unavailable) => {
                Err(StoreError::Connection("injected: store unavailable".into()))
            }
            _ => Ok(()),
        }
    }

    /// Live keys, sorted. Expired keys are purged first.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys = self.keys.lock().await;
        self.purge_all(&mut keys, Instant::now());
        let mut names: Vec<String> = keys.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove every expired key and publish an expiry event for each.
    pub async fn sweep(&self) -> usize {
        let mut keys = self.keys.lock().await;
        self.purge_all(&mut keys, Instant::now())
    }

    /// Background task that periodically sweeps expired keys. Stops once the
    /// store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else { break };
                let swept = store.sweep().await;
                if swept > 0 {
                    tracing::debug!(swept, "memory store expired keys");
                }
            }
        })
    }

    fn purge_all(&self, keys: &mut HashMap<String, Entry>, now: Instant) -> usize {
        let expired: Vec<String> = keys
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            keys.remove(key);
            self.hub.send(key);
        }
        expired.len()
    }

    fn purge_key(&self, keys: &mut HashMap<String, Entry>, key: &str, now: Instant) {
        if keys.get(key).is_some_and(|e| e.is_expired(now)) {
            keys.remove(key);
            self.hub.send(key);
        }
    }

    fn apply(
        &self,
        keys: &mut HashMap<String, Entry>,
        cmd: Cmd,
        now: Instant,
    ) -> Result<Reply, StoreError> {
        match cmd {
            Cmd::Get(key) => {
                self.purge_key(keys, &key, now);
                read_string(keys.get(&key))
            }
            Cmd::Set(key, value) => {
                keys.insert(key, Entry::string(value, None));
                Ok(Reply::Ok)
            }
            Cmd::GetSet(key, value) => {
                self.purge_key(keys, &key, now);
                let prior = read_string(keys.get(&key))?;
                keys.insert(key, Entry::string(value, None));
                Ok(prior)
            }
            Cmd::SetPx(key, value, ttl_ms) => {
                let expires_at = now + Duration::from_millis(ttl_ms);
                keys.insert(key, Entry::string(value, Some(expires_at)));
                Ok(Reply::Ok)
            }
            Cmd::SetNxPx(key, value, ttl_ms) => {
                self.purge_key(keys, &key, now);
                if keys.contains_key(&key) {
                    return Ok(Reply::Nil);
                }
                let expires_at = now + Duration::from_millis(ttl_ms);
                keys.insert(key, Entry::string(value, Some(expires_at)));
                Ok(Reply::Ok)
            }
            Cmd::IncrBy(key, delta) => {
                self.purge_key(keys, &key, now);
                let (current, expires_at) = match keys.get(&key) {
                    None => (0, None),
                    Some(Entry {
                        value: Value::Str(s),
                        expires_at,
                    }) => {
                        let n = s.parse::<i64>().map_err(|_| {
                            StoreError::Command(format!("value at {key} is not an integer"))
                        })?;
                        (n, *expires_at)
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| StoreError::Command(format!("increment overflow at {key}")))?;
                keys.insert(key, Entry::string(next.to_string(), expires_at));
                Ok(Reply::Int(next))
            }
            Cmd::Del(key) => {
                self.purge_key(keys, &key, now);
                Ok(Reply::Int(i64::from(keys.remove(&key).is_some())))
            }
            Cmd::PTtl(key) => {
                self.purge_key(keys, &key, now);
                let ttl = match keys.get(&key) {
                    None => -2,
                    Some(Entry {
                        expires_at: None, ..
                    }) => -1,
                    Some(Entry {
                        expires_at: Some(at),
                        ..
                    }) => i64::try_from(at.saturating_duration_since(now).as_millis())
                        .unwrap_or(i64::MAX),
                };
                Ok(Reply::Int(ttl))
            }
            Cmd::HSet(key, fields) => {
                if self.failure() == Some(Failure::HashWrites) {
                    return Err(StoreError::Command(format!("injected: HSET {key} failed")));
                }
                self.purge_key(keys, &key, now);
                let entry = keys.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::Hash(BTreeMap::new()),
                    expires_at: None,
                });
                let Value::Hash(hash) = &mut entry.value else {
                    return Err(wrong_type(&key));
                };
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                Ok(Reply::Int(added))
            }
        }
    }
}

fn read_string(entry: Option<&Entry>) -> Result<Reply, StoreError> {
    match entry {
        None => Ok(Reply::Nil),
        Some(Entry {
            value: Value::Str(s),
            ..
        }) => Ok(Reply::Str(s.clone())),
        Some(_) => Err(StoreError::Command(
            "WRONGTYPE operation against a key holding the wrong kind of value".into(),
        )),
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE {key} holds the wrong kind of value"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn transaction(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError> {
        self.check_available()?;
        let mut keys = self.keys.lock().await;
        let now = Instant::now();
        cmds.into_iter()
            .map(|cmd| self.apply(&mut keys, cmd, now))
            .collect()
    }

    async fn pipeline(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError> {
        self.check_available()?;
        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            // Released between commands: a pipeline is not atomic.
            let mut keys = self.keys.lock().await;
            replies.push(self.apply(&mut keys, cmd, Instant::now())?);
        }
        Ok(replies)
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<(String, String)>), StoreError> {
        self.check_available()?;
        let mut keys = self.keys.lock().await;
        self.purge_key(&mut keys, key, Instant::now());
        let hash = match keys.get(key) {
            None => return Ok((0, Vec::new())),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => hash,
            Some(_) => return Err(wrong_type(key)),
        };
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        let page: Vec<(String, String)> = hash
            .iter()
            .skip(start)
            .take(count.max(1))
            .map(|(f, v)| (f.clone(), v.clone()))
            .collect();
        let end = start.saturating_add(count.max(1));
        let next = if end >= hash.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn expired_keys(&self) -> Result<ExpiryStream, StoreError> {
        self.check_available()?;
        Ok(self.hub.subscribe())
    }
}
