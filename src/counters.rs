use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::keys::Keyspace;
use crate::limits::MAX_BATCH_SIZE;
use crate::model::CounterFamily;
use crate::store::{Cmd, Store, StoreError};

/// One raw entry of a counter request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountEntry {
    /// Positional id, worth one unit.
    Id(String),
    /// Keyed id with an explicit delta.
    Delta(String, i64),
}

/// A normalised batch: one delta per distinct id, in order of first
/// appearance.
///
/// Keyed deltas for an id are summed, positional units for an id are
/// summed, and an id that has any keyed delta ignores its positional
/// units. Empty ids are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterRequest {
    entries: Vec<(String, i64)>,
}

impl CounterRequest {
    pub fn single(id: impl Into<String>) -> Self {
        Self::from_entries([CountEntry::Id(id.into())])
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CountEntry>) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut keyed: HashMap<String, i64> = HashMap::new();
        let mut positional: HashMap<String, i64> = HashMap::new();

        for entry in entries {
            let (id, delta, is_keyed) = match entry {
                CountEntry::Id(id) => (id, 1, false),
                CountEntry::Delta(id, delta) => (id, delta, true),
            };
            if id.is_empty() {
                continue;
            }
            if !keyed.contains_key(&id) && !positional.contains_key(&id) {
                order.push(id.clone());
            }
            let slot = if is_keyed { &mut keyed } else { &mut positional };
            let total = slot.entry(id).or_insert(0);
            *total = total.saturating_add(delta);
        }

        let entries = order
            .into_iter()
            .map(|id| {
                let delta = keyed
                    .get(&id)
                    .or_else(|| positional.get(&id))
                    .copied()
                    .unwrap_or(0);
                (id, delta)
            })
            .collect();
        Self { entries }
    }

    /// Accept loosely shaped input: a string is one id, an object maps ids to
    /// integer deltas, an array mixes both. Anything else is skipped.
    pub fn from_json(value: &Value) -> Self {
        let mut raw = Vec::new();
        collect_json(value, &mut raw, true);
        Self::from_entries(raw)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn entries(&self) -> &[(String, i64)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn collect_json(value: &Value, out: &mut Vec<CountEntry>, top_level: bool) {
    match value {
        Value::String(id) => out.push(CountEntry::Id(id.clone())),
        Value::Object(map) => {
            for (id, delta) in map {
                if let Some(delta) = delta.as_i64() {
                    out.push(CountEntry::Delta(id.clone(), delta));
                }
            }
        }
        Value::Array(items) if top_level => {
            for item in items {
                collect_json(item, out, false);
            }
        }
        _ => {}
    }
}

impl<S: Into<String>> FromIterator<S> for CounterRequest {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_entries(iter.into_iter().map(|id| CountEntry::Id(id.into())))
    }
}

/// Counter values aligned with the request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterValues(Vec<(String, i64)>);

impl CounterValues {
    pub fn get(&self, id: &str) -> Option<i64> {
        self.0.iter().find(|(k, _)| k == id).map(|(_, v)| *v)
    }

    pub fn as_slice(&self) -> &[(String, i64)] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<(String, i64)> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
pub enum CounterError {
    Store(StoreError),
    BatchTooLarge(usize),
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterError::Store(e) => write!(f, "{e}"),
            CounterError::BatchTooLarge(n) => {
                write!(f, "counter batch of {n} exceeds {MAX_BATCH_SIZE}")
            }
        }
    }
}

impl std::error::Error for CounterError {}

impl From<StoreError> for CounterError {
    fn from(e: StoreError) -> Self {
        CounterError::Store(e)
    }
}

/// Atomic per-resource counters for the reserved and pending families.
/// Every batch is one pipelined round trip; callers never read-modify-write.
pub struct CounterService<S: Store> {
    store: Arc<S>,
    keys: Keyspace,
}

impl<S: Store> Clone for CounterService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keys: self.keys.clone(),
        }
    }
}

impl<S: Store> CounterService<S> {
    pub fn new(store: Arc<S>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Current values; a missing counter reads as 0.
    pub async fn get(
        &self,
        family: CounterFamily,
        request: &CounterRequest,
    ) -> Result<CounterValues, CounterError> {
        Self::check_size(request)?;
        let cmds = request
            .ids()
            .map(|id| Cmd::Get(self.keys.counter_key(family, id)))
            .collect();
        let replies = self.store.pipeline(cmds).await?;
        Ok(CounterValues(
            request
                .ids()
                .zip(replies)
                .map(|(id, reply)| (id.to_string(), reply.as_int().unwrap_or(0)))
                .collect(),
        ))
    }

    pub async fn get_one(&self, family: CounterFamily, id: &str) -> Result<i64, CounterError> {
        let values = self.get(family, &CounterRequest::single(id)).await?;
        Ok(values.get(id).unwrap_or(0))
    }

    /// Apply each delta and return the new values.
    pub async fn increment(
        &self,
        family: CounterFamily,
        request: &CounterRequest,
    ) -> Result<CounterValues, CounterError> {
        self.apply(family, request, 1).await
    }

    /// Apply each delta negated and return the new values.
    pub async fn decrement(
        &self,
        family: CounterFamily,
        request: &CounterRequest,
    ) -> Result<CounterValues, CounterError> {
        self.apply(family, request, -1).await
    }

    async fn apply(
        &self,
        family: CounterFamily,
        request: &CounterRequest,
        sign: i64,
    ) -> Result<CounterValues, CounterError> {
        Self::check_size(request)?;
        if request.is_empty() {
            return Ok(CounterValues::default());
        }
        let cmds = request
            .entries()
            .iter()
            .map(|(id, delta)| Cmd::IncrBy(self.keys.counter_key(family, id), delta.saturating_mul(sign)))
            .collect();
        let replies = self.store.pipeline(cmds).await?;

        let mut values = Vec::with_capacity(request.len());
        for ((id, _), reply) in request.entries().iter().zip(replies) {
            let value = reply
                .as_int()
                .ok_or(StoreError::UnexpectedReply("INCRBY without integer"))?;
            values.push((id.clone(), value));
        }
        metrics::counter!(crate::observability::COUNTER_UPDATES_TOTAL, "family" => family.label())
            .increment(values.len() as u64);
        Ok(CounterValues(values))
    }

    fn check_size(request: &CounterRequest) -> Result<(), CounterError> {
        if request.len() > MAX_BATCH_SIZE {
            return Err(CounterError::BatchTooLarge(request.len()));
        }
        Ok(())
    }
}
