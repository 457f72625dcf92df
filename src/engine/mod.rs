mod batch;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use batch::ReleaseBatch;
pub use error::EngineError;

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::counters::CounterService;
use crate::keys::Keyspace;
use crate::model::*;
use crate::store::{Reply, Store, StoreError};

/// Coordinates reservations through the shared store. Holds no reservation
/// state between calls: every instance of the service sees the same truth.
pub struct ReservationEngine<S: Store> {
    pub(super) store: Arc<S>,
    pub(super) keys: Keyspace,
    pub(super) config: EngineConfig,
}

impl<S: Store> Clone for ReservationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keys: self.keys.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> ReservationEngine<S> {
    pub fn new(store: Arc<S>, keys: Keyspace, config: EngineConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Counter service over the same store and keyspace.
    pub fn counters(&self) -> CounterService<S> {
        CounterService::new(self.store.clone(), self.keys.clone())
    }

    /// Grace added on top of the requested duration, and the minimum TTL a
    /// reservation at this depth must still have to count as valid.
    pub(super) fn grace_for(&self, depth: Depth) -> Duration {
        match depth {
            Depth::Root => self.config.grace,
            Depth::Child => self.config.child_grace(),
        }
    }
}

/// Destructure a fixed-size reply vector.
pub(super) fn replies<const N: usize>(
    replies: Vec<Reply>,
    what: &'static str,
) -> Result<[Reply; N], StoreError> {
    <[Reply; N]>::try_from(replies).map_err(|_| StoreError::UnexpectedReply(what))
}
