use crate::model::{Release, ReservationId};
use crate::store::Store;

use super::{EngineError, ReservationEngine};

/// Releases collected during one flow and flushed together later. The
/// caller owns the batch; nothing is shared across flows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseBatch {
    ids: Vec<ReservationId>,
}

impl ReleaseBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: ReservationId) {
        self.ids.push(id);
    }

    pub fn ids(&self) -> &[ReservationId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Release everything in insertion order and empty the batch. On a store
    /// error the ids not yet released stay queued, so the call can be retried.
    pub async fn execute<S: Store>(
        &mut self,
        engine: &ReservationEngine<S>,
    ) -> Result<Vec<(ReservationId, Release)>, EngineError> {
        let mut done = Vec::with_capacity(self.ids.len());
        let queued = self.ids.clone();
        for (released, id) in queued.into_iter().enumerate() {
            match engine.release(id).await {
                Ok(release) => done.push((id, release)),
                Err(e) => {
                    self.ids.drain(..released);
                    return Err(e);
                }
            }
        }
        self.ids.clear();
        Ok(done)
    }
}

impl Extend<ReservationId> for ReleaseBatch {
    fn extend<I: IntoIterator<Item = ReservationId>>(&mut self, iter: I) {
        self.ids.extend(iter);
    }
}

impl FromIterator<ReservationId> for ReleaseBatch {
    fn from_iter<I: IntoIterator<Item = ReservationId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}
