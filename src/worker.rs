use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::ReservationEngine;
use crate::model::{Release, ReleaseTask, ReservationId};
use crate::observability;
use crate::store::Store;

/// Consumes release tasks and runs them against the engine, at most
/// `max_in_flight` at a time. A task for a reservation that is already
/// being released is dropped; the running release covers it.
pub struct ReleaseWorker<S: Store> {
    engine: ReservationEngine<S>,
    tasks: mpsc::Receiver<ReleaseTask>,
    max_in_flight: usize,
    in_flight: Arc<DashMap<ReservationId, Instant>>,
}

impl<S: Store> ReleaseWorker<S> {
    pub fn new(
        engine: ReservationEngine<S>,
        tasks: mpsc::Receiver<ReleaseTask>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            engine,
            tasks,
            max_in_flight: max_in_flight.max(1),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Runs until every sender is dropped and the running releases finish.
    pub async fn run(mut self) {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut running = JoinSet::new();

        while let Some(task) = self.tasks.recv().await {
            let id = task.reservation_id;
            match self.in_flight.entry(id) {
                Entry::Occupied(_) => {
                    debug!(reservation = %id, "release already in flight");
                    metrics::counter!(observability::RELEASE_TASKS_DEDUPED_TOTAL).increment(1);
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(Instant::now());
                }
            }

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            metrics::gauge!(observability::RELEASES_IN_FLIGHT).increment(1.0);

            let engine = self.engine.clone();
            let in_flight = self.in_flight.clone();
            running.spawn(async move {
                let _permit = permit;
                let outcome = engine.release(id).await;
                let started = in_flight.remove(&id).map(|(_, at)| at);
                metrics::gauge!(observability::RELEASES_IN_FLIGHT).decrement(1.0);
                log_outcome(id, started, outcome);
            });

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "release task panicked");
                }
            }
        }

        info!(in_flight = running.len(), "release queue closed, draining");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "release task panicked");
            }
        }
        info!("release worker stopped");
    }
}

fn log_outcome(
    id: ReservationId,
    started: Option<Instant>,
    outcome: Result<Release, crate::engine::EngineError>,
) {
    let elapsed_ms = started.map(|at| at.elapsed().as_millis() as u64);
    match outcome {
        Ok(Release::Released { anomalies }) if anomalies.is_empty() => {
            info!(reservation = %id, ?elapsed_ms, "expired reservation released");
        }
        Ok(Release::Released { anomalies }) => {
            warn!(
                reservation = %id,
                anomalies = anomalies.len(),
                ?elapsed_ms,
                "expired reservation released with anomalies"
            );
        }
        Ok(Release::NotFound) => {
            debug!(reservation = %id, "expired reservation already released");
        }
        // The id-key outlives a failed release, so an explicit release
        // resumes it once the lease is dropped or lapses.
        Err(e) => error!(reservation = %id, error = %e, "release of expired reservation failed"),
    }
}
