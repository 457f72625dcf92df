use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::keys::Keyspace;
use crate::model::ReleaseTask;
use crate::observability;
use crate::store::Store;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Turns store expiry events into release tasks.
///
/// The subscription covers every expiring key in the store; events for keys
/// outside the reservation keyspace are counted and dropped. A lost
/// subscription is re-established with exponential backoff.
pub struct ExpiryWatcher<S: Store> {
    store: Arc<S>,
    keys: Keyspace,
    tasks: mpsc::Sender<ReleaseTask>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl<S: Store> ExpiryWatcher<S> {
    pub fn new(store: Arc<S>, keys: Keyspace, tasks: mpsc::Sender<ReleaseTask>) -> Self {
        Self {
            store,
            keys,
            tasks,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Runs until the task channel's receiver is dropped.
    pub async fn run(self) {
        let mut delay = self.initial_backoff;
        loop {
            match self.store.expired_keys().await {
                Ok(mut events) => {
                    info!("subscribed to expiry events");
                    delay = self.initial_backoff;
                    loop {
                        tokio::select! {
                            _ = self.tasks.closed() => {
                                info!("release queue closed, expiry watcher stopping");
                                return;
                            }
                            event = events.next() => match event {
                                Some(Ok(key)) => {
                                    if !self.forward(&key).await {
                                        info!("release queue closed, expiry watcher stopping");
                                        return;
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "expiry subscription failed");
                                    break;
                                }
                                None => {
                                    warn!("expiry subscription ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "cannot subscribe to expiry events"),
            }

            metrics::counter!(observability::EXPIRY_RESUBSCRIBES_TOTAL).increment(1);
            debug!(delay_ms = delay.as_millis() as u64, "resubscribing after backoff");
            tokio::select! {
                _ = self.tasks.closed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.max_backoff);
        }
    }

    /// Queue a release for `key` if it is a reservation TTL key. Returns
    /// false once nobody is consuming tasks.
    async fn forward(&self, key: &str) -> bool {
        let Some(reservation_id) = self.keys.reservation_from_expired(key) else {
            metrics::counter!(observability::EXPIRY_EVENTS_TOTAL, "kind" => "other").increment(1);
            return true;
        };
        metrics::counter!(observability::EXPIRY_EVENTS_TOTAL, "kind" => "reservation")
            .increment(1);
        debug!(reservation = %reservation_id, "reservation expired");
        self.tasks.send(ReleaseTask { reservation_id }).await.is_ok()
    }
}
