use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::store::StoreError;

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast hub for key-expiry events of the in-process store.
pub struct ExpiryHub {
    sender: broadcast::Sender<String>,
}

impl Default for ExpiryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to every expired key from now on.
    pub fn subscribe(&self) -> BoxStream<'static, Result<String, StoreError>> {
        let rx = self.sender.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(key) => return Some((Ok(key), rx)),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "expiry subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Publish an expired key. No-op if nobody is listening.
    pub fn send(&self, key: &str) {
        let _ = self.sender.send(key.to_string());
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
