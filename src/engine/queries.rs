use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::limits::*;
use crate::model::*;
use crate::store::{Cmd, Store};

use super::{EngineError, ReservationEngine, replies};

impl<S: Store> ReservationEngine<S> {
    /// Whether `id` still holds `resource_id`, with at least the grace for
    /// its depth left on the clock, and every descendant passes the same
    /// check. Stops at the first failing child.
    pub async fn check_reservation(
        &self,
        resource_id: &str,
        id: ReservationId,
        depth: Depth,
    ) -> Result<Check, EngineError> {
        self.check_node(resource_id, id, depth, 0).await
    }

    fn check_node<'a>(
        &'a self,
        resource_id: &'a str,
        id: ReservationId,
        depth: Depth,
        level: usize,
    ) -> BoxFuture<'a, Result<Check, EngineError>> {
        async move {
            if level > MAX_TREE_DEPTH {
                return Ok(Check::Invalid(InvalidReason::TooDeep));
            }

            let result = self
                .store
                .pipeline(vec![
                    Cmd::Get(self.keys.id_key(&id)),
                    Cmd::PTtl(self.keys.ttl_key(&id)),
                ])
                .await?;
            let [stored, ttl] = replies::<2>(result, "check")?;

            let Some(stored) = stored.into_string() else {
                return Ok(Check::NotFound);
            };
            if stored != resource_id {
                return Ok(Check::Invalid(InvalidReason::ResourceMismatch { stored }));
            }
            match ttl.as_int() {
                // No TTL at all: nothing can lapse.
                Some(-1) => {}
                Some(ms) if ms >= 0 => {
                    let remaining = Duration::from_millis(ms.unsigned_abs());
                    if remaining < self.grace_for(depth) {
                        return Ok(Check::Invalid(InvalidReason::GraceElapsed { remaining }));
                    }
                }
                _ => return Ok(Check::Invalid(InvalidReason::Expired)),
            }

            let children_key = self.keys.children_key(&id);
            let mut cursor = 0;
            loop {
                let (next, page) = self
                    .store
                    .hscan(&children_key, cursor, self.config.scan_page_size)
                    .await?;
                for (child_id, child_resource) in page {
                    let Ok(child_id) = child_id.parse::<ReservationId>() else {
                        return Ok(Check::Invalid(InvalidReason::MalformedChild(child_id)));
                    };
                    let check = self
                        .check_node(&child_resource, child_id, Depth::Child, level + 1)
                        .await?;
                    if !check.is_valid() {
                        tracing::debug!(reservation = %id, child = %child_id, ?check, "child invalid");
                        return Ok(Check::Invalid(InvalidReason::Child(child_id)));
                    }
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            Ok(Check::Valid)
        }
        .boxed()
    }
}
