use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};

use crate::config::ChildWritePolicy;
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, depth_label};
use crate::store::{Cmd, Reply, Store, hscan_all};

use super::{EngineError, ReservationEngine, replies};

impl<S: Store> ReservationEngine<S> {
    /// Hold one unit of `resource_id` for `duration` under a fresh id.
    ///
    /// `children` must already be live reservations; they are attached to
    /// the new one and released with it. On failure they stay untouched and
    /// belong to the caller.
    pub async fn reserve(
        &self,
        resource_id: &str,
        duration: Duration,
        children: &[ChildReservation],
        depth: Depth,
    ) -> Result<ReservationId, EngineError> {
        self.reserve_as(ReservationId::new(), resource_id, duration, children, depth)
            .await
    }

    /// Like [`reserve`](Self::reserve) with a caller-chosen id. Returns
    /// `EngineError::Conflict` if the id is already in use, leaving the
    /// reserved count as it was.
    pub async fn reserve_as(
        &self,
        id: ReservationId,
        resource_id: &str,
        duration: Duration,
        children: &[ChildReservation],
        depth: Depth,
    ) -> Result<ReservationId, EngineError> {
        if children.len() > MAX_CHILDREN {
            return Err(EngineError::LimitExceeded("too many child reservations"));
        }
        let started = Instant::now();
        let id_key = self.keys.id_key(&id);
        let ttl_key = self.keys.ttl_key(&id);
        let counter_key = self.keys.counter_key(CounterFamily::Reserved, resource_id);
        let ttl = duration + self.grace_for(depth);

        // The TTL key is read before it is overwritten so a collision can
        // put it back.
        let result = self
            .store
            .transaction(vec![
                Cmd::GetSet(id_key.clone(), resource_id.to_string()),
                Cmd::Get(ttl_key.clone()),
                Cmd::PTtl(ttl_key.clone()),
                Cmd::SetPx(ttl_key.clone(), resource_id.to_string(), Cmd::ttl_ms(ttl)),
                Cmd::IncrBy(counter_key.clone(), 1),
            ])
            .await?;
        let [prior, prior_value, prior_ttl, _, _] = replies::<5>(result, "reserve transaction")?;

        if let Some(prior) = prior.into_string() {
            // Someone else owns this id: undo our increment and give both
            // keys back.
            tracing::warn!(reservation = %id, resource = resource_id, "reservation id collision");
            metrics::counter!(observability::COLLISIONS_TOTAL).increment(1);
            let restore_ttl = match (prior_value.into_string(), prior_ttl.as_int()) {
                (Some(value), Some(ms)) if ms >= 0 => {
                    Cmd::SetPx(ttl_key, value, u64::try_from(ms).unwrap_or(0).max(1))
                }
                (Some(value), _) => Cmd::Set(ttl_key, value),
                (None, _) => Cmd::Del(ttl_key),
            };
            self.store
                .transaction(vec![
                    Cmd::IncrBy(counter_key, -1),
                    Cmd::Set(id_key, prior),
                    restore_ttl,
                ])
                .await?;
            metrics::counter!(observability::RESERVATIONS_TOTAL,
                "depth" => depth_label(depth), "outcome" => "conflict")
            .increment(1);
            return Err(EngineError::Conflict(id));
        }

        if !children.is_empty() {
            let fields = children
                .iter()
                .map(|c| (c.reservation_id.to_string(), c.resource_id.clone()))
                .collect();
            let written = self
                .store
                .pipeline(vec![Cmd::HSet(self.keys.children_key(&id), fields)])
                .await;
            if let Err(e) = written {
                match self.config.child_write_policy {
                    ChildWritePolicy::Rollback => {
                        tracing::warn!(reservation = %id, error = %e, "child write failed, rolling back");
                        if let Err(undo) = self.release(id).await {
                            tracing::error!(reservation = %id, error = %undo, "rollback release failed");
                        }
                        return Err(EngineError::Store(e));
                    }
                    ChildWritePolicy::KeepParent => {
                        tracing::warn!(reservation = %id, error = %e, "child write failed, keeping reservation");
                    }
                }
            }
        }

        tracing::debug!(
            reservation = %id,
            resource = resource_id,
            children = children.len(),
            ttl_ms = Cmd::ttl_ms(ttl),
            "reserved"
        );
        metrics::counter!(observability::RESERVATIONS_TOTAL,
            "depth" => depth_label(depth), "outcome" => "reserved")
        .increment(1);
        metrics::histogram!(observability::RESERVE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(id)
    }

    /// Release a reservation and its whole child tree.
    ///
    /// Idempotent: the caller that takes the release lease while the id-key
    /// still exists owns the release, every other concurrent or later call
    /// gets `NotFound`. This is also the path for TTL expiry, where the TTL
    /// key is already gone. Cleanup anomalies are logged and returned, never
    /// raised; only store failures are errors.
    ///
    /// The id-key is only removed in the final step, together with the
    /// decrement. A release that fails part-way leaves it in place and drops
    /// its lease, so calling `release` again resumes the walk; children that
    /// were already freed answer `NotFound` and are skipped.
    pub async fn release(&self, id: ReservationId) -> Result<Release, EngineError> {
        let started = Instant::now();
        let release = self.release_node(id, 0).await?;
        let outcome = if release.is_released() { "released" } else { "not_found" };
        metrics::counter!(observability::RELEASES_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::RELEASE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(release)
    }

    fn release_node(
        &self,
        id: ReservationId,
        level: usize,
    ) -> BoxFuture<'_, Result<Release, EngineError>> {
        async move {
            let releasing_key = self.keys.releasing_key(&id);
            let claimed = self
                .store
                .transaction(vec![
                    Cmd::Del(self.keys.ttl_key(&id)),
                    Cmd::Get(self.keys.id_key(&id)),
                    Cmd::SetNxPx(
                        releasing_key.clone(),
                        "1".to_string(),
                        Cmd::ttl_ms(self.config.release_lease),
                    ),
                ])
                .await?;
            let [_, resource, lease] = replies::<3>(claimed, "release claim")?;
            let leased = lease == Reply::Ok;

            let Some(resource_id) = resource.into_string() else {
                if leased {
                    self.drop_lease(id, releasing_key).await;
                }
                return Ok(Release::NotFound);
            };
            if !leased {
                tracing::debug!(reservation = %id, "release already in progress");
                return Ok(Release::NotFound);
            }

            let outcome = self.release_claimed(id, &resource_id, level).await;
            if let Err(e) = &outcome {
                tracing::warn!(reservation = %id, error = %e, "release interrupted, left resumable");
                self.drop_lease(id, releasing_key).await;
            }
            outcome
        }
        .boxed()
    }

    /// Walk the children of a claimed reservation, then free it.
    async fn release_claimed(
        &self,
        id: ReservationId,
        resource_id: &str,
        level: usize,
    ) -> Result<Release, EngineError> {
        let children_key = self.keys.children_key(&id);
        let mut found = Vec::new();
        let mut nested = Vec::new();

        // Past the depth limit the children are left to their own TTLs and
        // stay listed under this reservation.
        let too_deep = level >= MAX_TREE_DEPTH;
        let had_children = if too_deep {
            found.push(Anomaly::TreeTooDeep { reservation_id: id });
            false
        } else {
            let children =
                hscan_all(&*self.store, &children_key, self.config.scan_page_size).await?;
            let had_children = !children.is_empty();
            for (child_id, _) in children {
                match child_id.parse::<ReservationId>() {
                    Ok(child_id) => {
                        if let Release::Released { anomalies } =
                            self.release_node(child_id, level + 1).await?
                        {
                            nested.extend(anomalies);
                        }
                    }
                    Err(_) => found.push(Anomaly::UnexpectedReply { step: "child id" }),
                }
            }
            had_children
        };
        found.extend(
            self.finish_release(id, resource_id, &children_key, had_children, too_deep)
                .await?,
        );

        for anomaly in &found {
            tracing::warn!(reservation = %id, resource = %resource_id, "{anomaly}");
            metrics::counter!(observability::RELEASE_ANOMALIES_TOTAL,
                "kind" => anomaly_label(anomaly))
            .increment(1);
        }
        tracing::debug!(reservation = %id, resource = %resource_id, level, "released");

        found.extend(nested);
        Ok(Release::Released { anomalies: found })
    }

    /// Decrement, drop the id-key, the lease and the child collection in one
    /// transaction. The child collection is kept when its entries were not
    /// released.
    async fn finish_release(
        &self,
        id: ReservationId,
        resource_id: &str,
        children_key: &str,
        had_children: bool,
        keep_children: bool,
    ) -> Result<Vec<Anomaly>, EngineError> {
        let mut cmds = vec![
            Cmd::IncrBy(
                self.keys.counter_key(CounterFamily::Reserved, resource_id),
                -1,
            ),
            Cmd::Del(self.keys.id_key(&id)),
            Cmd::Del(self.keys.releasing_key(&id)),
        ];
        if !keep_children {
            cmds.push(Cmd::Del(children_key.to_string()));
        }
        let result = self.store.transaction(cmds).await?;
        let (count, deleted) = if keep_children {
            let [count, _, _] = replies::<3>(result, "release cleanup")?;
            (count, None)
        } else {
            let [count, _, _, deleted] = replies::<4>(result, "release cleanup")?;
            (count, Some(deleted))
        };

        let mut anomalies = Vec::new();
        match count.as_int() {
            Some(value) if value < 0 => anomalies.push(Anomaly::NegativeCount {
                resource_id: resource_id.to_string(),
                value,
            }),
            Some(_) => {}
            None => anomalies.push(Anomaly::UnexpectedReply { step: "decrement" }),
        }
        match deleted.map(|d| d.as_int()) {
            Some(Some(0)) if had_children => {
                anomalies.push(Anomaly::MissingChildren { reservation_id: id });
            }
            Some(Some(_)) | None => {}
            Some(None) => anomalies.push(Anomaly::UnexpectedReply { step: "delete children" }),
        }
        Ok(anomalies)
    }

    /// Best effort; an undeleted lease lapses after `release_lease`.
    async fn drop_lease(&self, id: ReservationId, releasing_key: String) {
        if let Err(e) = self.store.pipeline(vec![Cmd::Del(releasing_key)]).await {
            tracing::error!(reservation = %id, error = %e, "could not drop release lease");
        }
    }
}

fn anomaly_label(anomaly: &Anomaly) -> &'static str {
    match anomaly {
        Anomaly::NegativeCount { .. } => "negative_count",
        Anomaly::MissingChildren { .. } => "missing_children",
        Anomaly::UnexpectedReply { .. } => "unexpected_reply",
        Anomaly::TreeTooDeep { .. } => "tree_too_deep",
    }
}
