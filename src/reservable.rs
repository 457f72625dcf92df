//! Resource kinds: what can be reserved, what it drags along, and whether
//! it may be held right now.
//!
//! A kind is looked up by the tag in its [`ResourceRef`]. Reserving a
//! resource first reserves every sub-resource its kind names, then asks the
//! kind for admission, then holds the resource itself with the
//! sub-reservations attached as children.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

use crate::counters::CounterService;
use crate::engine::{EngineError, ReservationEngine};
use crate::limits::MAX_TREE_DEPTH;
use crate::model::{ChildReservation, Depth, Release, ReservationId};
use crate::store::Store;

/// A reservable thing, addressed as `kind:id`. The rendered form is the
/// resource id the engine stores and counts under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for ResourceRef {
    type Err = ReserveError;

    /// Splits on the first `:`; the id may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Self::new(kind, id)),
            _ => Err(ReserveError::InvalidResource(s.to_string())),
        }
    }
}

/// A kind's answer to "may one more unit be held now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Everything left is sold.
    OutOfStock,
    /// What is left is currently held by other reservations.
    AllReserved,
    /// Sales have not opened.
    NotSold,
    Rejected(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Admitted => write!(f, "admitted"),
            Admission::OutOfStock => write!(f, "out of stock"),
            Admission::AllReserved => write!(f, "all reserved"),
            Admission::NotSold => write!(f, "not yet on sale"),
            Admission::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Behaviour of one resource kind.
#[async_trait]
pub trait ResourceKind<S: Store>: Send + Sync {
    /// The `kind` part of every [`ResourceRef`] this kind handles.
    fn tag(&self) -> &str;

    /// Hold time for this kind. `None` uses the reserver's default.
    fn reservation_time(&self) -> Option<Duration> {
        None
    }

    /// Decide admission. `counters` reads the shared reserved/pending
    /// counts, which already include any sub-reservations made for this
    /// attempt.
    async fn is_reservable(
        &self,
        id: &str,
        counters: &CounterService<S>,
    ) -> Result<Admission, EngineError>;

    /// Sub-resources to hold together with `id`.
    async fn children(&self, _id: &str) -> Result<Vec<ResourceRef>, EngineError> {
        Ok(Vec::new())
    }
}

#[derive(Debug)]
pub enum ReserveError {
    UnknownKind(String),
    InvalidResource(String),
    Engine(EngineError),
}

impl ReserveError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReserveError::Engine(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReserveError::UnknownKind(tag) => write!(f, "unknown resource kind: {tag}"),
            ReserveError::InvalidResource(s) => write!(f, "invalid resource reference: {s:?}"),
            ReserveError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReserveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReserveError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineError> for ReserveError {
    fn from(e: EngineError) -> Self {
        ReserveError::Engine(e)
    }
}

/// Tag → kind lookup, built once at startup.
pub struct KindRegistry<S: Store> {
    kinds: HashMap<String, Arc<dyn ResourceKind<S>>>,
}

impl<S: Store> Default for KindRegistry<S> {
    fn default() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }
}

impl<S: Store> KindRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind; a later kind with the same tag replaces the earlier one.
    pub fn register(mut self, kind: impl ResourceKind<S> + 'static) -> Self {
        self.kinds.insert(kind.tag().to_string(), Arc::new(kind));
        self
    }

    pub fn get(&self, tag: &str) -> Result<&Arc<dyn ResourceKind<S>>, ReserveError> {
        self.kinds
            .get(tag)
            .ok_or_else(|| ReserveError::UnknownKind(tag.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(ReservationId),
    Refused {
        resource: ResourceRef,
        admission: Admission,
    },
}

impl ReserveOutcome {
    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            ReserveOutcome::Reserved(id) => Some(*id),
            ReserveOutcome::Refused { .. } => None,
        }
    }
}

/// Reserves resource trees through the engine, resolving kinds by tag.
pub struct Reserver<S: Store> {
    engine: ReservationEngine<S>,
    kinds: Arc<KindRegistry<S>>,
    default_time: Duration,
}

impl<S: Store> Clone for Reserver<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            kinds: self.kinds.clone(),
            default_time: self.default_time,
        }
    }
}

const CONFLICT_RETRIES: usize = 3;

impl<S: Store> Reserver<S> {
    pub fn new(engine: ReservationEngine<S>, kinds: KindRegistry<S>, default_time: Duration) -> Self {
        Self {
            engine,
            kinds: Arc::new(kinds),
            default_time,
        }
    }

    pub fn engine(&self) -> &ReservationEngine<S> {
        &self.engine
    }

    /// Hold `resource` and everything its kind names below it.
    ///
    /// A refusal anywhere in the tree releases whatever was already held for
    /// this attempt and reports the refusing resource.
    pub async fn reserve(&self, resource: &ResourceRef) -> Result<ReserveOutcome, ReserveError> {
        self.reserve_node(resource, Depth::Root, 0, Duration::ZERO).await
    }

    /// Admission for `resource` alone, without holding anything.
    pub async fn can_reserve(&self, resource: &ResourceRef) -> Result<Admission, ReserveError> {
        let kind = self.kinds.get(&resource.kind)?;
        Ok(kind
            .is_reservable(&resource.id, &self.engine.counters())
            .await?)
    }

    pub async fn release(&self, id: ReservationId) -> Result<Release, ReserveError> {
        Ok(self.engine.release(id).await?)
    }

    /// Whether `id` is a live root reservation of `resource`.
    pub async fn is_reserved(
        &self,
        resource: &ResourceRef,
        id: ReservationId,
    ) -> Result<bool, ReserveError> {
        let check = self
            .engine
            .check_reservation(&resource.to_string(), id, Depth::Root)
            .await?;
        Ok(check.is_valid())
    }

    fn reserve_node<'a>(
        &'a self,
        resource: &'a ResourceRef,
        depth: Depth,
        level: usize,
        at_least: Duration,
    ) -> BoxFuture<'a, Result<ReserveOutcome, ReserveError>> {
        async move {
            if level > MAX_TREE_DEPTH {
                return Err(EngineError::LimitExceeded("resource tree too deep").into());
            }
            let kind = self.kinds.get(&resource.kind)?;
            // Children never run out before the reservation holding them.
            let duration = kind
                .reservation_time()
                .unwrap_or(self.default_time)
                .max(at_least);

            let mut held = Vec::new();
            for child in kind.children(&resource.id).await? {
                match self.reserve_node(&child, Depth::Child, level + 1, duration).await {
                    Ok(ReserveOutcome::Reserved(id)) => {
                        held.push(ChildReservation::new(id, child.to_string()));
                    }
                    Ok(refused) => {
                        self.release_held(&held).await;
                        return Ok(refused);
                    }
                    Err(e) => {
                        self.release_held(&held).await;
                        return Err(e);
                    }
                }
            }

            let admission = match kind.is_reservable(&resource.id, &self.engine.counters()).await {
                Ok(admission) => admission,
                Err(e) => {
                    self.release_held(&held).await;
                    return Err(e.into());
                }
            };
            if !admission.is_admitted() {
                tracing::debug!(resource = %resource, %admission, "reservation refused");
                self.release_held(&held).await;
                return Ok(ReserveOutcome::Refused {
                    resource: resource.clone(),
                    admission,
                });
            }

            let resource_id = resource.to_string();
            let mut attempt = 0;
            loop {
                match self.engine.reserve(&resource_id, duration, &held, depth).await {
                    Ok(id) => return Ok(ReserveOutcome::Reserved(id)),
                    Err(EngineError::Conflict(_)) if attempt < CONFLICT_RETRIES => attempt += 1,
                    Err(e) => {
                        self.release_held(&held).await;
                        return Err(e.into());
                    }
                }
            }
        }
        .boxed()
    }

    async fn release_held(&self, held: &[ChildReservation]) {
        for child in held {
            if let Err(e) = self.engine.release(child.reservation_id).await {
                tracing::error!(
                    reservation = %child.reservation_id,
                    resource = %child.resource_id,
                    error = %e,
                    "failed to release child after refusal"
                );
            }
        }
    }
}
