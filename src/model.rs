use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque reservation token. Generated once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Ulid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReservationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Position of a reservation in its tree. Children get a longer grace
/// because the store only expires roots from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Root,
    Child,
}

/// A reservation held on behalf of a sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReservation {
    pub reservation_id: ReservationId,
    pub resource_id: String,
}

impl ChildReservation {
    pub fn new(reservation_id: ReservationId, resource_id: impl Into<String>) -> Self {
        Self {
            reservation_id,
            resource_id: resource_id.into(),
        }
    }
}

/// Why a reservation failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// The id-key holds a different resource.
    ResourceMismatch { stored: String },
    /// The TTL key is gone.
    Expired,
    /// The TTL key exists but less than the grace threshold remains.
    GraceElapsed { remaining: Duration },
    /// A descendant failed validation.
    Child(ReservationId),
    /// A child entry whose field is not a reservation id.
    MalformedChild(String),
    TooDeep,
}

/// Outcome of a tree-wide validity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Valid,
    NotFound,
    Invalid(InvalidReason),
}

impl Check {
    pub fn is_valid(&self) -> bool {
        matches!(self, Check::Valid)
    }
}

/// Something unexpected observed while releasing. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    NegativeCount { resource_id: String, value: i64 },
    MissingChildren { reservation_id: ReservationId },
    UnexpectedReply { step: &'static str },
    TreeTooDeep { reservation_id: ReservationId },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::NegativeCount { resource_id, value } => {
                write!(f, "reserved count for {resource_id} went negative: {value}")
            }
            Anomaly::MissingChildren { reservation_id } => {
                write!(f, "children of {reservation_id} vanished before cleanup")
            }
            Anomaly::UnexpectedReply { step } => write!(f, "unexpected store reply at {step}"),
            Anomaly::TreeTooDeep { reservation_id } => {
                write!(f, "reservation tree below {reservation_id} too deep, children left")
            }
        }
    }
}

/// Outcome of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    Released { anomalies: Vec<Anomaly> },
    NotFound,
}

impl Release {
    pub fn is_released(&self) -> bool {
        matches!(self, Release::Released { .. })
    }
}

/// The two per-resource counter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterFamily {
    Reserved,
    Pending,
}

impl CounterFamily {
    pub fn label(&self) -> &'static str {
        match self {
            CounterFamily::Reserved => "reserved",
            CounterFamily::Pending => "pending",
        }
    }
}

/// Work item handed from the expiry watcher to the release worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTask {
    pub reservation_id: ReservationId,
}
