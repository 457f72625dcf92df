use crate::model::{CounterFamily, ReservationId};

pub const DEFAULT_RESERVATION_PREFIX: &str = "reservation:";
pub const DEFAULT_RESERVED_PREFIX: &str = "reservedcount:";
pub const DEFAULT_PENDING_PREFIX: &str = "pendingcount:";

const ID_SUFFIX: &str = ":id";
const CHILDREN_SUFFIX: &str = ":children";
const RELEASING_SUFFIX: &str = ":releasing";

/// Key naming shared by the engine, the counters and the expiry watcher.
///
/// ```text
/// reservation:<id>            TTL string, value = resource id
/// reservation:<id>:id         string, value = resource id
/// reservation:<id>:children   hash, child reservation id -> child resource id
/// reservation:<id>:releasing  TTL string, lease held by the running release
/// reservedcount:<resource>    integer
/// pendingcount:<resource>     integer
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    reservation: String,
    reserved: String,
    pending: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(
            DEFAULT_RESERVATION_PREFIX,
            DEFAULT_RESERVED_PREFIX,
            DEFAULT_PENDING_PREFIX,
        )
    }
}

impl Keyspace {
    pub fn new(
        reservation: impl Into<String>,
        reserved: impl Into<String>,
        pending: impl Into<String>,
    ) -> Self {
        Self {
            reservation: reservation.into(),
            reserved: reserved.into(),
            pending: pending.into(),
        }
    }

    pub fn reservation_prefix(&self) -> &str {
        &self.reservation
    }

    pub fn ttl_key(&self, id: &ReservationId) -> String {
        format!("{}{id}", self.reservation)
    }

    pub fn id_key(&self, id: &ReservationId) -> String {
        format!("{}{id}{ID_SUFFIX}", self.reservation)
    }

    pub fn children_key(&self, id: &ReservationId) -> String {
        format!("{}{id}{CHILDREN_SUFFIX}", self.reservation)
    }

    pub fn releasing_key(&self, id: &ReservationId) -> String {
        format!("{}{id}{RELEASING_SUFFIX}", self.reservation)
    }

    pub fn counter_key(&self, family: CounterFamily, resource_id: &str) -> String {
        match family {
            CounterFamily::Reserved => format!("{}{resource_id}", self.reserved),
            CounterFamily::Pending => format!("{}{resource_id}", self.pending),
        }
    }

    /// Recover the reservation id from an expired key name. Only the TTL key
    /// itself maps back; sub-keys and foreign keys yield `None`.
    pub fn reservation_from_expired(&self, key: &str) -> Option<ReservationId> {
        let rest = key.strip_prefix(self.reservation.as_str())?;
        if rest.contains(':') {
            return None;
        }
        rest.parse().ok()
    }
}
