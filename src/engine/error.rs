use crate::model::ReservationId;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// A generated reservation id was already taken. Retry with a new id.
    Conflict(ReservationId),
    LimitExceeded(&'static str),
    /// The store could not be reached or rejected a command.
    Store(StoreError),
}

impl EngineError {
    /// Whether retrying the same call with a fresh id can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Conflict(id) => write!(f, "reservation id collision: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<crate::counters::CounterError> for EngineError {
    fn from(e: crate::counters::CounterError) -> Self {
        match e {
            crate::counters::CounterError::Store(e) => EngineError::Store(e),
            crate::counters::CounterError::BatchTooLarge(_) => {
                EngineError::LimitExceeded("counter batch too large")
            }
        }
    }
}
