use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{OwnerId, ServiceId, Span};

/// Caller-visible classification. Every `EngineError` maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedTime,
    InvalidRange,
    Overlap,
    NotFound,
    NoAvailableSlot,
    LimitExceeded,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid time format {0:?} (expected HH:MM)")]
    MalformedTime(String),

    #[error("invalid date {0:?} (expected YYYY-MM-DD)")]
    MalformedDate(String),

    #[error("range {0} - {1} must satisfy start < end")]
    InvalidRange(String, String),

    #[error("time ranges overlap: {first} and {second}")]
    Overlap { first: Span, second: Span },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("appointment not found: {0}")]
    AppointmentNotFound(Ulid),

    #[error("appointment not found: {0:?} is not an appointment id")]
    UnknownAppointmentId(String),

    #[error("service {service_id} not found for owner {owner_id}")]
    ServiceNotFound {
        service_id: ServiceId,
        owner_id: OwnerId,
    },

    #[error("no available timeslot for {span} on {date}")]
    NoAvailableSlot { date: NaiveDate, span: Span },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("WAL error: {0}")]
    WalError(String),

    #[error("store invariant violated: {0}")]
    Corrupt(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MalformedTime(_) | EngineError::MalformedDate(_) => ErrorKind::MalformedTime,
            EngineError::InvalidRange(..) | EngineError::MissingField(_) => ErrorKind::InvalidRange,
            EngineError::Overlap { .. } => ErrorKind::Overlap,
            EngineError::AppointmentNotFound(_)
            | EngineError::UnknownAppointmentId(_)
            | EngineError::ServiceNotFound { .. } => ErrorKind::NotFound,
            EngineError::NoAvailableSlot { .. } => ErrorKind::NoAvailableSlot,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::LockTimeout(_) | EngineError::WalError(_) | EngineError::Corrupt(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Internal failures leave state unchanged and may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}
