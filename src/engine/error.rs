use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::{ReservationStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Interval bounds that cannot be tiled (`start >= end`, bad step).
    InvalidRange {
        start: NaiveTime,
        end: NaiveTime,
        step_minutes: u32,
    },
    /// The slot is no longer open for a hold.
    SlotUnavailable {
        date: NaiveDate,
        slot: Span,
    },
    /// The provider is not one of the reservation's eligible providers.
    InvalidProvider {
        reservation_id: Ulid,
        provider_id: Ulid,
    },
    /// The reservation is in a state that does not allow the operation.
    InvalidTransition {
        id: Ulid,
        status: ReservationStatus,
        reason: &'static str,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange {
                start,
                end,
                step_minutes,
            } => write!(
                f,
                "invalid range [{}, {}) with step {step_minutes}m",
                start.format(crate::model::TIME_FORMAT),
                end.format(crate::model::TIME_FORMAT)
            ),
            EngineError::SlotUnavailable { date, slot } => write!(
                f,
                "slot {date} {slot} was just taken, please choose another"
            ),
            EngineError::InvalidProvider {
                reservation_id,
                provider_id,
            } => write!(
                f,
                "provider {provider_id} cannot serve reservation {reservation_id}"
            ),
            EngineError::InvalidTransition { id, status, reason } => write!(
                f,
                "reservation {id} is {}: {reason}",
                status.as_str()
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
