use std::fmt;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::ledger::LedgerError;
use crate::model::{AppointmentStatus, Slot};

/// Why a date cannot take a new booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRejection {
    Past,
    AlreadyStarted,
    ClosedWeekday,
    BeyondHorizon,
    Blocked,
}

impl fmt::Display for DateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DateRejection::Past => "date is in the past",
            DateRejection::AlreadyStarted => "slot has already started",
            DateRejection::ClosedWeekday => "shop is closed that weekday",
            DateRejection::BeyondHorizon => "date is beyond the booking horizon",
            DateRejection::Blocked => "date is blocked",
        })
    }
}

#[derive(Debug)]
pub enum EngineError {
    InvalidArgument(String),
    InvalidDate {
        date: NaiveDate,
        reason: DateRejection,
    },
    ActiveLimitExceeded {
        owner_id: String,
        limit: u32,
    },
    SlotTaken(Slot),
    LeadTimeViolation {
        id: Ulid,
        required_hours: u32,
        hours_left: f64,
    },
    ModificationLimitExceeded {
        id: Ulid,
        limit: u32,
    },
    InvalidState {
        id: Ulid,
        status: AppointmentStatus,
    },
    NotFound(Ulid),
    UnknownService(String),
    Forbidden(Ulid),
    AlreadyEnrolled(Slot),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    StoreUnavailable(String),
}

impl EngineError {
    /// Stable machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) | EngineError::UnknownService(_) => "invalid_argument",
            EngineError::InvalidDate { .. } => "invalid_date",
            EngineError::ActiveLimitExceeded { .. } => "active_limit_exceeded",
            EngineError::SlotTaken(_) => "slot_taken",
            EngineError::LeadTimeViolation { .. } => "lead_time_violation",
            EngineError::ModificationLimitExceeded { .. } => "modification_limit_exceeded",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyEnrolled(_) => "already_enrolled",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }

    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) | EngineError::UnknownService(_) => "22023",
            EngineError::InvalidDate { .. } => "22007",
            EngineError::ActiveLimitExceeded { .. }
            | EngineError::LeadTimeViolation { .. }
            | EngineError::ModificationLimitExceeded { .. } => "23514",
            EngineError::SlotTaken(_) | EngineError::AlreadyEnrolled(_) => "23P01",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::InvalidState { .. } => "55000",
            EngineError::NotFound(_) => "02000",
            EngineError::Forbidden(_) => "42501",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::StoreUnavailable(_) => "58030",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::InvalidDate { date, reason } => write!(f, "cannot book {date}: {reason}"),
            EngineError::ActiveLimitExceeded { owner_id, limit } => {
                write!(f, "{owner_id} already holds {limit} active appointments")
            }
            EngineError::SlotTaken(slot) => write!(f, "slot {slot} is already taken"),
            EngineError::LeadTimeViolation {
                id,
                required_hours,
                hours_left,
            } => write!(
                f,
                "appointment {id} starts in {hours_left:.2}h, changes need {required_hours}h notice"
            ),
            EngineError::ModificationLimitExceeded { id, limit } => {
                write!(f, "appointment {id} was already modified {limit} times")
            }
            EngineError::InvalidState { id, status } => {
                write!(f, "appointment {id} is {}", status.as_str())
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownService(id) => write!(f, "unknown or retired service: {id}"),
            EngineError::Forbidden(id) => write!(f, "{id} belongs to someone else"),
            EngineError::AlreadyEnrolled(slot) => {
                write!(f, "already on the waitlist for {slot}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(EngineError::from(LedgerError::Contention).is_retryable());
        assert!(!EngineError::NotFound(Ulid::new()).is_retryable());
        assert!(!EngineError::LimitExceeded("x").is_retryable());
    }

    #[test]
    fn unknown_service_reports_as_invalid_argument() {
        let e = EngineError::UnknownService("laser".into());
        assert_eq!(e.kind(), "invalid_argument");
        assert_eq!(e.sqlstate(), "22023");
    }

    #[test]
    fn lead_time_message_carries_hours() {
        let e = EngineError::LeadTimeViolation {
            id: Ulid::nil(),
            required_hours: 2,
            hours_left: 1.5,
        };
        assert!(e.to_string().contains("1.50h"));
        assert_eq!(e.kind(), "lead_time_violation");
    }
}
