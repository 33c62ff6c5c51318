use ulid::Ulid;

use crate::model::{ConflictEntry, ReservationStatus};
use crate::timeofday::FormatError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// A resource name given by reference that matches nothing.
    UnknownResourceName(String),
    AlreadyExists(Ulid),
    DuplicateName(String),
    /// The write would overlap existing active bookings.
    Conflict(Vec<ConflictEntry>),
    /// Cancelled reservations never change again.
    Immutable { id: Ulid, status: ReservationStatus },
    Inactive(Ulid),
    Validation(String),
    BadTime(FormatError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Transient store failures may succeed on retry; everything else is a
    /// rejected request.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownResourceName(name) => write!(f, "no resource named {name:?}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateName(name) => write!(f, "resource name already in use: {name:?}"),
            EngineError::Conflict(entries) => {
                write!(f, "slot occupied")?;
                for (i, entry) in entries.iter().enumerate() {
                    let sep = if i == 0 { ": " } else { "; " };
                    write!(f, "{sep}{entry}")?;
                }
                Ok(())
            }
            EngineError::Immutable { id, status } => {
                write!(f, "reservation {id} is {} and cannot change", status.label())
            }
            EngineError::Inactive(id) => write!(f, "resource {id} is not accepting bookings"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::BadTime(e) => write!(f, "{e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<FormatError> for EngineError {
    fn from(e: FormatError) -> Self {
        EngineError::BadTime(e)
    }
}

/// Failure of a ledger operation.
#[derive(Debug)]
pub enum LedgerError {
    /// Rejected before any mutation; never retried.
    Validation(String),
    /// Missing booking or account; never retried.
    NotFound(String),
    InsufficientBalance { balance: i64, requested: i64 },
    /// Store failure inside the transaction. Safe to retry the whole call.
    Transient(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Validation(msg) => write!(f, "invalid ledger request: {msg}"),
            LedgerError::NotFound(what) => write!(f, "not found: {what}"),
            LedgerError::InsufficientBalance { balance, requested } => {
                write!(f, "insufficient balance: have {balance}, debit of {requested} requested")
            }
            LedgerError::Transient(e) => write!(f, "transient store failure: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<EngineError> for LedgerError {
    fn from(e: EngineError) -> Self {
        if e.is_transient() {
            return LedgerError::Transient(e.to_string());
        }
        match e {
            EngineError::NotFound(id) => LedgerError::NotFound(id.to_string()),
            other => LedgerError::Validation(other.to_string()),
        }
    }
}
