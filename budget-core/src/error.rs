//! Error types for the budget ledger

use crate::types::{BudgetId, BudgetState, HashAlgorithm, LineId, ProjectId};
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type for budget ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Digest prefix length used in human-readable messages
pub const HASH_PREFIX_LEN: usize = 16;

/// Budget ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reservation or expense larger than the available balance
    #[error("Insufficient balance on line {line_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Line
        line_id: LineId,
        /// Available balance at the time of the request
        available: Decimal,
        /// Requested amount
        requested: Decimal,
    },

    /// Accumulated executed quantity above the line's current quantity
    #[error("Execution cap exceeded on line {line_id}: cap {cap}, executed {executed}")]
    ExecutionCapExceeded {
        /// Line
        line_id: LineId,
        /// Current (authorized) quantity
        cap: Decimal,
        /// Accumulated executed quantity including the rejected entry
        executed: Decimal,
    },

    /// Structural mutation attempted on a frozen budget
    #[error("Budget {budget_id} is frozen: {operation} rejected")]
    FrozenBudgetViolation {
        /// Budget
        budget_id: BudgetId,
        /// Description of the rejected operation
        operation: String,
    },

    /// Change order cannot produce a revision
    #[error("Change order precondition violated: {0}")]
    ChangeOrderPrecondition(String),

    /// State machine transition not allowed
    #[error("Budget {budget_id}: transition {from} -> {to} not allowed")]
    InvalidStateTransition {
        /// Budget
        budget_id: BudgetId,
        /// Current state
        from: BudgetState,
        /// Requested state
        to: BudgetState,
    },

    /// No schedule baseline for the owning project
    #[error("No schedule baseline exists for project {0}")]
    ScheduleBaselineMissing(ProjectId),

    /// Invariant violation (negative balance at freeze, hierarchy cycle, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Sealed budget diverged from its approval hash
    #[error("{0}")]
    BudgetIntegrityViolation(Box<IntegrityViolation>),

    /// Stale version presented at the storage boundary
    #[error("Concurrency conflict on {entity} {id}: expected version {expected:?}, found {actual:?}")]
    ConcurrencyConflict {
        /// Entity kind ("budget", "line")
        entity: &'static str,
        /// Entity id
        id: Uuid,
        /// Version presented by the caller
        expected: Option<u64>,
        /// Version currently stored
        actual: Option<u64>,
    },

    /// Budget not found
    #[error("Budget not found: {0}")]
    BudgetNotFound(BudgetId),

    /// Line not found
    #[error("Line not found: {0}")]
    LineNotFound(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy, drives caller behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected, correct and retry
    Validation,
    /// Rejected, correct and retry
    DomainInvariant,
    /// Escalate, do not retry blindly
    Integrity,
    /// Re-read state and retry
    Concurrency,
    /// Unknown entity
    NotFound,
    /// Storage, serialization, configuration
    Infrastructure,
}

impl Error {
    /// Classify error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::InsufficientBalance { .. }
            | Error::ExecutionCapExceeded { .. }
            | Error::FrozenBudgetViolation { .. }
            | Error::ChangeOrderPrecondition(_)
            | Error::InvalidStateTransition { .. }
            | Error::ScheduleBaselineMissing(_)
            | Error::InvariantViolation(_) => ErrorKind::DomainInvariant,
            Error::BudgetIntegrityViolation(_) => ErrorKind::Integrity,
            Error::ConcurrencyConflict { .. } => ErrorKind::Concurrency,
            Error::BudgetNotFound(_) | Error::LineNotFound(_) => ErrorKind::NotFound,
            Error::Storage(_) | Error::Serialization(_) | Error::Config(_) | Error::Io(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Only concurrency conflicts are retried automatically
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }

    pub(crate) fn frozen(budget_id: BudgetId, operation: impl Into<String>) -> Self {
        Error::FrozenBudgetViolation {
            budget_id,
            operation: operation.into(),
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<IntegrityViolation> for Error {
    fn from(violation: IntegrityViolation) -> Self {
        Error::BudgetIntegrityViolation(Box::new(violation))
    }
}

/// Forensic payload of a detected integrity violation
///
/// Digests are kept whole here; only the `Display` output truncates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    /// Budget
    pub budget_id: BudgetId,
    /// Stored approval hash
    pub expected_hash: String,
    /// Recomputed hash
    pub actual_hash: String,
    /// Violation label
    pub violation_type: String,
    /// Algorithm used for both digests
    pub algorithm: HashAlgorithm,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Budget integrity violation detected for budget {}. Expected hash: {}, Actual hash: {}, Violation type: {}",
            self.budget_id,
            truncate_hash(&self.expected_hash),
            truncate_hash(&self.actual_hash),
            self.violation_type
        )
    }
}

/// Short digest prefix for log lines and messages
pub fn truncate_hash(hash: &str) -> String {
    if hash.chars().count() <= HASH_PREFIX_LEN {
        hash.to_string()
    } else {
        let prefix: String = hash.chars().take(HASH_PREFIX_LEN).collect();
        format!("{}...", prefix)
    }
}
