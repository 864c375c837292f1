//! BudgetPro Budget Core
//!
//! Reservation ledger and tamper-evident sealing for hierarchical
//! construction-project budgets.
//!
//! # Architecture
//!
//! - **Line Ledger**: Exact-decimal balances, commitments and expenses per line
//! - **Freeze State Machine**: DRAFT → FROZEN → INVALIDATED, structure locked once frozen
//! - **Integrity Seal**: Approval hash over a canonical form, chained execution hash
//! - **Audit Trail**: Append-only record of every generation, validation and violation
//! - **Revisions**: Approved change orders produce new, independently sealed budgets
//!
//! # Invariants
//!
//! - Balance identity: available == allocated − expenses − commitments, always
//! - Frozen structure: no add, remove, reparent or quantity edit after approval
//! - Optimistic concurrency: versions are assigned by the store, never by the domain
//! - Append-only audit: entries are never modified or deleted
//! - Single successor: a budget is revised at most once, then its lines close

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod error;
pub mod line;
pub mod budget;
pub mod integrity;
pub mod audit;
pub mod change_order;
pub mod revision;
pub mod storage;
pub mod ledger;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, ErrorKind, IntegrityViolation, Result};
pub use types::{ApproverId, BudgetId, BudgetState, ChangeOrderId, HashAlgorithm, LineId, ProjectId};
pub use line::{BudgetLine, ExecutionCheck, OveragePolicy, ProgressEntry, ProgressSource};
pub use budget::{Budget, ScheduleBaseline};
pub use integrity::IntegritySealer;
pub use audit::{AuditEventType, AuditTrail, IntegrityAuditEntry, ValidationResult};
pub use change_order::{ChangeOrder, ChangeOrderState, LineDelta};
pub use revision::RevisionService;
pub use storage::{BudgetStore, MemoryStore, RocksStore};
pub use ledger::{with_conflict_retry, BudgetLedger};
pub use config::Config;
pub use metrics::IntegrityMetrics;
