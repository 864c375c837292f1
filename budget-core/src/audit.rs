//! Integrity audit trail
//!
//! Append-only record of every hash generation, validation and detected
//! violation. Entries are never updated or deleted; the store assigns each one
//! a monotonic sequence number on append.

use crate::{
    budget::Budget,
    error::{IntegrityViolation, Result},
    types::{ApproverId, BudgetId, HashAlgorithm},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of integrity event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// Seal produced at approval
    HashGenerated,
    /// Seal recomputed and matched
    HashValidated,
    /// Seal recomputed and diverged
    HashViolation,
}

impl AuditEventType {
    /// Stored label
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::HashGenerated => "HASH_GENERATED",
            AuditEventType::HashValidated => "HASH_VALIDATED",
            AuditEventType::HashViolation => "HASH_VIOLATION",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationResult {
    /// Generation or validation succeeded
    Success,
    /// Violation detected
    Failure,
}

/// Single audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityAuditEntry {
    entry_id: Uuid,
    sequence: Option<u64>,
    budget_id: BudgetId,
    event_type: AuditEventType,
    approval_hash: Option<String>,
    execution_hash: Option<String>,
    recomputed_hash: Option<String>,
    validator: Option<ApproverId>,
    recorded_at: DateTime<Utc>,
    result: ValidationResult,
    violation_details: Option<String>,
    algorithm: HashAlgorithm,
}

impl IntegrityAuditEntry {
    fn base(
        budget_id: BudgetId,
        event_type: AuditEventType,
        result: ValidationResult,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            sequence: None,
            budget_id,
            event_type,
            approval_hash: None,
            execution_hash: None,
            recomputed_hash: None,
            validator: None,
            recorded_at: Utc::now(),
            result,
            violation_details: None,
            algorithm,
        }
    }

    /// `HASH_GENERATED` entry for a freshly sealed budget
    pub fn generated(budget: &Budget, algorithm: HashAlgorithm) -> Self {
        Self {
            approval_hash: budget.approval_hash().map(str::to_string),
            execution_hash: budget.execution_hash().map(str::to_string),
            validator: budget.approved_by(),
            ..Self::base(
                budget.id(),
                AuditEventType::HashGenerated,
                ValidationResult::Success,
                algorithm,
            )
        }
    }

    /// `HASH_VALIDATED` entry for a matching recomputation
    pub fn validated(budget: &Budget, validator: Option<ApproverId>, algorithm: HashAlgorithm) -> Self {
        Self {
            approval_hash: budget.approval_hash().map(str::to_string),
            execution_hash: budget.execution_hash().map(str::to_string),
            validator,
            ..Self::base(
                budget.id(),
                AuditEventType::HashValidated,
                ValidationResult::Success,
                algorithm,
            )
        }
    }

    /// `HASH_VIOLATION` entry; keeps both full digests
    pub fn violation(
        violation: &IntegrityViolation,
        execution_hash: Option<&str>,
        validator: Option<ApproverId>,
    ) -> Self {
        Self {
            approval_hash: Some(violation.expected_hash.clone()),
            execution_hash: execution_hash.map(str::to_string),
            recomputed_hash: Some(violation.actual_hash.clone()),
            validator,
            violation_details: Some(format!(
                "{}: expected {}, recomputed {}",
                violation.violation_type, violation.expected_hash, violation.actual_hash
            )),
            ..Self::base(
                violation.budget_id,
                AuditEventType::HashViolation,
                ValidationResult::Failure,
                violation.algorithm,
            )
        }
    }

    /// Entry id
    pub fn entry_id(&self) -> Uuid {
        self.entry_id
    }

    /// Store-assigned sequence, `None` until appended
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Budget
    pub fn budget_id(&self) -> BudgetId {
        self.budget_id
    }

    /// Event kind
    pub fn event_type(&self) -> AuditEventType {
        self.event_type
    }

    /// Approval hash (stored seal for violations)
    pub fn approval_hash(&self) -> Option<&str> {
        self.approval_hash.as_deref()
    }

    /// Execution hash at the time of the event
    pub fn execution_hash(&self) -> Option<&str> {
        self.execution_hash.as_deref()
    }

    /// Recomputed digest, only present on violations
    pub fn recomputed_hash(&self) -> Option<&str> {
        self.recomputed_hash.as_deref()
    }

    /// Approver or validator reference
    pub fn validator(&self) -> Option<ApproverId> {
        self.validator
    }

    /// Event timestamp
    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    /// Outcome
    pub fn result(&self) -> ValidationResult {
        self.result
    }

    /// Free-text violation details
    pub fn violation_details(&self) -> Option<&str> {
        self.violation_details.as_deref()
    }

    /// Algorithm tag
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Append-only audit sink
///
/// Queries return entries most recent first.
pub trait AuditTrail: Send + Sync {
    /// Append an entry, returning it with its assigned sequence
    fn append(&self, entry: IntegrityAuditEntry) -> Result<IntegrityAuditEntry>;

    /// All entries for a budget
    fn find_by_budget_id(&self, budget_id: BudgetId) -> Result<Vec<IntegrityAuditEntry>>;

    /// All `HASH_VIOLATION` entries
    fn find_violations(&self) -> Result<Vec<IntegrityAuditEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::MemoryStore, types::ProjectId};

    fn violation(budget_id: BudgetId) -> IntegrityViolation {
        IntegrityViolation {
            budget_id,
            expected_hash: "a".repeat(64),
            actual_hash: "b".repeat(64),
            violation_type: "Tampering detected".to_string(),
            algorithm: HashAlgorithm::Sha256V1,
        }
    }

    #[test]
    fn test_violation_entry_keeps_full_digests() {
        let budget_id = BudgetId::new();
        let entry = IntegrityAuditEntry::violation(&violation(budget_id), Some("c"), None);

        assert_eq!(entry.event_type(), AuditEventType::HashViolation);
        assert_eq!(entry.result(), ValidationResult::Failure);
        assert_eq!(entry.approval_hash().map(str::len), Some(64));
        assert_eq!(entry.recomputed_hash().map(str::len), Some(64));
        assert!(entry.violation_details().unwrap().contains("Tampering detected"));
        assert_eq!(entry.sequence(), None);
    }

    #[test]
    fn test_event_labels_serialize_in_stored_form() {
        let json = serde_json::to_string(&AuditEventType::HashViolation).unwrap();
        assert_eq!(json, "\"HASH_VIOLATION\"");
        let json = serde_json::to_string(&ValidationResult::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }

    #[test]
    fn test_trail_orders_most_recent_first() {
        let store = MemoryStore::new();
        let budget = Budget::new(ProjectId::new(), "Audit").unwrap();

        let first = store
            .append(IntegrityAuditEntry::validated(&budget, None, HashAlgorithm::Sha256V1))
            .unwrap();
        let second = store
            .append(IntegrityAuditEntry::violation(&violation(budget.id()), None, None))
            .unwrap();

        assert!(second.sequence() > first.sequence());

        let entries = store.find_by_budget_id(budget.id()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_id(), second.entry_id());

        let violations = store.find_violations().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].budget_id(), budget.id());

        assert!(store.find_by_budget_id(BudgetId::new()).unwrap().is_empty());
    }
}
