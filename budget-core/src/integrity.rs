//! Integrity sealing
//!
//! # Architecture
//!
//! ```text
//! approval hash  = H(tag | budget root | lines sorted by code: structural fields)
//! execution hash = H(tag | approval hash | lines sorted by code: financial state)
//! ```
//!
//! The canonical form is a sequence of length-prefixed fields (`len:value|`),
//! so no field content can shift a delimiter. Decimals are normalized before
//! encoding, so `10` and `10.00` seal identically. No timestamps enter either
//! digest.
//!
//! The execution hash is chained to the approval hash: it can only be produced
//! for a sealed budget, and any change to the seal changes it too.
//!
//! Validation always recomputes with the algorithm stored next to the seal,
//! never with the currently configured one, so older seals stay verifiable
//! after the default moves on.

use crate::{
    audit::{AuditTrail, IntegrityAuditEntry},
    budget::Budget,
    error::{truncate_hash, Error, IntegrityViolation, Result},
    metrics::{HashKind, IntegrityMetrics},
    types::{ApproverId, HashAlgorithm},
};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::{fmt, sync::Arc, time::Instant};

/// Violation label for a seal mismatch
pub const TAMPERING_DETECTED: &str = "Tampering detected";

/// Produces, refreshes and validates budget seals
#[derive(Clone)]
pub struct IntegritySealer {
    algorithm: HashAlgorithm,
    audit: Arc<dyn AuditTrail>,
    metrics: Option<Arc<IntegrityMetrics>>,
}

impl fmt::Debug for IntegritySealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegritySealer")
            .field("algorithm", &self.algorithm)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl IntegritySealer {
    /// Create a sealer writing validation outcomes to `audit`
    pub fn new(algorithm: HashAlgorithm, audit: Arc<dyn AuditTrail>) -> Self {
        Self {
            algorithm,
            audit,
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<IntegrityMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Algorithm used for new seals
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Approval hash of the budget's current structure with the configured algorithm
    ///
    /// Pure computation: nothing is appended to the audit trail. Sealing goes
    /// through [`Budget::approve`], whose `HASH_GENERATED` entry is persisted
    /// with the frozen budget by `BudgetStore::commit_seal`.
    pub fn generate_approval_hash(&self, budget: &Budget) -> String {
        let start = Instant::now();
        let hash = approval_digest(budget, self.algorithm);

        if let Some(metrics) = &self.metrics {
            metrics.record_hash(HashKind::Approval, self.algorithm, start.elapsed().as_secs_f64());
            metrics.record_lines_hashed(budget.line_count());
        }
        tracing::debug!(
            budget_id = %budget.id(),
            lines = budget.line_count(),
            algorithm = %self.algorithm,
            hash = %truncate_hash(&hash),
            "Approval hash generated"
        );
        hash
    }

    /// Execution hash chained to the stored seal
    pub fn compute_execution_hash(&self, budget: &Budget) -> Result<String> {
        let (approval_hash, algorithm) = seal_of(budget)?;

        let start = Instant::now();
        let hash = execution_digest(budget, approval_hash, algorithm);

        if let Some(metrics) = &self.metrics {
            metrics.record_hash(HashKind::Execution, algorithm, start.elapsed().as_secs_f64());
        }
        Ok(hash)
    }

    /// Recompute and store the execution hash
    pub fn refresh_execution_hash(&self, budget: &mut Budget) -> Result<String> {
        let hash = self.compute_execution_hash(budget)?;
        budget.set_execution_hash(hash.clone());
        Ok(hash)
    }

    /// Recompute the approval hash and compare with the seal
    ///
    /// Both outcomes are appended to the audit trail. A mismatch appends
    /// exactly one `HASH_VIOLATION` entry and returns
    /// `Error::BudgetIntegrityViolation`.
    pub fn validate(&self, budget: &Budget, validator: Option<ApproverId>) -> Result<String> {
        let (expected, algorithm) = seal_of(budget)?;
        let actual = approval_digest(budget, algorithm);

        if actual == expected {
            self.audit
                .append(IntegrityAuditEntry::validated(budget, validator, algorithm))?;
            if let Some(metrics) = &self.metrics {
                metrics.record_validation(true, algorithm);
            }
            tracing::info!(
                budget_id = %budget.id(),
                algorithm = %algorithm,
                hash = %truncate_hash(&actual),
                "Budget integrity validated"
            );
            return Ok(actual);
        }

        let violation = IntegrityViolation {
            budget_id: budget.id(),
            expected_hash: expected.to_string(),
            actual_hash: actual,
            violation_type: TAMPERING_DETECTED.to_string(),
            algorithm,
        };

        tracing::error!(
            budget_id = %violation.budget_id,
            expected = %truncate_hash(&violation.expected_hash),
            actual = %truncate_hash(&violation.actual_hash),
            algorithm = %algorithm,
            "Budget integrity violation"
        );

        self.audit.append(IntegrityAuditEntry::violation(
            &violation,
            budget.execution_hash(),
            validator,
        ))?;
        if let Some(metrics) = &self.metrics {
            metrics.record_validation(false, algorithm);
        }

        Err(violation.into())
    }

    /// `HASH_GENERATED` entry for a budget sealed by this sealer
    pub(crate) fn generation_entry(&self, budget: &Budget) -> IntegrityAuditEntry {
        IntegrityAuditEntry::generated(budget, budget.hash_algorithm().unwrap_or(self.algorithm))
    }
}

fn seal_of(budget: &Budget) -> Result<(&str, HashAlgorithm)> {
    match (budget.approval_hash(), budget.hash_algorithm()) {
        (Some(hash), Some(algorithm)) => Ok((hash, algorithm)),
        _ => Err(Error::Validation(format!(
            "Budget {} has no approval seal",
            budget.id()
        ))),
    }
}

/// Canonical byte form covered by the approval hash
pub fn canonical_approval_form(budget: &Budget, algorithm: HashAlgorithm) -> Vec<u8> {
    let mut form = CanonicalForm::new("approval", algorithm);

    form.field(&budget.id().to_string())
        .field(&budget.project_id().to_string())
        .field(budget.name())
        .field(&budget.revision().to_string())
        .field(if budget.is_contractual() { "1" } else { "0" })
        .field(&budget.line_count().to_string());

    for line in budget.lines() {
        form.field("line")
            .field(line.code())
            .field(&line.id().to_string())
            .field(&line.parent_id().map(|p| p.to_string()).unwrap_or_default())
            .field(line.description())
            .field(line.unit().unwrap_or_default())
            .decimal(line.original_quantity())
            .decimal(line.current_quantity())
            .decimal(line.unit_price())
            .decimal(line.allocated_amount());
    }

    form.into_bytes()
}

/// Canonical byte form covered by the execution hash
pub fn canonical_execution_form(
    budget: &Budget,
    approval_hash: &str,
    algorithm: HashAlgorithm,
) -> Vec<u8> {
    let mut form = CanonicalForm::new("execution", algorithm);
    form.field(approval_hash);

    for line in budget.lines() {
        form.field("line")
            .field(line.code())
            .decimal(line.actual_expenses())
            .decimal(line.pending_commitments())
            .decimal(line.available_balance())
            .decimal(line.executed_quantity());
    }

    form.into_bytes()
}

/// Hex digest of `bytes`
pub fn digest(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256V1 => format!("{:x}", Sha256::digest(bytes)),
        HashAlgorithm::Blake3V1 => blake3::hash(bytes).to_hex().to_string(),
    }
}

fn approval_digest(budget: &Budget, algorithm: HashAlgorithm) -> String {
    digest(algorithm, &canonical_approval_form(budget, algorithm))
}

fn execution_digest(budget: &Budget, approval_hash: &str, algorithm: HashAlgorithm) -> String {
    digest(algorithm, &canonical_execution_form(budget, approval_hash, algorithm))
}

struct CanonicalForm {
    buf: String,
}

impl CanonicalForm {
    fn new(kind: &str, algorithm: HashAlgorithm) -> Self {
        let mut form = Self { buf: String::new() };
        form.field(kind).field(algorithm.tag());
        form
    }

    fn field(&mut self, value: &str) -> &mut Self {
        self.buf.push_str(&value.len().to_string());
        self.buf.push(':');
        self.buf.push_str(value);
        self.buf.push('|');
        self
    }

    fn decimal(&mut self, value: Decimal) -> &mut Self {
        self.field(&value.normalize().to_string())
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf.into_bytes()
    }
}
