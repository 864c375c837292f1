//! Change orders
//!
//! ```text
//!   DRAFT ──submit_for_review()──▶ IN_REVIEW ──approve()──▶ APPROVED
//!     ▲                                │
//!     └───────────reopen()──── REJECTED ◀──reject()
//! ```
//!
//! A change order never touches the frozen budget it targets. Once approved,
//! its deltas are applied to a copy that becomes the next revision.

use crate::{
    budget::Budget,
    error::{Error, Result},
    types::{ApproverId, BudgetId, ChangeOrderId, ProjectId},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Change order lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrderState {
    /// Being drafted, deltas editable
    Draft,
    /// Submitted, awaiting a decision
    InReview,
    /// Approved, can produce a revision
    Approved,
    /// Rejected, may be reopened
    Rejected,
}

impl ChangeOrderState {
    /// Canonical label
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOrderState::Draft => "DRAFT",
            ChangeOrderState::InReview => "IN_REVIEW",
            ChangeOrderState::Approved => "APPROVED",
            ChangeOrderState::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ChangeOrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single line change, addressed by line code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineDelta {
    /// New line; allocation equals its priced value
    AddLine {
        /// Code of the new line
        code: String,
        /// Description
        description: String,
        /// Unit of measure
        unit: Option<String>,
        /// Parent line code, `None` for a root line
        parent_code: Option<String>,
        /// Quantity
        quantity: Decimal,
        /// Unit price
        unit_price: Decimal,
    },
    /// Drop a leaf line with no expenses or commitments
    RemoveLine {
        /// Line code
        code: String,
    },
    /// New current quantity
    AdjustQuantity {
        /// Line code
        code: String,
        /// Replacement current quantity
        new_quantity: Decimal,
    },
    /// New unit price
    AdjustPrice {
        /// Line code
        code: String,
        /// Replacement unit price
        new_unit_price: Decimal,
    },
}

impl LineDelta {
    /// Code of the line the delta applies to
    pub fn code(&self) -> &str {
        match self {
            LineDelta::AddLine { code, .. }
            | LineDelta::RemoveLine { code }
            | LineDelta::AdjustQuantity { code, .. }
            | LineDelta::AdjustPrice { code, .. } => code,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.code().trim().is_empty() {
            return Err(Error::Validation("Delta line code cannot be empty".to_string()));
        }
        let negative = match self {
            LineDelta::AddLine {
                quantity,
                unit_price,
                ..
            } => quantity.is_sign_negative() || unit_price.is_sign_negative(),
            LineDelta::AdjustQuantity { new_quantity, .. } => new_quantity.is_sign_negative(),
            LineDelta::AdjustPrice { new_unit_price, .. } => new_unit_price.is_sign_negative(),
            LineDelta::RemoveLine { .. } => false,
        };
        if negative {
            return Err(Error::Validation(format!(
                "Delta for line {} carries a negative value",
                self.code()
            )));
        }
        Ok(())
    }
}

/// Request to alter a frozen budget's scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeOrder {
    id: ChangeOrderId,
    budget_id: BudgetId,
    project_id: ProjectId,
    state: ChangeOrderState,
    justification: Option<String>,
    deltas: Vec<LineDelta>,
    approver: Option<ApproverId>,
    rejection_reason: Option<String>,
    created_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
}

impl ChangeOrder {
    /// Draft change order against a budget
    pub fn new(budget: &Budget) -> Self {
        Self {
            id: ChangeOrderId::new(),
            budget_id: budget.id(),
            project_id: budget.project_id(),
            state: ChangeOrderState::Draft,
            justification: None,
            deltas: Vec::new(),
            approver: None,
            rejection_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    /// Id
    pub fn id(&self) -> ChangeOrderId {
        self.id
    }

    /// Target budget
    pub fn budget_id(&self) -> BudgetId {
        self.budget_id
    }

    /// Project
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// State
    pub fn state(&self) -> ChangeOrderState {
        self.state
    }

    /// Justification given on submission
    pub fn justification(&self) -> Option<&str> {
        self.justification.as_deref()
    }

    /// Line deltas in submission order
    pub fn deltas(&self) -> &[LineDelta] {
        &self.deltas
    }

    /// Approver, set on approval
    pub fn approver(&self) -> Option<ApproverId> {
        self.approver
    }

    /// Reason recorded on rejection
    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    /// Creation timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Approval or rejection timestamp
    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        self.decided_at
    }

    /// Add a delta; one delta per line code
    pub fn add_delta(&mut self, delta: LineDelta) -> Result<()> {
        self.ensure_state(ChangeOrderState::Draft, "add delta")?;
        delta.validate()?;
        if self.deltas.iter().any(|d| d.code() == delta.code()) {
            return Err(Error::Validation(format!(
                "Change order already has a delta for line {}",
                delta.code()
            )));
        }
        self.deltas.push(delta);
        Ok(())
    }

    /// DRAFT → IN_REVIEW
    pub fn submit_for_review(&mut self, justification: impl Into<String>) -> Result<()> {
        self.ensure_state(ChangeOrderState::Draft, "submit for review")?;

        let justification = justification.into().trim().to_string();
        if justification.is_empty() {
            return Err(Error::Validation(
                "A justification is required to submit a change order".to_string(),
            ));
        }
        if self.deltas.is_empty() {
            return Err(Error::Validation(
                "A change order needs at least one line delta".to_string(),
            ));
        }

        self.justification = Some(justification);
        self.state = ChangeOrderState::InReview;
        Ok(())
    }

    /// IN_REVIEW → APPROVED
    pub fn approve(&mut self, approver: ApproverId) -> Result<()> {
        self.ensure_state(ChangeOrderState::InReview, "approve")?;
        if approver.as_uuid().is_nil() {
            return Err(Error::Validation(
                "An approver reference is required".to_string(),
            ));
        }
        self.approver = Some(approver);
        self.state = ChangeOrderState::Approved;
        self.decided_at = Some(Utc::now());
        tracing::info!(change_order_id = %self.id, budget_id = %self.budget_id, "Change order approved");
        Ok(())
    }

    /// IN_REVIEW → REJECTED
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_state(ChangeOrderState::InReview, "reject")?;
        let reason = reason.into().trim().to_string();
        if reason.is_empty() {
            return Err(Error::Validation("A rejection reason is required".to_string()));
        }
        self.rejection_reason = Some(reason);
        self.state = ChangeOrderState::Rejected;
        self.decided_at = Some(Utc::now());
        Ok(())
    }

    /// REJECTED → DRAFT
    pub fn reopen(&mut self) -> Result<()> {
        self.ensure_state(ChangeOrderState::Rejected, "reopen")?;
        self.state = ChangeOrderState::Draft;
        self.rejection_reason = None;
        self.decided_at = None;
        Ok(())
    }

    fn ensure_state(&self, expected: ChangeOrderState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::ChangeOrderPrecondition(format!(
                "Cannot {} change order {} in state {}, expected {}",
                operation, self.id, self.state, expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> ChangeOrder {
        let budget = Budget::new(ProjectId::new(), "Plaza").unwrap();
        ChangeOrder::new(&budget)
    }

    fn adjust(code: &str, qty: i64) -> LineDelta {
        LineDelta::AdjustQuantity {
            code: code.to_string(),
            new_quantity: Decimal::from(qty),
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut co = order();
        co.add_delta(adjust("01", 12)).unwrap();
        co.submit_for_review("Client requested extra floor area").unwrap();
        assert_eq!(co.state(), ChangeOrderState::InReview);

        // Deltas are fixed once submitted
        assert!(co.add_delta(adjust("02", 3)).is_err());

        let approver = ApproverId::new();
        co.approve(approver).unwrap();
        assert_eq!(co.state(), ChangeOrderState::Approved);
        assert_eq!(co.approver(), Some(approver));
        assert!(co.decided_at().is_some());
    }

    #[test]
    fn test_submit_requires_deltas_and_justification() {
        let mut co = order();
        assert!(matches!(
            co.submit_for_review("Reason"),
            Err(Error::Validation(_))
        ));
        co.add_delta(adjust("01", 1)).unwrap();
        assert!(co.submit_for_review("   ").is_err());
        assert_eq!(co.state(), ChangeOrderState::Draft);
    }

    #[test]
    fn test_reject_and_reopen() {
        let mut co = order();
        co.add_delta(adjust("01", 1)).unwrap();
        co.submit_for_review("Scope change").unwrap();
        co.reject("Missing quotes").unwrap();
        assert_eq!(co.rejection_reason(), Some("Missing quotes"));

        assert!(matches!(
            co.approve(ApproverId::new()),
            Err(Error::ChangeOrderPrecondition(_))
        ));

        co.reopen().unwrap();
        assert_eq!(co.state(), ChangeOrderState::Draft);
        assert_eq!(co.rejection_reason(), None);
        co.add_delta(adjust("02", 4)).unwrap();
        assert_eq!(co.deltas().len(), 2);
    }

    #[test]
    fn test_delta_validation() {
        let mut co = order();
        assert!(co.add_delta(adjust("01", -1)).is_err());
        assert!(co.add_delta(adjust(" ", 1)).is_err());
        co.add_delta(adjust("01", 1)).unwrap();
        assert!(co
            .add_delta(LineDelta::RemoveLine {
                code: "01".to_string()
            })
            .is_err());
    }
}
