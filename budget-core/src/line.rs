//! Budget line ledger
//!
//! A line is one work-breakdown item carrying a quantity baseline and a
//! monetary allocation. Balance bookkeeping:
//!
//! ```text
//! available_balance = allocated_amount - actual_expenses - pending_commitments
//! ```
//!
//! The available balance is never stored; it is derived on every read so the
//! identity holds in exact decimal arithmetic at all times.
//!
//! Sealed fields (code, description, unit, parent, quantities, unit price,
//! allocation) are locked once the owning budget freezes. Commitments, expenses
//! and executed quantity keep moving after the freeze.

use crate::{
    error::{Error, Result},
    types::{BudgetId, LineId},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Policy applied when accumulated execution exceeds the current quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OveragePolicy {
    /// Reject with `ExecutionCapExceeded`; a change order must raise the quantity first
    Reject,
    /// Accept, log a warning and report the excess
    Warn,
}

impl Default for OveragePolicy {
    fn default() -> Self {
        OveragePolicy::Reject
    }
}

impl FromStr for OveragePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OveragePolicy::Reject),
            "warn" => Ok(OveragePolicy::Warn),
            other => Err(Error::Validation(format!(
                "Unknown overage policy: {}",
                other
            ))),
        }
    }
}

/// Outcome of an executed-quantity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionCheck {
    /// Accumulated execution is within the current quantity
    WithinCap {
        /// Accumulated executed quantity
        executed: Decimal,
        /// Quantity still available
        remaining: Decimal,
    },
    /// Accepted over the cap (warn policy)
    OverCap {
        /// Accumulated executed quantity
        executed: Decimal,
        /// Quantity above the cap
        excess: Decimal,
    },
}

/// Append-only progress entry supplied by the progress-reporting collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Line the progress belongs to
    pub line_id: LineId,
    /// Executed quantity reported by this entry
    pub quantity: Decimal,
    /// Report timestamp
    pub recorded_at: DateTime<Utc>,
}

/// Source of accumulated progress per line
pub trait ProgressSource {
    /// All progress entries recorded so far for a line
    fn entries(&self, line_id: LineId) -> Result<Vec<ProgressEntry>>;
}

impl ProgressSource for [ProgressEntry] {
    fn entries(&self, line_id: LineId) -> Result<Vec<ProgressEntry>> {
        Ok(self.iter().filter(|e| e.line_id == line_id).cloned().collect())
    }
}

impl ProgressSource for Vec<ProgressEntry> {
    fn entries(&self, line_id: LineId) -> Result<Vec<ProgressEntry>> {
        self.as_slice().entries(line_id)
    }
}

/// Single work-breakdown line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLine {
    id: LineId,
    budget_id: BudgetId,
    parent_id: Option<LineId>,
    code: String,
    description: String,
    unit: Option<String>,
    original_quantity: Decimal,
    current_quantity: Decimal,
    unit_price: Decimal,
    allocated_amount: Decimal,
    actual_expenses: Decimal,
    pending_commitments: Decimal,
    executed_quantity: Decimal,
    locked: bool,
    version: Option<u64>,
}

impl BudgetLine {
    /// Create a new unallocated line
    pub fn new(
        budget_id: BudgetId,
        code: impl Into<String>,
        description: impl Into<String>,
        unit: Option<String>,
        quantity: Decimal,
        unit_price: Decimal,
    ) -> Result<Self> {
        let code = code.into().trim().to_string();
        let description = description.into().trim().to_string();

        if code.is_empty() {
            return Err(Error::Validation("Line code cannot be empty".to_string()));
        }
        if description.is_empty() {
            return Err(Error::Validation(
                "Line description cannot be empty".to_string(),
            ));
        }
        ensure_non_negative(quantity, "Quantity")?;
        ensure_non_negative(unit_price, "Unit price")?;

        Ok(Self {
            id: LineId::new(),
            budget_id,
            parent_id: None,
            code,
            description,
            unit: unit.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()),
            original_quantity: quantity,
            current_quantity: quantity,
            unit_price,
            allocated_amount: Decimal::ZERO,
            actual_expenses: Decimal::ZERO,
            pending_commitments: Decimal::ZERO,
            executed_quantity: Decimal::ZERO,
            locked: false,
            version: None,
        })
    }

    // Accessors

    /// Line id
    pub fn id(&self) -> LineId {
        self.id
    }

    /// Owning budget
    pub fn budget_id(&self) -> BudgetId {
        self.budget_id
    }

    /// Parent line, if any
    pub fn parent_id(&self) -> Option<LineId> {
        self.parent_id
    }

    /// WBS code ("01.02.03")
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Unit of measure
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Quantity at original approval
    pub fn original_quantity(&self) -> Decimal {
        self.original_quantity
    }

    /// Currently authorized quantity
    pub fn current_quantity(&self) -> Decimal {
        self.current_quantity
    }

    /// Unit price
    pub fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    /// Allocated amount
    pub fn allocated_amount(&self) -> Decimal {
        self.allocated_amount
    }

    /// Actual expenses
    pub fn actual_expenses(&self) -> Decimal {
        self.actual_expenses
    }

    /// Reserved but unspent amount
    pub fn pending_commitments(&self) -> Decimal {
        self.pending_commitments
    }

    /// Last accepted accumulated executed quantity
    pub fn executed_quantity(&self) -> Decimal {
        self.executed_quantity
    }

    /// Storage-assigned version, `None` until first persisted
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Whether sealed fields are locked
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Allocated minus expenses minus commitments
    ///
    /// Expenses plus commitments never exceed the allocation, so this cannot
    /// overflow.
    pub fn available_balance(&self) -> Decimal {
        self.allocated_amount - self.actual_expenses - self.pending_commitments
    }

    /// Priced value of the current quantity
    pub fn priced_value(&self) -> Result<Decimal> {
        priced(self.current_quantity, self.unit_price, &self.code)
    }

    // Structural mutators (draft only)

    /// Increase the allocated amount
    pub fn allocate(&mut self, amount: Decimal) -> Result<()> {
        self.ensure_unlocked("allocate")?;
        ensure_positive(amount, "Allocation")?;
        self.allocated_amount = checked(
            self.allocated_amount.checked_add(amount),
            "Allocated amount",
            &self.code,
        )?;
        tracing::debug!(line_id = %self.id, %amount, "Line allocated");
        Ok(())
    }

    /// Set the original quantity; the current quantity follows while in draft
    pub fn set_original_quantity(&mut self, quantity: Decimal) -> Result<()> {
        self.ensure_unlocked("set original quantity")?;
        ensure_non_negative(quantity, "Quantity")?;
        self.original_quantity = quantity;
        self.current_quantity = quantity;
        Ok(())
    }

    /// Set the unit price
    pub fn set_unit_price(&mut self, unit_price: Decimal) -> Result<()> {
        self.ensure_unlocked("set unit price")?;
        ensure_non_negative(unit_price, "Unit price")?;
        self.unit_price = unit_price;
        Ok(())
    }

    /// Replace description
    pub fn set_description(&mut self, description: impl Into<String>) -> Result<()> {
        self.ensure_unlocked("change description")?;
        let description = description.into().trim().to_string();
        if description.is_empty() {
            return Err(Error::Validation(
                "Line description cannot be empty".to_string(),
            ));
        }
        self.description = description;
        Ok(())
    }

    // Ledger operations (allowed after freeze)

    /// Reserve part of the available balance as a pending commitment
    ///
    /// On failure nothing is mutated.
    pub fn reserve_commitment(&mut self, amount: Decimal) -> Result<()> {
        ensure_positive(amount, "Commitment")?;
        let available = self.available_balance();
        if amount > available {
            return Err(Error::InsufficientBalance {
                line_id: self.id,
                available,
                requested: amount,
            });
        }
        self.pending_commitments = checked(
            self.pending_commitments.checked_add(amount),
            "Pending commitments",
            &self.code,
        )?;
        tracing::debug!(line_id = %self.id, %amount, "Commitment reserved");
        Ok(())
    }

    /// Exact inverse of `reserve_commitment`
    pub fn release_commitment(&mut self, amount: Decimal) -> Result<()> {
        ensure_positive(amount, "Release")?;
        if amount > self.pending_commitments {
            return Err(Error::Validation(format!(
                "Release of {} exceeds pending commitments {} on line {}",
                amount, self.pending_commitments, self.id
            )));
        }
        self.pending_commitments -= amount;
        tracing::debug!(line_id = %self.id, %amount, "Commitment released");
        Ok(())
    }

    /// Record an expense that was not previously committed
    pub fn record_actual_expense(&mut self, amount: Decimal) -> Result<()> {
        ensure_positive(amount, "Expense")?;
        let available = self.available_balance();
        if amount > available {
            return Err(Error::InsufficientBalance {
                line_id: self.id,
                available,
                requested: amount,
            });
        }
        self.actual_expenses = checked(
            self.actual_expenses.checked_add(amount),
            "Actual expenses",
            &self.code,
        )?;
        tracing::debug!(line_id = %self.id, %amount, "Actual expense recorded");
        Ok(())
    }

    /// Convert a pending commitment into an actual expense
    ///
    /// The available balance is unchanged.
    pub fn settle_commitment(&mut self, amount: Decimal) -> Result<()> {
        ensure_positive(amount, "Settlement")?;
        if amount > self.pending_commitments {
            return Err(Error::Validation(format!(
                "Settlement of {} exceeds pending commitments {} on line {}",
                amount, self.pending_commitments, self.id
            )));
        }
        let expenses = checked(
            self.actual_expenses.checked_add(amount),
            "Actual expenses",
            &self.code,
        )?;
        self.pending_commitments -= amount;
        self.actual_expenses = expenses;
        Ok(())
    }

    /// Check a new executed quantity against the current quantity
    ///
    /// The total is rebuilt from the append-only progress entries plus the new
    /// quantity, never from a running counter. The caller appends the progress
    /// entry once this returns `Ok`.
    pub fn record_executed_quantity<P: ProgressSource + ?Sized>(
        &mut self,
        quantity: Decimal,
        progress: &P,
        policy: OveragePolicy,
    ) -> Result<ExecutionCheck> {
        ensure_positive(quantity, "Executed quantity")?;

        let executed = progress
            .entries(self.id)?
            .iter()
            .try_fold(quantity, |total, entry| total.checked_add(entry.quantity));
        let executed = checked(executed, "Executed quantity", &self.code)?;

        if executed <= self.current_quantity {
            self.executed_quantity = executed;
            return Ok(ExecutionCheck::WithinCap {
                executed,
                remaining: self.current_quantity - executed,
            });
        }

        match policy {
            OveragePolicy::Reject => Err(Error::ExecutionCapExceeded {
                line_id: self.id,
                cap: self.current_quantity,
                executed,
            }),
            OveragePolicy::Warn => {
                let excess = executed - self.current_quantity;
                tracing::warn!(
                    line_id = %self.id,
                    code = %self.code,
                    cap = %self.current_quantity,
                    %executed,
                    %excess,
                    "Executed quantity exceeds authorized quantity"
                );
                self.executed_quantity = executed;
                Ok(ExecutionCheck::OverCap { executed, excess })
            }
        }
    }

    // Crate-internal hooks for the aggregate, storage and revision service

    pub(crate) fn set_parent(&mut self, parent_id: Option<LineId>) -> Result<()> {
        self.ensure_unlocked("reparent line")?;
        self.parent_id = parent_id;
        Ok(())
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }

    /// Compare every field covered by the approval seal
    pub(crate) fn sealed_fields_eq(&self, other: &BudgetLine) -> bool {
        self.id == other.id
            && self.budget_id == other.budget_id
            && self.parent_id == other.parent_id
            && self.code == other.code
            && self.description == other.description
            && self.unit == other.unit
            && self.original_quantity == other.original_quantity
            && self.current_quantity == other.current_quantity
            && self.unit_price == other.unit_price
            && self.allocated_amount == other.allocated_amount
            && self.locked == other.locked
    }

    /// Copy into a new revision: fresh id, unlocked, never persisted
    pub(crate) fn carry_forward(&self, budget_id: BudgetId, parent_id: Option<LineId>) -> Self {
        Self {
            id: LineId::new(),
            budget_id,
            parent_id,
            locked: false,
            version: None,
            ..self.clone()
        }
    }

    /// Move the current quantity; allocation follows the priced value
    pub(crate) fn revise_quantity(&mut self, quantity: Decimal) -> Result<()> {
        self.ensure_unlocked("revise quantity")?;
        ensure_non_negative(quantity, "Quantity")?;
        let allocated = self.revised_allocation(quantity, self.unit_price)?;
        self.current_quantity = quantity;
        self.allocated_amount = allocated;
        Ok(())
    }

    /// Move the unit price; allocation follows the priced value
    pub(crate) fn revise_unit_price(&mut self, unit_price: Decimal) -> Result<()> {
        self.ensure_unlocked("revise unit price")?;
        ensure_non_negative(unit_price, "Unit price")?;
        let allocated = self.revised_allocation(self.current_quantity, unit_price)?;
        self.unit_price = unit_price;
        self.allocated_amount = allocated;
        Ok(())
    }

    /// Allocation after repricing; must still cover expenses and commitments
    fn revised_allocation(&self, quantity: Decimal, unit_price: Decimal) -> Result<Decimal> {
        let before = self.priced_value()?;
        let after = priced(quantity, unit_price, &self.code)?;
        let allocated = checked(
            after
                .checked_sub(before)
                .and_then(|delta| self.allocated_amount.checked_add(delta)),
            "Allocated amount",
            &self.code,
        )?;

        let spent = checked(
            self.actual_expenses.checked_add(self.pending_commitments),
            "Expenses and commitments",
            &self.code,
        )?;
        if allocated < spent {
            return Err(Error::ChangeOrderPrecondition(format!(
                "Line {} would be allocated {}, below its expenses and commitments of {}",
                self.code, allocated, spent
            )));
        }
        Ok(allocated)
    }

    fn ensure_unlocked(&self, operation: &str) -> Result<()> {
        if self.locked {
            return Err(Error::frozen(
                self.budget_id,
                format!("{} on line {}", operation, self.code),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tamper_allocated_amount(&mut self, amount: Decimal) {
        self.allocated_amount = amount;
    }
}

fn checked(value: Option<Decimal>, what: &str, code: &str) -> Result<Decimal> {
    value.ok_or_else(|| Error::Validation(format!("{} on line {} overflows", what, code)))
}

fn priced(quantity: Decimal, unit_price: Decimal, code: &str) -> Result<Decimal> {
    checked(quantity.checked_mul(unit_price), "Priced value", code)
}

fn ensure_positive(amount: Decimal, what: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::Validation(format!("{} must be positive", what)));
    }
    Ok(())
}

fn ensure_non_negative(amount: Decimal, what: &str) -> Result<()> {
    if amount < Decimal::ZERO {
        return Err(Error::Validation(format!("{} cannot be negative", what)));
    }
    Ok(())
}
