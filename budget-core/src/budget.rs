//! Budget aggregate and freeze state machine
//!
//! ```text
//!   DRAFT ──approve()──▶ FROZEN ──invalidate()──▶ INVALIDATED
//! ```
//!
//! Lines live in a flat arena keyed by id. Parents are referenced by id only,
//! and every insert or reparent is checked for cycles. A code index keeps the
//! canonical (code-sorted) order used for sealing.

use crate::{
    audit::IntegrityAuditEntry,
    error::{Error, Result},
    integrity::IntegritySealer,
    line::BudgetLine,
    types::{ApproverId, BudgetId, BudgetState, ChangeOrderId, HashAlgorithm, LineId, ProjectId},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Capability answering whether a schedule baseline exists for a project
///
/// Budget and schedule freeze together; the schedule module stays behind
/// this single predicate.
pub trait ScheduleBaseline {
    /// Whether a baseline exists for the project
    fn has_baseline(&self, project_id: ProjectId) -> Result<bool>;
}

/// Budget aggregate root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    id: BudgetId,
    project_id: ProjectId,
    name: String,
    state: BudgetState,
    revision: u32,
    contractual: bool,
    approval_hash: Option<String>,
    execution_hash: Option<String>,
    hash_algorithm: Option<HashAlgorithm>,
    approved_by: Option<ApproverId>,
    frozen_at: Option<DateTime<Utc>>,
    supersedes: Option<BudgetId>,
    change_order_id: Option<ChangeOrderId>,
    version: Option<u64>,

    // Lines are persisted separately, keyed by line id
    #[serde(skip)]
    lines: HashMap<LineId, BudgetLine>,
    #[serde(skip)]
    code_index: BTreeMap<String, LineId>,
}

impl Budget {
    /// Create a draft budget at revision 1
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: BudgetId::new(),
            project_id,
            name: normalize_name(name.into())?,
            state: BudgetState::Draft,
            revision: 1,
            contractual: false,
            approval_hash: None,
            execution_hash: None,
            hash_algorithm: None,
            approved_by: None,
            frozen_at: None,
            supersedes: None,
            change_order_id: None,
            version: None,
            lines: HashMap::new(),
            code_index: BTreeMap::new(),
        })
    }

    /// Draft successor of `base` at the given revision, without lines
    pub(crate) fn successor(base: &Budget, revision: u32, change_order_id: ChangeOrderId) -> Self {
        let root_name = base
            .name
            .split(" (v")
            .next()
            .unwrap_or(base.name.as_str())
            .to_string();

        Self {
            id: BudgetId::new(),
            project_id: base.project_id,
            name: format!("{} (v{})", root_name, revision),
            state: BudgetState::Draft,
            revision,
            contractual: base.contractual,
            approval_hash: None,
            execution_hash: None,
            hash_algorithm: None,
            approved_by: None,
            frozen_at: None,
            supersedes: Some(base.id),
            change_order_id: Some(change_order_id),
            version: None,
            lines: HashMap::new(),
            code_index: BTreeMap::new(),
        }
    }

    // Accessors

    /// Budget id
    pub fn id(&self) -> BudgetId {
        self.id
    }

    /// Budget this revision replaces, `None` for a first revision
    pub fn supersedes(&self) -> Option<BudgetId> {
        self.supersedes
    }

    /// Change order this revision was built from
    pub fn change_order_id(&self) -> Option<ChangeOrderId> {
        self.change_order_id
    }

    /// Owning project
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle state
    pub fn state(&self) -> BudgetState {
        self.state
    }

    /// Revision number (1 for the original baseline)
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Contractual flag
    pub fn is_contractual(&self) -> bool {
        self.contractual
    }

    /// Hash sealed at approval
    pub fn approval_hash(&self) -> Option<&str> {
        self.approval_hash.as_deref()
    }

    /// Last computed execution hash
    pub fn execution_hash(&self) -> Option<&str> {
        self.execution_hash.as_deref()
    }

    /// Algorithm the seal was produced with
    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        self.hash_algorithm
    }

    /// Approver
    pub fn approved_by(&self) -> Option<ApproverId> {
        self.approved_by
    }

    /// Freeze timestamp
    pub fn frozen_at(&self) -> Option<DateTime<Utc>> {
        self.frozen_at
    }

    /// Storage-assigned version, `None` until first persisted
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Whether an approval hash is present
    pub fn is_sealed(&self) -> bool {
        self.approval_hash.is_some()
    }

    /// Number of lines
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Lines in canonical (code) order
    pub fn lines(&self) -> impl Iterator<Item = &BudgetLine> + '_ {
        self.code_index.values().filter_map(|id| self.lines.get(id))
    }

    /// Line by id
    pub fn line(&self, line_id: LineId) -> Option<&BudgetLine> {
        self.lines.get(&line_id)
    }

    /// Line by code
    pub fn line_by_code(&self, code: &str) -> Option<&BudgetLine> {
        self.code_index.get(code).and_then(|id| self.lines.get(id))
    }

    /// Mutable line access for ledger operations
    ///
    /// Sealed fields of a frozen budget's lines stay locked.
    pub fn line_mut(&mut self, line_id: LineId) -> Option<&mut BudgetLine> {
        self.lines.get_mut(&line_id)
    }

    /// Direct children of a line
    pub fn children(&self, line_id: LineId) -> Vec<&BudgetLine> {
        self.lines()
            .filter(|line| line.parent_id() == Some(line_id))
            .collect()
    }

    /// Depth in the hierarchy, roots are level 1
    pub fn level(&self, line_id: LineId) -> Option<usize> {
        let mut level = 1;
        let mut current = self.lines.get(&line_id)?;
        while let Some(parent) = current.parent_id().and_then(|p| self.lines.get(&p)) {
            level += 1;
            current = parent;
            if level > self.lines.len() {
                break;
            }
        }
        Some(level)
    }

    /// Sum of allocations
    pub fn total_allocated(&self) -> Decimal {
        self.lines.values().map(|l| l.allocated_amount()).sum()
    }

    /// Sum of available balances
    pub fn total_available(&self) -> Decimal {
        self.lines.values().map(|l| l.available_balance()).sum()
    }

    // Structural operations (draft only)

    /// Rename
    pub fn rename(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_draft("rename budget")?;
        self.name = normalize_name(name.into())?;
        Ok(())
    }

    /// Flag as contractual
    pub fn mark_contractual(&mut self) -> Result<()> {
        self.ensure_draft("mark contractual")?;
        self.contractual = true;
        Ok(())
    }

    /// Add a line under an optional parent
    pub fn add_line(&mut self, mut line: BudgetLine, parent_id: Option<LineId>) -> Result<LineId> {
        self.ensure_draft("add line")?;

        if line.budget_id() != self.id {
            return Err(Error::Validation(format!(
                "Line {} belongs to budget {}, not {}",
                line.code(),
                line.budget_id(),
                self.id
            )));
        }
        if self.code_index.contains_key(line.code()) {
            return Err(Error::Validation(format!(
                "Duplicate line code {}",
                line.code()
            )));
        }
        if let Some(parent) = parent_id {
            if !self.lines.contains_key(&parent) {
                return Err(Error::LineNotFound(parent.to_string()));
            }
        }

        line.set_parent(parent_id)?;
        let line_id = line.id();
        self.code_index.insert(line.code().to_string(), line_id);
        self.lines.insert(line_id, line);
        Ok(line_id)
    }

    /// Remove a leaf line
    pub fn remove_line(&mut self, line_id: LineId) -> Result<BudgetLine> {
        self.ensure_draft("remove line")?;

        if !self.lines.contains_key(&line_id) {
            return Err(Error::LineNotFound(line_id.to_string()));
        }
        if self.lines.values().any(|l| l.parent_id() == Some(line_id)) {
            return Err(Error::InvariantViolation(format!(
                "Line {} still has children",
                line_id
            )));
        }

        let line = self
            .lines
            .remove(&line_id)
            .ok_or_else(|| Error::LineNotFound(line_id.to_string()))?;
        self.code_index.remove(line.code());
        Ok(line)
    }

    /// Move a line under a new parent (or to the root)
    pub fn reparent_line(&mut self, line_id: LineId, new_parent: Option<LineId>) -> Result<()> {
        self.ensure_draft("reparent line")?;

        if !self.lines.contains_key(&line_id) {
            return Err(Error::LineNotFound(line_id.to_string()));
        }
        if let Some(parent) = new_parent {
            if !self.lines.contains_key(&parent) {
                return Err(Error::LineNotFound(parent.to_string()));
            }
            if self.is_ancestor_or_self(line_id, parent) {
                return Err(Error::InvariantViolation(format!(
                    "Reparenting line {} under {} would create a cycle",
                    line_id, parent
                )));
            }
        }

        self.lines
            .get_mut(&line_id)
            .ok_or_else(|| Error::LineNotFound(line_id.to_string()))?
            .set_parent(new_parent)
    }

    /// Change a line's original quantity
    pub fn set_original_quantity(&mut self, line_id: LineId, quantity: Decimal) -> Result<()> {
        self.ensure_draft("change original quantity")?;
        self.draft_line_mut(line_id)?.set_original_quantity(quantity)
    }

    /// Change a line's unit price
    pub fn set_unit_price(&mut self, line_id: LineId, unit_price: Decimal) -> Result<()> {
        self.ensure_draft("change unit price")?;
        self.draft_line_mut(line_id)?.set_unit_price(unit_price)
    }

    /// Increase a line's allocation
    pub fn allocate(&mut self, line_id: LineId, amount: Decimal) -> Result<()> {
        self.ensure_draft("allocate")?;
        self.draft_line_mut(line_id)?.allocate(amount)
    }

    // State machine

    /// Freeze and seal: DRAFT → FROZEN
    ///
    /// Returns the `HASH_GENERATED` entry, which the caller must commit to the
    /// audit trail together with the frozen budget.
    #[must_use = "the HASH_GENERATED audit entry must be committed"]
    pub fn approve(
        &mut self,
        approver: ApproverId,
        baseline: &dyn ScheduleBaseline,
        sealer: &IntegritySealer,
    ) -> Result<IntegrityAuditEntry> {
        if self.state != BudgetState::Draft {
            return Err(Error::InvalidStateTransition {
                budget_id: self.id,
                from: self.state,
                to: BudgetState::Frozen,
            });
        }
        if approver.as_uuid().is_nil() {
            return Err(Error::Validation(
                "An approver reference is required".to_string(),
            ));
        }
        if !baseline.has_baseline(self.project_id)? {
            return Err(Error::ScheduleBaselineMissing(self.project_id));
        }
        if let Some(line) = self
            .lines()
            .find(|line| line.available_balance() < Decimal::ZERO)
        {
            return Err(Error::InvariantViolation(format!(
                "Line {} has negative available balance {}",
                line.code(),
                line.available_balance()
            )));
        }

        // Compute the seal before touching any field so a failure leaves the draft intact
        let algorithm = sealer.algorithm();
        let approval_hash = sealer.generate_approval_hash(self);

        for line in self.lines.values_mut() {
            line.lock();
        }
        self.state = BudgetState::Frozen;
        self.approval_hash = Some(approval_hash);
        self.hash_algorithm = Some(algorithm);
        self.approved_by = Some(approver);
        self.frozen_at = Some(Utc::now());
        self.execution_hash = Some(sealer.compute_execution_hash(self)?);

        tracing::info!(
            budget_id = %self.id,
            revision = self.revision,
            lines = self.lines.len(),
            algorithm = %algorithm,
            "Budget frozen"
        );

        Ok(sealer.generation_entry(self))
    }

    /// Supersede or cancel: FROZEN → INVALIDATED (irreversible)
    pub fn invalidate(&mut self) -> Result<()> {
        if self.state != BudgetState::Frozen {
            return Err(Error::InvalidStateTransition {
                budget_id: self.id,
                from: self.state,
                to: BudgetState::Invalidated,
            });
        }
        self.state = BudgetState::Invalidated;
        tracing::info!(budget_id = %self.id, revision = self.revision, "Budget invalidated");
        Ok(())
    }

    // Crate-internal hooks for storage, sealing and revisioning

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }

    pub(crate) fn set_execution_hash(&mut self, hash: String) {
        self.execution_hash = Some(hash);
    }

    pub(crate) fn lines_mut(&mut self) -> impl Iterator<Item = &mut BudgetLine> + '_ {
        self.lines.values_mut()
    }

    /// Rehydrate lines loaded from storage
    pub(crate) fn restore_lines(&mut self, lines: Vec<BudgetLine>) {
        self.lines.clear();
        self.code_index.clear();
        for line in lines {
            self.code_index.insert(line.code().to_string(), line.id());
            self.lines.insert(line.id(), line);
        }
    }

    /// Root record without lines, as persisted
    pub(crate) fn detached_root(&self) -> Self {
        Self {
            id: self.id,
            project_id: self.project_id,
            name: self.name.clone(),
            state: self.state,
            revision: self.revision,
            contractual: self.contractual,
            approval_hash: self.approval_hash.clone(),
            execution_hash: self.execution_hash.clone(),
            hash_algorithm: self.hash_algorithm,
            approved_by: self.approved_by,
            frozen_at: self.frozen_at,
            supersedes: self.supersedes,
            change_order_id: self.change_order_id,
            version: self.version,
            lines: HashMap::new(),
            code_index: BTreeMap::new(),
        }
    }

    /// Compare every root field fixed by the seal
    pub(crate) fn sealed_root_eq(&self, other: &Budget) -> bool {
        self.id == other.id
            && self.project_id == other.project_id
            && self.name == other.name
            && self.revision == other.revision
            && self.contractual == other.contractual
            && self.approval_hash == other.approval_hash
            && self.hash_algorithm == other.hash_algorithm
            && self.approved_by == other.approved_by
            && self.frozen_at == other.frozen_at
            && self.supersedes == other.supersedes
            && self.change_order_id == other.change_order_id
    }

    fn ensure_draft(&self, operation: &str) -> Result<()> {
        match self.state {
            BudgetState::Draft => Ok(()),
            _ => Err(Error::frozen(self.id, operation)),
        }
    }

    fn draft_line_mut(&mut self, line_id: LineId) -> Result<&mut BudgetLine> {
        self.lines
            .get_mut(&line_id)
            .ok_or_else(|| Error::LineNotFound(line_id.to_string()))
    }

    /// Whether `ancestor` is `node` or one of its ancestors
    fn is_ancestor_or_self(&self, ancestor: LineId, node: LineId) -> bool {
        let mut current = Some(node);
        let mut steps = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.lines.len() {
                // Corrupt data already holds a cycle
                return true;
            }
            current = self.lines.get(&id).and_then(|l| l.parent_id());
        }
        false
    }
}

fn normalize_name(name: String) -> Result<String> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Validation("Budget name cannot be empty".to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    struct Baseline(bool);

    impl ScheduleBaseline for Baseline {
        fn has_baseline(&self, _project_id: ProjectId) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn sealer() -> IntegritySealer {
        IntegritySealer::new(HashAlgorithm::Sha256V1, Arc::new(MemoryStore::new()))
    }

    fn line(budget: &Budget, code: &str) -> BudgetLine {
        BudgetLine::new(
            budget.id(),
            code,
            format!("Item {}", code),
            Some("m2".to_string()),
            Decimal::from(10),
            Decimal::new(2550, 2),
        )
        .unwrap()
    }

    fn draft_with_lines() -> (Budget, LineId, LineId) {
        let mut budget = Budget::new(ProjectId::new(), "Tower A").unwrap();
        let root = budget.add_line(line(&budget, "01"), None).unwrap();
        let child = budget.add_line(line(&budget, "01.01"), Some(root)).unwrap();
        budget.allocate(child, Decimal::from(255)).unwrap();
        (budget, root, child)
    }

    #[test]
    fn test_new_budget_is_draft_without_version() {
        let budget = Budget::new(ProjectId::new(), "  Tower A ").unwrap();
        assert_eq!(budget.state(), BudgetState::Draft);
        assert_eq!(budget.revision(), 1);
        assert_eq!(budget.name(), "Tower A");
        assert_eq!(budget.version(), None);
        assert!(!budget.is_sealed());
        assert!(Budget::new(ProjectId::new(), " ").is_err());
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let (mut budget, _, _) = draft_with_lines();
        let dup = line(&budget, "01.01");
        assert!(matches!(budget.add_line(dup, None), Err(Error::Validation(_))));
    }

    #[test]
    fn test_foreign_line_rejected() {
        let (mut budget, _, _) = draft_with_lines();
        let other = Budget::new(ProjectId::new(), "Other").unwrap();
        assert!(budget.add_line(line(&other, "02"), None).is_err());
    }

    #[test]
    fn test_levels_and_children() {
        let (mut budget, root, child) = draft_with_lines();
        let grandchild = budget.add_line(line(&budget, "01.01.01"), Some(child)).unwrap();

        assert_eq!(budget.level(root), Some(1));
        assert_eq!(budget.level(child), Some(2));
        assert_eq!(budget.level(grandchild), Some(3));
        assert_eq!(budget.children(root).len(), 1);
    }

    #[test]
    fn test_reparent_rejects_cycles() {
        let (mut budget, root, child) = draft_with_lines();
        let grandchild = budget.add_line(line(&budget, "01.01.01"), Some(child)).unwrap();

        let err = budget.reparent_line(root, Some(grandchild)).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert!(budget.reparent_line(root, Some(root)).is_err());

        budget.reparent_line(grandchild, Some(root)).unwrap();
        assert_eq!(budget.line(grandchild).unwrap().parent_id(), Some(root));
        assert_eq!(budget.level(grandchild), Some(2));
    }

    #[test]
    fn test_remove_line_requires_leaf() {
        let (mut budget, root, child) = draft_with_lines();
        assert!(budget.remove_line(root).is_err());
        budget.remove_line(child).unwrap();
        budget.remove_line(root).unwrap();
        assert_eq!(budget.line_count(), 0);
    }

    #[test]
    fn test_lines_iterate_in_code_order() {
        let mut budget = Budget::new(ProjectId::new(), "Ordering").unwrap();
        for code in ["03", "01", "02.01", "02"] {
            budget.add_line(line(&budget, code), None).unwrap();
        }
        let codes: Vec<&str> = budget.lines().map(|l| l.code()).collect();
        assert_eq!(codes, vec!["01", "02", "02.01", "03"]);
    }

    #[test]
    fn test_approve_freezes_and_seals() {
        let (mut budget, _, _) = draft_with_lines();
        let approver = ApproverId::new();

        let entry = budget.approve(approver, &Baseline(true), &sealer()).unwrap();

        assert_eq!(budget.state(), BudgetState::Frozen);
        assert_eq!(budget.approved_by(), Some(approver));
        assert!(budget.frozen_at().is_some());
        assert_eq!(budget.approval_hash().map(str::len), Some(64));
        assert!(budget.execution_hash().is_some());
        assert_eq!(budget.hash_algorithm(), Some(HashAlgorithm::Sha256V1));
        assert!(budget.lines().all(|l| l.is_locked()));
        assert_eq!(entry.approval_hash(), budget.approval_hash());
    }

    #[test]
    fn test_approve_requires_schedule_baseline() {
        let (mut budget, _, _) = draft_with_lines();
        let err = budget
            .approve(ApproverId::new(), &Baseline(false), &sealer())
            .unwrap_err();
        assert!(matches!(err, Error::ScheduleBaselineMissing(_)));
        assert_eq!(budget.state(), BudgetState::Draft);
        assert!(!budget.is_sealed());
    }

    #[test]
    fn test_approve_requires_approver() {
        let (mut budget, _, _) = draft_with_lines();
        let nil = ApproverId::from_uuid(uuid::Uuid::nil());
        assert!(matches!(
            budget.approve(nil, &Baseline(true), &sealer()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_frozen_budget_rejects_structural_edits() {
        let (mut budget, root, child) = draft_with_lines();
        let _ = budget.approve(ApproverId::new(), &Baseline(true), &sealer()).unwrap();

        let extra = line(&budget, "09");
        let results = vec![
            budget.add_line(extra, None).map(|_| ()),
            budget.remove_line(child).map(|_| ()),
            budget.reparent_line(child, None),
            budget.set_original_quantity(child, Decimal::from(99)),
            budget.allocate(child, Decimal::ONE),
            budget.rename("Renamed"),
        ];
        for result in results {
            match result {
                Err(Error::FrozenBudgetViolation { budget_id, operation }) => {
                    assert_eq!(budget_id, budget.id());
                    assert!(!operation.is_empty());
                }
                other => panic!("expected FrozenBudgetViolation, got {:?}", other),
            }
        }

        // Through the line handle as well
        let err = budget
            .line_mut(root)
            .unwrap()
            .set_original_quantity(Decimal::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::FrozenBudgetViolation { .. }));

        // Ledger operations continue after the freeze
        budget
            .line_mut(child)
            .unwrap()
            .reserve_commitment(Decimal::from(100))
            .unwrap();
    }

    #[test]
    fn test_state_machine_transitions() {
        let (mut budget, _, _) = draft_with_lines();
        assert!(matches!(
            budget.invalidate(),
            Err(Error::InvalidStateTransition { .. })
        ));

        let _ = budget.approve(ApproverId::new(), &Baseline(true), &sealer()).unwrap();
        assert!(budget
            .approve(ApproverId::new(), &Baseline(true), &sealer())
            .is_err());

        budget.invalidate().unwrap();
        assert_eq!(budget.state(), BudgetState::Invalidated);
        assert!(budget.invalidate().is_err());
        assert!(budget
            .approve(ApproverId::new(), &Baseline(true), &sealer())
            .is_err());
    }
}
