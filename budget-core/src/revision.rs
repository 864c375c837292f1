//! Budget revisions from approved change orders
//!
//! The base budget is read, never written: its lines are carried forward into
//! a fresh draft under new ids, the change order's deltas are applied, and the
//! draft is approved (and so sealed) on its own.

use crate::{
    audit::IntegrityAuditEntry,
    budget::{Budget, ScheduleBaseline},
    change_order::{ChangeOrder, ChangeOrderState, LineDelta},
    error::{Error, Result},
    integrity::IntegritySealer,
    line::BudgetLine,
    types::{BudgetState, LineId},
};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Produces independently sealed revisions
#[derive(Debug, Clone)]
pub struct RevisionService {
    sealer: IntegritySealer,
}

impl RevisionService {
    /// Create a service sealing with `sealer`
    pub fn new(sealer: IntegritySealer) -> Self {
        Self { sealer }
    }

    /// Build, apply and seal the next revision of `base`
    ///
    /// Returns the frozen revision and its `HASH_GENERATED` entry; both must be
    /// persisted together.
    pub fn create_revision_from_change_order(
        &self,
        change_order: &ChangeOrder,
        base: &Budget,
        baseline: &dyn ScheduleBaseline,
    ) -> Result<(Budget, IntegrityAuditEntry)> {
        check_preconditions(change_order, base)?;
        let approver = change_order.approver().ok_or_else(|| {
            Error::ChangeOrderPrecondition(format!(
                "Change order {} has no approver",
                change_order.id()
            ))
        })?;

        let mut revision = Budget::successor(base, base.revision() + 1, change_order.id());
        carry_forward_lines(base, &mut revision)?;

        for delta in change_order.deltas() {
            apply_delta(&mut revision, delta)?;
        }

        let entry = revision.approve(approver, baseline, &self.sealer)?;

        tracing::info!(
            base_budget_id = %base.id(),
            budget_id = %revision.id(),
            revision = revision.revision(),
            change_order_id = %change_order.id(),
            deltas = change_order.deltas().len(),
            "Budget revision created"
        );

        Ok((revision, entry))
    }
}

fn check_preconditions(change_order: &ChangeOrder, base: &Budget) -> Result<()> {
    if base.state() != BudgetState::Frozen {
        return Err(Error::ChangeOrderPrecondition(format!(
            "Base budget {} is {}, expected FROZEN",
            base.id(),
            base.state()
        )));
    }
    if change_order.state() != ChangeOrderState::Approved {
        return Err(Error::ChangeOrderPrecondition(format!(
            "Change order {} is {}, expected APPROVED",
            change_order.id(),
            change_order.state()
        )));
    }
    if change_order.deltas().is_empty() {
        return Err(Error::ChangeOrderPrecondition(format!(
            "Change order {} has no line deltas",
            change_order.id()
        )));
    }
    if change_order.project_id() != base.project_id() {
        return Err(Error::ChangeOrderPrecondition(format!(
            "Change order project {} does not match budget project {}",
            change_order.project_id(),
            base.project_id()
        )));
    }
    if change_order.budget_id() != base.id() {
        return Err(Error::ChangeOrderPrecondition(format!(
            "Change order targets budget {}, not {}",
            change_order.budget_id(),
            base.id()
        )));
    }
    Ok(())
}

/// Copy lines parents-first, remapping parent ids
fn carry_forward_lines(base: &Budget, revision: &mut Budget) -> Result<()> {
    let mut id_map: HashMap<LineId, LineId> = HashMap::with_capacity(base.line_count());
    let mut pending: Vec<&BudgetLine> = base.lines().collect();

    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();

        for line in pending {
            let parent = match line.parent_id() {
                None => None,
                Some(old) => match id_map.get(&old) {
                    Some(new) => Some(*new),
                    None => {
                        deferred.push(line);
                        continue;
                    }
                },
            };
            let copy = line.carry_forward(revision.id(), None);
            let new_id = revision.add_line(copy, parent)?;
            id_map.insert(line.id(), new_id);
        }

        if deferred.len() == before {
            return Err(Error::InvariantViolation(format!(
                "Budget {} has lines with unresolved parents",
                base.id()
            )));
        }
        pending = deferred;
    }
    Ok(())
}

fn apply_delta(revision: &mut Budget, delta: &LineDelta) -> Result<()> {
    match delta {
        LineDelta::AddLine {
            code,
            description,
            unit,
            parent_code,
            quantity,
            unit_price,
        } => {
            let parent = match parent_code {
                Some(parent_code) => Some(line_id_for(revision, parent_code)?),
                None => None,
            };
            if revision.line_by_code(code).is_some() {
                return Err(Error::ChangeOrderPrecondition(format!(
                    "Line {} already exists",
                    code
                )));
            }
            let line = BudgetLine::new(
                revision.id(),
                code.as_str(),
                description.as_str(),
                unit.clone(),
                *quantity,
                *unit_price,
            )?;
            let priced = line.priced_value()?;
            let line_id = revision.add_line(line, parent)?;
            if priced > Decimal::ZERO {
                revision.allocate(line_id, priced)?;
            }
        }
        LineDelta::RemoveLine { code } => {
            let line_id = line_id_for(revision, code)?;
            let line = revision
                .line(line_id)
                .ok_or_else(|| Error::LineNotFound(code.clone()))?;
            if !line.actual_expenses().is_zero() || !line.pending_commitments().is_zero() {
                return Err(Error::ChangeOrderPrecondition(format!(
                    "Line {} has expenses or commitments and cannot be removed",
                    code
                )));
            }
            if !revision.children(line_id).is_empty() {
                return Err(Error::ChangeOrderPrecondition(format!(
                    "Line {} has child lines and cannot be removed",
                    code
                )));
            }
            revision.remove_line(line_id)?;
        }
        LineDelta::AdjustQuantity { code, new_quantity } => {
            let line_id = line_id_for(revision, code)?;
            revision
                .line_mut(line_id)
                .ok_or_else(|| Error::LineNotFound(code.clone()))?
                .revise_quantity(*new_quantity)?;
        }
        LineDelta::AdjustPrice {
            code,
            new_unit_price,
        } => {
            let line_id = line_id_for(revision, code)?;
            revision
                .line_mut(line_id)
                .ok_or_else(|| Error::LineNotFound(code.clone()))?
                .revise_unit_price(*new_unit_price)?;
        }
    }

    tracing::debug!(budget_id = %revision.id(), code = delta.code(), "Delta applied");
    Ok(())
}

fn line_id_for(revision: &Budget, code: &str) -> Result<LineId> {
    revision
        .line_by_code(code)
        .map(|line| line.id())
        .ok_or_else(|| {
            Error::ChangeOrderPrecondition(format!("Line {} does not exist in the base budget", code))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::MemoryStore,
        types::{ApproverId, HashAlgorithm, ProjectId},
    };
    use std::sync::Arc;

    struct Baselined;

    impl ScheduleBaseline for Baselined {
        fn has_baseline(&self, _project_id: crate::types::ProjectId) -> Result<bool> {
            Ok(true)
        }
    }

    fn service() -> RevisionService {
        RevisionService::new(IntegritySealer::new(
            HashAlgorithm::Sha256V1,
            Arc::new(MemoryStore::new()),
        ))
    }

    fn frozen_base(service: &RevisionService) -> Budget {
        let mut budget = Budget::new(ProjectId::new(), "School (v1)").unwrap();
        budget.mark_contractual().unwrap();

        // Child code sorts before its parent's code
        let parent = BudgetLine::new(budget.id(), "B", "Structure", None, Decimal::ONE, Decimal::from(500))
            .unwrap();
        let parent_id = budget.add_line(parent, None).unwrap();
        budget.allocate(parent_id, Decimal::from(500)).unwrap();

        let child = BudgetLine::new(
            budget.id(),
            "A",
            "Columns",
            Some("m3".to_string()),
            Decimal::from(10),
            Decimal::from(100),
        )
        .unwrap();
        let child_id = budget.add_line(child, Some(parent_id)).unwrap();
        budget.allocate(child_id, Decimal::from(1000)).unwrap();

        let _ = budget
            .approve(ApproverId::new(), &Baselined, &service.sealer)
            .unwrap();
        budget
    }

    fn approved(base: &Budget, deltas: Vec<LineDelta>) -> ChangeOrder {
        let mut co = ChangeOrder::new(base);
        for delta in deltas {
            co.add_delta(delta).unwrap();
        }
        co.submit_for_review("Design update").unwrap();
        co.approve(ApproverId::new()).unwrap();
        co
    }

    #[test]
    fn test_revision_is_new_sealed_budget() {
        let service = service();
        let base = frozen_base(&service);
        let snapshot = base.clone();
        let co = approved(
            &base,
            vec![LineDelta::AdjustQuantity {
                code: "A".to_string(),
                new_quantity: Decimal::from(12),
            }],
        );

        let (revision, entry) = service
            .create_revision_from_change_order(&co, &base, &Baselined)
            .unwrap();

        assert_eq!(revision.revision(), 2);
        assert_eq!(revision.state(), BudgetState::Frozen);
        assert_eq!(revision.name(), "School (v2)");
        assert!(revision.is_contractual());
        assert_eq!(revision.approved_by(), co.approver());
        assert_ne!(revision.approval_hash(), base.approval_hash());
        assert_eq!(entry.budget_id(), revision.id());
        assert_eq!(revision.version(), None);
        assert_eq!(revision.supersedes(), Some(base.id()));
        assert_eq!(revision.change_order_id(), Some(co.id()));

        let adjusted = revision.line_by_code("A").unwrap();
        assert_eq!(adjusted.current_quantity(), Decimal::from(12));
        assert_eq!(adjusted.original_quantity(), Decimal::from(10));
        assert_eq!(adjusted.allocated_amount(), Decimal::from(1200));

        // Hierarchy survives with fresh ids
        let parent = revision.line_by_code("B").unwrap();
        assert_eq!(adjusted.parent_id(), Some(parent.id()));
        assert!(base.line(parent.id()).is_none());

        // Base untouched
        assert_eq!(base.state(), BudgetState::Frozen);
        assert_eq!(base.approval_hash(), snapshot.approval_hash());
        assert_eq!(
            base.line_by_code("A").unwrap().current_quantity(),
            Decimal::from(10)
        );
    }

    #[test]
    fn test_add_and_remove_deltas() {
        let service = service();
        let base = frozen_base(&service);
        let co = approved(
            &base,
            vec![
                LineDelta::AddLine {
                    code: "C".to_string(),
                    description: "Roofing".to_string(),
                    unit: Some("m2".to_string()),
                    parent_code: Some("B".to_string()),
                    quantity: Decimal::from(40),
                    unit_price: Decimal::new(1550, 2),
                },
                LineDelta::RemoveLine {
                    code: "A".to_string(),
                },
            ],
        );

        let (revision, _) = service
            .create_revision_from_change_order(&co, &base, &Baselined)
            .unwrap();

        assert!(revision.line_by_code("A").is_none());
        let roofing = revision.line_by_code("C").unwrap();
        assert_eq!(roofing.allocated_amount(), Decimal::from(620));
        assert_eq!(revision.level(roofing.id()), Some(2));
    }

    #[test]
    fn test_remove_parent_rejected() {
        let service = service();
        let base = frozen_base(&service);
        let co = approved(
            &base,
            vec![LineDelta::RemoveLine {
                code: "B".to_string(),
            }],
        );
        assert!(matches!(
            service.create_revision_from_change_order(&co, &base, &Baselined),
            Err(Error::ChangeOrderPrecondition(_))
        ));
    }

    #[test]
    fn test_preconditions() {
        let service = service();
        let base = frozen_base(&service);
        let delta = LineDelta::AdjustPrice {
            code: "A".to_string(),
            new_unit_price: Decimal::from(110),
        };

        // Not yet approved
        let mut pending = ChangeOrder::new(&base);
        pending.add_delta(delta.clone()).unwrap();
        pending.submit_for_review("Price update").unwrap();
        assert!(matches!(
            service.create_revision_from_change_order(&pending, &base, &Baselined),
            Err(Error::ChangeOrderPrecondition(_))
        ));

        // Base not frozen
        let draft = Budget::new(base.project_id(), "Draft").unwrap();
        let co = approved(&base, vec![delta.clone()]);
        assert!(matches!(
            service.create_revision_from_change_order(&co, &draft, &Baselined),
            Err(Error::ChangeOrderPrecondition(_))
        ));

        // Other project
        let mut foreign = Budget::new(ProjectId::new(), "Other").unwrap();
        let _ = foreign
            .approve(ApproverId::new(), &Baselined, &service.sealer)
            .unwrap();
        assert!(matches!(
            service.create_revision_from_change_order(&co, &foreign, &Baselined),
            Err(Error::ChangeOrderPrecondition(_))
        ));

        // Unknown line
        let unknown = approved(
            &base,
            vec![LineDelta::AdjustQuantity {
                code: "Z".to_string(),
                new_quantity: Decimal::ONE,
            }],
        );
        assert!(service
            .create_revision_from_change_order(&unknown, &base, &Baselined)
            .is_err());
    }

    #[test]
    fn test_quantity_cut_below_commitments_rejected_at_delta() {
        let service = service();
        let mut base = frozen_base(&service);
        let line_id = base.line_by_code("A").unwrap().id();
        base.line_mut(line_id)
            .unwrap()
            .reserve_commitment(Decimal::from(900))
            .unwrap();

        let co = approved(
            &base,
            vec![LineDelta::AdjustQuantity {
                code: "A".to_string(),
                new_quantity: Decimal::from(5),
            }],
        );
        let err = service
            .create_revision_from_change_order(&co, &base, &Baselined)
            .unwrap_err();
        assert!(matches!(err, Error::ChangeOrderPrecondition(ref msg) if msg.contains("Line A")));
    }
}
