//! Budget ledger service
//!
//! Ties the aggregate, the sealer, the revision service and a store together.
//! Every mutating call is one load → mutate → compare-and-swap write cycle,
//! retried only when the write loses a version race.
//!
//! # Example
//!
//! ```no_run
//! use budget_core::{BudgetLedger, Config, ProjectId, ScheduleBaseline};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! struct Baselines;
//!
//! impl ScheduleBaseline for Baselines {
//!     fn has_baseline(&self, _project_id: ProjectId) -> budget_core::Result<bool> {
//!         Ok(true)
//!     }
//! }
//!
//! fn main() -> budget_core::Result<()> {
//!     let ledger = BudgetLedger::open(Config::default(), Arc::new(Baselines))?;
//!
//!     let budget = ledger.create_budget(ProjectId::new(), "Tower A")?;
//!     let line_id = ledger.add_line(
//!         budget.id(),
//!         None,
//!         "01",
//!         "Earthworks",
//!         Some("m3".to_string()),
//!         Decimal::from(100),
//!         Decimal::from(10),
//!     )?;
//!     ledger.allocate(budget.id(), line_id, Decimal::from(1000))?;
//!
//!     Ok(())
//! }
//! ```

use crate::{
    audit::{AuditTrail, IntegrityAuditEntry},
    budget::{Budget, ScheduleBaseline},
    change_order::ChangeOrder,
    error::{Error, Result},
    integrity::IntegritySealer,
    line::{BudgetLine, ExecutionCheck, ProgressSource},
    metrics::IntegrityMetrics,
    revision::RevisionService,
    storage::{BudgetStore, RocksStore},
    types::{ApproverId, BudgetId, BudgetState, LineId, ProjectId},
    Config,
};
use rust_decimal::Decimal;
use std::{fmt, sync::Arc};

/// Run `f`, re-running it after a concurrency conflict
///
/// Every attempt must re-read state. Other errors return immediately.
pub fn with_conflict_retry<T>(max_attempts: u32, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tracing::warn!(attempt, max_attempts, error = %err, "Retrying after concurrency conflict");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Main ledger interface
pub struct BudgetLedger<S: BudgetStore + 'static> {
    store: Arc<S>,
    sealer: IntegritySealer,
    revisions: RevisionService,
    baseline: Arc<dyn ScheduleBaseline + Send + Sync>,
    metrics: Option<Arc<IntegrityMetrics>>,
    config: Config,
}

impl<S: BudgetStore + 'static> fmt::Debug for BudgetLedger<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("sealer", &self.sealer)
            .field("service_name", &self.config.service_name)
            .finish_non_exhaustive()
    }
}

impl BudgetLedger<RocksStore> {
    /// Open a RocksDB-backed ledger
    pub fn open(
        config: Config,
        baseline: Arc<dyn ScheduleBaseline + Send + Sync>,
    ) -> Result<Self> {
        let store = Arc::new(RocksStore::open(&config)?);
        Self::new(store, baseline, config)
    }
}

impl<S: BudgetStore + 'static> BudgetLedger<S> {
    /// Create a ledger over an existing store
    pub fn new(
        store: Arc<S>,
        baseline: Arc<dyn ScheduleBaseline + Send + Sync>,
        config: Config,
    ) -> Result<Self> {
        let mut sealer = IntegritySealer::new(config.integrity.algorithm, store.clone());

        let metrics = if config.integrity.metrics_enabled {
            let metrics = Arc::new(
                IntegrityMetrics::new()
                    .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?,
            );
            sealer = sealer.with_metrics(metrics.clone());
            Some(metrics)
        } else {
            None
        };

        tracing::info!(
            service = %config.service_name,
            algorithm = %config.integrity.algorithm,
            overage_policy = ?config.execution.overage_policy,
            "Budget ledger ready"
        );

        Ok(Self {
            store,
            revisions: RevisionService::new(sealer.clone()),
            sealer,
            baseline,
            metrics,
            config,
        })
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Sealer used for approvals and validations
    pub fn sealer(&self) -> &IntegritySealer {
        &self.sealer
    }

    /// Metrics collector, if enabled
    pub fn metrics(&self) -> Option<&Arc<IntegrityMetrics>> {
        self.metrics.as_ref()
    }

    fn retry<T>(&self, f: impl FnMut() -> Result<T>) -> Result<T> {
        with_conflict_retry(self.config.max_conflict_retries, f)
    }

    // Budget operations

    /// Create and persist a draft budget
    pub fn create_budget(&self, project_id: ProjectId, name: impl Into<String>) -> Result<Budget> {
        let mut budget = Budget::new(project_id, name)?;
        self.store.save_budget(&mut budget)?;
        tracing::info!(budget_id = %budget.id(), %project_id, "Budget created");
        Ok(budget)
    }

    /// Load a budget with its lines
    pub fn budget(&self, budget_id: BudgetId) -> Result<Budget> {
        self.store.load_budget(budget_id)
    }

    /// Load a line
    pub fn line(&self, line_id: LineId) -> Result<BudgetLine> {
        self.store.load_line(line_id)
    }

    /// Apply a mutation to a budget and persist it
    ///
    /// The closure may run more than once.
    pub fn update_budget<T>(
        &self,
        budget_id: BudgetId,
        mut f: impl FnMut(&mut Budget) -> Result<T>,
    ) -> Result<T> {
        self.retry(|| {
            let mut budget = self.store.load_budget(budget_id)?;
            let value = f(&mut budget)?;
            self.store.save_budget(&mut budget)?;
            Ok(value)
        })
    }

    /// Add a line to a draft budget
    #[allow(clippy::too_many_arguments)]
    pub fn add_line(
        &self,
        budget_id: BudgetId,
        parent_id: Option<LineId>,
        code: &str,
        description: &str,
        unit: Option<String>,
        quantity: Decimal,
        unit_price: Decimal,
    ) -> Result<LineId> {
        self.update_budget(budget_id, |budget| {
            let line = BudgetLine::new(
                budget.id(),
                code,
                description,
                unit.clone(),
                quantity,
                unit_price,
            )?;
            budget.add_line(line, parent_id)
        })
    }

    /// Allocate to a line of a draft budget
    pub fn allocate(&self, budget_id: BudgetId, line_id: LineId, amount: Decimal) -> Result<()> {
        self.update_budget(budget_id, |budget| budget.allocate(line_id, amount))
    }

    /// Freeze and seal a draft budget
    ///
    /// The frozen state, the locked lines and the `HASH_GENERATED` entry are
    /// committed in one write.
    pub fn approve_budget(&self, budget_id: BudgetId, approver: ApproverId) -> Result<Budget> {
        self.retry(|| {
            let mut budget = self.store.load_budget(budget_id)?;
            let entry = budget.approve(approver, self.baseline.as_ref(), &self.sealer)?;
            self.store.commit_seal(&mut budget, entry)?;
            Ok(budget)
        })
    }

    /// Close a frozen budget for good
    pub fn invalidate_budget(&self, budget_id: BudgetId) -> Result<()> {
        self.update_budget(budget_id, |budget| budget.invalidate())
    }

    // Line ledger operations

    fn update_line<T>(
        &self,
        line_id: LineId,
        mut f: impl FnMut(&mut BudgetLine) -> Result<T>,
    ) -> Result<(BudgetLine, T)> {
        self.retry(|| {
            let mut line = self.store.load_line(line_id)?;
            let owner = self.store.load_budget_root(line.budget_id())?;
            if owner.state() == BudgetState::Invalidated {
                return Err(Error::InvariantViolation(format!(
                    "Budget {} is {}, its lines accept no further entries",
                    owner.id(),
                    owner.state()
                )));
            }
            let value = f(&mut line)?;
            self.store.save_line(&mut line)?;
            Ok((line, value))
        })
    }

    /// Reserve part of a line's available balance
    pub fn reserve_commitment(&self, line_id: LineId, amount: Decimal) -> Result<BudgetLine> {
        self.update_line(line_id, |line| line.reserve_commitment(amount))
            .map(|(line, _)| line)
    }

    /// Release a previous reservation
    pub fn release_commitment(&self, line_id: LineId, amount: Decimal) -> Result<BudgetLine> {
        self.update_line(line_id, |line| line.release_commitment(amount))
            .map(|(line, _)| line)
    }

    /// Record an uncommitted expense
    pub fn record_actual_expense(&self, line_id: LineId, amount: Decimal) -> Result<BudgetLine> {
        self.update_line(line_id, |line| line.record_actual_expense(amount))
            .map(|(line, _)| line)
    }

    /// Turn a reservation into an expense
    pub fn settle_commitment(&self, line_id: LineId, amount: Decimal) -> Result<BudgetLine> {
        self.update_line(line_id, |line| line.settle_commitment(amount))
            .map(|(line, _)| line)
    }

    /// Check new progress against the line's current quantity
    ///
    /// Applies the configured overage policy.
    pub fn record_executed_quantity<P: ProgressSource + ?Sized>(
        &self,
        line_id: LineId,
        quantity: Decimal,
        progress: &P,
    ) -> Result<ExecutionCheck> {
        let policy = self.config.execution.overage_policy;
        self.update_line(line_id, |line| {
            line.record_executed_quantity(quantity, progress, policy)
        })
        .map(|(_, check)| check)
    }

    // Integrity

    /// Validate a budget's seal; the outcome is always audited
    pub fn validate_budget(
        &self,
        budget_id: BudgetId,
        validator: Option<ApproverId>,
    ) -> Result<String> {
        let budget = self.store.load_budget(budget_id)?;
        self.sealer.validate(&budget, validator)
    }

    /// Recompute and persist the execution hash
    pub fn checkpoint_execution(&self, budget_id: BudgetId) -> Result<String> {
        self.update_budget(budget_id, |budget| self.sealer.refresh_execution_hash(budget))
    }

    /// Create, seal and persist the next revision from an approved change order
    ///
    /// A base budget gets at most one revision. Once it exists, the base's
    /// lines are closed and entries go to the revision's lines.
    pub fn create_revision(&self, change_order: &ChangeOrder) -> Result<Budget> {
        self.retry(|| {
            let base = self.store.load_budget(change_order.budget_id())?;
            if let Some(existing) = self.store.successor_of(base.id())? {
                return Err(Error::ChangeOrderPrecondition(format!(
                    "Budget {} already has revision {}",
                    base.id(),
                    existing
                )));
            }
            let (mut revision, entry) = self.revisions.create_revision_from_change_order(
                change_order,
                &base,
                self.baseline.as_ref(),
            )?;
            self.store.insert_revision(&mut revision, &base, entry)?;
            Ok(revision)
        })
    }

    /// Revision that superseded a budget, if any
    pub fn successor_of(&self, budget_id: BudgetId) -> Result<Option<BudgetId>> {
        self.store.successor_of(budget_id)
    }

    /// Audit entries of a budget, most recent first
    pub fn audit_history(&self, budget_id: BudgetId) -> Result<Vec<IntegrityAuditEntry>> {
        self.store.find_by_budget_id(budget_id)
    }

    /// Every recorded violation, most recent first
    pub fn violations(&self) -> Result<Vec<IntegrityAuditEntry>> {
        self.store.find_violations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::AuditEventType,
        change_order::LineDelta,
        line::{OveragePolicy, ProgressEntry},
        storage::MemoryStore,
    };
    use chrono::Utc;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Barrier,
    };

    struct Baselines(bool);

    impl ScheduleBaseline for Baselines {
        fn has_baseline(&self, _project_id: ProjectId) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn ledger_with(config: Config) -> BudgetLedger<MemoryStore> {
        BudgetLedger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Baselines(true)),
            config,
        )
        .unwrap()
    }

    fn ledger() -> BudgetLedger<MemoryStore> {
        ledger_with(Config::default())
    }

    /// Draft budget with one line allocated 1000.00
    fn setup(ledger: &BudgetLedger<MemoryStore>) -> (BudgetId, LineId) {
        let budget = ledger.create_budget(ProjectId::new(), "Hospital").unwrap();
        let line_id = ledger
            .add_line(
                budget.id(),
                None,
                "03.01",
                "Masonry",
                Some("m2".to_string()),
                Decimal::from(100),
                Decimal::from(10),
            )
            .unwrap();
        ledger
            .allocate(budget.id(), line_id, Decimal::new(100000, 2))
            .unwrap();
        (budget.id(), line_id)
    }

    #[test]
    fn test_scenario_a_reservations() {
        let ledger = ledger();
        let (_, line_id) = setup(&ledger);

        let line = ledger
            .reserve_commitment(line_id, Decimal::new(40000, 2))
            .unwrap();
        assert_eq!(line.available_balance(), Decimal::new(60000, 2));

        let err = ledger
            .reserve_commitment(line_id, Decimal::new(70000, 2))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(
            ledger.line(line_id).unwrap().available_balance(),
            Decimal::new(60000, 2)
        );
    }

    #[test]
    fn test_scenario_d_stale_snapshot_conflicts_then_rejects() {
        let ledger = ledger();
        let (_, line_id) = setup(&ledger);
        ledger
            .reserve_commitment(line_id, Decimal::new(40000, 2))
            .unwrap();

        // Both callers read the line at available 600.00
        let mut first = ledger.line(line_id).unwrap();
        let mut second = ledger.line(line_id).unwrap();

        first.reserve_commitment(Decimal::new(50000, 2)).unwrap();
        ledger.store().save_line(&mut first).unwrap();

        second.reserve_commitment(Decimal::new(50000, 2)).unwrap();
        let err = ledger.store().save_line(&mut second).unwrap_err();
        assert!(err.is_retryable());

        // Retry re-reads and is rejected on balance
        let err = ledger
            .reserve_commitment(line_id, Decimal::new(50000, 2))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(
            ledger.line(line_id).unwrap().pending_commitments(),
            Decimal::new(90000, 2)
        );
    }

    #[test]
    fn test_scenario_d_threads() {
        let ledger = ledger();
        let (_, line_id) = setup(&ledger);
        ledger
            .reserve_commitment(line_id, Decimal::new(40000, 2))
            .unwrap();

        let barrier = Barrier::new(2);
        let results: Vec<Result<BudgetLine>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        ledger.reserve_commitment(line_id, Decimal::new(50000, 2))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::InsufficientBalance { .. }))));

        let line = ledger.line(line_id).unwrap();
        assert_eq!(line.available_balance(), Decimal::new(10000, 2));
    }

    #[test]
    fn test_conflict_retry_bounds() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_conflict_retry(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::ConcurrencyConflict {
                entity: "line",
                id: uuid::Uuid::new_v4(),
                expected: Some(1),
                actual: Some(2),
            })
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Domain errors are never retried
        let attempts = AtomicU32::new(0);
        let _ = with_conflict_retry(3, || -> Result<()> {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Validation("bad".to_string()))
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_approve_then_validate() {
        let ledger = ledger();
        let (budget_id, _) = setup(&ledger);

        let budget = ledger.approve_budget(budget_id, ApproverId::new()).unwrap();
        assert_eq!(budget.state(), BudgetState::Frozen);

        let hash = ledger.validate_budget(budget_id, None).unwrap();
        assert_eq!(Some(hash.as_str()), budget.approval_hash());

        let history = ledger.audit_history(budget_id).unwrap();
        let kinds: Vec<AuditEventType> = history.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec![AuditEventType::HashValidated, AuditEventType::HashGenerated]
        );

        let metrics = ledger.metrics().unwrap();
        assert_eq!(
            metrics
                .validations_total
                .with_label_values(&["success", "SHA-256-v1"])
                .get(),
            1
        );
    }

    #[test]
    fn test_approve_without_baseline() {
        let ledger = BudgetLedger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Baselines(false)),
            Config::default(),
        )
        .unwrap();
        let budget = ledger.create_budget(ProjectId::new(), "Depot").unwrap();

        assert!(matches!(
            ledger.approve_budget(budget.id(), ApproverId::new()),
            Err(Error::ScheduleBaselineMissing(_))
        ));
        assert_eq!(ledger.budget(budget.id()).unwrap().state(), BudgetState::Draft);
        assert!(ledger.audit_history(budget.id()).unwrap().is_empty());
    }

    #[test]
    fn test_frozen_budget_keeps_ledger_open_but_structure_closed() {
        let ledger = ledger();
        let (budget_id, line_id) = setup(&ledger);
        ledger.approve_budget(budget_id, ApproverId::new()).unwrap();

        assert!(matches!(
            ledger.allocate(budget_id, line_id, Decimal::ONE),
            Err(Error::FrozenBudgetViolation { .. })
        ));

        ledger.reserve_commitment(line_id, Decimal::from(300)).unwrap();
        ledger.settle_commitment(line_id, Decimal::from(100)).unwrap();
        ledger.release_commitment(line_id, Decimal::from(200)).unwrap();
        let line = ledger.record_actual_expense(line_id, Decimal::from(50)).unwrap();

        assert_eq!(line.actual_expenses(), Decimal::from(150));
        assert_eq!(line.pending_commitments(), Decimal::ZERO);
        assert_eq!(line.available_balance(), Decimal::from(850));

        // Financial activity does not disturb the seal
        ledger.validate_budget(budget_id, None).unwrap();
    }

    #[test]
    fn test_invalidated_budget_closes_lines() {
        let ledger = ledger();
        let (budget_id, line_id) = setup(&ledger);
        ledger.approve_budget(budget_id, ApproverId::new()).unwrap();
        ledger.invalidate_budget(budget_id).unwrap();

        assert!(ledger.reserve_commitment(line_id, Decimal::ONE).is_err());
        assert!(matches!(
            ledger.invalidate_budget(budget_id),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_checkpoint_execution_moves_with_activity() {
        let ledger = ledger();
        let (budget_id, line_id) = setup(&ledger);

        assert!(ledger.checkpoint_execution(budget_id).is_err());

        let sealed = ledger.approve_budget(budget_id, ApproverId::new()).unwrap();
        let initial = sealed.execution_hash().unwrap().to_string();
        assert_eq!(ledger.checkpoint_execution(budget_id).unwrap(), initial);

        ledger.record_actual_expense(line_id, Decimal::from(10)).unwrap();
        let moved = ledger.checkpoint_execution(budget_id).unwrap();
        assert_ne!(moved, initial);
        assert_eq!(
            ledger.budget(budget_id).unwrap().execution_hash(),
            Some(moved.as_str())
        );
    }

    #[test]
    fn test_executed_quantity_policies() {
        let progress = |line_id: LineId, qty: i64| ProgressEntry {
            line_id,
            quantity: Decimal::from(qty),
            recorded_at: Utc::now(),
        };

        let ledger = ledger();
        let (_, line_id) = setup(&ledger);
        let entries = vec![progress(line_id, 60), progress(line_id, 30)];

        let check = ledger
            .record_executed_quantity(line_id, Decimal::from(5), &entries)
            .unwrap();
        assert_eq!(
            check,
            ExecutionCheck::WithinCap {
                executed: Decimal::from(95),
                remaining: Decimal::from(5),
            }
        );
        assert!(matches!(
            ledger.record_executed_quantity(line_id, Decimal::from(20), &entries),
            Err(Error::ExecutionCapExceeded { .. })
        ));

        let mut config = Config::default();
        config.execution.overage_policy = OveragePolicy::Warn;
        let lenient = ledger_with(config);
        let (_, line_id) = setup(&lenient);
        let entries = vec![progress(line_id, 90)];
        let check = lenient
            .record_executed_quantity(line_id, Decimal::from(20), &entries)
            .unwrap();
        assert_eq!(
            check,
            ExecutionCheck::OverCap {
                executed: Decimal::from(110),
                excess: Decimal::from(10),
            }
        );
        assert_eq!(
            lenient.line(line_id).unwrap().executed_quantity(),
            Decimal::from(110)
        );
    }

    #[test]
    fn test_revision_persisted_alongside_base() {
        let ledger = ledger();
        let (budget_id, _) = setup(&ledger);
        let base = ledger.approve_budget(budget_id, ApproverId::new()).unwrap();

        let mut co = ChangeOrder::new(&base);
        co.add_delta(LineDelta::AdjustPrice {
            code: "03.01".to_string(),
            new_unit_price: Decimal::from(12),
        })
        .unwrap();
        co.submit_for_review("Supplier price increase").unwrap();
        co.approve(ApproverId::new()).unwrap();

        let revision = ledger.create_revision(&co).unwrap();
        assert_eq!(revision.version(), Some(1));

        let stored = ledger.budget(revision.id()).unwrap();
        assert_eq!(stored.revision(), 2);
        assert_eq!(stored.state(), BudgetState::Frozen);
        assert_eq!(
            stored.line_by_code("03.01").unwrap().allocated_amount(),
            Decimal::from(1200)
        );
        ledger.validate_budget(revision.id(), None).unwrap();

        let base_after = ledger.budget(budget_id).unwrap();
        assert_eq!(base_after.approval_hash(), base.approval_hash());
        assert_eq!(base_after.version(), base.version());

        assert_eq!(
            ledger.audit_history(revision.id()).unwrap()[1].event_type(),
            AuditEventType::HashGenerated
        );
    }

    fn price_change(base: &Budget) -> ChangeOrder {
        let mut co = ChangeOrder::new(base);
        co.add_delta(LineDelta::AdjustPrice {
            code: "03.01".to_string(),
            new_unit_price: Decimal::from(12),
        })
        .unwrap();
        co.submit_for_review("Supplier price increase").unwrap();
        co.approve(ApproverId::new()).unwrap();
        co
    }

    #[test]
    fn test_change_order_yields_one_revision() {
        let ledger = ledger();
        let (budget_id, _) = setup(&ledger);
        let base = ledger.approve_budget(budget_id, ApproverId::new()).unwrap();
        let co = price_change(&base);

        let revision = ledger.create_revision(&co).unwrap();
        assert!(matches!(
            ledger.create_revision(&co),
            Err(Error::ChangeOrderPrecondition(_))
        ));

        // A second change order against the same base is refused as well
        assert!(matches!(
            ledger.create_revision(&price_change(&base)),
            Err(Error::ChangeOrderPrecondition(_))
        ));

        assert_eq!(ledger.successor_of(budget_id).unwrap(), Some(revision.id()));
        let generated = ledger
            .store()
            .find_by_budget_id(revision.id())
            .unwrap()
            .len();
        assert_eq!(generated, 1);
        assert_eq!(ledger.store().list_budget_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_superseded_base_lines_reject_entries() {
        let ledger = ledger();
        let (budget_id, line_id) = setup(&ledger);
        let base = ledger.approve_budget(budget_id, ApproverId::new()).unwrap();
        ledger
            .reserve_commitment(line_id, Decimal::from(400))
            .unwrap();

        let revision = ledger
            .create_revision(&price_change(&ledger.budget(budget_id).unwrap()))
            .unwrap();
        assert_ne!(revision.id(), base.id());

        let err = ledger
            .reserve_commitment(line_id, Decimal::from(100))
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert!(ledger.release_commitment(line_id, Decimal::from(400)).is_err());
        assert_eq!(
            ledger.line(line_id).unwrap().pending_commitments(),
            Decimal::from(400)
        );

        // The commitment lives on in the revision, once
        let carried = revision.line_by_code("03.01").unwrap().id();
        let line = ledger
            .reserve_commitment(carried, Decimal::from(100))
            .unwrap();
        assert_eq!(line.pending_commitments(), Decimal::from(500));
        assert_eq!(line.available_balance(), Decimal::from(700));
    }
}
