//! Persistence boundary
//!
//! Every write is a compare-and-swap on the storage-assigned version: a new
//! record gets `Some(1)`, each successful write increments it, and a write that
//! presents any other version fails with `ConcurrencyConflict`.
//!
//! The store also re-checks the freeze: once the stored budget has left DRAFT,
//! no write may change a sealed field of the budget root or of its lines, no
//! matter which code path produced the write.
//!
//! A budget has at most one successor revision. The successor link is written
//! in the same atomic unit as the revision itself, and from then on the base
//! budget's lines accept no further writes.
//!
//! # Column Families (RocksDB)
//!
//! - `budgets` - Budget roots (key: budget_id)
//! - `lines` - Budget lines (key: line_id)
//! - `audit` - Integrity audit trail (key: sequence, big-endian)
//! - `indices` - `B` || budget_id || line_id, `A` || budget_id || sequence, `V` || sequence,
//!   `R` || base budget_id -> successor budget_id

use crate::{
    audit::{AuditEventType, AuditTrail, IntegrityAuditEntry},
    budget::Budget,
    error::{Error, Result},
    line::BudgetLine,
    types::{BudgetId, BudgetState, LineId},
    Config,
};
use parking_lot::{Mutex, RwLock};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions,
    DB,
};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};
use uuid::Uuid;

/// Versioned storage of budgets, lines and the audit trail
pub trait BudgetStore: AuditTrail {
    /// Load a budget with all of its lines
    fn load_budget(&self, budget_id: BudgetId) -> Result<Budget>;

    /// Load a budget root without its lines
    fn load_budget_root(&self, budget_id: BudgetId) -> Result<Budget>;

    /// Load a single line
    fn load_line(&self, line_id: LineId) -> Result<BudgetLine>;

    /// Ids of every stored budget
    fn list_budget_ids(&self) -> Result<Vec<BudgetId>>;

    /// Revision that superseded `budget_id`, if one was inserted
    fn successor_of(&self, budget_id: BudgetId) -> Result<Option<BudgetId>>;

    /// Insert or update a budget with its lines
    ///
    /// Lines that are unchanged since load are skipped; changed or new lines
    /// are version-checked individually. Freezing goes through `commit_seal`.
    fn save_budget(&self, budget: &mut Budget) -> Result<()>;

    /// Update a single line
    fn save_line(&self, line: &mut BudgetLine) -> Result<()>;

    /// Persist a freshly sealed budget, its lines and its `HASH_GENERATED`
    /// entry in one atomic write
    fn commit_seal(
        &self,
        budget: &mut Budget,
        entry: IntegrityAuditEntry,
    ) -> Result<IntegrityAuditEntry>;

    /// Insert a revision sealed before its first write, together with its
    /// `HASH_GENERATED` entry and the successor link of `base`
    ///
    /// `base` is the snapshot the revision was built from. The insert fails
    /// with `ChangeOrderPrecondition` when the base already has a successor,
    /// and with `ConcurrencyConflict` when any base line moved since the
    /// snapshot was loaded.
    fn insert_revision(
        &self,
        revision: &mut Budget,
        base: &Budget,
        entry: IntegrityAuditEntry,
    ) -> Result<IntegrityAuditEntry>;
}

/// Outcome of checking a budget write against the stored image
#[derive(Debug)]
struct WritePlan {
    budget_version: u64,
    changed_lines: Vec<(LineId, u64)>,
    removed_lines: Vec<LineId>,
}

fn conflict(entity: &'static str, id: Uuid, expected: Option<u64>, actual: Option<u64>) -> Error {
    tracing::warn!(entity, %id, ?expected, ?actual, "Concurrency conflict");
    Error::ConcurrencyConflict {
        entity,
        id,
        expected,
        actual,
    }
}

fn check_seal_entry(budget: &Budget, entry: &IntegrityAuditEntry) -> Result<()> {
    if entry.budget_id() != budget.id()
        || entry.event_type() != AuditEventType::HashGenerated
        || entry.approval_hash() != budget.approval_hash()
        || !budget.is_sealed()
    {
        return Err(Error::Validation(format!(
            "Audit entry does not match the seal of budget {}",
            budget.id()
        )));
    }
    Ok(())
}

fn superseded(budget_id: BudgetId, successor: BudgetId) -> Error {
    Error::InvariantViolation(format!(
        "Budget {} is superseded by revision {}, its lines accept no further entries",
        budget_id, successor
    ))
}

/// Checks a revision's first write against the stored image of its base
fn check_revision_insert(
    revision: &Budget,
    base: &Budget,
    stored_base: Option<&Budget>,
    stored_base_lines: &HashMap<LineId, BudgetLine>,
    successor: Option<BudgetId>,
) -> Result<()> {
    if revision.version().is_some() || revision.supersedes() != Some(base.id()) {
        return Err(Error::Validation(format!(
            "Budget {} is not a new revision of budget {}",
            revision.id(),
            base.id()
        )));
    }
    if let Some(existing) = successor {
        return Err(Error::ChangeOrderPrecondition(format!(
            "Budget {} already has revision {}",
            base.id(),
            existing
        )));
    }

    let stored_base = stored_base.ok_or(Error::BudgetNotFound(base.id()))?;
    if stored_base.version() != base.version() {
        return Err(conflict(
            "budget",
            base.id().as_uuid(),
            base.version(),
            stored_base.version(),
        ));
    }
    if stored_base.state() != BudgetState::Frozen {
        return Err(Error::ChangeOrderPrecondition(format!(
            "Base budget {} is {}, expected FROZEN",
            base.id(),
            stored_base.state()
        )));
    }

    // Carried-forward balances must match what is stored now
    for line in base.lines() {
        let actual = stored_base_lines.get(&line.id()).and_then(|l| l.version());
        if actual != line.version() {
            return Err(conflict("line", line.id().as_uuid(), line.version(), actual));
        }
    }
    if stored_base_lines.len() != base.line_count() {
        return Err(conflict(
            "budget",
            base.id().as_uuid(),
            base.version(),
            stored_base.version(),
        ));
    }
    Ok(())
}

fn unlinked_revision(budget: &Budget) -> Error {
    Error::Validation(format!(
        "Revision {} must be inserted through insert_revision",
        budget.id()
    ))
}

fn plan_budget_write(
    stored: Option<&Budget>,
    stored_lines: &HashMap<LineId, BudgetLine>,
    budget: &Budget,
    sealing: bool,
    successor: Option<BudgetId>,
) -> Result<WritePlan> {
    let expected = budget.version();
    let actual = stored.and_then(|b| b.version());
    if expected != actual {
        return Err(conflict("budget", budget.id().as_uuid(), expected, actual));
    }

    let from = stored.map(|b| b.state());
    let to = budget.state();
    let transition_ok = if sealing {
        matches!(from, None | Some(BudgetState::Draft)) && to == BudgetState::Frozen
    } else {
        matches!(
            (from, to),
            (None, BudgetState::Draft)
                | (Some(BudgetState::Draft), BudgetState::Draft)
                | (Some(BudgetState::Frozen), BudgetState::Frozen)
                | (Some(BudgetState::Frozen), BudgetState::Invalidated)
                | (Some(BudgetState::Invalidated), BudgetState::Invalidated)
        )
    };
    if !transition_ok {
        if !sealing && to == BudgetState::Frozen && matches!(from, None | Some(BudgetState::Draft)) {
            return Err(Error::Validation(format!(
                "Budget {} must be frozen through commit_seal",
                budget.id()
            )));
        }
        return Err(Error::InvalidStateTransition {
            budget_id: budget.id(),
            from: from.unwrap_or(BudgetState::Draft),
            to,
        });
    }

    let stored_sealed = stored.map_or(false, |b| b.state() != BudgetState::Draft);
    if let Some(stored) = stored.filter(|_| stored_sealed) {
        if !stored.sealed_root_eq(budget) {
            return Err(Error::frozen(budget.id(), "modify sealed budget fields"));
        }
    }

    let mut changed_lines = Vec::new();
    for line in budget.lines() {
        match stored_lines.get(&line.id()) {
            Some(current) if current == line => {}
            Some(current) => {
                if line.version() != current.version() {
                    return Err(conflict(
                        "line",
                        line.id().as_uuid(),
                        line.version(),
                        current.version(),
                    ));
                }
                if stored_sealed && !current.sealed_fields_eq(line) {
                    return Err(Error::frozen(
                        budget.id(),
                        format!("modify sealed fields of line {}", line.code()),
                    ));
                }
                changed_lines.push((line.id(), current.version().unwrap_or(0) + 1));
            }
            None => {
                if line.version().is_some() {
                    return Err(conflict("line", line.id().as_uuid(), line.version(), None));
                }
                if stored_sealed {
                    return Err(Error::frozen(
                        budget.id(),
                        format!("add line {}", line.code()),
                    ));
                }
                changed_lines.push((line.id(), 1));
            }
        }
    }

    if let Some(successor) = successor {
        if !changed_lines.is_empty() {
            return Err(superseded(budget.id(), successor));
        }
    }

    let mut removed_lines = Vec::new();
    for (line_id, current) in stored_lines {
        if budget.line(*line_id).is_none() {
            if stored_sealed {
                return Err(Error::frozen(
                    budget.id(),
                    format!("remove line {}", current.code()),
                ));
            }
            removed_lines.push(*line_id);
        }
    }

    Ok(WritePlan {
        budget_version: actual.unwrap_or(0) + 1,
        changed_lines,
        removed_lines,
    })
}

fn plan_line_write(
    stored_budget: &Budget,
    stored: &BudgetLine,
    line: &BudgetLine,
    successor: Option<BudgetId>,
) -> Result<u64> {
    if let Some(successor) = successor {
        return Err(superseded(stored_budget.id(), successor));
    }
    if line.version() != stored.version() {
        return Err(conflict(
            "line",
            line.id().as_uuid(),
            line.version(),
            stored.version(),
        ));
    }
    if stored_budget.state() != BudgetState::Draft && !stored.sealed_fields_eq(line) {
        return Err(Error::frozen(
            stored_budget.id(),
            format!("modify sealed fields of line {}", line.code()),
        ));
    }
    Ok(stored.version().unwrap_or(0) + 1)
}

fn apply_plan(budget: &mut Budget, plan: &WritePlan) {
    budget.set_version(plan.budget_version);
    for (line_id, version) in &plan.changed_lines {
        if let Some(line) = budget.line_mut(*line_id) {
            line.set_version(*version);
        }
    }
}

fn sorted_newest_first(mut entries: Vec<IntegrityAuditEntry>) -> Vec<IntegrityAuditEntry> {
    entries.sort_by(|a, b| b.sequence().cmp(&a.sequence()));
    entries
}

// In-memory store

/// In-memory store; one write lock makes every write atomic
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    budgets: HashMap<BudgetId, Budget>,
    lines: HashMap<LineId, BudgetLine>,
    budget_lines: HashMap<BudgetId, BTreeSet<LineId>>,
    successors: HashMap<BudgetId, BudgetId>,
    audit: Vec<IntegrityAuditEntry>,
}

impl MemoryInner {
    fn lines_of(&self, budget_id: BudgetId) -> HashMap<LineId, BudgetLine> {
        self.budget_lines
            .get(&budget_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.lines.get(id).map(|line| (*id, line.clone())))
            .collect()
    }

    fn append(&mut self, entry: IntegrityAuditEntry) -> IntegrityAuditEntry {
        let entry = entry.with_sequence(self.audit.len() as u64 + 1);
        self.audit.push(entry.clone());
        entry
    }

    fn write_budget(
        &mut self,
        budget: &mut Budget,
        entry: Option<IntegrityAuditEntry>,
        base: Option<&Budget>,
    ) -> Result<Option<IntegrityAuditEntry>> {
        let stored = self.budgets.get(&budget.id());
        match base {
            Some(base) => check_revision_insert(
                budget,
                base,
                self.budgets.get(&base.id()),
                &self.lines_of(base.id()),
                self.successors.get(&base.id()).copied(),
            )?,
            None if stored.is_none() && budget.supersedes().is_some() => {
                return Err(unlinked_revision(budget));
            }
            None => {}
        }

        let stored_lines = self.lines_of(budget.id());
        let plan = plan_budget_write(
            stored,
            &stored_lines,
            budget,
            entry.is_some(),
            self.successors.get(&budget.id()).copied(),
        )?;

        apply_plan(budget, &plan);
        if let Some(base) = base {
            self.successors.insert(base.id(), budget.id());
        }

        for line_id in &plan.removed_lines {
            self.lines.remove(line_id);
        }
        let index = self.budget_lines.entry(budget.id()).or_default();
        for line_id in &plan.removed_lines {
            index.remove(line_id);
        }
        for (line_id, _) in &plan.changed_lines {
            if let Some(line) = budget.line(*line_id) {
                index.insert(*line_id);
                self.lines.insert(*line_id, line.clone());
            }
        }
        self.budgets.insert(budget.id(), budget.detached_root());

        Ok(entry.map(|e| self.append(e)))
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditTrail for MemoryStore {
    fn append(&self, entry: IntegrityAuditEntry) -> Result<IntegrityAuditEntry> {
        Ok(self.inner.write().append(entry))
    }

    fn find_by_budget_id(&self, budget_id: BudgetId) -> Result<Vec<IntegrityAuditEntry>> {
        let inner = self.inner.read();
        Ok(sorted_newest_first(
            inner
                .audit
                .iter()
                .filter(|e| e.budget_id() == budget_id)
                .cloned()
                .collect(),
        ))
    }

    fn find_violations(&self) -> Result<Vec<IntegrityAuditEntry>> {
        let inner = self.inner.read();
        Ok(sorted_newest_first(
            inner
                .audit
                .iter()
                .filter(|e| e.event_type() == AuditEventType::HashViolation)
                .cloned()
                .collect(),
        ))
    }
}

impl BudgetStore for MemoryStore {
    fn load_budget(&self, budget_id: BudgetId) -> Result<Budget> {
        let inner = self.inner.read();
        let mut budget = inner
            .budgets
            .get(&budget_id)
            .cloned()
            .ok_or(Error::BudgetNotFound(budget_id))?;
        budget.restore_lines(inner.lines_of(budget_id).into_values().collect());
        Ok(budget)
    }

    fn load_budget_root(&self, budget_id: BudgetId) -> Result<Budget> {
        self.inner
            .read()
            .budgets
            .get(&budget_id)
            .cloned()
            .ok_or(Error::BudgetNotFound(budget_id))
    }

    fn load_line(&self, line_id: LineId) -> Result<BudgetLine> {
        self.inner
            .read()
            .lines
            .get(&line_id)
            .cloned()
            .ok_or_else(|| Error::LineNotFound(line_id.to_string()))
    }

    fn list_budget_ids(&self) -> Result<Vec<BudgetId>> {
        let mut ids: Vec<BudgetId> = self.inner.read().budgets.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn successor_of(&self, budget_id: BudgetId) -> Result<Option<BudgetId>> {
        Ok(self.inner.read().successors.get(&budget_id).copied())
    }

    fn save_budget(&self, budget: &mut Budget) -> Result<()> {
        self.inner.write().write_budget(budget, None, None)?;
        Ok(())
    }

    fn save_line(&self, line: &mut BudgetLine) -> Result<()> {
        let mut inner = self.inner.write();

        let stored = inner
            .lines
            .get(&line.id())
            .ok_or_else(|| Error::LineNotFound(line.id().to_string()))?;
        let stored_budget = inner
            .budgets
            .get(&line.budget_id())
            .ok_or(Error::BudgetNotFound(line.budget_id()))?;

        let successor = inner.successors.get(&line.budget_id()).copied();

        let version = plan_line_write(stored_budget, stored, line, successor)?;
        line.set_version(version);
        inner.lines.insert(line.id(), line.clone());
        Ok(())
    }

    fn commit_seal(
        &self,
        budget: &mut Budget,
        entry: IntegrityAuditEntry,
    ) -> Result<IntegrityAuditEntry> {
        check_seal_entry(budget, &entry)?;
        self.inner
            .write()
            .write_budget(budget, Some(entry), None)?
            .ok_or_else(|| Error::Storage("Seal entry was not appended".to_string()))
    }

    fn insert_revision(
        &self,
        revision: &mut Budget,
        base: &Budget,
        entry: IntegrityAuditEntry,
    ) -> Result<IntegrityAuditEntry> {
        check_seal_entry(revision, &entry)?;
        self.inner
            .write()
            .write_budget(revision, Some(entry), Some(base))?
            .ok_or_else(|| Error::Storage("Seal entry was not appended".to_string()))
    }
}

// RocksDB store

/// Column family names
const CF_BUDGETS: &str = "budgets";
const CF_LINES: &str = "lines";
const CF_AUDIT: &str = "audit";
const CF_INDICES: &str = "indices";

/// Index key prefixes
const IDX_BUDGET_LINE: u8 = b'B';
const IDX_BUDGET_AUDIT: u8 = b'A';
const IDX_VIOLATION: u8 = b'V';
const IDX_SUCCESSOR: u8 = b'R';

const EMPTY: &[u8] = &[];

/// RocksDB-backed store
pub struct RocksStore {
    db: Arc<DB>,
    // Serializes writes and holds the next audit sequence
    sequence: Mutex<u64>,
    sync_writes: bool,
}

impl fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BUDGETS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_LINES, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_AUDIT, Self::cf_options_audit()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        let store = Self {
            db: Arc::new(db),
            sequence: Mutex::new(1),
            sync_writes: config.rocksdb.sync_writes,
        };

        let next = store.recover_sequence()?;
        *store.sequence.lock() = next;

        tracing::info!(
            path = ?path,
            next_audit_sequence = next,
            "Opened budget store"
        );

        Ok(store)
    }

    // Column family options

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Records are read on every ledger operation
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_audit() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn recover_sequence(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_AUDIT)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_u64(&key)? + 1)
            }
            None => Ok(1),
        }
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    // Reads

    fn get_root(&self, budget_id: BudgetId) -> Result<Option<Budget>> {
        let cf = self.cf_handle(CF_BUDGETS)?;
        match self.db.get_cf(&cf, budget_id.as_uuid().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn get_line(&self, line_id: LineId) -> Result<Option<BudgetLine>> {
        let cf = self.cf_handle(CF_LINES)?;
        match self.db.get_cf(&cf, line_id.as_uuid().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn get_lines_of(&self, budget_id: BudgetId) -> Result<HashMap<LineId, BudgetLine>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = index_key_budget_line(budget_id, None);

        let mut lines = HashMap::new();
        for item in self.db.prefix_iterator_cf(&cf_indices, &prefix) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let line_id = LineId::from_uuid(decode_uuid(&key[prefix.len()..])?);
            let line = self
                .get_line(line_id)?
                .ok_or_else(|| Error::Storage(format!("Dangling line index {}", line_id)))?;
            lines.insert(line_id, line);
        }
        Ok(lines)
    }

    fn get_successor(&self, budget_id: BudgetId) -> Result<Option<BudgetId>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        match self.db.get_cf(&cf_indices, index_key_successor(budget_id))? {
            Some(value) => Ok(Some(BudgetId::from_uuid(decode_uuid(&value)?))),
            None => Ok(None),
        }
    }

    fn get_audit_by_index(&self, prefix: &[u8]) -> Result<Vec<IntegrityAuditEntry>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let cf_audit = self.cf_handle(CF_AUDIT)?;

        let mut entries = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf_indices, prefix) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let sequence = decode_u64(&key[prefix.len()..])?;
            let value = self
                .db
                .get_cf(&cf_audit, sequence.to_be_bytes())?
                .ok_or_else(|| Error::Storage(format!("Dangling audit index {}", sequence)))?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(sorted_newest_first(entries))
    }

    // Writes

    fn put_audit_entry(
        &self,
        batch: &mut WriteBatch,
        entry: &IntegrityAuditEntry,
    ) -> Result<()> {
        let cf_audit = self.cf_handle(CF_AUDIT)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let sequence = entry
            .sequence()
            .ok_or_else(|| Error::Storage("Audit entry without sequence".to_string()))?;

        batch.put_cf(&cf_audit, sequence.to_be_bytes(), bincode::serialize(entry)?);
        batch.put_cf(
            &cf_indices,
            index_key_budget_audit(entry.budget_id(), Some(sequence)),
            EMPTY,
        );
        if entry.event_type() == AuditEventType::HashViolation {
            batch.put_cf(&cf_indices, index_key_violation(Some(sequence)), EMPTY);
        }
        Ok(())
    }

    fn write_budget(
        &self,
        budget: &mut Budget,
        entry: Option<IntegrityAuditEntry>,
        base: Option<&Budget>,
    ) -> Result<Option<IntegrityAuditEntry>> {
        let mut next_sequence = self.sequence.lock();

        let stored = self.get_root(budget.id())?;
        match base {
            Some(base) => check_revision_insert(
                budget,
                base,
                self.get_root(base.id())?.as_ref(),
                &self.get_lines_of(base.id())?,
                self.get_successor(base.id())?,
            )?,
            None if stored.is_none() && budget.supersedes().is_some() => {
                return Err(unlinked_revision(budget));
            }
            None => {}
        }

        let stored_lines = self.get_lines_of(budget.id())?;
        let plan = plan_budget_write(
            stored.as_ref(),
            &stored_lines,
            budget,
            entry.is_some(),
            self.get_successor(budget.id())?,
        )?;

        let cf_budgets = self.cf_handle(CF_BUDGETS)?;
        let cf_lines = self.cf_handle(CF_LINES)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let mut batch = WriteBatch::default();

        // 1. Root
        let mut root = budget.detached_root();
        root.set_version(plan.budget_version);
        batch.put_cf(&cf_budgets, budget.id().as_uuid().as_bytes(), bincode::serialize(&root)?);

        // 2. Changed and new lines
        for (line_id, version) in &plan.changed_lines {
            if let Some(line) = budget.line(*line_id) {
                let mut line = line.clone();
                line.set_version(*version);
                batch.put_cf(&cf_lines, line_id.as_uuid().as_bytes(), bincode::serialize(&line)?);
                batch.put_cf(&cf_indices, index_key_budget_line(budget.id(), Some(*line_id)), EMPTY);
            }
        }

        // 3. Removed lines
        for line_id in &plan.removed_lines {
            batch.delete_cf(&cf_lines, line_id.as_uuid().as_bytes());
            batch.delete_cf(&cf_indices, index_key_budget_line(budget.id(), Some(*line_id)));
        }

        // 4. Successor link
        if let Some(base) = base {
            batch.put_cf(
                &cf_indices,
                index_key_successor(base.id()),
                budget.id().as_uuid().as_bytes(),
            );
        }

        // 5. Audit entry
        let entry = entry.map(|e| e.with_sequence(*next_sequence));
        if let Some(entry) = &entry {
            self.put_audit_entry(&mut batch, entry)?;
        }

        // Atomic commit
        self.db.write_opt(batch, &self.write_options())?;

        if entry.is_some() {
            *next_sequence += 1;
        }
        apply_plan(budget, &plan);

        tracing::debug!(
            budget_id = %budget.id(),
            version = plan.budget_version,
            changed_lines = plan.changed_lines.len(),
            removed_lines = plan.removed_lines.len(),
            "Budget written"
        );

        Ok(entry)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("Budget store closed");
        Ok(())
    }
}

impl AuditTrail for RocksStore {
    fn append(&self, entry: IntegrityAuditEntry) -> Result<IntegrityAuditEntry> {
        let mut next_sequence = self.sequence.lock();
        let entry = entry.with_sequence(*next_sequence);

        let mut batch = WriteBatch::default();
        self.put_audit_entry(&mut batch, &entry)?;
        self.db.write_opt(batch, &self.write_options())?;

        *next_sequence += 1;
        Ok(entry)
    }

    fn find_by_budget_id(&self, budget_id: BudgetId) -> Result<Vec<IntegrityAuditEntry>> {
        self.get_audit_by_index(&index_key_budget_audit(budget_id, None))
    }

    fn find_violations(&self) -> Result<Vec<IntegrityAuditEntry>> {
        self.get_audit_by_index(&index_key_violation(None))
    }
}

impl BudgetStore for RocksStore {
    fn load_budget(&self, budget_id: BudgetId) -> Result<Budget> {
        let mut budget = self
            .get_root(budget_id)?
            .ok_or(Error::BudgetNotFound(budget_id))?;
        budget.restore_lines(self.get_lines_of(budget_id)?.into_values().collect());
        Ok(budget)
    }

    fn load_budget_root(&self, budget_id: BudgetId) -> Result<Budget> {
        self.get_root(budget_id)?
            .ok_or(Error::BudgetNotFound(budget_id))
    }

    fn load_line(&self, line_id: LineId) -> Result<BudgetLine> {
        self.get_line(line_id)?
            .ok_or_else(|| Error::LineNotFound(line_id.to_string()))
    }

    fn list_budget_ids(&self) -> Result<Vec<BudgetId>> {
        let cf = self.cf_handle(CF_BUDGETS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(BudgetId::from_uuid(decode_uuid(&key)?));
        }
        Ok(ids)
    }

    fn successor_of(&self, budget_id: BudgetId) -> Result<Option<BudgetId>> {
        self.get_successor(budget_id)
    }

    fn save_budget(&self, budget: &mut Budget) -> Result<()> {
        self.write_budget(budget, None, None)?;
        Ok(())
    }

    fn save_line(&self, line: &mut BudgetLine) -> Result<()> {
        let _guard = self.sequence.lock();

        let stored = self
            .get_line(line.id())?
            .ok_or_else(|| Error::LineNotFound(line.id().to_string()))?;
        let stored_budget = self
            .get_root(line.budget_id())?
            .ok_or(Error::BudgetNotFound(line.budget_id()))?;
        let successor = self.get_successor(line.budget_id())?;
        let version = plan_line_write(&stored_budget, &stored, line, successor)?;

        let mut updated = line.clone();
        updated.set_version(version);

        let cf_lines = self.cf_handle(CF_LINES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_lines, line.id().as_uuid().as_bytes(), bincode::serialize(&updated)?);
        self.db.write_opt(batch, &self.write_options())?;

        line.set_version(version);
        Ok(())
    }

    fn commit_seal(
        &self,
        budget: &mut Budget,
        entry: IntegrityAuditEntry,
    ) -> Result<IntegrityAuditEntry> {
        check_seal_entry(budget, &entry)?;
        self.write_budget(budget, Some(entry), None)?
            .ok_or_else(|| Error::Storage("Seal entry was not appended".to_string()))
    }

    fn insert_revision(
        &self,
        revision: &mut Budget,
        base: &Budget,
        entry: IntegrityAuditEntry,
    ) -> Result<IntegrityAuditEntry> {
        check_seal_entry(revision, &entry)?;
        self.write_budget(revision, Some(entry), Some(base))?
            .ok_or_else(|| Error::Storage("Seal entry was not appended".to_string()))
    }
}

// Index key helpers

fn index_key_budget_line(budget_id: BudgetId, line_id: Option<LineId>) -> Vec<u8> {
    let mut key = vec![IDX_BUDGET_LINE];
    key.extend_from_slice(budget_id.as_uuid().as_bytes());
    if let Some(line_id) = line_id {
        key.extend_from_slice(line_id.as_uuid().as_bytes());
    }
    key
}

fn index_key_budget_audit(budget_id: BudgetId, sequence: Option<u64>) -> Vec<u8> {
    let mut key = vec![IDX_BUDGET_AUDIT];
    key.extend_from_slice(budget_id.as_uuid().as_bytes());
    if let Some(sequence) = sequence {
        key.extend_from_slice(&sequence.to_be_bytes());
    }
    key
}

fn index_key_violation(sequence: Option<u64>) -> Vec<u8> {
    let mut key = vec![IDX_VIOLATION];
    if let Some(sequence) = sequence {
        key.extend_from_slice(&sequence.to_be_bytes());
    }
    key
}

fn index_key_successor(budget_id: BudgetId) -> Vec<u8> {
    let mut key = vec![IDX_SUCCESSOR];
    key.extend_from_slice(budget_id.as_uuid().as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Malformed sequence key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_uuid(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Storage(format!("Malformed id key: {}", e)))
}
