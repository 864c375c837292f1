//! Integrity audit binary
//!
//! Validates sealed budgets in a store and prints the violation view as JSON.
//!
//! ```text
//! integrity-audit [--config <file>] [budget-id ...]
//! ```
//!
//! Without budget ids every sealed budget in the store is validated. Exits with
//! status 2 when any violation is found.

use anyhow::{bail, Context};
use budget_core::{
    AuditTrail, BudgetId, BudgetStore, Config, Error, IntegrityMetrics, IntegritySealer,
    RocksStore,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct Report {
    checked: usize,
    valid: usize,
    skipped: usize,
    violations: Vec<ViolationRecord>,
}

#[derive(Debug, Serialize)]
struct ViolationRecord {
    budget_id: String,
    sequence: Option<u64>,
    recorded_at: String,
    algorithm: String,
    approval_hash: Option<String>,
    recomputed_hash: Option<String>,
    details: Option<String>,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1).peekable();
    let config = if args.peek().map(String::as_str) == Some("--config") {
        args.next();
        let path = args.next().context("--config requires a path")?;
        Config::from_file(&path).with_context(|| format!("loading config from {}", path))?
    } else {
        Config::from_env()?
    };

    let requested = args
        .map(|arg| {
            Uuid::parse_str(&arg)
                .map(BudgetId::from_uuid)
                .with_context(|| format!("invalid budget id: {}", arg))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    tracing::info!(data_dir = ?config.data_dir, "Starting integrity audit");

    let store = Arc::new(RocksStore::open(&config)?);
    let mut sealer = IntegritySealer::new(config.integrity.algorithm, store.clone());
    if config.integrity.metrics_enabled {
        sealer = sealer.with_metrics(Arc::new(IntegrityMetrics::new()?));
    }

    let budget_ids = if requested.is_empty() {
        store.list_budget_ids()?
    } else {
        requested
    };

    let mut report = Report {
        checked: 0,
        valid: 0,
        skipped: 0,
        violations: Vec::new(),
    };

    for budget_id in budget_ids {
        let budget = store.load_budget(budget_id)?;
        if !budget.is_sealed() {
            report.skipped += 1;
            continue;
        }

        report.checked += 1;
        match sealer.validate(&budget, None) {
            Ok(_) => report.valid += 1,
            Err(Error::BudgetIntegrityViolation(violation)) => {
                tracing::error!(%violation, "Integrity check failed");
            }
            Err(err) => return Err(err.into()),
        }
    }

    report.violations = store
        .find_violations()?
        .into_iter()
        .map(|entry| ViolationRecord {
            budget_id: entry.budget_id().to_string(),
            sequence: entry.sequence(),
            recorded_at: entry.recorded_at().to_rfc3339(),
            algorithm: entry.algorithm().tag().to_string(),
            approval_hash: entry.approval_hash().map(str::to_string),
            recomputed_hash: entry.recomputed_hash().map(str::to_string),
            details: entry.violation_details().map(str::to_string),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed = report.checked - report.valid;
    if failed > 0 {
        tracing::error!(failed, "Integrity audit found violations");
        std::process::exit(2);
    }
    if report.checked == 0 && report.skipped == 0 {
        bail!("no budgets found in {}", config.data_dir.display());
    }

    tracing::info!(checked = report.checked, "Integrity audit passed");
    Ok(())
}
