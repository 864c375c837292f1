//! Metrics collection for integrity operations
//!
//! Prometheus collectors live in a private registry so several ledgers (and
//! tests) can coexist in one process.
//!
//! # Metrics
//!
//! - `budget_integrity_hashes_total{kind,algorithm}` - Hashes computed
//! - `budget_integrity_validations_total{result,algorithm}` - Validation outcomes
//! - `budget_integrity_violations_total{algorithm}` - Detected violations
//! - `budget_integrity_hash_duration_seconds{kind}` - Hash latency
//! - `budget_integrity_lines_hashed` - Lines covered per approval hash

use crate::types::HashAlgorithm;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

/// Hash kind label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// Seal over the structural fields
    Approval,
    /// Chained digest over the financial state
    Execution,
}

impl HashKind {
    fn label(&self) -> &'static str {
        match self {
            HashKind::Approval => "approval",
            HashKind::Execution => "execution",
        }
    }
}

/// Integrity metrics collector
#[derive(Clone)]
pub struct IntegrityMetrics {
    /// Hashes computed
    pub hashes_total: IntCounterVec,

    /// Validation outcomes
    pub validations_total: IntCounterVec,

    /// Detected violations
    pub violations_total: IntCounterVec,

    /// Hash latency
    pub hash_duration: HistogramVec,

    /// Lines per approval hash
    pub lines_hashed: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for IntegrityMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityMetrics").finish_non_exhaustive()
    }
}

impl IntegrityMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let hashes_total = IntCounterVec::new(
            Opts::new("budget_integrity_hashes_total", "Total number of hashes computed"),
            &["kind", "algorithm"],
        )?;
        registry.register(Box::new(hashes_total.clone()))?;

        let validations_total = IntCounterVec::new(
            Opts::new(
                "budget_integrity_validations_total",
                "Total number of integrity validations",
            ),
            &["result", "algorithm"],
        )?;
        registry.register(Box::new(validations_total.clone()))?;

        let violations_total = IntCounterVec::new(
            Opts::new(
                "budget_integrity_violations_total",
                "Total number of detected integrity violations",
            ),
            &["algorithm"],
        )?;
        registry.register(Box::new(violations_total.clone()))?;

        let hash_duration = HistogramVec::new(
            HistogramOpts::new(
                "budget_integrity_hash_duration_seconds",
                "Histogram of hash computation latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500]),
            &["kind"],
        )?;
        registry.register(Box::new(hash_duration.clone()))?;

        let lines_hashed = Histogram::with_opts(
            HistogramOpts::new(
                "budget_integrity_lines_hashed",
                "Histogram of lines covered per approval hash",
            )
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        registry.register(Box::new(lines_hashed.clone()))?;

        Ok(Self {
            hashes_total,
            validations_total,
            violations_total,
            hash_duration,
            lines_hashed,
            registry,
        })
    }

    /// Record a computed hash
    pub fn record_hash(&self, kind: HashKind, algorithm: HashAlgorithm, duration_seconds: f64) {
        self.hashes_total
            .with_label_values(&[kind.label(), algorithm.tag()])
            .inc();
        self.hash_duration
            .with_label_values(&[kind.label()])
            .observe(duration_seconds);
    }

    /// Record the number of lines sealed
    pub fn record_lines_hashed(&self, lines: usize) {
        self.lines_hashed.observe(lines as f64);
    }

    /// Record a validation outcome
    pub fn record_validation(&self, success: bool, algorithm: HashAlgorithm) {
        let result = if success { "success" } else { "failure" };
        self.validations_total
            .with_label_values(&[result, algorithm.tag()])
            .inc();
        if !success {
            self.violations_total
                .with_label_values(&[algorithm.tag()])
                .inc();
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
