//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//! Collectors are registered in a per-instance registry so several ledgers
//! can live in one process (tests open many).
//!
//! # Metrics
//!
//! - `costing_transactions_created_total` - Transactions recorded
//! - `costing_transactions_updated_total` - Transactions updated
//! - `costing_transactions_deleted_total` - Transactions tombstoned
//! - `costing_rejections_total{kind}` - Rejected mutations by error kind
//! - `costing_cascade_length` - Snapshots recomputed per mutation
//! - `costing_mutation_duration_seconds` - Mutation latency

use crate::error::ErrorKind;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Transactions recorded
    pub created_total: IntCounter,

    /// Transactions updated
    pub updated_total: IntCounter,

    /// Transactions tombstoned
    pub deleted_total: IntCounter,

    /// Rejections by error kind
    pub rejections_total: IntCounterVec,

    /// Cascade length histogram
    pub cascade_length: Histogram,

    /// Mutation duration histogram
    pub mutation_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let created_total = IntCounter::new(
            "costing_transactions_created_total",
            "Transactions recorded",
        )?;
        registry.register(Box::new(created_total.clone()))?;

        let updated_total = IntCounter::new(
            "costing_transactions_updated_total",
            "Transactions updated",
        )?;
        registry.register(Box::new(updated_total.clone()))?;

        let deleted_total = IntCounter::new(
            "costing_transactions_deleted_total",
            "Transactions tombstoned",
        )?;
        registry.register(Box::new(deleted_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("costing_rejections_total", "Rejected mutations by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let cascade_length = Histogram::with_opts(
            HistogramOpts::new("costing_cascade_length", "Snapshots recomputed per mutation")
                .buckets(vec![0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]),
        )?;
        registry.register(Box::new(cascade_length.clone()))?;

        let mutation_duration = Histogram::with_opts(
            HistogramOpts::new("costing_mutation_duration_seconds", "Mutation latency")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(mutation_duration.clone()))?;

        Ok(Self {
            created_total,
            updated_total,
            deleted_total,
            rejections_total,
            cascade_length,
            mutation_duration,
            registry,
        })
    }

    /// Record a successful create
    pub fn record_created(&self, cascade_len: usize, duration_seconds: f64) {
        self.created_total.inc();
        self.record_mutation(cascade_len, duration_seconds);
    }

    /// Record a successful update
    pub fn record_updated(&self, cascade_len: usize, duration_seconds: f64) {
        self.updated_total.inc();
        self.record_mutation(cascade_len, duration_seconds);
    }

    /// Record a successful delete
    pub fn record_deleted(&self, cascade_len: usize, duration_seconds: f64) {
        self.deleted_total.inc();
        self.record_mutation(cascade_len, duration_seconds);
    }

    fn record_mutation(&self, cascade_len: usize, duration_seconds: f64) {
        self.cascade_length.observe(cascade_len as f64);
        self.mutation_duration.observe(duration_seconds);
    }

    /// Record a rejected mutation
    pub fn record_rejection(&self, kind: ErrorKind) {
        self.rejections_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Rejections recorded for one kind
    pub fn rejections(&self, kind: ErrorKind) -> u64 {
        self.rejections_total.with_label_values(&[kind.as_str()]).get()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("created_total", &self.created_total.get())
            .field("updated_total", &self.updated_total.get())
            .field("deleted_total", &self.deleted_total.get())
            .finish_non_exhaustive()
    }
}
