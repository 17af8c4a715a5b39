//! Main ledger orchestration layer
//!
//! [`InventoryLedger`] ties storage, the per-item lock table, the fold and the
//! cascade engine together. Every mutation runs inside its item's critical
//! section and ends in exactly one atomic storage commit, or none.
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use costing_core::{Config, Direction, InventoryLedger, ItemId, NewTransaction};
//! use rust_decimal::Decimal;
//!
//! fn main() -> costing_core::Result<()> {
//!     let ledger = InventoryLedger::open(Config::default())?;
//!     let item_id = ItemId::generate();
//!
//!     ledger.create_transaction(NewTransaction {
//!         item_id,
//!         direction: Direction::Purchase,
//!         quantity: 20,
//!         amount: Decimal::new(400, 0),
//!         effective_at: Utc::now(),
//!     })?;
//!
//!     assert_eq!(ledger.current_cost(item_id)?, Decimal::new(20, 0));
//!     Ok(())
//! }
//! ```

use crate::{
    cascade::{cascade, CascadeFailure, ChainLink},
    fold::Valuation,
    lock::ItemLocks,
    metrics::Metrics,
    ordering::{LedgerPosition, RangeBound},
    storage::{LedgerBatch, StorageStats},
    types::{
        Direction, ItemId, NewTransaction, Snapshot, SnapshotId, Transaction, TransactionChange,
        TransactionId, TransactionRecord,
    },
    Config, Error, Result, Storage,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Weighted-average inventory costing ledger
pub struct InventoryLedger {
    /// RocksDB store
    storage: Storage,

    /// Per-item critical sections
    locks: ItemLocks,

    /// Last insertion sequence handed out
    sequence: AtomicU64,

    /// Prometheus collectors
    metrics: Metrics,

    /// Configuration
    config: Config,
}

/// Result of a mutation inside the critical section
struct Committed<T> {
    value: T,
    cascaded: usize,
}

impl InventoryLedger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Storage::open(&config)?;
        let sequence = storage.max_sequence()?;
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            sequence,
            "Inventory ledger opened"
        );

        Ok(Self {
            storage,
            locks: ItemLocks::new(),
            sequence: AtomicU64::new(sequence),
            metrics,
            config,
        })
    }

    /// Record a purchase or sale and recompute every later entry of the item
    pub fn create_transaction(&self, request: NewTransaction) -> Result<TransactionRecord> {
        let started = Instant::now();
        let result = validate_movement(request.quantity, request.amount).and_then(|_| {
            self.locks
                .with_item(request.item_id, || self.create_locked(&request))
        });

        let committed = self.observe("create", request.item_id, result)?;
        self.metrics
            .record_created(committed.cascaded, started.elapsed().as_secs_f64());

        let record = committed.value;
        tracing::info!(
            item_id = %record.transaction.item_id,
            transaction_id = %record.transaction.id,
            direction = %record.transaction.direction,
            quantity = record.transaction.quantity,
            cascaded = committed.cascaded,
            "Transaction recorded"
        );

        Ok(record)
    }

    fn create_locked(&self, request: &NewTransaction) -> Result<Committed<TransactionRecord>> {
        let now = Utc::now();
        let sequence = self.next_sequence();
        let position = LedgerPosition::new(request.effective_at, sequence);

        let baseline = self.storage.latest_snapshot(
            request.item_id,
            RangeBound::AtOrBefore(LedgerPosition::closing(request.effective_at)),
            None,
        )?;

        if request.direction == Direction::Sale {
            match &baseline {
                None => return Err(Error::FirstTransactionMustBePurchase(position)),
                Some(previous) if previous.total_stock < u64::from(request.quantity) => {
                    return Err(Error::InsufficientStock {
                        position,
                        requested: request.quantity,
                        available: previous.total_stock,
                    });
                }
                Some(_) => {}
            }
        }

        let transaction = Transaction::record(request, sequence, now);
        let valuation = Valuation::baseline(baseline.as_ref())
            .apply_transaction(&transaction)
            .map_err(|e| {
                Error::InconsistentLedger(format!("transaction at {}: {}", position, e))
            })?;
        let snapshot = new_snapshot(&transaction, &valuation, now);

        let later = self
            .storage
            .chain_links(request.item_id, RangeBound::After(position), None)?;
        let cascaded = self.recompute(&valuation, &later, now)?;

        let mut batch = LedgerBatch::default();
        batch
            .put_transaction(transaction.clone())
            .put_snapshot(snapshot.clone())
            .put_snapshots(cascaded);
        self.storage.commit(&batch)?;

        Ok(Committed {
            value: TransactionRecord {
                transaction,
                snapshot,
            },
            cascaded: later.len(),
        })
    }

    /// Change direction, quantity or amount of a live transaction
    pub fn update_transaction(
        &self,
        transaction_id: TransactionId,
        change: TransactionChange,
    ) -> Result<TransactionRecord> {
        let started = Instant::now();
        let item_id = match self.storage.get_transaction(transaction_id) {
            Ok(Some(transaction)) => transaction.item_id,
            Ok(None) => return self.reject("update", None, not_found(transaction_id)),
            Err(e) => return self.reject("update", None, e),
        };

        let result = validate_movement(change.quantity, change.amount).and_then(|_| {
            self.locks
                .with_item(item_id, || self.update_locked(transaction_id, &change))
        });

        let committed = self.observe("update", item_id, result)?;
        self.metrics
            .record_updated(committed.cascaded, started.elapsed().as_secs_f64());

        tracing::info!(
            item_id = %item_id,
            transaction_id = %transaction_id,
            cascaded = committed.cascaded,
            "Transaction updated"
        );

        Ok(committed.value)
    }

    fn update_locked(
        &self,
        transaction_id: TransactionId,
        change: &TransactionChange,
    ) -> Result<Committed<TransactionRecord>> {
        let now = Utc::now();
        // Reload under the lock, a concurrent delete may have won
        let (mut transaction, mut snapshot) = self.load_live(transaction_id)?;
        let position = transaction.position();
        let item_id = transaction.item_id;

        let baseline =
            self.storage
                .latest_snapshot(item_id, RangeBound::Before(position), Some(snapshot.id))?;

        if change.direction == Direction::Sale && baseline.is_none() {
            return Err(Error::FirstTransactionMustBePurchase(position));
        }

        transaction.apply_change(change, now);
        let valuation = Valuation::baseline(baseline.as_ref())
            .apply_transaction(&transaction)
            .map_err(|e| {
                Error::InconsistentLedger(format!(
                    "transaction {} at {}: {}",
                    transaction_id, position, e
                ))
            })?;
        valuation.stamp(&mut snapshot, now);

        let later =
            self.storage
                .chain_links(item_id, RangeBound::After(position), Some(snapshot.id))?;
        let cascaded = self.recompute(&valuation, &later, now)?;

        let mut batch = LedgerBatch::default();
        batch
            .put_transaction(transaction.clone())
            .put_snapshot(snapshot.clone())
            .put_snapshots(cascaded);
        self.storage.commit(&batch)?;

        Ok(Committed {
            value: TransactionRecord {
                transaction,
                snapshot,
            },
            cascaded: later.len(),
        })
    }

    /// Tombstone a transaction and its snapshot, recomputing later entries
    pub fn delete_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        let started = Instant::now();
        let item_id = match self.storage.get_transaction(transaction_id) {
            Ok(Some(transaction)) => transaction.item_id,
            Ok(None) => return self.reject("delete", None, not_found(transaction_id)),
            Err(e) => return self.reject("delete", None, e),
        };

        let result = self
            .locks
            .with_item(item_id, || self.delete_locked(transaction_id));

        let committed = self.observe("delete", item_id, result)?;
        self.metrics
            .record_deleted(committed.cascaded, started.elapsed().as_secs_f64());

        tracing::info!(
            item_id = %item_id,
            transaction_id = %transaction_id,
            cascaded = committed.cascaded,
            "Transaction deleted"
        );

        Ok(())
    }

    fn delete_locked(&self, transaction_id: TransactionId) -> Result<Committed<()>> {
        let now = Utc::now();
        let (mut transaction, mut snapshot) = self.load_live(transaction_id)?;
        let position = transaction.position();
        let item_id = transaction.item_id;

        let baseline =
            self.storage
                .latest_snapshot(item_id, RangeBound::Before(position), Some(snapshot.id))?;
        let later =
            self.storage
                .chain_links(item_id, RangeBound::After(position), Some(snapshot.id))?;
        let cascaded = self.recompute(&Valuation::baseline(baseline.as_ref()), &later, now)?;

        transaction.deleted_at = Some(now);
        transaction.updated_at = now;
        snapshot.deleted_at = Some(now);
        snapshot.updated_at = now;

        let mut batch = LedgerBatch::default();
        batch
            .put_transaction(transaction)
            .put_snapshot(snapshot)
            .put_snapshots(cascaded);
        self.storage.commit(&batch)?;

        Ok(Committed {
            value: (),
            cascaded: later.len(),
        })
    }

    /// Weighted-average unit cost after the item's latest entry
    pub fn current_cost(&self, item_id: ItemId) -> Result<Decimal> {
        self.storage
            .latest_snapshot(item_id, RangeBound::All, None)?
            .map(|snapshot| snapshot.cost_per_item)
            .ok_or_else(|| Error::NoStock(item_id.to_string()))
    }

    /// Live transaction with its snapshot embedded
    pub fn get_transaction(&self, transaction_id: TransactionId) -> Result<TransactionRecord> {
        let item_id = self
            .storage
            .get_transaction(transaction_id)?
            .ok_or_else(|| not_found(transaction_id))?
            .item_id;
        // Both rows under the lock so a concurrent commit cannot land between the reads
        let (transaction, snapshot) = self
            .locks
            .with_item(item_id, || self.load_live(transaction_id))?;
        Ok(TransactionRecord {
            transaction,
            snapshot,
        })
    }

    /// The item's live chain in ledger order
    pub fn ledger_entries(&self, item_id: ItemId) -> Result<Vec<Snapshot>> {
        self.locks.with_item(item_id, || {
            self.storage.snapshots_in_range(item_id, RangeBound::All, None)
        })
    }

    /// Refold the item's whole chain from zero and compare with what is stored
    pub fn verify_item(&self, item_id: ItemId) -> Result<VerificationReport> {
        let links = self.locks.with_item(item_id, || {
            self.storage.chain_links(item_id, RangeBound::All, None)
        })?;

        let mut report = VerificationReport {
            item_id,
            entries: links.len(),
            mismatches: Vec::new(),
            failure: None,
        };

        match cascade(&Valuation::ZERO, &links, Utc::now()) {
            Ok(outcome) => {
                report.mismatches = links
                    .iter()
                    .zip(&outcome.snapshots)
                    .filter(|(link, expected)| link.snapshot != **expected)
                    .map(|(link, expected)| SnapshotMismatch {
                        snapshot_id: link.snapshot.id,
                        position: link.position(),
                        stored: Valuation::of(&link.snapshot),
                        expected: Valuation::of(expected),
                    })
                    .collect();
            }
            Err(failure) => report.failure = Some(failure),
        }

        if report.is_consistent() {
            tracing::debug!(item_id = %item_id, entries = report.entries, "Chain verified");
        } else {
            tracing::warn!(
                item_id = %item_id,
                mismatches = report.mismatches.len(),
                failure = ?report.failure,
                "Chain does not match its transactions"
            );
        }

        Ok(report)
    }

    /// Verify every item that has ledger entries
    pub fn verify_all(&self) -> Result<Vec<VerificationReport>> {
        let reports = self
            .storage
            .item_ids()?
            .into_iter()
            .map(|item_id| self.verify_item(item_id))
            .collect::<Result<Vec<_>>>()?;

        let inconsistent = reports.iter().filter(|r| !r.is_consistent()).count();
        tracing::info!(items = reports.len(), inconsistent, "Ledger verification finished");

        Ok(reports)
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Prometheus collectors
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close the ledger (graceful shutdown)
    pub fn close(self) -> Result<()> {
        self.storage.close()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn load_live(&self, transaction_id: TransactionId) -> Result<(Transaction, Snapshot)> {
        let transaction = self
            .storage
            .get_transaction(transaction_id)?
            .ok_or_else(|| not_found(transaction_id))?;
        let snapshot = self
            .storage
            .snapshot_for_transaction(transaction_id)?
            .ok_or_else(|| not_found(transaction_id))?;
        Ok((transaction, snapshot))
    }

    /// Cascade over `later` and keep only the snapshots that moved
    fn recompute(
        &self,
        baseline: &Valuation,
        later: &[ChainLink],
        now: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>> {
        if later.len() > self.config.ledger.max_cascade_len {
            tracing::warn!(
                length = later.len(),
                threshold = self.config.ledger.max_cascade_len,
                "Long cascade"
            );
        }

        let outcome = cascade(baseline, later, now)
            .map_err(|failure| Error::InconsistentLedger(failure.to_string()))?;

        tracing::debug!(
            length = later.len(),
            changed = outcome.changed,
            "Cascade computed"
        );

        Ok(outcome
            .snapshots
            .into_iter()
            .zip(later)
            .filter(|(recomputed, link)| *recomputed != link.snapshot)
            .map(|(recomputed, _)| recomputed)
            .collect())
    }

    fn observe<T>(&self, operation: &'static str, item_id: ItemId, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => self.reject(operation, Some(item_id), e),
        }
    }

    fn reject<T>(&self, operation: &'static str, item_id: Option<ItemId>, err: Error) -> Result<T> {
        self.metrics.record_rejection(err.kind());
        tracing::warn!(
            operation,
            item_id = ?item_id,
            kind = %err.kind(),
            error = %err,
            "Mutation rejected"
        );
        Err(err)
    }
}

impl std::fmt::Debug for InventoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryLedger")
            .field("data_dir", &self.config.data_dir)
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Outcome of refolding one item's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// Item checked
    pub item_id: ItemId,
    /// Live entries in the chain
    pub entries: usize,
    /// Stored snapshots that disagree with the refold
    pub mismatches: Vec<SnapshotMismatch>,
    /// Where the refold itself broke, if it did
    #[serde(skip)]
    pub failure: Option<CascadeFailure>,
}

impl VerificationReport {
    /// True when every stored snapshot equals its refold
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.failure.is_none()
    }
}

/// A stored snapshot whose valuation differs from the refold
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotMismatch {
    /// Snapshot ID
    pub snapshot_id: SnapshotId,
    /// Chain position
    pub position: LedgerPosition,
    /// What storage holds
    pub stored: Valuation,
    /// What the transactions imply
    pub expected: Valuation,
}

fn validate_movement(quantity: u32, amount: Decimal) -> Result<()> {
    if quantity == 0 {
        return Err(Error::ValidationFailed(
            "quantity must be positive".to_string(),
        ));
    }
    if amount < Decimal::ZERO {
        return Err(Error::ValidationFailed(
            "amount must not be negative".to_string(),
        ));
    }
    Ok(())
}

fn not_found(transaction_id: TransactionId) -> Error {
    Error::NotFound(format!("transaction {}", transaction_id))
}

fn new_snapshot(transaction: &Transaction, valuation: &Valuation, now: DateTime<Utc>) -> Snapshot {
    let mut snapshot = Snapshot {
        id: SnapshotId::generate(),
        item_id: transaction.item_id,
        transaction_id: transaction.id,
        total_stock: 0,
        total_value: Decimal::ZERO,
        cost_per_item: Decimal::ZERO,
        logged_at: transaction.effective_at,
        sequence: transaction.sequence,
        updated_at: now,
        deleted_at: None,
    };
    valuation.stamp(&mut snapshot, now);
    snapshot
}
