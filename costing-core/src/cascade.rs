//! Cascade recomputation over an item's later snapshots
//!
//! Given a baseline valuation and the ordered chain that follows it, refold
//! every entry using the freshly computed valuation as the next baseline. The
//! first failing step aborts the whole cascade; callers commit the returned
//! snapshots in one batch or not at all. No storage access happens here.

use crate::error::ValuationError;
use crate::fold::Valuation;
use crate::ordering::LedgerPosition;
use crate::types::{Snapshot, SnapshotId, Transaction, TransactionId};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A stored snapshot together with the transaction that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    /// Ledger entry
    pub snapshot: Snapshot,
    /// Owning transaction
    pub transaction: Transaction,
}

impl ChainLink {
    /// Position in the chain
    pub fn position(&self) -> LedgerPosition {
        self.snapshot.position()
    }
}

/// Cascade stopped at an entry that would go negative
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cascade halted at {position} (snapshot {snapshot_id}, transaction {transaction_id}): {source}")]
pub struct CascadeFailure {
    /// Offending snapshot
    pub snapshot_id: SnapshotId,
    /// Its transaction
    pub transaction_id: TransactionId,
    /// Where in the chain it sits
    pub position: LedgerPosition,
    /// Fold failure
    #[source]
    pub source: ValuationError,
}

/// Recomputed tail of a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Every recomputed snapshot, in chain order
    pub snapshots: Vec<Snapshot>,
    /// Valuation after the last entry (the baseline if the chain is empty)
    pub tail: Valuation,
    /// Number of snapshots whose valuation actually moved
    pub changed: usize,
}

/// Refold `chain` starting from `baseline`
pub fn cascade(
    baseline: &Valuation,
    chain: &[ChainLink],
    now: DateTime<Utc>,
) -> Result<CascadeOutcome, CascadeFailure> {
    let (tail, snapshots, changed) = chain.iter().try_fold(
        (baseline.clone(), Vec::with_capacity(chain.len()), 0usize),
        |(previous, mut snapshots, changed), link| {
            let next = previous
                .apply_transaction(&link.transaction)
                .map_err(|source| CascadeFailure {
                    snapshot_id: link.snapshot.id,
                    transaction_id: link.transaction.id,
                    position: link.position(),
                    source,
                })?;

            let moved = !next.matches(&link.snapshot);
            let mut snapshot = link.snapshot.clone();
            if moved {
                next.stamp(&mut snapshot, now);
            }
            snapshots.push(snapshot);

            Ok((next, snapshots, changed + usize::from(moved)))
        },
    )?;

    Ok(CascadeOutcome {
        snapshots,
        tail,
        changed,
    })
}
