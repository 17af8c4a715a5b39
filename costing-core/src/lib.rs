//! Costing Core
//!
//! Weighted-average inventory costing ledger with cascade recomputation.
//!
//! # Architecture
//!
//! - **Snapshot chain**: Each transaction owns one snapshot holding the
//!   item's stock, value and unit cost right after it
//! - **Single fold**: Create, update, delete and verification all derive
//!   snapshots through [`Valuation::apply`]
//! - **Cascade**: Back-dated changes refold every later snapshot and commit
//!   them in one RocksDB write batch
//! - **Per-item locking**: Mutations of one item are serialized, different
//!   items run in parallel
//!
//! # Invariants
//!
//! - Every snapshot equals the fold of its predecessor and its transaction
//! - Stock and value are never negative
//! - Rows are tombstoned, never removed

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cascade;
pub mod config;
pub mod error;
pub mod fold;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod ordering;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use fold::Valuation;
pub use ledger::{InventoryLedger, SnapshotMismatch, VerificationReport};
pub use ordering::{LedgerPosition, RangeBound};
pub use storage::{Storage, StorageStats};
pub use types::{
    Direction, ItemId, NewTransaction, Snapshot, SnapshotId, Transaction, TransactionChange,
    TransactionId, TransactionRecord,
};
