//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Soft deletion (`deleted_at` tombstones, rows are never removed)

use crate::ordering::LedgerPosition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Fresh time-ordered identifier (UUIDv7)
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Raw bytes, used for storage keys
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Item identifier. Item attributes live outside the costing core.
    ItemId
);
uuid_id!(
    /// Transaction identifier
    TransactionId
);
uuid_id!(
    /// Snapshot (ledger entry) identifier
    SnapshotId
);

/// Direction of stock movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Stock comes in at the given amount
    Purchase = 1,
    /// Stock leaves at the running average cost
    Sale = 2,
}

impl Direction {
    /// Map the `is_purchase` flag used by callers
    pub fn from_purchase_flag(is_purchase: bool) -> Self {
        if is_purchase {
            Direction::Purchase
        } else {
            Direction::Sale
        }
    }

    /// Inverse of [`Direction::from_purchase_flag`]
    pub fn is_purchase(&self) -> bool {
        matches!(self, Direction::Purchase)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Purchase => f.write_str("purchase"),
            Direction::Sale => f.write_str("sale"),
        }
    }
}

/// Request to record a new transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    /// Item the stock belongs to
    pub item_id: ItemId,
    /// Purchase or sale
    pub direction: Direction,
    /// Units moved, must be positive
    pub quantity: u32,
    /// Total price of the movement, must not be negative
    pub amount: Decimal,
    /// Business time
    pub effective_at: DateTime<Utc>,
}

/// Mutable fields of an existing transaction.
///
/// Item and effective time are fixed at creation; moving a transaction means
/// deleting it and recording a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionChange {
    /// Purchase or sale
    pub direction: Direction,
    /// Units moved, must be positive
    pub quantity: u32,
    /// Total price of the movement, must not be negative
    pub amount: Decimal,
}

/// Stored purchase or sale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,
    /// Item reference
    pub item_id: ItemId,
    /// Purchase or sale
    pub direction: Direction,
    /// Units moved
    pub quantity: u32,
    /// Total price (ignored by valuation for sales)
    pub amount: Decimal,
    /// Business time, immutable
    pub effective_at: DateTime<Utc>,
    /// Insertion sequence, immutable
    pub sequence: u64,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
    /// Tombstone
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Build a fresh row from a request
    pub fn record(request: &NewTransaction, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: TransactionId::generate(),
            item_id: request.item_id,
            direction: request.direction,
            quantity: request.quantity,
            amount: request.amount,
            effective_at: request.effective_at,
            sequence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Position in the item's chain
    pub fn position(&self) -> LedgerPosition {
        LedgerPosition::new(self.effective_at, self.sequence)
    }

    /// Overwrite the mutable fields
    pub fn apply_change(&mut self, change: &TransactionChange, now: DateTime<Utc>) {
        self.direction = change.direction;
        self.quantity = change.quantity;
        self.amount = change.amount;
        self.updated_at = now;
    }

    /// Check if tombstoned
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Cumulative valuation right after one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot ID
    pub id: SnapshotId,
    /// Item reference
    pub item_id: ItemId,
    /// Owning transaction
    pub transaction_id: TransactionId,
    /// Units on hand
    pub total_stock: u64,
    /// Book value of the units on hand
    pub total_value: Decimal,
    /// Weighted-average unit cost
    pub cost_per_item: Decimal,
    /// Copy of the owning transaction's effective time
    pub logged_at: DateTime<Utc>,
    /// Copy of the owning transaction's insertion sequence
    pub sequence: u64,
    /// Last time the valuation was written
    pub updated_at: DateTime<Utc>,
    /// Tombstone
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Position in the item's chain
    pub fn position(&self) -> LedgerPosition {
        LedgerPosition::new(self.logged_at, self.sequence)
    }

    /// Check if tombstoned
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Transaction with its snapshot embedded, as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// The transaction
    #[serde(flatten)]
    pub transaction: Transaction,
    /// Its ledger entry
    pub snapshot: Snapshot,
}
