//! Ordering rule for ledger positions
//!
//! Every "before" / "after" question in the crate goes through
//! [`LedgerPosition`]'s `Ord` impl: effective time ascending, then insertion
//! sequence ascending. Baseline lookups, cascade ranges and the storage index
//! all agree on this order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Where an entry sits in an item's chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerPosition {
    /// Business time of the owning transaction
    pub effective_at: DateTime<Utc>,

    /// Insertion sequence, tie-break only
    pub sequence: u64,
}

impl LedgerPosition {
    /// Create a position
    pub fn new(effective_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            effective_at,
            sequence,
        }
    }

    /// Last possible position at an instant. Everything recorded at or before
    /// `effective_at` compares `<=` to it.
    pub fn closing(effective_at: DateTime<Utc>) -> Self {
        Self::new(effective_at, u64::MAX)
    }
}

impl Ord for LedgerPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.effective_at
            .cmp(&other.effective_at)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for LedgerPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LedgerPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.effective_at.to_rfc3339(), self.sequence)
    }
}

/// Range of positions selected by a chain query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    /// Whole chain
    All,
    /// Strictly earlier than the position
    Before(LedgerPosition),
    /// Earlier than or equal to the position
    AtOrBefore(LedgerPosition),
    /// Strictly later than the position
    After(LedgerPosition),
}

impl RangeBound {
    /// Whether `position` falls inside the range
    pub fn admits(&self, position: &LedgerPosition) -> bool {
        match self {
            RangeBound::All => true,
            RangeBound::Before(bound) => position.cmp(bound) == Ordering::Less,
            RangeBound::AtOrBefore(bound) => position.cmp(bound) != Ordering::Greater,
            RangeBound::After(bound) => position.cmp(bound) == Ordering::Greater,
        }
    }

    /// Position the range is anchored at, if any
    pub fn anchor(&self) -> Option<LedgerPosition> {
        match self {
            RangeBound::All => None,
            RangeBound::Before(p) | RangeBound::AtOrBefore(p) | RangeBound::After(p) => Some(*p),
        }
    }

    /// True when the range only extends towards earlier positions
    pub fn is_upper_bounded(&self) -> bool {
        matches!(self, RangeBound::Before(_) | RangeBound::AtOrBefore(_))
    }
}
