//! Weighted-average ledger fold
//!
//! `Valuation::apply` maps (previous valuation, transaction) to the next
//! valuation. It is the only place the costing formulas live; creation,
//! updates and cascades all go through it.
//!
//! - Purchase: stock += qty, value += amount, cost = value / stock
//! - Sale: stock -= qty, value -= cost × qty, cost carried over

use crate::error::ValuationError;
use crate::types::{Direction, Snapshot, Transaction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Running stock, value and unit cost of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valuation {
    /// Units on hand
    pub total_stock: u64,
    /// Book value of the units on hand
    pub total_value: Decimal,
    /// Unit cost, undefined before the first purchase
    pub cost_per_item: Option<Decimal>,
}

impl Valuation {
    /// Baseline used when no earlier snapshot exists
    pub const ZERO: Valuation = Valuation {
        total_stock: 0,
        total_value: Decimal::ZERO,
        cost_per_item: None,
    };

    /// Valuation recorded by a snapshot
    pub fn of(snapshot: &Snapshot) -> Self {
        Self {
            total_stock: snapshot.total_stock,
            total_value: snapshot.total_value,
            cost_per_item: Some(snapshot.cost_per_item),
        }
    }

    /// Valuation of an optional baseline snapshot
    pub fn baseline(snapshot: Option<&Snapshot>) -> Self {
        snapshot.map(Self::of).unwrap_or(Self::ZERO)
    }

    /// Fold one movement into this valuation
    pub fn apply(
        &self,
        direction: Direction,
        quantity: u32,
        amount: Decimal,
    ) -> Result<Valuation, ValuationError> {
        match direction {
            Direction::Purchase => self.purchase(quantity, amount),
            Direction::Sale => self.sale(quantity),
        }
    }

    /// Fold a stored transaction into this valuation
    pub fn apply_transaction(&self, transaction: &Transaction) -> Result<Valuation, ValuationError> {
        self.apply(transaction.direction, transaction.quantity, transaction.amount)
    }

    fn purchase(&self, quantity: u32, amount: Decimal) -> Result<Valuation, ValuationError> {
        let total_stock = self
            .total_stock
            .checked_add(u64::from(quantity))
            .ok_or(ValuationError::Overflow("stock"))?;
        let total_value = self
            .total_value
            .checked_add(amount)
            .ok_or(ValuationError::Overflow("value"))?;

        if total_value < Decimal::ZERO {
            return Err(ValuationError::NegativeLedgerState {
                stock: i128::from(total_stock),
                value: total_value,
            });
        }

        let cost_per_item = if total_stock == 0 {
            self.cost_per_item
        } else {
            Some(
                total_value
                    .checked_div(Decimal::from(total_stock))
                    .ok_or(ValuationError::Overflow("cost"))?,
            )
        };

        Ok(Valuation {
            total_stock,
            total_value,
            cost_per_item,
        })
    }

    fn sale(&self, quantity: u32) -> Result<Valuation, ValuationError> {
        let remaining = i128::from(self.total_stock) - i128::from(quantity);
        if remaining < 0 {
            return Err(ValuationError::NegativeLedgerState {
                stock: remaining,
                value: self.total_value,
            });
        }

        let cost = self.cost_per_item.unwrap_or(Decimal::ZERO);
        let outflow = cost
            .checked_mul(Decimal::from(quantity))
            .ok_or(ValuationError::Overflow("value"))?;

        // Selling out leaves nothing on the books, whatever the rounding of the carried cost.
        let total_value = if remaining == 0 {
            Decimal::ZERO
        } else {
            self.total_value
                .checked_sub(outflow)
                .ok_or(ValuationError::Overflow("value"))?
        };

        if total_value < Decimal::ZERO {
            return Err(ValuationError::NegativeLedgerState {
                stock: remaining,
                value: total_value,
            });
        }

        Ok(Valuation {
            total_stock: self.total_stock - u64::from(quantity),
            total_value,
            cost_per_item: self.cost_per_item,
        })
    }

    /// Write this valuation into a snapshot
    pub fn stamp(&self, snapshot: &mut Snapshot, now: DateTime<Utc>) {
        snapshot.total_stock = self.total_stock;
        snapshot.total_value = self.total_value;
        // A folded valuation always has a cost; only the zero baseline lacks one.
        snapshot.cost_per_item = self.cost_per_item.unwrap_or(Decimal::ZERO);
        snapshot.updated_at = now;
    }

    /// Whether a snapshot records exactly this valuation
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.total_stock == snapshot.total_stock
            && self.total_value == snapshot.total_value
            && self.cost_per_item.unwrap_or(Decimal::ZERO) == snapshot.cost_per_item
    }
}
