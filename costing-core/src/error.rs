//! Error types for the costing ledger

use crate::ordering::LedgerPosition;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Referenced transaction (or its snapshot) is absent or tombstoned
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input rejected before any mutation
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// A sale would drive stock negative at its own chronological position
    #[error("Insufficient stock at {position}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Position the sale would occupy
        position: LedgerPosition,
        /// Quantity the sale asks for
        requested: u32,
        /// Stock held by the nearest preceding snapshot
        available: u64,
    },

    /// The earliest transaction of an item cannot be a sale
    #[error("First transaction for an item must be a purchase (at {0})")]
    FirstTransactionMustBePurchase(LedgerPosition),

    /// Recomputation produced a negative stock or value somewhere
    #[error("Inconsistent ledger: {0}")]
    InconsistentLedger(String),

    /// Item has no ledger entries yet
    #[error("No stock recorded for item {0}")]
    NoStock(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Machine-checkable failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::ValidationFailed`]
    ValidationFailed,
    /// See [`Error::InsufficientStock`]
    InsufficientStock,
    /// See [`Error::FirstTransactionMustBePurchase`]
    FirstTransactionMustBePurchase,
    /// See [`Error::InconsistentLedger`]
    InconsistentLedger,
    /// See [`Error::NoStock`]
    NoStock,
    /// Persistence failure of any kind (storage, serialization, IO)
    StorageFailure,
    /// See [`Error::Config`]
    Config,
}

impl ErrorKind {
    /// Stable label, used as the metrics label value
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::FirstTransactionMustBePurchase => "first_transaction_must_be_purchase",
            ErrorKind::InconsistentLedger => "inconsistent_ledger",
            ErrorKind::NoStock => "no_stock",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Error::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Error::FirstTransactionMustBePurchase(_) => ErrorKind::FirstTransactionMustBePurchase,
            Error::InconsistentLedger(_) => ErrorKind::InconsistentLedger,
            Error::NoStock(_) => ErrorKind::NoStock,
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) => ErrorKind::StorageFailure,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Failure of a single fold step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValuationError {
    /// Resulting stock or value would be below zero
    #[error("negative ledger state: stock {stock}, value {value}")]
    NegativeLedgerState {
        /// Stock the step would produce
        stock: i128,
        /// Value the step would produce
        value: Decimal,
    },

    /// Stock or value left the representable range
    #[error("arithmetic overflow while folding {0}")]
    Overflow(&'static str),
}
