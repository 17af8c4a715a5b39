//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `transactions` - Transaction rows (key: transaction_id)
//! - `snapshots` - Ledger entries (key: snapshot_id)
//! - `indices` - Secondary indices:
//!   - `o` || item_id || time || sequence -> snapshot_id (chain order)
//!   - `t` || transaction_id -> snapshot_id
//!
//! Rows are never removed. Deleting sets `deleted_at`, and every lookup and
//! range scan below skips tombstoned rows.

use crate::{
    cascade::ChainLink,
    error::{Error, Result},
    ordering::{LedgerPosition, RangeBound},
    types::{ItemId, Snapshot, SnapshotId, Transaction, TransactionId},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction as ScanDirection,
    IteratorMode, Options, WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_TRANSACTIONS: &str = "transactions";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_INDICES: &str = "indices";

/// Index key tags
const IDX_CHAIN_ORDER: u8 = b'o';
const IDX_TRANSACTION_SNAPSHOT: u8 = b't';

/// tag + item_id + seconds + nanos + sequence
const CHAIN_KEY_LEN: usize = 1 + 16 + 8 + 4 + 8;
const CHAIN_PREFIX_LEN: usize = 1 + 16;

/// Flips the sign bit so negative timestamps sort before positive ones
const SIGN_FLIP: u64 = 1 << 63;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Cascades rewrite snapshot rows in place, level compaction keeps overwrites cheap
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_transactions()),
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options_snapshots()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB ledger store");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_transactions() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_snapshots() -> Options {
        let mut opts = Options::default();
        // Snapshots are read on every mutation, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Point lookups

    /// Get a live transaction by ID
    pub fn get_transaction(&self, transaction_id: TransactionId) -> Result<Option<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;

        let Some(value) = self.db.get_cf(cf, transaction_id.as_bytes())? else {
            return Ok(None);
        };

        let transaction: Transaction = bincode::deserialize(&value)?;
        Ok((!transaction.is_deleted()).then_some(transaction))
    }

    /// Get a live snapshot by ID
    pub fn get_snapshot(&self, snapshot_id: SnapshotId) -> Result<Option<Snapshot>> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;

        let Some(value) = self.db.get_cf(cf, snapshot_id.as_bytes())? else {
            return Ok(None);
        };

        let snapshot: Snapshot = bincode::deserialize(&value)?;
        Ok((!snapshot.is_deleted()).then_some(snapshot))
    }

    /// Get the live snapshot owned by a transaction
    pub fn snapshot_for_transaction(&self, transaction_id: TransactionId) -> Result<Option<Snapshot>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let key = Self::index_key_transaction_snapshot(transaction_id);

        match self.db.get_cf(cf, &key)? {
            Some(value) => self.get_snapshot(Self::decode_snapshot_id(&value)?),
            None => Ok(None),
        }
    }

    // Chain queries

    /// Live snapshots of an item inside `bound`, in chain order
    pub fn snapshots_in_range(
        &self,
        item_id: ItemId,
        bound: RangeBound,
        exclude: Option<SnapshotId>,
    ) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        self.walk_chain(item_id, bound, exclude, false, |snapshot| {
            snapshots.push(snapshot);
            true
        })?;
        Ok(snapshots)
    }

    /// Latest live snapshot of an item inside `bound`
    pub fn latest_snapshot(
        &self,
        item_id: ItemId,
        bound: RangeBound,
        exclude: Option<SnapshotId>,
    ) -> Result<Option<Snapshot>> {
        let mut latest = None;
        self.walk_chain(item_id, bound, exclude, true, |snapshot| {
            latest = Some(snapshot);
            false
        })?;
        Ok(latest)
    }

    /// Live snapshots inside `bound` paired with their transactions
    pub fn chain_links(
        &self,
        item_id: ItemId,
        bound: RangeBound,
        exclude: Option<SnapshotId>,
    ) -> Result<Vec<ChainLink>> {
        self.snapshots_in_range(item_id, bound, exclude)?
            .into_iter()
            .map(|snapshot| {
                let transaction = self.get_transaction(snapshot.transaction_id)?.ok_or_else(|| {
                    Error::Storage(format!(
                        "Snapshot {} references missing transaction {}",
                        snapshot.id, snapshot.transaction_id
                    ))
                })?;
                Ok(ChainLink {
                    snapshot,
                    transaction,
                })
            })
            .collect()
    }

    /// Walk the chain-order index for one item, newest first when `reverse`.
    ///
    /// `visit` returns false to stop early. Tombstoned and excluded entries
    /// are never passed to it.
    fn walk_chain<F>(
        &self,
        item_id: ItemId,
        bound: RangeBound,
        exclude: Option<SnapshotId>,
        reverse: bool,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(Snapshot) -> bool,
    {
        let cf = self.cf_handle(CF_INDICES)?;
        let prefix = Self::chain_prefix(item_id);

        // Seek to the anchor only when it is the near end of the range in scan direction
        let start = match bound.anchor() {
            Some(anchor) if reverse == bound.is_upper_bounded() => {
                Self::index_key_chain(item_id, &anchor)
            }
            _ if reverse => Self::chain_upper_key(item_id),
            _ => prefix.to_vec(),
        };
        let direction = if reverse {
            ScanDirection::Reverse
        } else {
            ScanDirection::Forward
        };

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start.as_slice(), direction));

        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }

            let position = Self::decode_chain_position(&key)?;
            if !bound.admits(&position) {
                // Past the far end of the range in scan direction
                if reverse != bound.is_upper_bounded() {
                    break;
                }
                continue;
            }

            let snapshot_id = Self::decode_snapshot_id(&value)?;
            if exclude == Some(snapshot_id) {
                continue;
            }

            let Some(snapshot) = self.get_snapshot(snapshot_id)? else {
                continue;
            };

            if !visit(snapshot) {
                break;
            }
        }

        Ok(())
    }

    /// Items that have at least one chain entry (live or tombstoned)
    pub fn item_ids(&self) -> Result<Vec<ItemId>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&[IDX_CHAIN_ORDER][..], ScanDirection::Forward));

        let mut items: Vec<ItemId> = Vec::new();
        for entry in iter {
            let (key, _) = entry?;
            if key.first() != Some(&IDX_CHAIN_ORDER) {
                break;
            }
            let item_id = Self::decode_chain_item(&key)?;
            if items.last() != Some(&item_id) {
                items.push(item_id);
            }
        }

        Ok(items)
    }

    /// Highest insertion sequence ever handed out
    pub fn max_sequence(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;

        let mut max = 0u64;
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = entry?;
            let transaction: Transaction = bincode::deserialize(&value)?;
            max = max.max(transaction.sequence);
        }

        Ok(max)
    }

    // Batch operations (atomic)

    /// Write every row in the batch in a single atomic RocksDB write
    pub fn commit(&self, batch: &LedgerBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut write = WriteBatch::default();

        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let cf_snapshots = self.cf_handle(CF_SNAPSHOTS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;

        for transaction in &batch.transactions {
            write.put_cf(
                cf_transactions,
                transaction.id.as_bytes(),
                bincode::serialize(transaction)?,
            );
        }

        for snapshot in &batch.snapshots {
            write.put_cf(cf_snapshots, snapshot.id.as_bytes(), bincode::serialize(snapshot)?);

            // Index entries are derived from immutable fields, re-putting them is a no-op
            write.put_cf(
                cf_indices,
                Self::index_key_chain(snapshot.item_id, &snapshot.position()),
                snapshot.id.as_bytes(),
            );
            write.put_cf(
                cf_indices,
                Self::index_key_transaction_snapshot(snapshot.transaction_id),
                snapshot.id.as_bytes(),
            );
        }

        self.db.write(write)?;

        tracing::debug!(
            rows = batch.len(),
            transactions = batch.transactions.len(),
            snapshots = batch.snapshots.len(),
            "Ledger batch committed"
        );

        Ok(())
    }

    // Index key helpers

    fn chain_prefix(item_id: ItemId) -> [u8; CHAIN_PREFIX_LEN] {
        let mut prefix = [0u8; CHAIN_PREFIX_LEN];
        prefix[0] = IDX_CHAIN_ORDER;
        prefix[1..].copy_from_slice(item_id.as_bytes());
        prefix
    }

    fn chain_upper_key(item_id: ItemId) -> Vec<u8> {
        let mut key = Self::chain_prefix(item_id).to_vec();
        key.resize(CHAIN_KEY_LEN, 0xFF);
        key
    }

    fn index_key_chain(item_id: ItemId, position: &LedgerPosition) -> Vec<u8> {
        let seconds = (position.effective_at.timestamp() as u64) ^ SIGN_FLIP;

        let mut key = Vec::with_capacity(CHAIN_KEY_LEN);
        key.extend_from_slice(&Self::chain_prefix(item_id));
        key.extend_from_slice(&seconds.to_be_bytes());
        key.extend_from_slice(&position.effective_at.timestamp_subsec_nanos().to_be_bytes());
        key.extend_from_slice(&position.sequence.to_be_bytes());
        key
    }

    fn index_key_transaction_snapshot(transaction_id: TransactionId) -> Vec<u8> {
        let mut key = vec![IDX_TRANSACTION_SNAPSHOT];
        key.extend_from_slice(transaction_id.as_bytes());
        key
    }

    fn decode_chain_item(key: &[u8]) -> Result<ItemId> {
        let bytes: [u8; 16] = key
            .get(1..CHAIN_PREFIX_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Storage("Malformed chain index key".to_string()))?;
        Ok(ItemId::from_uuid(Uuid::from_bytes(bytes)))
    }

    fn decode_chain_position(key: &[u8]) -> Result<LedgerPosition> {
        if key.len() != CHAIN_KEY_LEN {
            return Err(Error::Storage(format!(
                "Malformed chain index key of {} bytes",
                key.len()
            )));
        }

        let field = |range: std::ops::Range<usize>| -> [u8; 8] {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[range]);
            buf
        };

        let seconds = (u64::from_be_bytes(field(17..25)) ^ SIGN_FLIP) as i64;
        let mut nanos = [0u8; 4];
        nanos.copy_from_slice(&key[25..29]);
        let sequence = u64::from_be_bytes(field(29..37));

        let effective_at: DateTime<Utc> =
            DateTime::from_timestamp(seconds, u32::from_be_bytes(nanos))
                .ok_or_else(|| Error::Storage("Chain index key holds invalid time".to_string()))?;

        Ok(LedgerPosition::new(effective_at, sequence))
    }

    fn decode_snapshot_id(value: &[u8]) -> Result<SnapshotId> {
        let bytes: [u8; 16] = value
            .try_into()
            .map_err(|_| Error::Storage("Malformed snapshot reference".to_string()))?;
        Ok(SnapshotId::from_uuid(Uuid::from_bytes(bytes)))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let cf_snapshots = self.cf_handle(CF_SNAPSHOTS)?;

        Ok(StorageStats {
            total_transactions: self.approximate_count(cf_transactions)?,
            total_snapshots: self.approximate_count(cf_snapshots)?,
            total_items: self.item_ids()?.len() as u64,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

/// Rows to write together
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    /// Transaction rows (new, updated or tombstoned)
    pub transactions: Vec<Transaction>,
    /// Snapshot rows (new, recomputed or tombstoned)
    pub snapshots: Vec<Snapshot>,
}

impl LedgerBatch {
    /// Queue a transaction row
    pub fn put_transaction(&mut self, transaction: Transaction) -> &mut Self {
        self.transactions.push(transaction);
        self
    }

    /// Queue a snapshot row
    pub fn put_snapshot(&mut self, snapshot: Snapshot) -> &mut Self {
        self.snapshots.push(snapshot);
        self
    }

    /// Queue recomputed snapshots
    pub fn put_snapshots(&mut self, snapshots: impl IntoIterator<Item = Snapshot>) -> &mut Self {
        self.snapshots.extend(snapshots);
        self
    }

    /// Number of rows queued
    pub fn len(&self) -> usize {
        self.transactions.len() + self.snapshots.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Transaction rows, tombstones included (estimate)
    pub total_transactions: u64,
    /// Snapshot rows, tombstones included (estimate)
    pub total_snapshots: u64,
    /// Items with at least one chain entry
    pub total_items: u64,
}
