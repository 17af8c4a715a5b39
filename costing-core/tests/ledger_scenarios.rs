//! End-to-end costing scenarios against a RocksDB-backed ledger
//!
//! Every item starts from a purchase of 20 units for $400 on 2024-04-04.
//! Monetary values are compared at two decimal places.

use chrono::{TimeZone, Utc};
use costing_core::{
    Config, Direction, ErrorKind, InventoryLedger, ItemId, NewTransaction, Snapshot,
    TransactionChange, TransactionId,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

/// Create test ledger with temp directory
fn create_test_ledger() -> (InventoryLedger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    (InventoryLedger::open(config).unwrap(), temp_dir)
}

fn movement(item_id: ItemId, direction: Direction, quantity: u32, amount: i64, day: u32) -> NewTransaction {
    NewTransaction {
        item_id,
        direction,
        quantity,
        amount: Decimal::from(amount),
        effective_at: Utc.with_ymd_and_hms(2024, 4, day, 12, 0, 0).unwrap(),
    }
}

fn change(direction: Direction, quantity: u32, amount: i64) -> TransactionChange {
    TransactionChange {
        direction,
        quantity,
        amount: Decimal::from(amount),
    }
}

/// (stock, value, cost) with money rounded to cents
fn rounded(snapshot: &Snapshot) -> (u64, Decimal, Decimal) {
    (
        snapshot.total_stock,
        snapshot.total_value.round_dp(2),
        snapshot.cost_per_item.round_dp(2),
    )
}

fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

fn assert_chain(ledger: &InventoryLedger, item_id: ItemId, expected: &[(u64, i64, i64)]) {
    let actual: Vec<_> = ledger
        .ledger_entries(item_id)
        .unwrap()
        .iter()
        .map(rounded)
        .collect();
    let expected: Vec<_> = expected
        .iter()
        .map(|&(stock, value, cost)| (stock, cents(value), cents(cost)))
        .collect();
    assert_eq!(actual, expected);
}

/// First purchase on 04-04
fn first_purchase(ledger: &InventoryLedger, item_id: ItemId) -> TransactionId {
    ledger
        .create_transaction(movement(item_id, Direction::Purchase, 20, 400, 4))
        .unwrap()
        .transaction
        .id
}

/// Purchases on 04-04 and 04-06
fn two_purchases(ledger: &InventoryLedger, item_id: ItemId) -> Vec<TransactionId> {
    let first = first_purchase(ledger, item_id);
    let second = ledger
        .create_transaction(movement(item_id, Direction::Purchase, 20, 800, 6))
        .unwrap()
        .transaction
        .id;
    vec![first, second]
}

/// Purchase 04-04, sale 04-05 (inserted last), purchase 04-06, in chain order
fn purchase_sale_purchase(ledger: &InventoryLedger, item_id: ItemId) -> Vec<TransactionId> {
    let mut ids = two_purchases(ledger, item_id);
    let sale = ledger
        .create_transaction(movement(item_id, Direction::Sale, 10, 800, 5))
        .unwrap()
        .transaction
        .id;
    ids.insert(1, sale);
    ids
}

// Create

#[test]
fn test_first_purchase() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();

    first_purchase(&ledger, item_id);

    assert_chain(&ledger, item_id, &[(20, 40000, 2000)]);
}

#[test]
fn test_first_transaction_cannot_be_sale() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();

    let err = ledger
        .create_transaction(movement(item_id, Direction::Sale, 1, 10, 4))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FirstTransactionMustBePurchase);
    assert!(ledger.ledger_entries(item_id).unwrap().is_empty());
    assert_eq!(ledger.current_cost(item_id).unwrap_err().kind(), ErrorKind::NoStock);
}

#[test]
fn test_second_purchase() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();

    two_purchases(&ledger, item_id);

    assert_chain(&ledger, item_id, &[(20, 40000, 2000), (40, 120000, 3000)]);
    assert_eq!(ledger.current_cost(item_id).unwrap(), Decimal::from(30));
}

#[test]
fn test_insertion_order_does_not_matter() {
    let (ledger, _temp) = create_test_ledger();
    let forward = ItemId::generate();
    let backward = ItemId::generate();

    ledger
        .create_transaction(movement(forward, Direction::Purchase, 20, 400, 1))
        .unwrap();
    ledger
        .create_transaction(movement(forward, Direction::Purchase, 20, 800, 6))
        .unwrap();

    ledger
        .create_transaction(movement(backward, Direction::Purchase, 20, 800, 6))
        .unwrap();
    ledger
        .create_transaction(movement(backward, Direction::Purchase, 20, 400, 1))
        .unwrap();

    let expected = [(20, 40000, 2000), (40, 120000, 3000)];
    assert_chain(&ledger, forward, &expected);
    assert_chain(&ledger, backward, &expected);
}

#[test]
fn test_second_sale() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    first_purchase(&ledger, item_id);

    let record = ledger
        .create_transaction(movement(item_id, Direction::Sale, 10, 800, 6))
        .unwrap();

    assert_eq!(rounded(&record.snapshot), (10, cents(20000), cents(2000)));
    assert_chain(&ledger, item_id, &[(20, 40000, 2000), (10, 20000, 2000)]);
}

#[test]
fn test_sale_at_same_instant_follows_earlier_insert() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    ledger
        .create_transaction(movement(item_id, Direction::Purchase, 20, 400, 1))
        .unwrap();
    ledger
        .create_transaction(movement(item_id, Direction::Purchase, 20, 800, 6))
        .unwrap();

    // Ties with the 04-06 purchase and sorts after it
    let record = ledger
        .create_transaction(movement(item_id, Direction::Sale, 10, 0, 6))
        .unwrap();

    assert_eq!(rounded(&record.snapshot), (30, cents(90000), cents(3000)));
    assert_chain(
        &ledger,
        item_id,
        &[(20, 40000, 2000), (40, 120000, 3000), (30, 90000, 3000)],
    );
}

#[test]
fn test_sale_exceeding_stock_is_rejected() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    first_purchase(&ledger, item_id);

    let err = ledger
        .create_transaction(movement(item_id, Direction::Sale, 100, 800, 6))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientStock);
    assert_chain(&ledger, item_id, &[(20, 40000, 2000)]);
}

#[test]
fn test_sale_checks_stock_at_its_own_position() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    // 20 on hand on 04-04, 40 after 04-06
    two_purchases(&ledger, item_id);

    let err = ledger
        .create_transaction(movement(item_id, Direction::Sale, 30, 0, 5))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientStock);
    assert_chain(&ledger, item_id, &[(20, 40000, 2000), (40, 120000, 3000)]);
}

#[test]
fn test_earlier_purchase_cascades() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    first_purchase(&ledger, item_id);

    ledger
        .create_transaction(movement(item_id, Direction::Purchase, 20, 800, 2))
        .unwrap();

    assert_chain(&ledger, item_id, &[(20, 80000, 4000), (40, 120000, 3000)]);
}

#[test]
fn test_earlier_sale_cascades() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();

    purchase_sale_purchase(&ledger, item_id);

    assert_chain(
        &ledger,
        item_id,
        &[(20, 40000, 2000), (10, 20000, 2000), (30, 100000, 3333)],
    );
}

#[test]
fn test_sale_before_first_purchase_is_rejected() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    first_purchase(&ledger, item_id);

    let err = ledger
        .create_transaction(movement(item_id, Direction::Sale, 10, 800, 3))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FirstTransactionMustBePurchase);
    assert_chain(&ledger, item_id, &[(20, 40000, 2000)]);
}

#[test]
fn test_earlier_purchase_before_sell_out() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    first_purchase(&ledger, item_id);
    ledger
        .create_transaction(movement(item_id, Direction::Sale, 20, 0, 5))
        .unwrap();

    // A purchase before everything only adds stock, so this succeeds
    ledger
        .create_transaction(movement(item_id, Direction::Purchase, 5, 500, 1))
        .unwrap();

    assert_chain(
        &ledger,
        item_id,
        &[(5, 50000, 10000), (25, 90000, 3600), (5, 18000, 3600)],
    );
}

// Update

#[test]
fn test_update_purchase_cascades() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = two_purchases(&ledger, item_id);

    let record = ledger
        .update_transaction(ids[0], change(Direction::Purchase, 30, 700))
        .unwrap();

    assert_eq!(record.transaction.quantity, 30);
    assert_chain(&ledger, item_id, &[(30, 70000, 2333), (50, 150000, 3000)]);
}

#[test]
fn test_update_sale_cascades() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = purchase_sale_purchase(&ledger, item_id);

    ledger
        .update_transaction(ids[1], change(Direction::Sale, 15, 700))
        .unwrap();

    assert_chain(
        &ledger,
        item_id,
        &[(20, 40000, 2000), (5, 10000, 2000), (25, 90000, 3600)],
    );
}

#[test]
fn test_update_purchase_that_breaks_later_sale_is_rejected() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = purchase_sale_purchase(&ledger, item_id);
    let before = ledger.ledger_entries(item_id).unwrap();

    let err = ledger
        .update_transaction(ids[0], change(Direction::Purchase, 5, 50))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InconsistentLedger);
    assert_eq!(ledger.ledger_entries(item_id).unwrap(), before);
    assert_eq!(ledger.get_transaction(ids[0]).unwrap().transaction.quantity, 20);
}

#[test]
fn test_update_sale_exceeding_stock_is_rejected() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = purchase_sale_purchase(&ledger, item_id);
    let before = ledger.ledger_entries(item_id).unwrap();

    let err = ledger
        .update_transaction(ids[1], change(Direction::Sale, 30, 700))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InconsistentLedger);
    assert_eq!(ledger.ledger_entries(item_id).unwrap(), before);
}

#[test]
fn test_update_first_purchase_into_sale_is_rejected() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = two_purchases(&ledger, item_id);

    let err = ledger
        .update_transaction(ids[0], change(Direction::Sale, 1, 0))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FirstTransactionMustBePurchase);
    assert_chain(&ledger, item_id, &[(20, 40000, 2000), (40, 120000, 3000)]);
}

#[test]
fn test_update_keeps_position() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = two_purchases(&ledger, item_id);
    let original = ledger.get_transaction(ids[1]).unwrap();

    let updated = ledger
        .update_transaction(ids[1], change(Direction::Sale, 5, 0))
        .unwrap();

    assert_eq!(updated.transaction.position(), original.transaction.position());
    assert_eq!(updated.snapshot.id, original.snapshot.id);
    assert_eq!(updated.transaction.created_at, original.transaction.created_at);
    assert_chain(&ledger, item_id, &[(20, 40000, 2000), (15, 30000, 2000)]);
}

// Delete

#[test]
fn test_delete_purchase_cascades() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = two_purchases(&ledger, item_id);

    ledger.delete_transaction(ids[0]).unwrap();

    assert_chain(&ledger, item_id, &[(20, 80000, 4000)]);
}

#[test]
fn test_delete_sale_cascades() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = purchase_sale_purchase(&ledger, item_id);

    ledger.delete_transaction(ids[1]).unwrap();

    assert_chain(&ledger, item_id, &[(20, 40000, 2000), (40, 120000, 3000)]);
}

#[test]
fn test_delete_first_purchase_before_sale_is_rejected() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let ids = purchase_sale_purchase(&ledger, item_id);
    let before = ledger.ledger_entries(item_id).unwrap();

    let err = ledger.delete_transaction(ids[0]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InconsistentLedger);
    assert_eq!(ledger.ledger_entries(item_id).unwrap(), before);
    assert!(ledger.get_transaction(ids[0]).is_ok());
}

#[test]
fn test_delete_restores_chain_without_transaction() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();
    let reference = ItemId::generate();

    // Same history on both items, minus the 04-05 purchase on the reference
    for item in [item_id, reference] {
        first_purchase(&ledger, item);
        ledger
            .create_transaction(movement(item, Direction::Sale, 7, 0, 6))
            .unwrap();
        ledger
            .create_transaction(movement(item, Direction::Purchase, 3, 100, 7))
            .unwrap();
    }
    let extra = ledger
        .create_transaction(movement(item_id, Direction::Purchase, 9, 1234, 5))
        .unwrap();

    ledger.delete_transaction(extra.transaction.id).unwrap();

    let valuations = |item| -> Vec<_> {
        ledger
            .ledger_entries(item)
            .unwrap()
            .iter()
            .map(|s| (s.total_stock, s.total_value, s.cost_per_item))
            .collect()
    };
    assert_eq!(valuations(item_id), valuations(reference));
}

#[test]
fn test_get_unknown_transaction() {
    let (ledger, _temp) = create_test_ledger();

    let err = ledger.get_transaction(TransactionId::generate()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = ledger.delete_transaction(TransactionId::generate()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_rejections_are_counted() {
    let (ledger, _temp) = create_test_ledger();
    let item_id = ItemId::generate();

    let _ = ledger.create_transaction(movement(item_id, Direction::Sale, 1, 0, 4));
    first_purchase(&ledger, item_id);
    let _ = ledger.create_transaction(movement(item_id, Direction::Sale, 21, 0, 5));

    let metrics = ledger.metrics();
    assert_eq!(metrics.rejections(ErrorKind::FirstTransactionMustBePurchase), 1);
    assert_eq!(metrics.rejections(ErrorKind::InsufficientStock), 1);
    assert_eq!(metrics.created_total.get(), 1);
}

// Concurrency

#[test]
fn test_concurrent_sales_never_oversell() {
    let (ledger, _temp) = create_test_ledger();
    let ledger = Arc::new(ledger);
    let item_id = ItemId::generate();
    first_purchase(&ledger, item_id);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let accepted = runtime.block_on(async {
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                tokio::task::spawn_blocking(move || {
                    ledger
                        .create_transaction(movement(item_id, Direction::Sale, 3, 0, 5 + i % 3))
                        .is_ok()
                })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        accepted
    });

    // 20 units cover six sales of 3
    assert_eq!(accepted, 6);
    let entries = ledger.ledger_entries(item_id).unwrap();
    assert_eq!(entries.len(), 7);
    assert_eq!(entries.last().unwrap().total_stock, 2);
    assert!(ledger.verify_item(item_id).unwrap().is_consistent());
}

#[test]
fn test_items_are_independent() {
    let (ledger, _temp) = create_test_ledger();
    let a = ItemId::generate();
    let b = ItemId::generate();

    first_purchase(&ledger, a);
    ledger
        .create_transaction(movement(b, Direction::Purchase, 4, 100, 1))
        .unwrap();

    assert_eq!(ledger.current_cost(a).unwrap(), Decimal::from(20));
    assert_eq!(ledger.current_cost(b).unwrap(), Decimal::from(25));
    assert_eq!(ledger.verify_all().unwrap().len(), 2);
}
