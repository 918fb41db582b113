use std::{
    collections::HashSet,
    sync::{Arc, OnceLock},
    thread,
    time::Duration,
};

use rand::{distributions::Alphanumeric, seq::SliceRandom, Rng};
use tempfile::TempDir;

use simplebank::postgres_storage::PostgresStorage;
use simplebank::sqlite_storage::SqliteStorage;
use simplebank::storage::{Database, InMemoryStorage, StoreError};
use simplebank::{TransferManager, TransferOptions};
use simplebank_core::{
    Account, AdjustAccountBalanceParams, Context, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, ListParams, TransferTxParams, UpdateAccountParams, UpdateEntryParams,
    UpdateTransferParams,
};

fn random_owner() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

fn random_currency() -> String {
    ["USD", "EUR", "CAD"]
        .choose(&mut rand::thread_rng())
        .map(|c| c.to_string())
        .unwrap_or_default()
}

fn create_account<D: Database>(manager: &TransferManager<D>, balance: i64) -> Account {
    let params = CreateAccountParams {
        owner: random_owner(),
        balance,
        currency: random_currency(),
    };
    let account = manager
        .create_account(&Context::background(), &params)
        .expect("Failed to create account");
    assert_eq!(account.owner, params.owner);
    assert_eq!(account.balance, params.balance);
    assert_eq!(account.currency, params.currency);
    assert!(account.id > 0);
    account
}

// Property checks shared by every backend.

fn check_concurrent_transfers<D: Database + 'static>(manager: Arc<TransferManager<D>>) {
    let account1 = create_account(&manager, 100);
    let account2 = create_account(&manager, 50);

    let n = 5;
    let amount = 10;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let manager = manager.clone();
            let (from, to) = (account1.id, account2.id);
            thread::spawn(move || {
                manager.transfer_tx(&Context::background(), TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount,
                })
            })
        })
        .collect();

    let mut existed = HashSet::new();
    for handle in handles {
        let result = handle.join().expect("transfer thread panicked").expect("transfer failed");

        let transfer = &result.transfer;
        assert_eq!(transfer.from_account_id, account1.id);
        assert_eq!(transfer.to_account_id, account2.id);
        assert_eq!(transfer.amount, amount);
        assert!(transfer.id > 0);
        let fetched = manager.get_transfer(&Context::background(), transfer.id).unwrap();
        assert_eq!(&fetched, transfer);

        assert_eq!(result.from_entry.account_id, account1.id);
        assert_eq!(result.from_entry.amount, -amount);
        assert_eq!(result.to_entry.account_id, account2.id);
        assert_eq!(result.to_entry.amount, amount);
        assert_eq!(result.from_entry.amount, -result.to_entry.amount);
        manager.get_entry(&Context::background(), result.from_entry.id).unwrap();
        manager.get_entry(&Context::background(), result.to_entry.id).unwrap();

        assert_eq!(result.from_account.id, account1.id);
        assert_eq!(result.to_account.id, account2.id);

        let diff1 = account1.balance - result.from_account.balance;
        let diff2 = result.to_account.balance - account2.balance;
        assert_eq!(diff1, diff2);
        assert!(diff1 > 0);
        assert_eq!(diff1 % amount, 0);

        let k = diff1 / amount;
        assert!((1..=n).contains(&k), "round {} out of range", k);
        assert!(existed.insert(k), "round {} observed twice", k);
    }

    let updated1 = manager.get_account(&Context::background(), account1.id).unwrap();
    let updated2 = manager.get_account(&Context::background(), account2.id).unwrap();
    assert_eq!(updated1.balance, 50);
    assert_eq!(updated2.balance, 100);
}

fn check_mixed_direction_transfers<D: Database + 'static>(manager: Arc<TransferManager<D>>) {
    let account1 = create_account(&manager, 1000);
    let account2 = create_account(&manager, 1000);

    let n = 10;
    let amount = 10;

    let handles: Vec<_> = (0..n)
        .map(|i| {
            let manager = manager.clone();
            let (from, to) = if i % 2 == 0 {
                (account2.id, account1.id)
            } else {
                (account1.id, account2.id)
            };
            thread::spawn(move || {
                manager.transfer_tx(&Context::background(), TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount,
                })
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("transfer thread panicked").expect("transfer failed");
    }

    let updated1 = manager.get_account(&Context::background(), account1.id).unwrap();
    let updated2 = manager.get_account(&Context::background(), account2.id).unwrap();
    assert_eq!(updated1.balance, account1.balance);
    assert_eq!(updated2.balance, account2.balance);
}

fn check_partial_failure_rolls_back<D: Database>(manager: &TransferManager<D>) {
    let account1 = create_account(manager, 100);
    let account2 = create_account(manager, 100);

    let mut transfer_id = None;
    let mut entry_id = None;
    let err = manager
        .executor()
        .run_in_transaction(&Context::background(), |q| {
            let transfer = q.create_transfer(&CreateTransferParams {
                from_account_id: account1.id,
                to_account_id: account2.id,
                amount: 30,
            })?;
            transfer_id = Some(transfer.id);
            let entry = q.create_entry(&CreateEntryParams { account_id: account1.id, amount: -30 })?;
            entry_id = Some(entry.id);
            q.adjust_account_balance(&AdjustAccountBalanceParams { id: account1.id, amount: -30 })?;
            Err::<(), _>(StoreError::Other("simulated failure".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::Other(ref msg) if msg == "simulated failure"));

    let ctx = Context::background();
    let transfer_id = transfer_id.expect("transfer was created");
    let entry_id = entry_id.expect("entry was created");
    assert!(matches!(manager.get_transfer(&ctx, transfer_id), Err(StoreError::TransferNotFound(_))));
    assert!(matches!(manager.get_entry(&ctx, entry_id), Err(StoreError::EntryNotFound(_))));
    assert_eq!(manager.get_account(&ctx, account1.id).unwrap(), account1);
    assert_eq!(manager.get_account(&ctx, account2.id).unwrap(), account2);
}

fn check_missing_account_aborts_transfer<D: Database>(manager: &TransferManager<D>, isolated: bool) {
    let ctx = Context::background();
    let account = create_account(manager, 100);
    let before = manager.list_transfers(&ctx, &ListParams::new(1000, 0)).unwrap().len();

    let err = manager
        .transfer_tx(&ctx, TransferTxParams {
            from_account_id: account.id,
            to_account_id: i64::MAX,
            amount: 10,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::ConstraintViolation(_)), "unexpected error: {:?}", err);

    assert_eq!(manager.get_account(&ctx, account.id).unwrap().balance, 100);
    if isolated {
        let after = manager.list_transfers(&ctx, &ListParams::new(1000, 0)).unwrap().len();
        assert_eq!(before, after);
        assert!(manager.list_entries(&ctx, &ListParams::new(1000, 0)).unwrap().is_empty());
    }
}

fn check_overdraft_guard<D: Database>(db: Arc<D>, isolated: bool) {
    let manager = TransferManager::with_options(db, TransferOptions { allow_overdraft: false });
    let ctx = Context::background();
    let poor = create_account(&manager, 5);
    let rich = create_account(&manager, 500);

    let err = manager
        .transfer_tx(&ctx, TransferTxParams {
            from_account_id: poor.id,
            to_account_id: rich.id,
            amount: 10,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::InsufficientFunds { account_id, balance: -5 } if account_id == poor.id));
    assert_eq!(manager.get_account(&ctx, poor.id).unwrap().balance, 5);
    assert_eq!(manager.get_account(&ctx, rich.id).unwrap().balance, 500);
    if isolated {
        assert!(manager.list_transfers(&ctx, &ListParams::new(1000, 0)).unwrap().is_empty());
        assert!(manager.list_entries(&ctx, &ListParams::new(1000, 0)).unwrap().is_empty());
    }

    let ok = manager
        .transfer_tx(&ctx, TransferTxParams {
            from_account_id: rich.id,
            to_account_id: poor.id,
            amount: 500,
        })
        .unwrap();
    assert_eq!(ok.from_account.balance, 0);
    assert_eq!(ok.to_account.balance, 505);
}

fn check_overdraft_allowed_by_default<D: Database>(manager: &TransferManager<D>) {
    let ctx = Context::background();
    let from = create_account(manager, 0);
    let to = create_account(manager, 0);
    let result = manager
        .transfer_tx(&ctx, TransferTxParams {
            from_account_id: from.id,
            to_account_id: to.id,
            amount: 25,
        })
        .unwrap();
    assert_eq!(result.from_account.balance, -25);
    assert_eq!(result.to_account.balance, 25);
}

fn check_cancelled_transfer<D: Database>(manager: &TransferManager<D>) {
    let account1 = create_account(manager, 100);
    let account2 = create_account(manager, 100);

    let ctx = Context::with_timeout(Duration::from_secs(30));
    ctx.cancel();
    let err = manager
        .transfer_tx(&ctx, TransferTxParams {
            from_account_id: account1.id,
            to_account_id: account2.id,
            amount: 10,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::Cancelled));

    let ctx = Context::background();
    assert_eq!(manager.get_account(&ctx, account1.id).unwrap().balance, 100);
    assert_eq!(manager.get_account(&ctx, account2.id).unwrap().balance, 100);
}

fn check_reverse_order_transfer<D: Database>(manager: &TransferManager<D>) {
    let ctx = Context::background();
    let low = create_account(manager, 10);
    let high = create_account(manager, 10);
    assert!(low.id < high.id);

    let result = manager
        .transfer_tx(&ctx, TransferTxParams {
            from_account_id: high.id,
            to_account_id: low.id,
            amount: 7,
        })
        .unwrap();
    assert_eq!(result.from_account.id, high.id);
    assert_eq!(result.from_account.balance, 3);
    assert_eq!(result.to_account.id, low.id);
    assert_eq!(result.to_account.balance, 17);
    assert_eq!(result.from_entry.account_id, high.id);
    assert_eq!(result.from_entry.amount, -7);
    assert_eq!(result.to_entry.amount, 7);
}

fn check_record_crud<D: Database>(manager: &TransferManager<D>) {
    let ctx = Context::background();
    let account1 = create_account(manager, 100);
    let account2 = create_account(manager, 100);

    let fetched = manager.get_account(&ctx, account1.id).unwrap();
    assert_eq!(fetched, account1);

    let updated = manager
        .update_account(&ctx, &UpdateAccountParams { id: account1.id, balance: 321 })
        .unwrap();
    assert_eq!(updated.id, account1.id);
    assert_eq!(updated.owner, account1.owner);
    assert_eq!(updated.balance, 321);
    assert_eq!(updated.created_at, account1.created_at);
    assert_ne!(updated.updated_at, account1.updated_at);

    let (entry, transfer) = manager
        .executor()
        .run_in_transaction(&ctx, |q| {
            let entry = q.create_entry(&CreateEntryParams { account_id: account1.id, amount: 12 })?;
            let entry = q.update_entry(&UpdateEntryParams { id: entry.id, amount: 13 })?;
            let transfer = q.create_transfer(&CreateTransferParams {
                from_account_id: account1.id,
                to_account_id: account2.id,
                amount: 40,
            })?;
            let transfer = q.update_transfer(&UpdateTransferParams { id: transfer.id, amount: 41 })?;
            Ok((entry, transfer))
        })
        .unwrap();
    assert_eq!(manager.get_entry(&ctx, entry.id).unwrap().amount, 13);
    assert_eq!(manager.get_transfer(&ctx, transfer.id).unwrap().amount, 41);

    assert!(matches!(manager.delete_account(&ctx, account1.id), Err(StoreError::ConstraintViolation(_))));

    manager
        .executor()
        .run_in_transaction(&ctx, |q| {
            q.delete_entry(entry.id)?;
            q.delete_transfer(transfer.id)
        })
        .unwrap();
    assert!(matches!(manager.get_entry(&ctx, entry.id), Err(StoreError::EntryNotFound(_))));
    assert!(matches!(manager.get_transfer(&ctx, transfer.id), Err(StoreError::TransferNotFound(_))));

    manager.delete_account(&ctx, account2.id).unwrap();
    assert!(matches!(manager.get_account(&ctx, account2.id), Err(StoreError::AccountNotFound(_))));
    assert!(matches!(manager.delete_account(&ctx, account2.id), Err(StoreError::AccountNotFound(_))));
    assert!(matches!(
        manager.update_account(&ctx, &UpdateAccountParams { id: account2.id, balance: 1 }),
        Err(StoreError::AccountNotFound(_))
    ));
}

fn check_list_pages<D: Database>(manager: &TransferManager<D>) {
    let ctx = Context::background();
    for _ in 0..10 {
        create_account(manager, 0);
    }
    let accounts = manager.list_accounts(&ctx, &ListParams::new(5, 5)).unwrap();
    assert_eq!(accounts.len(), 5);
    assert!(accounts.windows(2).all(|w| w[0].id < w[1].id));
}

// In-memory backend

fn memory() -> Arc<TransferManager<InMemoryStorage>> {
    Arc::new(TransferManager::new(Arc::new(InMemoryStorage::new())))
}

#[test]
fn memory_concurrent_transfers() {
    check_concurrent_transfers(memory());
}

#[test]
fn memory_mixed_direction_transfers() {
    check_mixed_direction_transfers(memory());
}

#[test]
fn memory_partial_failure_rolls_back() {
    check_partial_failure_rolls_back(&memory());
}

#[test]
fn memory_missing_account_aborts_transfer() {
    check_missing_account_aborts_transfer(&memory(), true);
}

#[test]
fn memory_overdraft_guard() {
    check_overdraft_guard(Arc::new(InMemoryStorage::new()), true);
}

#[test]
fn memory_overdraft_allowed_by_default() {
    check_overdraft_allowed_by_default(&memory());
}

#[test]
fn memory_cancelled_transfer() {
    check_cancelled_transfer(&memory());
}

#[test]
fn memory_reverse_order_transfer() {
    check_reverse_order_transfer(&memory());
}

#[test]
fn memory_record_crud() {
    check_record_crud(&memory());
}

#[test]
fn memory_list_pages() {
    check_list_pages(&memory());
}

#[test]
fn memory_many_mixed_transfers_never_hit_lock_timeout() {
    // A short lock timeout turns any circular wait into an error.
    let db = Arc::new(InMemoryStorage::with_lock_timeout(Duration::from_millis(500)));
    let manager = Arc::new(TransferManager::new(db));
    let accounts: Vec<Account> = (0..3).map(|_| create_account(&manager, 10_000)).collect();

    let handles: Vec<_> = (0..30)
        .map(|i| {
            let manager = manager.clone();
            let from = accounts[i % 3].id;
            let to = accounts[(i + 1 + i / 3 % 2) % 3].id;
            thread::spawn(move || {
                manager.transfer_tx(&Context::background(), TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount: 1,
                })
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().expect("transfer failed");
    }

    let ctx = Context::background();
    let total: i64 = accounts
        .iter()
        .map(|a| manager.get_account(&ctx, a.id).unwrap().balance)
        .sum();
    assert_eq!(total, 30_000);
}

// SQLite backend

fn sqlite() -> (Arc<TransferManager<SqliteStorage>>, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("simplebank.db");
    let db = SqliteStorage::new(path.to_str().unwrap()).expect("Failed to open SQLite");
    (Arc::new(TransferManager::new(Arc::new(db))), dir)
}

#[test]
fn sqlite_concurrent_transfers() {
    let (manager, _dir) = sqlite();
    check_concurrent_transfers(manager);
}

#[test]
fn sqlite_mixed_direction_transfers() {
    let (manager, _dir) = sqlite();
    check_mixed_direction_transfers(manager);
}

#[test]
fn sqlite_partial_failure_rolls_back() {
    let (manager, _dir) = sqlite();
    check_partial_failure_rolls_back(&manager);
}

#[test]
fn sqlite_missing_account_aborts_transfer() {
    let (manager, _dir) = sqlite();
    check_missing_account_aborts_transfer(&manager, true);
}

#[test]
fn sqlite_overdraft_guard() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteStorage::new(dir.path().join("guard.db").to_str().unwrap()).unwrap();
    check_overdraft_guard(Arc::new(db), true);
}

#[test]
fn sqlite_cancelled_transfer() {
    let (manager, _dir) = sqlite();
    check_cancelled_transfer(&manager);
}

#[test]
fn sqlite_reverse_order_transfer() {
    let (manager, _dir) = sqlite();
    check_reverse_order_transfer(&manager);
}

#[test]
fn sqlite_record_crud() {
    let (manager, _dir) = sqlite();
    check_record_crud(&manager);
}

#[test]
fn sqlite_list_pages() {
    let (manager, _dir) = sqlite();
    check_list_pages(&manager);
}

#[test]
fn sqlite_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    let transfer = {
        let manager = TransferManager::new(Arc::new(SqliteStorage::new(path.to_str().unwrap()).unwrap()));
        let a = create_account(&manager, 20);
        let b = create_account(&manager, 20);
        manager
            .transfer_tx(&Context::background(), TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 5,
            })
            .unwrap()
            .transfer
    };

    let manager = TransferManager::new(Arc::new(SqliteStorage::new(path.to_str().unwrap()).unwrap()));
    let ctx = Context::background();
    assert_eq!(manager.get_transfer(&ctx, transfer.id).unwrap(), transfer);
    assert_eq!(manager.get_account(&ctx, transfer.from_account_id).unwrap().balance, 15);
}

// PostgreSQL backend, only when SIMPLEBANK_TEST_POSTGRES_URL is set.

fn postgres() -> Option<Arc<PostgresStorage>> {
    static STORAGE: OnceLock<Option<Arc<PostgresStorage>>> = OnceLock::new();
    STORAGE
        .get_or_init(|| {
            let url = std::env::var("SIMPLEBANK_TEST_POSTGRES_URL").ok()?;
            Some(Arc::new(PostgresStorage::new(&url).expect("Failed to connect to PostgreSQL")))
        })
        .clone()
}

#[test]
fn postgres_concurrent_transfers() {
    let Some(db) = postgres() else { return };
    check_concurrent_transfers(Arc::new(TransferManager::new(db)));
}

#[test]
fn postgres_mixed_direction_transfers() {
    let Some(db) = postgres() else { return };
    check_mixed_direction_transfers(Arc::new(TransferManager::new(db)));
}

#[test]
fn postgres_partial_failure_rolls_back() {
    let Some(db) = postgres() else { return };
    check_partial_failure_rolls_back(&TransferManager::new(db));
}

#[test]
fn postgres_missing_account_aborts_transfer() {
    let Some(db) = postgres() else { return };
    check_missing_account_aborts_transfer(&TransferManager::new(db), false);
}

#[test]
fn postgres_overdraft_guard() {
    let Some(db) = postgres() else { return };
    check_overdraft_guard(db, false);
}

#[test]
fn postgres_reverse_order_transfer() {
    let Some(db) = postgres() else { return };
    check_reverse_order_transfer(&TransferManager::new(db));
}

#[test]
fn postgres_record_crud() {
    let Some(db) = postgres() else { return };
    check_record_crud(&TransferManager::new(db));
}
