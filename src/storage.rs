use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use time::OffsetDateTime;

use simplebank_core::{
    Account, AccountId, AdjustAccountBalanceParams, Context, CreateAccountParams,
    CreateEntryParams, CreateTransferParams, Entry, ListParams, Transfer, UpdateAccountParams,
    UpdateEntryParams, UpdateTransferParams,
};

pub use simplebank_core::storage::{Database, RecordStore, StoreError, Transaction, TransactionId};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Committed rows and id sequences.
#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    last_account_id: i64,
    last_entry_id: i64,
    last_transfer_id: i64,
}

impl Tables {
    fn apply(&mut self, writes: WriteSet) {
        apply_rows(&mut self.accounts, writes.accounts);
        apply_rows(&mut self.entries, writes.entries);
        apply_rows(&mut self.transfers, writes.transfers);
    }
}

/// Rows written by an open transaction. `None` marks a deleted row.
#[derive(Default)]
struct WriteSet {
    accounts: BTreeMap<AccountId, Option<Account>>,
    entries: BTreeMap<i64, Option<Entry>>,
    transfers: BTreeMap<i64, Option<Transfer>>,
}

fn apply_rows<T>(committed: &mut BTreeMap<i64, T>, writes: BTreeMap<i64, Option<T>>) {
    for (id, row) in writes {
        match row {
            Some(row) => {
                committed.insert(id, row);
            }
            None => {
                committed.remove(&id);
            }
        }
    }
}

fn visible<T: Clone>(committed: &BTreeMap<i64, T>, writes: &BTreeMap<i64, Option<T>>, id: i64) -> Option<T> {
    match writes.get(&id) {
        Some(row) => row.clone(),
        None => committed.get(&id).cloned(),
    }
}

/// Every row the transaction can see, in no particular order.
fn visible_rows<'r, T>(
    committed: &'r BTreeMap<i64, T>,
    writes: &'r BTreeMap<i64, Option<T>>,
) -> impl Iterator<Item = &'r T> {
    committed
        .iter()
        .filter(|(id, _)| !writes.contains_key(*id))
        .map(|(_, row)| row)
        .chain(writes.values().flatten())
}

fn page<T: Clone>(committed: &BTreeMap<i64, T>, writes: &BTreeMap<i64, Option<T>>, params: &ListParams) -> Vec<T> {
    let (offset, limit) = params.bounds();
    if writes.is_empty() {
        return committed.values().skip(offset).take(limit).cloned().collect();
    }
    let mut merged: BTreeMap<i64, &T> = committed.iter().map(|(id, row)| (*id, row)).collect();
    for (id, row) in writes {
        match row {
            Some(row) => {
                merged.insert(*id, row);
            }
            None => {
                merged.remove(id);
            }
        }
    }
    merged.into_values().skip(offset).take(limit).cloned().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    Entry(i64),
    Transfer(i64),
}

impl RowKey {
    fn table(self) -> &'static str {
        match self {
            RowKey::Account(_) => "accounts",
            RowKey::Entry(_) => "entries",
            RowKey::Transfer(_) => "transfers",
        }
    }

    fn id(self) -> i64 {
        match self {
            RowKey::Account(id) | RowKey::Entry(id) | RowKey::Transfer(id) => id,
        }
    }
}

/// Row lock strength, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LockMode {
    /// Taken on an account while an uncommitted entry or transfer points at it.
    KeyShare,
    /// Taken by balance and amount changes.
    Update,
    /// Taken by deletes.
    Exclusive,
}

impl LockMode {
    fn conflicts_with(self, other: LockMode) -> bool {
        matches!(
            (self, other),
            (LockMode::Exclusive, _) | (_, LockMode::Exclusive) | (LockMode::Update, LockMode::Update)
        )
    }
}

/// Process-local record store.
///
/// A transaction's writes stay private to it until commit, which applies them
/// in one step under the table mutex; rollback just discards them. Readers
/// therefore see committed rows plus their own writes and nothing else.
///
/// Rows a transaction modifies, deletes or references stay locked by it until
/// it ends. Other transactions wait for a conflicting lock up to
/// `lock_timeout` or their context deadline, whichever is sooner.
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Vec<(TransactionId, LockMode)>>>,
    lock_released: Condvar,
    tx_counter: AtomicU64,
    lock_timeout: Duration,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            row_locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            tx_counter: AtomicU64::new(1),
            lock_timeout,
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(poisoned)
    }

    fn release_locks(&self, tx_id: TransactionId, keys: &HashMap<RowKey, LockMode>) {
        if keys.is_empty() {
            return;
        }
        let mut held = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys.keys() {
            if let Some(holders) = held.get_mut(key) {
                holders.retain(|(owner, _)| *owner != tx_id);
                if holders.is_empty() {
                    held.remove(key);
                }
            }
        }
        drop(held);
        self.lock_released.notify_all();
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Other("storage mutex poisoned".to_string())
}

impl Database for InMemoryStorage {
    type Transaction<'a> = MemoryTransaction<'a>;

    fn begin_transaction(&self, ctx: &Context) -> Result<MemoryTransaction<'_>, StoreError> {
        ctx.err()?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "Transaction started");
        Ok(MemoryTransaction {
            storage: self,
            tx_id,
            ctx: ctx.clone(),
            writes: WriteSet::default(),
            locks: HashMap::new(),
            finished: false,
        })
    }
}

pub struct MemoryTransaction<'a> {
    storage: &'a InMemoryStorage,
    tx_id: TransactionId,
    ctx: Context,
    writes: WriteSet,
    locks: HashMap<RowKey, LockMode>,
    finished: bool,
}

impl<'a> MemoryTransaction<'a> {
    fn lock_row(&mut self, key: RowKey, mode: LockMode) -> Result<(), StoreError> {
        if self.locks.get(&key).is_some_and(|held| *held >= mode) {
            return Ok(());
        }
        let wait = match self.ctx.remaining() {
            Some(remaining) => remaining.min(self.storage.lock_timeout),
            None => self.storage.lock_timeout,
        };
        let deadline = Instant::now() + wait;

        let mut held = self.storage.row_locks.lock().map_err(poisoned)?;
        loop {
            let blocked = held.get(&key).is_some_and(|holders| {
                holders
                    .iter()
                    .any(|(owner, other)| *owner != self.tx_id && mode.conflicts_with(*other))
            });
            if !blocked {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                self.ctx.err()?;
                tracing::debug!(tx_id = self.tx_id, table = key.table(), id = key.id(), "Row lock wait timed out");
                return Err(StoreError::LockTimeout { table: key.table(), id: key.id() });
            }
            let (guard, _) = self
                .storage
                .lock_released
                .wait_timeout(held, deadline - now)
                .map_err(poisoned)?;
            held = guard;
        }

        let holders = held.entry(key).or_default();
        match holders.iter_mut().find(|(owner, _)| *owner == self.tx_id) {
            Some(own) => own.1 = own.1.max(mode),
            None => holders.push((self.tx_id, mode)),
        }
        drop(held);

        let own = self.locks.entry(key).or_insert(mode);
        *own = (*own).max(mode);
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        self.storage.release_locks(self.tx_id, &self.locks);
        self.locks.clear();
    }
}

impl<'a> RecordStore for MemoryTransaction<'a> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        self.ctx.err()?;
        let id = {
            let mut tables = self.storage.tables()?;
            tables.last_account_id += 1;
            tables.last_account_id
        };
        let now = OffsetDateTime::now_utc();
        let account = Account {
            id,
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: now,
            updated_at: now,
        };
        self.writes.accounts.insert(id, Some(account.clone()));
        Ok(account)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.ctx.err()?;
        let tables = self.storage.tables()?;
        visible(&tables.accounts, &self.writes.accounts, id).ok_or(StoreError::AccountNotFound(id))
    }

    fn list_accounts(&mut self, params: &ListParams) -> Result<Vec<Account>, StoreError> {
        self.ctx.err()?;
        let tables = self.storage.tables()?;
        Ok(page(&tables.accounts, &self.writes.accounts, params))
    }

    fn update_account(&mut self, params: &UpdateAccountParams) -> Result<Account, StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Account(params.id), LockMode::Update)?;
        let mut account = self.get_account(params.id)?;
        account.balance = params.balance;
        account.updated_at = OffsetDateTime::now_utc();
        self.writes.accounts.insert(params.id, Some(account.clone()));
        Ok(account)
    }

    fn delete_account(&mut self, id: AccountId) -> Result<(), StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Account(id), LockMode::Exclusive)?;
        let tables = self.storage.tables()?;
        if visible(&tables.accounts, &self.writes.accounts, id).is_none() {
            return Err(StoreError::AccountNotFound(id));
        }
        // Exclusive lock means no other open transaction still references the row.
        let referenced = visible_rows(&tables.entries, &self.writes.entries).any(|e| e.account_id == id)
            || visible_rows(&tables.transfers, &self.writes.transfers)
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        drop(tables);
        if referenced {
            return Err(StoreError::ConstraintViolation(format!(
                "account {} is still referenced by entries or transfers", id
            )));
        }
        self.writes.accounts.insert(id, None);
        Ok(())
    }

    fn adjust_account_balance(&mut self, params: &AdjustAccountBalanceParams) -> Result<Account, StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Account(params.id), LockMode::Update)?;
        let mut account = self.get_account(params.id)?;
        account.balance = account.balance.checked_add(params.amount)
            .ok_or_else(|| StoreError::Other(format!("balance of account {} out of range", params.id)))?;
        account.updated_at = OffsetDateTime::now_utc();
        self.writes.accounts.insert(params.id, Some(account.clone()));
        Ok(account)
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Account(params.account_id), LockMode::KeyShare)?;
        let id = {
            let mut tables = self.storage.tables()?;
            if visible(&tables.accounts, &self.writes.accounts, params.account_id).is_none() {
                return Err(StoreError::ConstraintViolation(format!(
                    "entry references missing account {}", params.account_id
                )));
            }
            tables.last_entry_id += 1;
            tables.last_entry_id
        };
        let now = OffsetDateTime::now_utc();
        let entry = Entry {
            id,
            account_id: params.account_id,
            amount: params.amount,
            created_at: now,
            updated_at: now,
        };
        self.writes.entries.insert(id, Some(entry.clone()));
        Ok(entry)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.ctx.err()?;
        let tables = self.storage.tables()?;
        visible(&tables.entries, &self.writes.entries, id).ok_or(StoreError::EntryNotFound(id))
    }

    fn list_entries(&mut self, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        self.ctx.err()?;
        let tables = self.storage.tables()?;
        Ok(page(&tables.entries, &self.writes.entries, params))
    }

    fn update_entry(&mut self, params: &UpdateEntryParams) -> Result<Entry, StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Entry(params.id), LockMode::Update)?;
        let mut entry = self.get_entry(params.id)?;
        entry.amount = params.amount;
        entry.updated_at = OffsetDateTime::now_utc();
        self.writes.entries.insert(params.id, Some(entry.clone()));
        Ok(entry)
    }

    fn delete_entry(&mut self, id: i64) -> Result<(), StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Entry(id), LockMode::Exclusive)?;
        self.get_entry(id)?;
        self.writes.entries.insert(id, None);
        Ok(())
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Account(params.from_account_id), LockMode::KeyShare)?;
        self.lock_row(RowKey::Account(params.to_account_id), LockMode::KeyShare)?;
        let id = {
            let mut tables = self.storage.tables()?;
            for account_id in [params.from_account_id, params.to_account_id] {
                if visible(&tables.accounts, &self.writes.accounts, account_id).is_none() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "transfer references missing account {}", account_id
                    )));
                }
            }
            tables.last_transfer_id += 1;
            tables.last_transfer_id
        };
        let now = OffsetDateTime::now_utc();
        let transfer = Transfer {
            id,
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: now,
            updated_at: now,
        };
        self.writes.transfers.insert(id, Some(transfer.clone()));
        Ok(transfer)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.ctx.err()?;
        let tables = self.storage.tables()?;
        visible(&tables.transfers, &self.writes.transfers, id).ok_or(StoreError::TransferNotFound(id))
    }

    fn list_transfers(&mut self, params: &ListParams) -> Result<Vec<Transfer>, StoreError> {
        self.ctx.err()?;
        let tables = self.storage.tables()?;
        Ok(page(&tables.transfers, &self.writes.transfers, params))
    }

    fn update_transfer(&mut self, params: &UpdateTransferParams) -> Result<Transfer, StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Transfer(params.id), LockMode::Update)?;
        let mut transfer = self.get_transfer(params.id)?;
        transfer.amount = params.amount;
        transfer.updated_at = OffsetDateTime::now_utc();
        self.writes.transfers.insert(params.id, Some(transfer.clone()));
        Ok(transfer)
    }

    fn delete_transfer(&mut self, id: i64) -> Result<(), StoreError> {
        self.ctx.err()?;
        self.lock_row(RowKey::Transfer(id), LockMode::Exclusive)?;
        self.get_transfer(id)?;
        self.writes.transfers.insert(id, None);
        Ok(())
    }
}

impl<'a> Transaction for MemoryTransaction<'a> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let writes = mem::take(&mut self.writes);
        let result = self.storage.tables().map(|mut tables| tables.apply(writes));
        self.finish();
        match &result {
            Ok(()) => tracing::debug!(tx_id = self.tx_id, "Transaction committed"),
            Err(e) => tracing::warn!(tx_id = self.tx_id, error = %e, "Commit failed"),
        }
        result
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.writes = WriteSet::default();
        self.finish();
        tracing::debug!(tx_id = self.tx_id, "Transaction rolled back");
        Ok(())
    }
}

impl<'a> Drop for MemoryTransaction<'a> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finish();
        tracing::debug!(tx_id = self.tx_id, "Abandoned transaction rolled back");
    }
}
