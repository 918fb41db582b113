use crate::{
    context::Context,
    models::{
        read::ListParams,
        write::{
            AdjustAccountBalanceParams, CreateAccountParams, CreateEntryParams,
            CreateTransferParams, UpdateAccountParams, UpdateEntryParams, UpdateTransferParams,
        },
        Account, AccountId, Entry, Transfer,
    },
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Other(String),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("entry not found: {0}")]
    EntryNotFound(i64),
    #[error("transfer not found: {0}")]
    TransferNotFound(i64),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("timed out waiting for lock on {table} row {id}")]
    LockTimeout { table: &'static str, id: i64 },
    #[error("insufficient funds in account {account_id}: balance would be {balance}")]
    InsufficientFunds { account_id: AccountId, balance: i64 },
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("tx err: {source}, rb err: {rollback}")]
    Rollback {
        source: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

pub type TransactionId = u64;

/// Single-row operations on accounts, entries and transfers.
///
/// Every backend hands out an implementation bound to one open transaction;
/// nothing done through it is durable until that transaction commits.
pub trait RecordStore {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError>;
    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError>;
    fn list_accounts(&mut self, params: &ListParams) -> Result<Vec<Account>, StoreError>;
    fn update_account(&mut self, params: &UpdateAccountParams) -> Result<Account, StoreError>;
    fn delete_account(&mut self, id: AccountId) -> Result<(), StoreError>;
    /// Atomic `balance += amount`. Holds the row lock until the transaction ends.
    fn adjust_account_balance(&mut self, params: &AdjustAccountBalanceParams) -> Result<Account, StoreError>;

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StoreError>;
    fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;
    fn list_entries(&mut self, params: &ListParams) -> Result<Vec<Entry>, StoreError>;
    fn update_entry(&mut self, params: &UpdateEntryParams) -> Result<Entry, StoreError>;
    fn delete_entry(&mut self, id: i64) -> Result<(), StoreError>;

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StoreError>;
    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;
    fn list_transfers(&mut self, params: &ListParams) -> Result<Vec<Transfer>, StoreError>;
    fn update_transfer(&mut self, params: &UpdateTransferParams) -> Result<Transfer, StoreError>;
    fn delete_transfer(&mut self, id: i64) -> Result<(), StoreError>;
}

/// An open transaction. Dropping it without calling either method rolls it back.
pub trait Transaction: RecordStore {
    fn id(&self) -> TransactionId;
    fn commit(self) -> Result<(), StoreError>;
    fn rollback(self) -> Result<(), StoreError>;
}

/// Connection-level handle that opens transactions.
pub trait Database: Send + Sync {
    type Transaction<'a>: Transaction
    where
        Self: 'a;

    fn begin_transaction(&self, ctx: &Context) -> Result<Self::Transaction<'_>, StoreError>;
}
