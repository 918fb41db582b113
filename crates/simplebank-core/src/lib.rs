//! Core types and traits for SimpleBank record stores.
//!
//! This crate provides the `RecordStore`, `Transaction` and `Database` traits
//! and the ledger models, so storage backends and the transfer manager can
//! live in separate crates.

pub mod context;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use context::Context;
pub use models::{Account, AccountId, Entry, Transfer, TransferTxParams, TransferTxResult};
pub use models::read::ListParams;
pub use models::write::{
    AdjustAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    UpdateAccountParams, UpdateEntryParams, UpdateTransferParams,
};
pub use storage::{Database, RecordStore, StoreError, Transaction, TransactionId};
