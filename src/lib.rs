//! Funds-transfer transaction manager for the SimpleBank ledger.
//!
//! `TransferManager::transfer_tx` moves money between two accounts inside a
//! single database transaction, adjusting balances in account-id order so
//! concurrent transfers never deadlock. Record stores are pluggable through
//! the `simplebank_core::Database` trait.

pub mod config;
pub mod executor;
pub mod postgres_storage;
pub mod sqlite_storage;
pub mod storage;
pub mod transfer;

pub use executor::TransactionExecutor;
pub use transfer::{canonical_order, TransferManager, TransferOptions};
