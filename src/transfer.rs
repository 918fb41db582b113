use std::sync::Arc;

use simplebank_core::{
    Account, AccountId, AdjustAccountBalanceParams, Context, CreateAccountParams,
    CreateEntryParams, CreateTransferParams, Database, Entry, ListParams, RecordStore, StoreError,
    Transfer, TransferTxParams, TransferTxResult, UpdateAccountParams,
};

use crate::executor::TransactionExecutor;

/// Order in which a transfer adjusts its two accounts.
///
/// The lower account id is always adjusted first so that concurrent
/// transfers over the same pair take row locks in the same order. Deltas
/// keep their debit/credit direction whichever account comes first.
pub fn canonical_order(
    from_account_id: AccountId,
    to_account_id: AccountId,
    amount: i64,
) -> (AccountId, i64, AccountId, i64) {
    if from_account_id <= to_account_id {
        (from_account_id, -amount, to_account_id, amount)
    } else {
        (to_account_id, amount, from_account_id, -amount)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// When false, a transfer that leaves the source account negative fails
    /// with `InsufficientFunds` and is rolled back.
    pub allow_overdraft: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self { allow_overdraft: true }
    }
}

/// Moves funds between accounts, one transaction per transfer.
///
/// Also exposes the plain record operations, each run in its own short
/// transaction, for callers that need to read back state.
pub struct TransferManager<D: Database> {
    executor: TransactionExecutor<D>,
    options: TransferOptions,
}

impl<D: Database> TransferManager<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self::with_options(db, TransferOptions::default())
    }

    pub fn with_options(db: Arc<D>, options: TransferOptions) -> Self {
        Self {
            executor: TransactionExecutor::new(db),
            options,
        }
    }

    pub fn executor(&self) -> &TransactionExecutor<D> {
        &self.executor
    }

    pub fn transfer_tx(&self, ctx: &Context, params: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        let options = self.options;
        let result = self.executor.run_in_transaction(ctx, |q| {
            ctx.err()?;
            let transfer = q.create_transfer(&CreateTransferParams {
                from_account_id: params.from_account_id,
                to_account_id: params.to_account_id,
                amount: params.amount,
            })?;

            ctx.err()?;
            let from_entry = q.create_entry(&CreateEntryParams {
                account_id: params.from_account_id,
                amount: -params.amount,
            })?;

            ctx.err()?;
            let to_entry = q.create_entry(&CreateEntryParams {
                account_id: params.to_account_id,
                amount: params.amount,
            })?;

            let (from_account, to_account) = transfer_money(ctx, q, &params)?;

            if !options.allow_overdraft && from_account.balance < 0 {
                return Err(StoreError::InsufficientFunds {
                    account_id: from_account.id,
                    balance: from_account.balance,
                });
            }

            Ok(TransferTxResult {
                transfer,
                from_account,
                to_account,
                from_entry,
                to_entry,
            })
        })?;

        tracing::info!(
            transfer_id = result.transfer.id,
            from = params.from_account_id,
            to = params.to_account_id,
            amount = params.amount,
            "Transfer committed"
        );
        Ok(result)
    }

    pub fn create_account(&self, ctx: &Context, params: &CreateAccountParams) -> Result<Account, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.create_account(params))
    }

    pub fn get_account(&self, ctx: &Context, id: AccountId) -> Result<Account, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.get_account(id))
    }

    pub fn list_accounts(&self, ctx: &Context, params: &ListParams) -> Result<Vec<Account>, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.list_accounts(params))
    }

    pub fn update_account(&self, ctx: &Context, params: &UpdateAccountParams) -> Result<Account, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.update_account(params))
    }

    pub fn delete_account(&self, ctx: &Context, id: AccountId) -> Result<(), StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.delete_account(id))
    }

    pub fn get_entry(&self, ctx: &Context, id: i64) -> Result<Entry, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.get_entry(id))
    }

    pub fn list_entries(&self, ctx: &Context, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.list_entries(params))
    }

    pub fn get_transfer(&self, ctx: &Context, id: i64) -> Result<Transfer, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.get_transfer(id))
    }

    pub fn list_transfers(&self, ctx: &Context, params: &ListParams) -> Result<Vec<Transfer>, StoreError> {
        self.executor.run_in_transaction(ctx, |q| q.list_transfers(params))
    }
}

/// Adjusts both balances in canonical order and returns `(from, to)`.
fn transfer_money(
    ctx: &Context,
    q: &mut dyn RecordStore,
    params: &TransferTxParams,
) -> Result<(Account, Account), StoreError> {
    let (first_id, first_delta, second_id, second_delta) =
        canonical_order(params.from_account_id, params.to_account_id, params.amount);

    ctx.err()?;
    let first = q.adjust_account_balance(&AdjustAccountBalanceParams {
        id: first_id,
        amount: first_delta,
    })?;

    ctx.err()?;
    let second = q.adjust_account_balance(&AdjustAccountBalanceParams {
        id: second_id,
        amount: second_delta,
    })?;

    if first_id == params.from_account_id {
        Ok((first, second))
    } else {
        Ok((second, first))
    }
}
