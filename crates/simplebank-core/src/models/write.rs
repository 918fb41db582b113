use serde::Deserialize;

use super::AccountId;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UpdateAccountParams {
    pub id: AccountId,
    pub balance: i64,
}

/// `balance += amount` on a single account row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AdjustAccountBalanceParams {
    pub id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UpdateEntryParams {
    pub id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UpdateTransferParams {
    pub id: i64,
    pub amount: i64,
}
