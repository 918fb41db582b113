use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use postgres::{error::SqlState, Client, NoTls, Row};
use time::OffsetDateTime;

use crate::storage::{Database, RecordStore, StoreError, Transaction, TransactionId};
use simplebank_core::{
    Account, AccountId, AdjustAccountBalanceParams, Context, CreateAccountParams,
    CreateEntryParams, CreateTransferParams, Entry, ListParams, Transfer, UpdateAccountParams,
    UpdateEntryParams, UpdateTransferParams,
};

const DEFAULT_MAX_IDLE: usize = 8;

/// PostgreSQL record store.
///
/// Each transaction runs on its own connection so row locks taken by
/// `adjust_account_balance` are held by the database, not by this process.
/// Connections are kept in a small idle list between transactions.
pub struct PostgresStorage {
    config: postgres::Config,
    idle: Mutex<Vec<Client>>,
    max_idle: usize,
    tx_counter: AtomicU64,
}

impl PostgresStorage {
    pub fn new(connection_string: &str) -> Result<Self, StoreError> {
        let config: postgres::Config = connection_string
            .parse()
            .map_err(|e| StoreError::Connection(format!("Invalid PostgreSQL connection string: {}", e)))?;

        let storage = Self {
            config,
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
            tx_counter: AtomicU64::new(1),
        };
        let mut client = storage.connect()?;
        Self::init_schema(&mut client)?;
        storage.release(client);
        Ok(storage)
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    fn init_schema(client: &mut Client) -> Result<(), StoreError> {
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                owner TEXT NOT NULL,
                balance BIGINT NOT NULL,
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS entries (
                id BIGSERIAL PRIMARY KEY,
                account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id BIGSERIAL PRIMARY KEY,
                from_account_id BIGINT NOT NULL REFERENCES accounts(id),
                to_account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_pg_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_pg_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_pair ON transfers(from_account_id, to_account_id);
            ",
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn connect(&self) -> Result<Client, StoreError> {
        self.config
            .connect(NoTls)
            .map_err(|e| StoreError::Connection(format!("PostgreSQL connection failed: {}", e)))
    }

    fn checkout(&self) -> Result<Client, StoreError> {
        let mut idle = self.idle.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        while let Some(client) = idle.pop() {
            if !client.is_closed() {
                return Ok(client);
            }
        }
        drop(idle);
        self.connect()
    }

    fn release(&self, client: Client) {
        if client.is_closed() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(client);
            }
        }
    }
}

fn map_err(e: postgres::Error) -> StoreError {
    if e.is_closed() {
        return StoreError::Connection(e.to_string());
    }
    match e.code() {
        Some(code)
            if *code == SqlState::FOREIGN_KEY_VIOLATION
                || *code == SqlState::UNIQUE_VIOLATION
                || *code == SqlState::CHECK_VIOLATION
                || *code == SqlState::NOT_NULL_VIOLATION =>
        {
            let detail = e
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| e.to_string());
            StoreError::ConstraintViolation(detail)
        }
        Some(code) if *code == SqlState::QUERY_CANCELED => StoreError::DeadlineExceeded,
        _ => StoreError::Other(e.to_string()),
    }
}

fn row_to_account(row: &Row) -> Result<Account, StoreError> {
    Ok(Account {
        id: row.try_get(0).map_err(map_err)?,
        owner: row.try_get(1).map_err(map_err)?,
        balance: row.try_get(2).map_err(map_err)?,
        currency: row.try_get(3).map_err(map_err)?,
        created_at: row.try_get(4).map_err(map_err)?,
        updated_at: row.try_get(5).map_err(map_err)?,
    })
}

fn row_to_entry(row: &Row) -> Result<Entry, StoreError> {
    Ok(Entry {
        id: row.try_get(0).map_err(map_err)?,
        account_id: row.try_get(1).map_err(map_err)?,
        amount: row.try_get(2).map_err(map_err)?,
        created_at: row.try_get(3).map_err(map_err)?,
        updated_at: row.try_get(4).map_err(map_err)?,
    })
}

fn row_to_transfer(row: &Row) -> Result<Transfer, StoreError> {
    Ok(Transfer {
        id: row.try_get(0).map_err(map_err)?,
        from_account_id: row.try_get(1).map_err(map_err)?,
        to_account_id: row.try_get(2).map_err(map_err)?,
        amount: row.try_get(3).map_err(map_err)?,
        created_at: row.try_get(4).map_err(map_err)?,
        updated_at: row.try_get(5).map_err(map_err)?,
    })
}

impl Database for PostgresStorage {
    type Transaction<'a> = PostgresTransaction<'a>;

    fn begin_transaction(&self, ctx: &Context) -> Result<PostgresTransaction<'_>, StoreError> {
        ctx.err()?;
        let mut client = self.checkout()?;
        client.batch_execute("BEGIN").map_err(map_err)?;
        if let Some(remaining) = ctx.remaining() {
            let millis = remaining.as_millis().max(1);
            if let Err(e) = client.batch_execute(&format!("SET LOCAL statement_timeout = {}", millis)) {
                if let Err(rb_err) = client.batch_execute("ROLLBACK") {
                    tracing::warn!(error = %rb_err, "Rollback after failed statement_timeout setup failed");
                }
                return Err(map_err(e));
            }
        }
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "PostgreSQL transaction started");
        Ok(PostgresTransaction {
            storage: self,
            client: Some(client),
            tx_id,
            ctx: ctx.clone(),
        })
    }
}

pub struct PostgresTransaction<'a> {
    storage: &'a PostgresStorage,
    client: Option<Client>,
    tx_id: TransactionId,
    ctx: Context,
}

impl<'a> PostgresTransaction<'a> {
    fn client(&mut self) -> Result<&mut Client, StoreError> {
        self.ctx.err()?;
        self.client
            .as_mut()
            .ok_or_else(|| StoreError::Other("transaction already finished".to_string()))
    }

    /// Runs `COMMIT` or `ROLLBACK` and hands the connection back on success.
    fn end(&mut self, sql: &str) -> Result<(), StoreError> {
        let mut client = self
            .client
            .take()
            .ok_or_else(|| StoreError::Other("transaction already finished".to_string()))?;
        client.batch_execute(sql).map_err(map_err)?;
        self.storage.release(client);
        Ok(())
    }
}

impl<'a> RecordStore for PostgresTransaction<'a> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = self
            .client()?
            .query_one(
                "INSERT INTO accounts (owner, balance, currency, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $4)
                 RETURNING id, owner, balance, currency, created_at, updated_at",
                &[&params.owner, &params.balance, &params.currency, &now],
            )
            .map_err(map_err)?;
        row_to_account(&row)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        let row = self
            .client()?
            .query_opt(
                "SELECT id, owner, balance, currency, created_at, updated_at FROM accounts WHERE id = $1",
                &[&id],
            )
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(id))?;
        row_to_account(&row)
    }

    fn list_accounts(&mut self, params: &ListParams) -> Result<Vec<Account>, StoreError> {
        let rows = self
            .client()?
            .query(
                "SELECT id, owner, balance, currency, created_at, updated_at
                 FROM accounts ORDER BY id LIMIT $1 OFFSET $2",
                &[&params.limit, &params.offset],
            )
            .map_err(map_err)?;
        rows.iter().map(row_to_account).collect()
    }

    fn update_account(&mut self, params: &UpdateAccountParams) -> Result<Account, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = self
            .client()?
            .query_opt(
                "UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1
                 RETURNING id, owner, balance, currency, created_at, updated_at",
                &[&params.id, &params.balance, &now],
            )
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(params.id))?;
        row_to_account(&row)
    }

    fn delete_account(&mut self, id: AccountId) -> Result<(), StoreError> {
        let deleted = self
            .client()?
            .execute("DELETE FROM accounts WHERE id = $1", &[&id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::AccountNotFound(id));
        }
        Ok(())
    }

    fn adjust_account_balance(&mut self, params: &AdjustAccountBalanceParams) -> Result<Account, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = self
            .client()?
            .query_opt(
                "UPDATE accounts SET balance = balance + $2, updated_at = $3 WHERE id = $1
                 RETURNING id, owner, balance, currency, created_at, updated_at",
                &[&params.id, &params.amount, &now],
            )
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(params.id))?;
        row_to_account(&row)
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = self
            .client()?
            .query_one(
                "INSERT INTO entries (account_id, amount, created_at, updated_at)
                 VALUES ($1, $2, $3, $3)
                 RETURNING id, account_id, amount, created_at, updated_at",
                &[&params.account_id, &params.amount, &now],
            )
            .map_err(map_err)?;
        row_to_entry(&row)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        let row = self
            .client()?
            .query_opt(
                "SELECT id, account_id, amount, created_at, updated_at FROM entries WHERE id = $1",
                &[&id],
            )
            .map_err(map_err)?
            .ok_or(StoreError::EntryNotFound(id))?;
        row_to_entry(&row)
    }

    fn list_entries(&mut self, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        let rows = self
            .client()?
            .query(
                "SELECT id, account_id, amount, created_at, updated_at
                 FROM entries ORDER BY id LIMIT $1 OFFSET $2",
                &[&params.limit, &params.offset],
            )
            .map_err(map_err)?;
        rows.iter().map(row_to_entry).collect()
    }

    fn update_entry(&mut self, params: &UpdateEntryParams) -> Result<Entry, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = self
            .client()?
            .query_opt(
                "UPDATE entries SET amount = $2, updated_at = $3 WHERE id = $1
                 RETURNING id, account_id, amount, created_at, updated_at",
                &[&params.id, &params.amount, &now],
            )
            .map_err(map_err)?
            .ok_or(StoreError::EntryNotFound(params.id))?;
        row_to_entry(&row)
    }

    fn delete_entry(&mut self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .client()?
            .execute("DELETE FROM entries WHERE id = $1", &[&id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::EntryNotFound(id));
        }
        Ok(())
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = self
            .client()?
            .query_one(
                "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $4)
                 RETURNING id, from_account_id, to_account_id, amount, created_at, updated_at",
                &[&params.from_account_id, &params.to_account_id, &params.amount, &now],
            )
            .map_err(map_err)?;
        row_to_transfer(&row)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        let row = self
            .client()?
            .query_opt(
                "SELECT id, from_account_id, to_account_id, amount, created_at, updated_at
                 FROM transfers WHERE id = $1",
                &[&id],
            )
            .map_err(map_err)?
            .ok_or(StoreError::TransferNotFound(id))?;
        row_to_transfer(&row)
    }

    fn list_transfers(&mut self, params: &ListParams) -> Result<Vec<Transfer>, StoreError> {
        let rows = self
            .client()?
            .query(
                "SELECT id, from_account_id, to_account_id, amount, created_at, updated_at
                 FROM transfers ORDER BY id LIMIT $1 OFFSET $2",
                &[&params.limit, &params.offset],
            )
            .map_err(map_err)?;
        rows.iter().map(row_to_transfer).collect()
    }

    fn update_transfer(&mut self, params: &UpdateTransferParams) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = self
            .client()?
            .query_opt(
                "UPDATE transfers SET amount = $2, updated_at = $3 WHERE id = $1
                 RETURNING id, from_account_id, to_account_id, amount, created_at, updated_at",
                &[&params.id, &params.amount, &now],
            )
            .map_err(map_err)?
            .ok_or(StoreError::TransferNotFound(params.id))?;
        row_to_transfer(&row)
    }

    fn delete_transfer(&mut self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .client()?
            .execute("DELETE FROM transfers WHERE id = $1", &[&id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::TransferNotFound(id));
        }
        Ok(())
    }
}

impl<'a> Transaction for PostgresTransaction<'a> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.end("COMMIT")?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.end("ROLLBACK")?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl<'a> Drop for PostgresTransaction<'a> {
    fn drop(&mut self) {
        if self.client.is_none() {
            return;
        }
        if let Err(e) = self.end("ROLLBACK") {
            tracing::warn!(tx_id = self.tx_id, error = %e, "Rollback of abandoned transaction failed");
        }
    }
}
