use std::sync::{
    atomic::{AtomicU64, Ordering},
    Condvar, Mutex, MutexGuard, PoisonError,
};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::storage::{Database, RecordStore, StoreError, Transaction, TransactionId};
use simplebank_core::{
    Account, AccountId, AdjustAccountBalanceParams, Context, CreateAccountParams,
    CreateEntryParams, CreateTransferParams, Entry, ListParams, Transfer, UpdateAccountParams,
    UpdateEntryParams, UpdateTransferParams,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at, updated_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at, updated_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at, updated_at";

/// SQLite record store. Transactions are serialized on a single connection.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    gate: Gate,
    tx_counter: AtomicU64,
}

/// Hands the connection to one transaction at a time.
#[derive(Default)]
struct Gate {
    busy: Mutex<bool>,
    released: Condvar,
}

/// Turn on the connection. Dropping it wakes the next waiter.
struct Permit<'a> {
    gate: &'a Gate,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut busy = self.gate.busy.lock().unwrap_or_else(PoisonError::into_inner);
        *busy = false;
        drop(busy);
        self.gate.released.notify_one();
    }
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(map_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            gate: Gate::default(),
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                balance INTEGER NOT NULL,
                currency TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_account_id INTEGER NOT NULL,
                to_account_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (from_account_id) REFERENCES accounts(id),
                FOREIGN KEY (to_account_id) REFERENCES accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_pair ON transfers(from_account_id, to_account_id);
            ",
        )
        .map_err(map_err)?;
        Ok(())
    }

    /// Waits for the connection, giving up when the context expires.
    fn acquire(&self, ctx: &Context) -> Result<(Permit<'_>, MutexGuard<'_, Connection>), StoreError> {
        let mut busy = self.gate.busy.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        while *busy {
            ctx.err()?;
            busy = match ctx.remaining() {
                Some(remaining) => {
                    self.gate.released.wait_timeout(busy, remaining)
                        .map_err(|e| StoreError::Other(e.to_string()))?
                        .0
                }
                None => self.gate.released.wait(busy).map_err(|e| StoreError::Other(e.to_string()))?,
            };
        }
        *busy = true;
        drop(busy);

        let permit = Permit { gate: &self.gate };
        let conn = self.conn.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        Ok((permit, conn))
    }
}

fn map_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, msg) if failure.code == ErrorCode::ConstraintViolation => {
            StoreError::ConstraintViolation(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::CannotOpen | ErrorCode::NotADatabase) =>
        {
            StoreError::Connection(e.to_string())
        }
        _ => StoreError::Other(e.to_string()),
    }
}

fn ts_to_str(ts: OffsetDateTime) -> Result<String, StoreError> {
    ts.format(&Rfc3339)
        .map_err(|e| StoreError::Other(format!("Invalid timestamp: {}", e)))
}

fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let s: String = row.get(idx)?;
    OffsetDateTime::parse(&s, &Rfc3339).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_account(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: row.get(3)?,
        created_at: ts_col(row, 4)?,
        updated_at: ts_col(row, 5)?,
    })
}

fn row_to_entry(row: &Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        created_at: ts_col(row, 3)?,
        updated_at: ts_col(row, 4)?,
    })
}

fn row_to_transfer(row: &Row) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        from_account_id: row.get(1)?,
        to_account_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: ts_col(row, 4)?,
        updated_at: ts_col(row, 5)?,
    })
}

impl Database for SqliteStorage {
    type Transaction<'a> = SqliteTransaction<'a>;

    fn begin_transaction(&self, ctx: &Context) -> Result<SqliteTransaction<'_>, StoreError> {
        ctx.err()?;
        let (permit, conn) = self.acquire(ctx)?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(map_err)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(SqliteTransaction {
            conn,
            _permit: permit,
            tx_id,
            ctx: ctx.clone(),
            finished: false,
        })
    }
}

pub struct SqliteTransaction<'a> {
    // Dropped before the permit, so the next holder never blocks on the mutex.
    conn: MutexGuard<'a, Connection>,
    _permit: Permit<'a>,
    tx_id: TransactionId,
    ctx: Context,
    finished: bool,
}

impl<'a> SqliteTransaction<'a> {
    fn end(&mut self, sql: &str) -> Result<(), StoreError> {
        self.finished = true;
        self.conn.execute_batch(sql).map_err(map_err)
    }
}

impl<'a> RecordStore for SqliteTransaction<'a> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        self.ctx.err()?;
        let now = ts_to_str(OffsetDateTime::now_utc())?;
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4) RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.owner, params.balance, params.currency, now],
                row_to_account,
            )
            .map_err(map_err)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.ctx.err()?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                row_to_account,
            )
            .optional()
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(id))
    }

    fn list_accounts(&mut self, params: &ListParams) -> Result<Vec<Account>, StoreError> {
        self.ctx.err()?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM accounts ORDER BY id LIMIT ?1 OFFSET ?2",
                ACCOUNT_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![params.limit, params.offset], row_to_account)
            .map_err(map_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
    }

    fn update_account(&mut self, params: &UpdateAccountParams) -> Result<Account, StoreError> {
        self.ctx.err()?;
        let now = ts_to_str(OffsetDateTime::now_utc())?;
        self.conn
            .query_row(
                &format!(
                    "UPDATE accounts SET balance = ?2, updated_at = ?3 WHERE id = ?1 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.id, params.balance, now],
                row_to_account,
            )
            .optional()
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(params.id))
    }

    fn delete_account(&mut self, id: AccountId) -> Result<(), StoreError> {
        self.ctx.err()?;
        let deleted = self
            .conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::AccountNotFound(id));
        }
        Ok(())
    }

    fn adjust_account_balance(&mut self, params: &AdjustAccountBalanceParams) -> Result<Account, StoreError> {
        self.ctx.err()?;
        let now = ts_to_str(OffsetDateTime::now_utc())?;
        self.conn
            .query_row(
                &format!(
                    "UPDATE accounts SET balance = balance + ?2, updated_at = ?3 WHERE id = ?1 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.id, params.amount, now],
                row_to_account,
            )
            .optional()
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(params.id))
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StoreError> {
        self.ctx.err()?;
        let now = ts_to_str(OffsetDateTime::now_utc())?;
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO entries (account_id, amount, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3) RETURNING {}",
                    ENTRY_COLUMNS
                ),
                params![params.account_id, params.amount, now],
                row_to_entry,
            )
            .map_err(map_err)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.ctx.err()?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                row_to_entry,
            )
            .optional()
            .map_err(map_err)?
            .ok_or(StoreError::EntryNotFound(id))
    }

    fn list_entries(&mut self, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        self.ctx.err()?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM entries ORDER BY id LIMIT ?1 OFFSET ?2",
                ENTRY_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![params.limit, params.offset], row_to_entry)
            .map_err(map_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
    }

    fn update_entry(&mut self, params: &UpdateEntryParams) -> Result<Entry, StoreError> {
        self.ctx.err()?;
        let now = ts_to_str(OffsetDateTime::now_utc())?;
        self.conn
            .query_row(
                &format!(
                    "UPDATE entries SET amount = ?2, updated_at = ?3 WHERE id = ?1 RETURNING {}",
                    ENTRY_COLUMNS
                ),
                params![params.id, params.amount, now],
                row_to_entry,
            )
            .optional()
            .map_err(map_err)?
            .ok_or(StoreError::EntryNotFound(params.id))
    }

    fn delete_entry(&mut self, id: i64) -> Result<(), StoreError> {
        self.ctx.err()?;
        let deleted = self
            .conn
            .execute("DELETE FROM entries WHERE id = ?1", params![id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::EntryNotFound(id));
        }
        Ok(())
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StoreError> {
        self.ctx.err()?;
        let now = ts_to_str(OffsetDateTime::now_utc())?;
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4) RETURNING {}",
                    TRANSFER_COLUMNS
                ),
                params![params.from_account_id, params.to_account_id, params.amount, now],
                row_to_transfer,
            )
            .map_err(map_err)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.ctx.err()?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM transfers WHERE id = ?1", TRANSFER_COLUMNS),
                params![id],
                row_to_transfer,
            )
            .optional()
            .map_err(map_err)?
            .ok_or(StoreError::TransferNotFound(id))
    }

    fn list_transfers(&mut self, params: &ListParams) -> Result<Vec<Transfer>, StoreError> {
        self.ctx.err()?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM transfers ORDER BY id LIMIT ?1 OFFSET ?2",
                TRANSFER_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![params.limit, params.offset], row_to_transfer)
            .map_err(map_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
    }

    fn update_transfer(&mut self, params: &UpdateTransferParams) -> Result<Transfer, StoreError> {
        self.ctx.err()?;
        let now = ts_to_str(OffsetDateTime::now_utc())?;
        self.conn
            .query_row(
                &format!(
                    "UPDATE transfers SET amount = ?2, updated_at = ?3 WHERE id = ?1 RETURNING {}",
                    TRANSFER_COLUMNS
                ),
                params![params.id, params.amount, now],
                row_to_transfer,
            )
            .optional()
            .map_err(map_err)?
            .ok_or(StoreError::TransferNotFound(params.id))
    }

    fn delete_transfer(&mut self, id: i64) -> Result<(), StoreError> {
        self.ctx.err()?;
        let deleted = self
            .conn
            .execute("DELETE FROM transfers WHERE id = ?1", params![id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::TransferNotFound(id));
        }
        Ok(())
    }
}

impl<'a> Transaction for SqliteTransaction<'a> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn commit(mut self) -> Result<(), StoreError> {
        if let Err(e) = self.end("COMMIT") {
            if !self.conn.is_autocommit() {
                if let Err(rb_err) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(tx_id = self.tx_id, error = %rb_err, "Rollback after failed commit failed");
                }
            }
            return Err(e);
        }
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.end("ROLLBACK")?;
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

impl<'a> Drop for SqliteTransaction<'a> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.end("ROLLBACK") {
            tracing::warn!(tx_id = self.tx_id, error = %e, "Rollback of abandoned transaction failed");
        }
    }
}
