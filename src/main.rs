use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use prettytable::{row, Table};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use simplebank::config::{Backend, CliArgs, Command, Config, LoggingConfig};
use simplebank::postgres_storage::PostgresStorage;
use simplebank::sqlite_storage::SqliteStorage;
use simplebank::storage::{Database, InMemoryStorage, StoreError};
use simplebank::{TransferManager, TransferOptions};
use simplebank_core::{Account, Context, CreateAccountParams, ListParams, TransferTxParams};

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_tracing(&config.logging);

    let options = TransferOptions {
        allow_overdraft: config.transfer.allow_overdraft,
    };

    let result = match config.database.backend {
        Backend::Memory => run(Arc::new(InMemoryStorage::with_lock_timeout(config.lock_timeout())), options, &cli.command),
        Backend::Sqlite => SqliteStorage::new(&config.database.url)
            .and_then(|db| run(Arc::new(db), options, &cli.command)),
        Backend::Postgres => PostgresStorage::new(&config.database.url)
            .and_then(|db| run(Arc::new(db), options, &cli.command)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_target(false).with_writer(std::io::stderr)).init();
    }
}

fn run<D: Database>(db: Arc<D>, options: TransferOptions, command: &Command) -> Result<(), StoreError> {
    let manager = TransferManager::with_options(db, options);
    let ctx = Context::background();

    match command {
        Command::CreateAccount { owner, balance, currency } => {
            let account = manager.create_account(&ctx, &CreateAccountParams {
                owner: owner.clone(),
                balance: *balance,
                currency: currency.clone(),
            })?;
            print_json(&account)
        }
        Command::GetAccount { id } => print_json(&manager.get_account(&ctx, *id)?),
        Command::ListAccounts { limit, offset } => {
            let accounts = manager.list_accounts(&ctx, &ListParams::new(*limit, *offset))?;
            print_accounts(&accounts);
            Ok(())
        }
        Command::Transfer { from, to, amount, timeout_ms } => {
            let ctx = match timeout_ms {
                Some(ms) => Context::with_timeout(Duration::from_millis(*ms)),
                None => ctx,
            };
            let result = manager.transfer_tx(&ctx, TransferTxParams {
                from_account_id: *from,
                to_account_id: *to,
                amount: *amount,
            })?;
            print_json(&result)
        }
        Command::GetTransfer { id } => print_json(&manager.get_transfer(&ctx, *id)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), StoreError> {
    let out = serde_json::to_string_pretty(value).map_err(|e| StoreError::Other(e.to_string()))?;
    println!("{}", out);
    Ok(())
}

fn print_accounts(accounts: &[Account]) {
    let mut table = Table::new();
    table.add_row(row!["ID", "Owner", "Balance", "Currency", "Updated"]);
    table.add_empty_row();
    for account in accounts {
        table.add_row(row![account.id, account.owner, account.balance, account.currency, account.updated_at]);
    }
    table.printstd();
}
