use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "simplebank", about = "SimpleBank - transactional account ledger")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "simplebank.toml")]
    pub config: String,

    /// Storage backend (overrides config file)
    #[arg(short, long)]
    pub backend: Option<Backend>,

    /// Database path or connection string (overrides config file)
    #[arg(short, long)]
    pub url: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Open a new account
    CreateAccount {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = 0)]
        balance: i64,
        #[arg(long)]
        currency: String,
    },
    /// Show one account
    GetAccount {
        #[arg(long)]
        id: i64,
    },
    /// Print a page of accounts
    ListAccounts {
        #[arg(long, default_value_t = 10)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Move funds between two accounts
    Transfer {
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
        #[arg(long)]
        amount: i64,
        /// Abort and roll back if the transfer takes longer than this
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show one transfer
    GetTransfer {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// SQLite file path or PostgreSQL connection string.
    #[serde(default = "default_url")]
    pub url: String,

    /// How long the in-memory backend waits for an account row lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransferConfig {
    /// Allow transfers that leave the source account negative.
    #[serde(default = "default_allow_overdraft")]
    pub allow_overdraft: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        backend: default_backend(),
        url: default_url(),
        lock_timeout_ms: default_lock_timeout_ms(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_backend() -> Backend {
    Backend::Sqlite
}

fn default_url() -> String {
    "simplebank.db".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_allow_overdraft() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            allow_overdraft: default_allow_overdraft(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: default_database(),
            transfer: TransferConfig::default(),
            logging: default_logging(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(backend) = cli.backend {
            config.database.backend = backend;
        }
        if let Some(ref url) = cli.url {
            config.database.url = url.clone();
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.database.lock_timeout_ms)
    }
}
