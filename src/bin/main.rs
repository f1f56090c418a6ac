// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use crossbeam::channel;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transfer_engine::{AccountId, AccountStore, Context, Engine, EngineConfig, EngineError, Money};

/// Transfer Engine - replay money movements against a set of accounts
///
/// Loads opening balances, runs deposits, withdrawals and transfers on a pool
/// of worker threads, and writes the final account states to stdout.
#[derive(Parser, Debug)]
#[command(name = "transfer-engine")]
#[command(about = "Runs concurrent transfers against a set of accounts", long_about = None)]
struct Args {
    /// CSV file with opening balances
    ///
    /// Expected format: account,balance,active,frozen
    #[arg(long, value_name = "FILE")]
    accounts: PathBuf,

    /// CSV file with operations
    ///
    /// Expected format: type,from,to,amount
    /// Example: cargo run -- --accounts accounts.csv operations.csv > balances.csv
    #[arg(value_name = "FILE")]
    operations: PathBuf,

    /// Number of worker threads
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Per-operation deadline in milliseconds (overrides TRANSFER_LOCK_TIMEOUT_MS)
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// Optimistic update attempts (overrides TRANSFER_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Base retry backoff in milliseconds (overrides TRANSFER_RETRY_BACKOFF_MS)
    #[arg(long)]
    retry_backoff_ms: Option<u64>,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig, transfer_engine::ConfigError> {
        let mut config = EngineConfig::from_env()?;
        if let Some(ms) = self.lock_timeout_ms {
            config = config.with_lock_timeout(Duration::from_millis(ms));
        }
        if let Some(attempts) = self.max_attempts {
            config = config.with_max_attempts(attempts);
        }
        if let Some(ms) = self.retry_backoff_ms {
            config = config.with_retry_backoff(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "transfer_engine=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let config = match args.engine_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration: {}", e);
            process::exit(1);
        }
    };
    let engine = Engine::with_config(config);

    let accounts = match File::open(&args.accounts) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.accounts.display(), e);
            process::exit(1);
        }
    };
    if let Err(e) = load_accounts(&engine, BufReader::new(accounts)) {
        eprintln!("Error loading accounts: {}", e);
        process::exit(1);
    }

    let operations = match File::open(&args.operations) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.operations.display(), e);
            process::exit(1);
        }
    };
    let summary = match process_operations(&engine, BufReader::new(operations), args.workers) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error processing operations: {}", e);
            process::exit(1);
        }
    };
    info!(
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped,
        "operations processed"
    );

    if let Err(e) = write_accounts(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

fn default_true() -> bool {
    true
}

/// Raw CSV record of an opening balance.
#[derive(Debug, Deserialize)]
struct AccountRecord {
    account: String,
    balance: Decimal,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    frozen: bool,
}

/// Raw CSV record matching the operations format.
///
/// Fields: `type, from, to, amount`
#[derive(Debug, Deserialize)]
struct OperationRecord {
    #[serde(rename = "type")]
    op_type: String,
    from: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    to: Option<String>,
    amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Deposit { account: AccountId, amount: Money },
    Withdrawal { account: AccountId, amount: Money },
    Transfer { from: AccountId, to: AccountId, amount: Money },
}

impl OperationRecord {
    /// Converts a CSV record to an operation.
    ///
    /// Returns `None` for unknown types, malformed ids or amounts.
    fn into_operation(self) -> Option<Operation> {
        let amount = Money::from_decimal(self.amount).ok()?;
        let from: AccountId = self.from.parse().ok()?;

        match self.op_type.to_lowercase().as_str() {
            "deposit" => Some(Operation::Deposit {
                account: from,
                amount,
            }),
            "withdrawal" => Some(Operation::Withdrawal {
                account: from,
                amount,
            }),
            "transfer" => {
                let to: AccountId = self.to?.parse().ok()?;
                Some(Operation::Transfer { from, to, amount })
            }
            _ => None,
        }
    }
}

/// Opens every account listed in the reader.
///
/// # Errors
///
/// Returns the first malformed row or engine rejection; an opening balance
/// file is all or nothing.
fn load_accounts<R: Read>(
    engine: &Engine,
    reader: R,
) -> Result<usize, Box<dyn std::error::Error>> {
    let ctx = Context::background();
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .has_headers(true)
        .from_reader(reader);

    let mut opened = 0;
    for result in rdr.deserialize::<AccountRecord>() {
        let record = result?;
        let id: AccountId = record.account.parse()?;
        let balance = Money::from_decimal(record.balance)?;
        engine.open_account(&ctx, id, balance)?;
        if record.frozen {
            engine.set_frozen(&ctx, id, true)?;
        }
        if !record.active {
            engine.set_active(&ctx, id, false)?;
        }
        opened += 1;
    }
    Ok(opened)
}

/// Counts of what happened to each operation row.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Summary {
    completed: usize,
    failed: usize,
    skipped: usize,
}

fn run_operation(engine: &Engine, ctx: &Context, operation: Operation) -> Result<(), EngineError> {
    let receipt = match operation {
        Operation::Deposit { account, amount } => engine.deposit(ctx, account, amount)?,
        Operation::Withdrawal { account, amount } => engine.withdraw(ctx, account, amount)?,
        Operation::Transfer { from, to, amount } => engine.transfer(ctx, from, to, amount)?,
    };
    if receipt.is_degraded() {
        warn!(transaction_id = %receipt.transaction.id(), "operation committed without audit entry");
    }
    Ok(())
}

/// Processes operations from a CSV reader on `workers` threads.
///
/// Rows are parsed on the calling thread and handed to the workers through a
/// bounded channel. Malformed rows are skipped; failed operations are logged
/// and counted but don't stop processing.
///
/// # Errors
///
/// Returns a CSV error if the header row can't be read.
fn process_operations<R: Read>(
    engine: &Engine,
    reader: R,
    workers: usize,
) -> Result<Summary, csv::Error> {
    let workers = workers.max(1);
    let (tx, rx) = channel::bounded::<Operation>(workers * 64);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    rdr.headers()?;

    let mut summary = Summary::default();
    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                scope.spawn(move || {
                    let ctx = Context::background();
                    let mut totals = Summary::default();
                    for operation in rx {
                        match run_operation(engine, &ctx, operation) {
                            Ok(()) => totals.completed += 1,
                            Err(e) => {
                                warn!(?operation, error = %e, kind = ?e.kind(), "operation rejected");
                                totals.failed += 1;
                            }
                        }
                    }
                    totals
                })
            })
            .collect();

        for result in rdr.deserialize::<OperationRecord>() {
            match result {
                Ok(record) => match record.into_operation() {
                    Some(operation) => {
                        if tx.send(operation).is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!("Skipping invalid operation record");
                        summary.skipped += 1;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Skipping malformed row");
                    summary.skipped += 1;
                }
            }
        }
        drop(tx);

        for handle in handles {
            match handle.join() {
                Ok(totals) => {
                    summary.completed += totals.completed;
                    summary.failed += totals.failed;
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    });

    Ok(summary)
}

/// Output row of the final account states.
#[derive(Debug, Serialize)]
struct AccountRow {
    account: AccountId,
    balance: Decimal,
    available: Decimal,
    active: bool,
    frozen: bool,
    version: u64,
}

/// Write account states to a CSV writer
///
/// # CSV Format
///
/// Columns: `account, balance, available, active, frozen, version`
///
/// # Example
///
/// ```csv
/// account,balance,available,active,frozen,version
/// 1,70.00,70.00,true,false,1
/// 2,80.00,80.00,true,false,1
/// ```
fn write_accounts<W: Write>(engine: &Engine, writer: W) -> Result<(), Box<dyn std::error::Error>> {
    let mut wtr = Writer::from_writer(writer);

    for account in engine.accounts().snapshot()? {
        wtr.serialize(AccountRow {
            account: account.id(),
            balance: account.balance().to_decimal(),
            available: account.available_balance().to_decimal(),
            active: account.is_active(),
            frozen: account.is_frozen(),
            version: account.version(),
        })?;
    }

    wtr.flush()?;
    Ok(())
}
