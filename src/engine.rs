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

//! Funds-transfer engine.
//!
//! The [`Engine`] is the central component that moves money between accounts
//! and records every attempt in the ledger.
//!
//! # Operations
//!
//! - **Transfers**: pessimistic. Both accounts are held exclusively for the
//!   whole unit of work, always in ascending [`AccountId`] order so two
//!   opposite transfers over the same pair can never wait on each other.
//! - **Deposits / withdrawals / status changes**: optimistic. One account is
//!   updated through a version-checked compare-and-swap with bounded retry.
//!
//! # Unit of work
//!
//! A pending ledger record is written before any balance moves. Transfer
//! balances are staged in the account holds and published only after the
//! ledger record is marked completed; any failure before that drops the staged
//! state and marks the record failed, so readers never see a partial or
//! rolled back transfer. Audit entries are written after the commit and cannot
//! undo it.
//!
//! # Thread Safety
//!
//! `Engine` is `Send + Sync`; share it between threads with an `Arc`.

use crate::account::Account;
use crate::audit::{AuditAction, AuditError, AuditLogger, AuditSink, MemoryAuditLog};
use crate::base::{AccountId, AuditId, TransactionId};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{EngineError, StoreError};
use crate::ledger::{Ledger, MemoryLedger};
use crate::money::Money;
use crate::optimistic::{RetryPolicy, Update, update_with_retry};
use crate::store::{AccountHold, AccountStore, MemoryAccountStore};
use crate::transaction::{FailureReason, Resolution, Transaction};
use chrono::Utc;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Whether the audit entry for a committed mutation was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditStatus {
    Recorded(AuditId),
    Failed(AuditError),
}

impl From<Result<AuditId, AuditError>> for AuditStatus {
    fn from(result: Result<AuditId, AuditError>) -> Self {
        match result {
            Ok(id) => AuditStatus::Recorded(id),
            Err(err) => AuditStatus::Failed(err),
        }
    }
}

/// Outcome of a committed money movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// The ledger record, always `completed`.
    pub transaction: Transaction,
    pub audit: AuditStatus,
}

impl Receipt {
    /// The mutation is committed but its audit entry is missing.
    pub fn is_degraded(&self) -> bool {
        matches!(self.audit, AuditStatus::Failed(_))
    }
}

/// Both sides of a transfer, as written to the audit log.
#[derive(Serialize)]
struct PairSnapshot<'a> {
    source: &'a Account,
    destination: &'a Account,
}

/// Single-account balance change applied through the optimistic path.
#[derive(Debug, Clone, Copy)]
enum Adjustment {
    Credit(Money),
    Debit(Money),
}

impl Adjustment {
    fn apply(self, account: &Account) -> Result<Account, EngineError> {
        let mut next = account.clone();
        next.ensure_usable()?;
        match self {
            Adjustment::Credit(amount) => next.credit(amount)?,
            Adjustment::Debit(amount) => next.debit(amount)?,
        }
        Ok(next)
    }

    /// Undo of a committed adjustment. Skips status checks: a compensation
    /// must go through even if the account was frozen in between.
    fn revert(self, account: &Account) -> Result<Account, EngineError> {
        let mut next = account.clone();
        match self {
            Adjustment::Credit(amount) => next.debit(amount)?,
            Adjustment::Debit(amount) => next.credit(amount)?,
        }
        Ok(next)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Funds-transfer engine over pluggable account, ledger and audit backends.
///
/// # Invariants
///
/// - Money is conserved by transfers: the sum of balances never changes.
/// - No account balance or available balance ever goes negative.
/// - Every successful mutation bumps the account version by exactly one.
/// - No ledger record is left `pending` when an operation returns.
pub struct Engine<S = MemoryAccountStore, L = MemoryLedger, A = MemoryAuditLog> {
    accounts: S,
    ledger: L,
    audit: AuditLogger<A>,
    config: EngineConfig,
}

impl Engine {
    /// Creates an in-memory engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::from_parts(
            MemoryAccountStore::new(),
            MemoryLedger::new(),
            MemoryAuditLog::new(),
            config,
        )
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, L, A> Engine<S, L, A>
where
    S: AccountStore,
    L: Ledger,
    A: AuditSink,
{
    pub fn from_parts(accounts: S, ledger: L, audit: A, config: EngineConfig) -> Self {
        Self {
            accounts,
            ledger,
            audit: AuditLogger::new(audit),
            config,
        }
    }

    pub fn accounts(&self) -> &S {
        &self.accounts
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn audit_log(&self) -> &A {
        self.audit.sink()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates an active account holding `opening_balance`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidAmount`] - Opening balance is negative.
    /// - [`EngineError::DuplicateAccount`] - The id is taken.
    pub fn open_account(
        &self,
        ctx: &Context,
        id: AccountId,
        opening_balance: Money,
    ) -> Result<Account, EngineError> {
        if opening_balance.is_negative() {
            return Err(EngineError::InvalidAmount);
        }
        ctx.check()?;

        let account = Account::open(id, opening_balance);
        self.accounts.insert(account.clone())?;
        info!(account = %id, balance = %opening_balance, "account opened");

        let _ = self
            .audit
            .record(AuditAction::AccountOpened, "account", id, &None::<Account>, &account);
        Ok(account)
    }

    pub fn get_account(&self, id: AccountId) -> Result<Account, EngineError> {
        Ok(self.accounts.get_for_read(id)?)
    }

    /// Moves `amount` from `from` to `to`.
    ///
    /// # Errors
    ///
    /// | Error | Ledger record |
    /// |-------|---------------|
    /// | [`InvalidAmount`](EngineError::InvalidAmount), [`SelfTransfer`](EngineError::SelfTransfer) | none |
    /// | [`AccountNotFound`](EngineError::AccountNotFound), [`DestinationNotFound`](EngineError::DestinationNotFound) | failed |
    /// | [`AccountInactive`](EngineError::AccountInactive), [`AccountFrozen`](EngineError::AccountFrozen) | failed |
    /// | [`InsufficientBalance`](EngineError::InsufficientBalance) | failed |
    /// | [`Cancelled`](EngineError::Cancelled), [`DeadlineExceeded`](EngineError::DeadlineExceeded) | failed, reason `timeout` |
    /// | [`Store`](EngineError::Store) | failed, nothing published |
    pub fn transfer(
        &self,
        ctx: &Context,
        from: AccountId,
        to: AccountId,
        amount: Money,
    ) -> Result<Receipt, EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount);
        }
        if from == to {
            return Err(EngineError::SelfTransfer);
        }
        ctx.check()?;

        let started = Instant::now();
        let pending = Transaction::transfer(from, to, amount);
        let id = pending.id();
        self.ledger.append(pending)?;

        let ctx = match ctx.deadline() {
            Some(_) => ctx.clone(),
            None => ctx.bounded(self.config.lock_timeout),
        };

        match self.run_transfer(&ctx, id, from, to, amount, started) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                warn!(transaction_id = %id, from = %from, to = %to, error = %err, "transfer failed");
                self.mark_failed(id, FailureReason::from_error(&err), started);
                Err(err)
            }
        }
    }

    fn run_transfer(
        &self,
        ctx: &Context,
        id: TransactionId,
        from: AccountId,
        to: AccountId,
        amount: Money,
        started: Instant,
    ) -> Result<Receipt, EngineError> {
        // Fixed lock order: lower id first, whatever the direction.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let first_hold = self.acquire(ctx, first, from)?;
        let second_hold = self.acquire(ctx, second, from)?;
        let (mut source, mut destination) = if first == from {
            (first_hold, second_hold)
        } else {
            (second_hold, first_hold)
        };
        ctx.check()?;

        let source_before = source.account().clone();
        let destination_before = destination.account().clone();
        source_before.ensure_usable()?;
        destination_before.ensure_usable()?;

        let mut source_after = source_before.clone();
        source_after.debit(amount)?;
        source_after.bump_version();
        let mut destination_after = destination_before.clone();
        destination_after.credit(amount)?;
        destination_after.bump_version();

        // Staged only: nothing is visible until the commit below, and the
        // holds discard their staged state on every early return.
        self.accounts.save(&mut source, source_after.clone())?;
        self.accounts.save(&mut destination, destination_after.clone())?;

        // A cancellation that lands mid-unit still aborts the commit.
        ctx.check()?;
        let transaction = self
            .ledger
            .resolve(id, Resolution::Completed, elapsed_ms(started))?;
        self.accounts.commit(&[&source, &destination]);

        info!(
            transaction_id = %id,
            from = %from,
            to = %to,
            amount = %amount,
            processing_time_ms = transaction.processing_time_ms().unwrap_or_default(),
            "transfer completed"
        );

        let audit = AuditStatus::from(self.audit.record(
            AuditAction::TransferExecuted,
            "transaction",
            id,
            &PairSnapshot {
                source: &source_before,
                destination: &destination_before,
            },
            &PairSnapshot {
                source: &source_after,
                destination: &destination_after,
            },
        ));

        drop(destination);
        drop(source);
        Ok(Receipt { transaction, audit })
    }

    /// Takes an exclusive hold, naming a missing non-source account as the
    /// destination.
    fn acquire(
        &self,
        ctx: &Context,
        id: AccountId,
        source: AccountId,
    ) -> Result<S::Hold, EngineError> {
        debug!(account = %id, "waiting for exclusive hold");
        self.accounts
            .get_for_exclusive_use(id, ctx)
            .map_err(|err| match err {
                StoreError::AccountNotFound(missing) if missing != source => {
                    EngineError::DestinationNotFound(missing)
                }
                other => other.into(),
            })
    }

    fn mark_failed(&self, id: TransactionId, reason: FailureReason, started: Instant) {
        if let Err(err) = self
            .ledger
            .resolve(id, Resolution::Failed(reason), elapsed_ms(started))
        {
            error!(transaction_id = %id, reason = %reason, error = %err, "could not mark transaction failed");
        }
    }

    /// Credits `amount` to `account` through the optimistic path.
    pub fn deposit(
        &self,
        ctx: &Context,
        account: AccountId,
        amount: Money,
    ) -> Result<Receipt, EngineError> {
        self.adjust(
            ctx,
            Transaction::deposit(account, amount),
            Adjustment::Credit(amount),
            AuditAction::DepositExecuted,
        )
    }

    /// Debits `amount` from `account` through the optimistic path.
    pub fn withdraw(
        &self,
        ctx: &Context,
        account: AccountId,
        amount: Money,
    ) -> Result<Receipt, EngineError> {
        self.adjust(
            ctx,
            Transaction::withdrawal(account, amount),
            Adjustment::Debit(amount),
            AuditAction::WithdrawalExecuted,
        )
    }

    fn adjust(
        &self,
        ctx: &Context,
        pending: Transaction,
        adjustment: Adjustment,
        action: AuditAction,
    ) -> Result<Receipt, EngineError> {
        if !pending.amount().is_positive() {
            return Err(EngineError::InvalidAmount);
        }
        ctx.check()?;

        let started = Instant::now();
        let id = pending.id();
        let account = pending.source_account_id();
        self.ledger.append(pending)?;

        let update = match update_with_retry(&self.accounts, ctx, account, self.retry_policy(), |a| {
            adjustment.apply(a)
        }) {
            Ok(update) => update,
            Err(err) => {
                warn!(transaction_id = %id, account = %account, error = %err, "balance adjustment failed");
                self.mark_failed(id, FailureReason::from_error(&err), started);
                return Err(err);
            }
        };

        let transaction = match self.ledger.resolve(id, Resolution::Completed, elapsed_ms(started)) {
            Ok(transaction) => transaction,
            Err(err) => {
                self.compensate(account, adjustment);
                let err = EngineError::from(err);
                self.mark_failed(id, FailureReason::from_error(&err), started);
                return Err(err);
            }
        };

        info!(
            transaction_id = %id,
            account = %account,
            kind = ?transaction.kind(),
            amount = %transaction.amount(),
            attempts = update.attempts,
            "balance adjustment completed"
        );

        let Update { before, after, .. } = update;
        let audit = AuditStatus::from(self.audit.record(action, "transaction", id, &before, &after));
        Ok(Receipt { transaction, audit })
    }

    /// Reverses a committed adjustment whose ledger commit failed.
    ///
    /// The reversal is itself a business operation: if the deposited funds
    /// were spent in the meantime the debit is refused, the balance keeps the
    /// deposit and its record says `failed`. That is logged at error for
    /// manual reconciliation.
    fn compensate(&self, account: AccountId, adjustment: Adjustment) {
        // Compensation ignores the caller's deadline: it must not be cut short.
        let result = update_with_retry(
            &self.accounts,
            &Context::background(),
            account,
            self.retry_policy(),
            |a| adjustment.revert(a),
        );
        if let Err(err) = result {
            error!(account = %account, error = %err, "compensation failed, account needs reconciliation");
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    /// Freezes or unfreezes an account.
    pub fn set_frozen(
        &self,
        ctx: &Context,
        id: AccountId,
        frozen: bool,
    ) -> Result<Account, EngineError> {
        let action = if frozen {
            AuditAction::AccountFrozen
        } else {
            AuditAction::AccountUnfrozen
        };
        self.change_status(ctx, id, action, |a| a.is_frozen() == frozen, |a| {
            a.set_frozen(frozen)
        })
    }

    /// Activates or deactivates an account.
    pub fn set_active(
        &self,
        ctx: &Context,
        id: AccountId,
        active: bool,
    ) -> Result<Account, EngineError> {
        let action = if active {
            AuditAction::AccountActivated
        } else {
            AuditAction::AccountDeactivated
        };
        self.change_status(ctx, id, action, |a| a.is_active() == active, |a| {
            a.set_active(active)
        })
    }

    fn change_status<P, M>(
        &self,
        ctx: &Context,
        id: AccountId,
        action: AuditAction,
        already: P,
        mutate: M,
    ) -> Result<Account, EngineError>
    where
        P: Fn(&Account) -> bool,
        M: Fn(&mut Account),
    {
        ctx.check()?;
        let current = self.accounts.get_for_read(id)?;
        if already(&current) {
            return Ok(current);
        }

        let update = update_with_retry(&self.accounts, ctx, id, self.retry_policy(), |a| {
            let mut next = a.clone();
            mutate(&mut next);
            Ok(next)
        })?;
        info!(account = %id, action = %action, "account status changed");

        let _ = self
            .audit
            .record(action, "account", id, &update.before, &update.after);
        Ok(update.after)
    }

    /// Returns one ledger record. Terminal records never change.
    pub fn get_transaction(&self, id: TransactionId) -> Result<Transaction, EngineError> {
        Ok(self.ledger.get(id)?)
    }

    /// Records touching `account`, newest first, plus the total count.
    pub fn list_transactions(
        &self,
        account: AccountId,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Transaction>, usize), EngineError> {
        Ok(self.ledger.list_for_account(account, offset, limit)?)
    }

    /// Fails every `pending` record older than `older_than` with reason
    /// `abandoned` and returns their ids.
    ///
    /// A pending record outliving its operation means the process stopped
    /// between writing the record and resolving it. Records younger than the
    /// configured lock timeout are never touched; their operation may still
    /// be running.
    pub fn reconcile_pending(&self, older_than: Duration) -> Result<Vec<TransactionId>, EngineError> {
        let older_than = older_than.max(self.config.lock_timeout);
        let Ok(threshold) = chrono::Duration::from_std(older_than) else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let mut abandoned = Vec::new();

        for transaction in self.ledger.pending()? {
            let age = now.signed_duration_since(transaction.created_at());
            if age < threshold {
                continue;
            }
            let age_ms = u64::try_from(age.num_milliseconds()).unwrap_or_default();
            match self
                .ledger
                .resolve(transaction.id(), Resolution::Failed(FailureReason::Abandoned), age_ms)
            {
                Ok(_) => {
                    warn!(transaction_id = %transaction.id(), age_ms, "pending transaction abandoned");
                    abandoned.push(transaction.id());
                }
                // Resolved by its own operation in the meantime.
                Err(StoreError::TransactionFinalized(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(abandoned)
    }
}
