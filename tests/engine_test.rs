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

//! Engine public API integration tests.

use rust_decimal_macros::dec;
use std::thread;
use std::time::Duration;
use transfer_engine::{
    Account, AccountHold, AccountId, AccountStore, AuditAction, AuditError, AuditLogEntry,
    AuditSink, AuditStatus, Canceller, Context, Engine, EngineConfig, EngineError, ErrorKind,
    FailureReason, Ledger, MemoryAccountStore, MemoryAuditLog, MemoryHold, MemoryLedger, Money,
    Resolution, StoreError, Transaction, TransactionId, TransactionStatus, TransactionType,
};

fn money(amount: rust_decimal::Decimal) -> Money {
    Money::from_decimal(amount).unwrap()
}

/// Engine with account 1 holding 100.00 and account 2 holding 50.00.
fn setup() -> Engine {
    let engine = Engine::new();
    let ctx = Context::background();
    engine.open_account(&ctx, AccountId(1), money(dec!(100.00))).unwrap();
    engine.open_account(&ctx, AccountId(2), money(dec!(50.00))).unwrap();
    engine
}

fn balance<S: AccountStore, L: Ledger, A: AuditSink>(engine: &Engine<S, L, A>, id: u64) -> Money {
    engine.get_account(AccountId(id)).unwrap().balance()
}

/// The only record touching `id`.
fn only_record<S: AccountStore, L: Ledger, A: AuditSink>(
    engine: &Engine<S, L, A>,
    id: u64,
) -> Transaction {
    let (records, total) = engine.list_transactions(AccountId(id), 0, 10).unwrap();
    assert_eq!(total, 1);
    records.into_iter().next().unwrap()
}

// =============================================================================
// Transfers
// =============================================================================

#[test]
fn transfer_moves_money_and_bumps_versions() {
    let engine = setup();
    let receipt = engine
        .transfer(&Context::background(), AccountId(1), AccountId(2), money(dec!(30.00)))
        .unwrap();

    assert_eq!(receipt.transaction.status(), TransactionStatus::Completed);
    assert_eq!(receipt.transaction.kind(), TransactionType::Transfer);
    assert!(receipt.transaction.completed_at().is_some());
    assert!(receipt.transaction.processing_time_ms().is_some());
    assert!(!receipt.is_degraded());

    let source = engine.get_account(AccountId(1)).unwrap();
    let destination = engine.get_account(AccountId(2)).unwrap();
    assert_eq!(source.balance(), money(dec!(70.00)));
    assert_eq!(source.available_balance(), money(dec!(70.00)));
    assert_eq!(destination.balance(), money(dec!(80.00)));
    assert_eq!(source.version(), 1);
    assert_eq!(destination.version(), 1);
}

#[test]
fn transfer_exact_balance_empties_source() {
    let engine = setup();
    engine
        .transfer(&Context::background(), AccountId(2), AccountId(1), money(dec!(50.00)))
        .unwrap();

    assert_eq!(balance(&engine, 2), Money::ZERO);
    assert_eq!(balance(&engine, 1), money(dec!(150.00)));
}

#[test]
fn insufficient_balance_leaves_accounts_untouched() {
    let engine = setup();
    let result = engine.transfer(
        &Context::background(),
        AccountId(2),
        AccountId(1),
        money(dec!(60.00)),
    );

    assert_eq!(
        result,
        Err(EngineError::InsufficientBalance {
            account: AccountId(2),
            required: money(dec!(60.00)),
            available: money(dec!(50.00)),
        })
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::BusinessRule);

    let source = engine.get_account(AccountId(2)).unwrap();
    assert_eq!(source.balance(), money(dec!(50.00)));
    assert_eq!(source.version(), 0);
    assert_eq!(engine.get_account(AccountId(1)).unwrap().version(), 0);

    let record = only_record(&engine, 2);
    assert_eq!(record.status(), TransactionStatus::Failed);
    assert_eq!(record.failure_reason(), Some(FailureReason::InsufficientBalance));
    assert_eq!(record.failure_reason().unwrap().as_str(), "insufficient balance");
}

#[test]
fn frozen_destination_rejects_transfer() {
    let engine = setup();
    let ctx = Context::background();
    engine.set_frozen(&ctx, AccountId(2), true).unwrap();

    let result = engine.transfer(&ctx, AccountId(1), AccountId(2), money(dec!(10.00)));
    assert_eq!(result, Err(EngineError::AccountFrozen(AccountId(2))));
    assert_eq!(balance(&engine, 1), money(dec!(100.00)));
    assert_eq!(balance(&engine, 2), money(dec!(50.00)));

    let record = only_record(&engine, 1);
    assert_eq!(record.failure_reason(), Some(FailureReason::AccountFrozen));
}

#[test]
fn inactive_source_rejects_transfer() {
    let engine = setup();
    let ctx = Context::background();
    engine.set_active(&ctx, AccountId(1), false).unwrap();

    let result = engine.transfer(&ctx, AccountId(1), AccountId(2), money(dec!(10.00)));
    assert_eq!(result, Err(EngineError::AccountInactive(AccountId(1))));
    assert_eq!(
        only_record(&engine, 1).failure_reason(),
        Some(FailureReason::AccountInactive)
    );
}

#[test]
fn inactive_is_reported_before_frozen() {
    let engine = setup();
    let ctx = Context::background();
    engine.set_frozen(&ctx, AccountId(1), true).unwrap();
    engine.set_active(&ctx, AccountId(1), false).unwrap();

    let result = engine.transfer(&ctx, AccountId(1), AccountId(2), money(dec!(1.00)));
    assert_eq!(result, Err(EngineError::AccountInactive(AccountId(1))));
}

#[test]
fn missing_destination_is_named() {
    let engine = setup();
    let result = engine.transfer(
        &Context::background(),
        AccountId(1),
        AccountId(99),
        money(dec!(1.00)),
    );

    assert_eq!(result, Err(EngineError::DestinationNotFound(AccountId(99))));
    assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        only_record(&engine, 1).failure_reason(),
        Some(FailureReason::DestinationNotFound)
    );
    assert_eq!(balance(&engine, 1), money(dec!(100.00)));
}

#[test]
fn missing_source_is_named() {
    let engine = setup();
    let result = engine.transfer(
        &Context::background(),
        AccountId(99),
        AccountId(1),
        money(dec!(1.00)),
    );

    assert_eq!(result, Err(EngineError::AccountNotFound(AccountId(99))));
    assert_eq!(
        only_record(&engine, 1).failure_reason(),
        Some(FailureReason::SourceNotFound)
    );
}

#[test]
fn validation_errors_write_no_record() {
    let engine = setup();
    let ctx = Context::background();

    assert_eq!(
        engine.transfer(&ctx, AccountId(1), AccountId(2), Money::ZERO),
        Err(EngineError::InvalidAmount)
    );
    assert_eq!(
        engine.transfer(&ctx, AccountId(1), AccountId(2), Money::from_minor(-100)),
        Err(EngineError::InvalidAmount)
    );
    let self_transfer = engine.transfer(&ctx, AccountId(1), AccountId(1), money(dec!(1.00)));
    assert_eq!(self_transfer, Err(EngineError::SelfTransfer));
    assert_eq!(self_transfer.unwrap_err().kind(), ErrorKind::Validation);

    assert!(engine.ledger().is_empty());
    assert_eq!(engine.get_account(AccountId(1)).unwrap().version(), 0);
}

#[test]
fn cancelled_context_fails_before_any_record() {
    let engine = setup();
    let ctx = Context::background();
    ctx.cancel();

    let result = engine.transfer(&ctx, AccountId(1), AccountId(2), money(dec!(1.00)));
    assert_eq!(result, Err(EngineError::Cancelled));
    assert!(engine.ledger().is_empty());
}

#[test]
fn held_account_times_out_then_succeeds() {
    let engine = setup();
    let hold = engine
        .accounts()
        .get_for_exclusive_use(AccountId(2), &Context::background())
        .unwrap();

    let result = engine.transfer(
        &Context::with_timeout(Duration::from_millis(50)),
        AccountId(1),
        AccountId(2),
        money(dec!(10.00)),
    );
    assert_eq!(result, Err(EngineError::DeadlineExceeded));
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    assert_eq!(
        only_record(&engine, 1).failure_reason(),
        Some(FailureReason::Timeout)
    );
    assert_eq!(balance(&engine, 1), money(dec!(100.00)));

    drop(hold);
    engine
        .transfer(
            &Context::with_timeout(Duration::from_secs(1)),
            AccountId(1),
            AccountId(2),
            money(dec!(10.00)),
        )
        .unwrap();
    assert_eq!(balance(&engine, 1), money(dec!(90.00)));
}

#[test]
fn lock_timeout_bounds_contexts_without_deadline() {
    let config = EngineConfig::default().with_lock_timeout(Duration::from_millis(50));
    let engine = Engine::with_config(config);
    let ctx = Context::background();
    engine.open_account(&ctx, AccountId(1), money(dec!(10.00))).unwrap();
    engine.open_account(&ctx, AccountId(2), Money::ZERO).unwrap();

    let _hold = engine
        .accounts()
        .get_for_exclusive_use(AccountId(1), &ctx)
        .unwrap();
    let result = engine.transfer(&ctx, AccountId(1), AccountId(2), money(dec!(1.00)));
    assert_eq!(result, Err(EngineError::DeadlineExceeded));
}

// =============================================================================
// Deposits, withdrawals and status changes
// =============================================================================

#[test]
fn deposit_and_withdraw() {
    let engine = setup();
    let ctx = Context::background();

    let receipt = engine.deposit(&ctx, AccountId(1), money(dec!(25.50))).unwrap();
    assert_eq!(receipt.transaction.kind(), TransactionType::Deposit);
    assert_eq!(receipt.transaction.destination_account_id(), None);
    assert_eq!(balance(&engine, 1), money(dec!(125.50)));

    let receipt = engine.withdraw(&ctx, AccountId(1), money(dec!(0.50))).unwrap();
    assert_eq!(receipt.transaction.kind(), TransactionType::Withdrawal);
    assert_eq!(balance(&engine, 1), money(dec!(125.00)));
    assert_eq!(engine.get_account(AccountId(1)).unwrap().version(), 2);
}

#[test]
fn withdraw_more_than_balance_fails() {
    let engine = setup();
    let result = engine.withdraw(&Context::background(), AccountId(2), money(dec!(50.01)));

    assert!(matches!(result, Err(EngineError::InsufficientBalance { .. })));
    assert_eq!(balance(&engine, 2), money(dec!(50.00)));
    assert_eq!(only_record(&engine, 2).status(), TransactionStatus::Failed);
}

#[test]
fn deposit_into_frozen_account_fails() {
    let engine = setup();
    let ctx = Context::background();
    engine.set_frozen(&ctx, AccountId(1), true).unwrap();

    let result = engine.deposit(&ctx, AccountId(1), money(dec!(1.00)));
    assert_eq!(result, Err(EngineError::AccountFrozen(AccountId(1))));

    engine.set_frozen(&ctx, AccountId(1), false).unwrap();
    engine.deposit(&ctx, AccountId(1), money(dec!(1.00))).unwrap();
    assert_eq!(balance(&engine, 1), money(dec!(101.00)));
}

#[test]
fn deposit_to_unknown_account() {
    let engine = setup();
    let result = engine.deposit(&Context::background(), AccountId(7), money(dec!(1.00)));
    assert_eq!(result, Err(EngineError::AccountNotFound(AccountId(7))));
}

#[test]
fn status_change_to_current_state_is_a_no_op() {
    let engine = setup();
    let ctx = Context::background();

    let account = engine.set_frozen(&ctx, AccountId(1), false).unwrap();
    assert_eq!(account.version(), 0);
    let account = engine.set_frozen(&ctx, AccountId(1), true).unwrap();
    assert!(account.is_frozen());
    assert_eq!(account.version(), 1);
}

#[test]
fn open_account_rules() {
    let engine = setup();
    let ctx = Context::background();

    assert_eq!(
        engine.open_account(&ctx, AccountId(1), Money::ZERO),
        Err(EngineError::DuplicateAccount(AccountId(1)))
    );
    assert_eq!(
        engine.open_account(&ctx, AccountId(3), Money::from_minor(-1)),
        Err(EngineError::InvalidAmount)
    );
    let account = engine.open_account(&ctx, AccountId(3), Money::ZERO).unwrap();
    assert!(account.is_active());
    assert!(!account.is_frozen());
    assert_eq!(account.version(), 0);
}

// =============================================================================
// Ledger queries
// =============================================================================

#[test]
fn get_transaction_is_stable() {
    let engine = setup();
    let receipt = engine
        .transfer(&Context::background(), AccountId(1), AccountId(2), money(dec!(5.00)))
        .unwrap();

    let first = engine.get_transaction(receipt.transaction.id()).unwrap();
    let second = engine.get_transaction(receipt.transaction.id()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, receipt.transaction);
}

#[test]
fn unknown_transaction_is_not_found() {
    let engine = setup();
    let id = TransactionId::generate();
    assert_eq!(
        engine.get_transaction(id),
        Err(EngineError::TransactionNotFound(id))
    );
}

#[test]
fn list_transactions_is_newest_first_and_paged() {
    let engine = setup();
    let ctx = Context::background();
    let mut ids = Vec::new();
    for _ in 0..5 {
        let receipt = engine
            .transfer(&ctx, AccountId(1), AccountId(2), money(dec!(1.00)))
            .unwrap();
        ids.push(receipt.transaction.id());
    }

    let (page, total) = engine.list_transactions(AccountId(2), 0, 2).unwrap();
    assert_eq!(total, 5);
    assert_eq!(
        page.iter().map(Transaction::id).collect::<Vec<_>>(),
        vec![ids[4], ids[3]]
    );

    let (page, _) = engine.list_transactions(AccountId(2), 4, 2).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id(), ids[0]);

    let (page, total) = engine.list_transactions(AccountId(9), 0, 10).unwrap();
    assert!(page.is_empty());
    assert_eq!(total, 0);
}

#[test]
fn reconcile_fails_stale_pending_records() {
    let config = EngineConfig::default().with_lock_timeout(Duration::from_millis(30));
    let engine = Engine::with_config(config);
    let stale = Transaction::transfer(AccountId(1), AccountId(2), money(dec!(1.00)));
    let stale_id = stale.id();
    engine.ledger().append(stale).unwrap();

    // Younger than the lock timeout: its operation may still be running.
    assert!(engine.reconcile_pending(Duration::ZERO).unwrap().is_empty());

    thread::sleep(Duration::from_millis(50));
    assert!(engine.reconcile_pending(Duration::from_secs(3600)).unwrap().is_empty());

    let abandoned = engine.reconcile_pending(Duration::ZERO).unwrap();
    assert_eq!(abandoned, vec![stale_id]);
    let record = engine.get_transaction(stale_id).unwrap();
    assert_eq!(record.status(), TransactionStatus::Failed);
    assert_eq!(record.failure_reason(), Some(FailureReason::Abandoned));

    assert!(engine.reconcile_pending(Duration::ZERO).unwrap().is_empty());
}

#[test]
fn reconcile_leaves_in_flight_records_alone() {
    let engine = stalled_engine(Duration::from_millis(200));

    thread::scope(|s| {
        let deposit = s.spawn(|| {
            engine.deposit(&Context::background(), AccountId(1), money(dec!(5.00)))
        });
        thread::sleep(Duration::from_millis(50));
        assert!(engine.reconcile_pending(Duration::ZERO).unwrap().is_empty());
        assert!(deposit.join().unwrap().is_err());
    });

    let record = only_record(&engine, 1);
    assert_eq!(record.failure_reason(), Some(FailureReason::StoreFailure));
    assert_eq!(balance(&engine, 1), money(dec!(100.00)));
}

// =============================================================================
// Audit
// =============================================================================

#[test]
fn committed_operations_are_audited() {
    let engine = setup();
    let ctx = Context::background();
    let receipt = engine
        .transfer(&ctx, AccountId(1), AccountId(2), money(dec!(30.00)))
        .unwrap();
    let AuditStatus::Recorded(audit_id) = receipt.audit.clone() else {
        panic!("expected recorded audit");
    };

    let tx_id = receipt.transaction.id().to_string();
    let entries = engine.audit_log().entries_for(&tx_id);
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.id, audit_id);
    assert_eq!(entry.action, AuditAction::TransferExecuted.as_str());
    assert_eq!(entry.resource_type, "transaction");
    assert_eq!(entry.before_value["source"]["version"], 0);
    assert_eq!(entry.after_value["source"]["version"], 1);
    assert_eq!(entry.after_value["destination"]["version"], 1);

    // Two openings plus the transfer.
    assert_eq!(engine.audit_log().len(), 3);
    let opened = engine.audit_log().entries_for("1");
    assert_eq!(opened[0].action, "account.opened");
}

#[test]
fn failed_operations_are_not_audited() {
    let engine = setup();
    let before = engine.audit_log().len();
    let _ = engine.transfer(
        &Context::background(),
        AccountId(2),
        AccountId(1),
        money(dec!(500.00)),
    );
    assert_eq!(engine.audit_log().len(), before);
}

/// Audit sink that rejects every entry.
struct DownSink;

impl AuditSink for DownSink {
    fn append(&self, _entry: AuditLogEntry) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("disk full".into()))
    }
}

#[test]
fn audit_failure_degrades_but_keeps_the_commit() {
    let engine = Engine::from_parts(
        MemoryAccountStore::new(),
        MemoryLedger::new(),
        DownSink,
        EngineConfig::default(),
    );
    let ctx = Context::background();
    engine.open_account(&ctx, AccountId(1), money(dec!(10.00))).unwrap();
    engine.open_account(&ctx, AccountId(2), Money::ZERO).unwrap();

    let receipt = engine
        .transfer(&ctx, AccountId(1), AccountId(2), money(dec!(4.00)))
        .unwrap();
    assert!(receipt.is_degraded());
    assert_eq!(
        receipt.audit,
        AuditStatus::Failed(AuditError::Unavailable("disk full".into()))
    );
    assert_eq!(receipt.transaction.status(), TransactionStatus::Completed);
    assert_eq!(balance(&engine, 2), money(dec!(4.00)));

    let receipt = engine.deposit(&ctx, AccountId(2), money(dec!(1.00))).unwrap();
    assert!(receipt.is_degraded());
}

// =============================================================================
// Atomicity under store failure
// =============================================================================

/// Store that refuses writes to one account.
struct FlakyStore {
    inner: MemoryAccountStore,
    broken: AccountId,
}

impl AccountStore for FlakyStore {
    type Hold = MemoryHold;

    fn insert(&self, account: Account) -> Result<(), StoreError> {
        self.inner.insert(account)
    }

    fn get_for_read(&self, id: AccountId) -> Result<Account, StoreError> {
        self.inner.get_for_read(id)
    }

    fn get_for_exclusive_use(&self, id: AccountId, ctx: &Context) -> Result<MemoryHold, StoreError> {
        self.inner.get_for_exclusive_use(id, ctx)
    }

    fn save(&self, hold: &mut MemoryHold, account: Account) -> Result<(), StoreError> {
        if hold.account().id() == self.broken && account.version() > hold.account().version() {
            return Err(StoreError::Unavailable("write rejected".into()));
        }
        self.inner.save(hold, account)
    }

    fn commit(&self, holds: &[&MemoryHold]) {
        self.inner.commit(holds)
    }

    fn compare_and_swap<F>(
        &self,
        id: AccountId,
        expected_version: u64,
        mutator: F,
    ) -> Result<Account, StoreError>
    where
        F: FnOnce(&mut Account),
    {
        self.inner.compare_and_swap(id, expected_version, mutator)
    }

    fn snapshot(&self) -> Result<Vec<Account>, StoreError> {
        self.inner.snapshot()
    }
}

fn flaky_engine(broken: u64) -> Engine<FlakyStore, MemoryLedger, MemoryAuditLog> {
    let engine = Engine::from_parts(
        FlakyStore {
            inner: MemoryAccountStore::new(),
            broken: AccountId(broken),
        },
        MemoryLedger::new(),
        MemoryAuditLog::new(),
        EngineConfig::default(),
    );
    let ctx = Context::background();
    engine.open_account(&ctx, AccountId(1), money(dec!(100.00))).unwrap();
    engine.open_account(&ctx, AccountId(2), money(dec!(50.00))).unwrap();
    engine
}

#[test]
fn failed_destination_write_discards_staged_source() {
    let engine = flaky_engine(2);
    let result = engine.transfer(
        &Context::background(),
        AccountId(1),
        AccountId(2),
        money(dec!(30.00)),
    );

    assert!(matches!(result, Err(EngineError::Store(StoreError::Unavailable(_)))));
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Infrastructure);

    let source = engine.get_account(AccountId(1)).unwrap();
    assert_eq!(source.balance(), money(dec!(100.00)));
    assert_eq!(source.version(), 0);
    assert_eq!(balance(&engine, 2), money(dec!(50.00)));
    assert_eq!(
        only_record(&engine, 1).failure_reason(),
        Some(FailureReason::StoreFailure)
    );
}

#[test]
fn failed_source_write_changes_nothing() {
    let engine = flaky_engine(1);
    let result = engine.transfer(
        &Context::background(),
        AccountId(1),
        AccountId(2),
        money(dec!(30.00)),
    );

    assert!(result.is_err());
    assert_eq!(balance(&engine, 1), money(dec!(100.00)));
    assert_eq!(balance(&engine, 2), money(dec!(50.00)));
    assert_eq!(engine.audit_log().len(), 2);
}

// =============================================================================
// Ledger failures and cancellation inside the unit of work
// =============================================================================

/// Ledger that cannot complete records. Failing a record still works.
struct StalledLedger {
    inner: MemoryLedger,
    delay: Duration,
}

impl StalledLedger {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryLedger::new(),
            delay,
        }
    }
}

impl Ledger for StalledLedger {
    fn append(&self, transaction: Transaction) -> Result<(), StoreError> {
        self.inner.append(transaction)
    }

    fn resolve(
        &self,
        id: TransactionId,
        resolution: Resolution,
        processing_time_ms: u64,
    ) -> Result<Transaction, StoreError> {
        if resolution == Resolution::Completed {
            thread::sleep(self.delay);
            return Err(StoreError::Unavailable("ledger offline".into()));
        }
        self.inner.resolve(id, resolution, processing_time_ms)
    }

    fn get(&self, id: TransactionId) -> Result<Transaction, StoreError> {
        self.inner.get(id)
    }

    fn list_for_account(
        &self,
        account: AccountId,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Transaction>, usize), StoreError> {
        self.inner.list_for_account(account, offset, limit)
    }

    fn pending(&self) -> Result<Vec<Transaction>, StoreError> {
        self.inner.pending()
    }
}

fn stalled_engine(delay: Duration) -> Engine<MemoryAccountStore, StalledLedger, MemoryAuditLog> {
    let engine = Engine::from_parts(
        MemoryAccountStore::new(),
        StalledLedger::new(delay),
        MemoryAuditLog::new(),
        EngineConfig::default(),
    );
    let ctx = Context::background();
    engine.open_account(&ctx, AccountId(1), money(dec!(100.00))).unwrap();
    engine.open_account(&ctx, AccountId(2), money(dec!(50.00))).unwrap();
    engine
}

#[test]
fn readers_never_see_an_uncommitted_transfer() {
    let engine = stalled_engine(Duration::from_millis(200));

    thread::scope(|s| {
        let transfer = s.spawn(|| {
            engine.transfer(
                &Context::background(),
                AccountId(1),
                AccountId(2),
                money(dec!(30.00)),
            )
        });

        // The transfer is now stuck completing its ledger record.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(balance(&engine, 1), money(dec!(100.00)));
        assert_eq!(balance(&engine, 2), money(dec!(50.00)));
        let total: Money = engine
            .accounts()
            .snapshot()
            .unwrap()
            .iter()
            .map(|a| a.balance())
            .sum();
        assert_eq!(total, money(dec!(150.00)));

        let result = transfer.join().unwrap();
        assert!(matches!(result, Err(EngineError::Store(StoreError::Unavailable(_)))));
    });

    let source = engine.get_account(AccountId(1)).unwrap();
    assert_eq!(source.balance(), money(dec!(100.00)));
    assert_eq!(source.version(), 0);
    assert_eq!(engine.get_account(AccountId(2)).unwrap().version(), 0);
    assert_eq!(
        only_record(&engine, 1).failure_reason(),
        Some(FailureReason::StoreFailure)
    );
}

#[test]
fn failed_ledger_commit_reverts_deposit() {
    let engine = stalled_engine(Duration::ZERO);
    let result = engine.deposit(&Context::background(), AccountId(1), money(dec!(10.00)));

    assert!(matches!(result, Err(EngineError::Store(StoreError::Unavailable(_)))));
    let account = engine.get_account(AccountId(1)).unwrap();
    assert_eq!(account.balance(), money(dec!(100.00)));
    // Applied, then compensated.
    assert_eq!(account.version(), 2);
    let record = only_record(&engine, 1);
    assert_eq!(record.status(), TransactionStatus::Failed);
    assert_eq!(record.failure_reason(), Some(FailureReason::StoreFailure));
}

#[test]
fn failed_ledger_commit_reverts_withdrawal() {
    let engine = stalled_engine(Duration::ZERO);
    let result = engine.withdraw(&Context::background(), AccountId(2), money(dec!(50.00)));

    assert!(result.is_err());
    assert_eq!(balance(&engine, 2), money(dec!(50.00)));
    assert_eq!(only_record(&engine, 2).status(), TransactionStatus::Failed);
}

/// Store that cancels the caller's context as soon as a write is staged.
struct CancellingStore {
    inner: MemoryAccountStore,
    canceller: Canceller,
}

impl AccountStore for CancellingStore {
    type Hold = MemoryHold;

    fn insert(&self, account: Account) -> Result<(), StoreError> {
        self.inner.insert(account)
    }

    fn get_for_read(&self, id: AccountId) -> Result<Account, StoreError> {
        self.inner.get_for_read(id)
    }

    fn get_for_exclusive_use(&self, id: AccountId, ctx: &Context) -> Result<MemoryHold, StoreError> {
        self.inner.get_for_exclusive_use(id, ctx)
    }

    fn save(&self, hold: &mut MemoryHold, account: Account) -> Result<(), StoreError> {
        self.canceller.cancel();
        self.inner.save(hold, account)
    }

    fn commit(&self, holds: &[&MemoryHold]) {
        self.inner.commit(holds)
    }

    fn compare_and_swap<F>(
        &self,
        id: AccountId,
        expected_version: u64,
        mutator: F,
    ) -> Result<Account, StoreError>
    where
        F: FnOnce(&mut Account),
    {
        self.inner.compare_and_swap(id, expected_version, mutator)
    }

    fn snapshot(&self) -> Result<Vec<Account>, StoreError> {
        self.inner.snapshot()
    }
}

#[test]
fn cancellation_after_locking_aborts_the_commit() {
    let ctx = Context::background();
    let engine = Engine::from_parts(
        CancellingStore {
            inner: MemoryAccountStore::new(),
            canceller: ctx.canceller(),
        },
        MemoryLedger::new(),
        MemoryAuditLog::new(),
        EngineConfig::default(),
    );
    let setup_ctx = Context::background();
    engine.open_account(&setup_ctx, AccountId(1), money(dec!(100.00))).unwrap();
    engine.open_account(&setup_ctx, AccountId(2), money(dec!(50.00))).unwrap();

    let result = engine.transfer(&ctx, AccountId(1), AccountId(2), money(dec!(30.00)));
    assert_eq!(result, Err(EngineError::Cancelled));

    assert_eq!(balance(&engine, 1), money(dec!(100.00)));
    assert_eq!(balance(&engine, 2), money(dec!(50.00)));
    assert_eq!(engine.get_account(AccountId(1)).unwrap().version(), 0);
    let record = only_record(&engine, 1);
    assert_eq!(record.status(), TransactionStatus::Failed);
    assert_eq!(record.failure_reason(), Some(FailureReason::Timeout));
    assert_eq!(engine.audit_log().len(), 2);
}

#[test]
fn cancel_from_another_thread_stops_a_waiting_transfer() {
    let engine = setup();
    let hold = engine
        .accounts()
        .get_for_exclusive_use(AccountId(2), &Context::background())
        .unwrap();
    let ctx = Context::background();
    let canceller = ctx.canceller();

    thread::scope(|s| {
        s.spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });
        let result = engine.transfer(&ctx, AccountId(1), AccountId(2), money(dec!(10.00)));
        assert_eq!(result, Err(EngineError::Cancelled));
    });

    let record = only_record(&engine, 1);
    assert_eq!(record.status(), TransactionStatus::Failed);
    assert_eq!(record.failure_reason(), Some(FailureReason::Timeout));
    assert_eq!(balance(&engine, 1), money(dec!(100.00)));

    // The source hold taken before the wait was released.
    drop(hold);
    engine
        .transfer(&Context::background(), AccountId(1), AccountId(2), money(dec!(10.00)))
        .unwrap();
    assert_eq!(balance(&engine, 1), money(dec!(90.00)));
}
