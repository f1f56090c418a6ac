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

//! # Transfer Engine
//!
//! This library moves money between accounts under concurrent access while
//! conserving the total, never overdrawing an account, and leaving a ledger
//! record and an audit entry for every attempt.
//!
//! ## Core Components
//!
//! - [`Engine`]: Transfers, deposits, withdrawals and ledger queries
//! - [`AccountStore`]: Account storage with exclusive holds and compare-and-swap
//! - [`Ledger`]: Transaction record store
//! - [`AuditLogger`]: Best-effort audit trail of committed mutations
//! - [`Context`]: Deadline and cancellation passed to every operation
//!
//! ## Example
//!
//! ```
//! use transfer_engine::{AccountId, Context, Engine, Money, TransactionStatus};
//!
//! let engine = Engine::new();
//! let ctx = Context::background();
//! engine.open_account(&ctx, AccountId(1), Money::from_minor(10_000)).unwrap();
//! engine.open_account(&ctx, AccountId(2), Money::from_minor(5_000)).unwrap();
//!
//! let receipt = engine
//!     .transfer(&ctx, AccountId(1), AccountId(2), Money::from_minor(3_000))
//!     .unwrap();
//! assert_eq!(receipt.transaction.status(), TransactionStatus::Completed);
//!
//! let account = engine.get_account(AccountId(1)).unwrap();
//! assert_eq!(account.balance(), Money::from_minor(7_000));
//! ```
//!
//! ## Thread Safety
//!
//! Transfers hold both accounts exclusively, acquired in ascending id order,
//! so concurrent transfers in opposite directions cannot deadlock. Single
//! account updates use optimistic compare-and-swap with bounded retry.

pub mod account;
pub mod audit;
mod base;
pub mod config;
mod context;
mod engine;
pub mod error;
pub mod ledger;
mod money;
pub mod optimistic;
pub mod store;
mod transaction;

pub use account::Account;
pub use audit::{AuditAction, AuditError, AuditLogEntry, AuditLogger, AuditSink, MemoryAuditLog};
pub use base::{AccountId, AuditId, TransactionId};
pub use config::{ConfigError, EngineConfig};
pub use context::{Canceller, Context, Interrupted};
pub use engine::{AuditStatus, Engine, Receipt};
pub use error::{EngineError, ErrorKind, StoreError};
pub use ledger::{Ledger, MemoryLedger};
pub use money::{Money, MoneyError};
pub use optimistic::RetryPolicy;
pub use store::{AccountHold, AccountStore, MemoryAccountStore, MemoryHold};
pub use transaction::{FailureReason, Resolution, Transaction, TransactionStatus, TransactionType};
