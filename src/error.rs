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

//! Error types for the account store, the ledger and the engine.
//!
//! Every engine failure maps to a stable [`ErrorKind`] so a caller can decide
//! how to render it and whether a retry may help, without parsing messages.

use crate::base::{AccountId, TransactionId};
use crate::money::Money;
use thiserror::Error;

/// Stable classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller supplied bad parameters.
    Validation,
    /// Referenced account or transaction does not exist.
    NotFound,
    /// The request is well formed but violates a business rule.
    BusinessRule,
    /// Optimistic update lost too many races.
    Conflict,
    /// Deadline exceeded or caller cancelled.
    Timeout,
    /// Underlying store failed.
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict | Self::Timeout | Self::Infrastructure)
    }
}

/// Failures reported by account store and ledger backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error("duplicate transaction ID {0}")]
    DuplicateTransaction(TransactionId),

    /// Compare-and-swap saw a different version than expected.
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    /// Account stayed under an exclusive hold for longer than the store waits.
    #[error("account {0} is held by another operation")]
    Busy(AccountId),

    /// Attempted to change a transaction that already reached a terminal state.
    #[error("transaction {0} is already final")]
    TransactionFinalized(TransactionId),

    /// Write through a hold that belongs to a different account.
    #[error("hold on account {held} cannot write account {written}")]
    HoldMismatch { held: AccountId, written: AccountId },

    #[error("cancelled while waiting for account")]
    Cancelled,

    #[error("deadline exceeded while waiting for account")]
    DeadlineExceeded,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the engine's public operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    #[error("cannot transfer to the same account")]
    SelfTransfer,

    #[error("malformed identifier: {0:?}")]
    MalformedId(String),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("destination account {0} not found")]
    DestinationNotFound(AccountId),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error("insufficient balance in account {account}: required {required}, available {available}")]
    InsufficientBalance {
        account: AccountId,
        required: Money,
        available: Money,
    },

    #[error("account {0} is frozen")]
    AccountFrozen(AccountId),

    #[error("account {0} is not active")]
    AccountInactive(AccountId),

    /// Credit would push the balance past the representable range.
    #[error("balance overflow on account {0}")]
    BalanceOverflow(AccountId),

    #[error("concurrent updates on account {account} exceeded {attempts} attempts")]
    ConcurrentUpdateExceeded { account: AccountId, attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount | Self::SelfTransfer | Self::MalformedId(_) => {
                ErrorKind::Validation
            }
            Self::AccountNotFound(_)
            | Self::DestinationNotFound(_)
            | Self::TransactionNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateAccount(_)
            | Self::InsufficientBalance { .. }
            | Self::AccountFrozen(_)
            | Self::AccountInactive(_)
            | Self::BalanceOverflow(_) => ErrorKind::BusinessRule,
            Self::ConcurrentUpdateExceeded { .. } => ErrorKind::Conflict,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Timeout,
            Self::Store(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => Self::AccountNotFound(id),
            StoreError::TransactionNotFound(id) => Self::TransactionNotFound(id),
            StoreError::DuplicateAccount(id) => Self::DuplicateAccount(id),
            StoreError::Cancelled => Self::Cancelled,
            StoreError::DeadlineExceeded => Self::DeadlineExceeded,
            other => Self::Store(other),
        }
    }
}
