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

//! Ledger transaction records.
//!
//! Transactions follow a state machine:
//! - [`Pending`] → [`Completed`]
//! - [`Pending`] → [`Failed`] (with a [`FailureReason`])
//!
//! Terminal records are frozen: any further transition is refused.
//!
//! [`Pending`]: TransactionStatus::Pending
//! [`Completed`]: TransactionStatus::Completed
//! [`Failed`]: TransactionStatus::Failed

use crate::base::{AccountId, TransactionId};
use crate::error::{EngineError, StoreError};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Why a transaction ended up `failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureReason {
    #[serde(rename = "insufficient balance")]
    InsufficientBalance,
    #[serde(rename = "account frozen")]
    AccountFrozen,
    #[serde(rename = "account inactive")]
    AccountInactive,
    #[serde(rename = "source not found")]
    SourceNotFound,
    #[serde(rename = "destination not found")]
    DestinationNotFound,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "concurrent update")]
    ConcurrentUpdate,
    #[serde(rename = "balance overflow")]
    BalanceOverflow,
    #[serde(rename = "store failure")]
    StoreFailure,
    /// Found `pending` during reconciliation.
    #[serde(rename = "abandoned")]
    Abandoned,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientBalance => "insufficient balance",
            Self::AccountFrozen => "account frozen",
            Self::AccountInactive => "account inactive",
            Self::SourceNotFound => "source not found",
            Self::DestinationNotFound => "destination not found",
            Self::Timeout => "timeout",
            Self::ConcurrentUpdate => "concurrent update",
            Self::BalanceOverflow => "balance overflow",
            Self::StoreFailure => "store failure",
            Self::Abandoned => "abandoned",
        }
    }

    /// Reason recorded for an engine error raised inside a unit of work.
    pub fn from_error(err: &EngineError) -> Self {
        match err {
            EngineError::InsufficientBalance { .. } => Self::InsufficientBalance,
            EngineError::AccountFrozen(_) => Self::AccountFrozen,
            EngineError::AccountInactive(_) => Self::AccountInactive,
            EngineError::AccountNotFound(_) => Self::SourceNotFound,
            EngineError::DestinationNotFound(_) => Self::DestinationNotFound,
            EngineError::Cancelled | EngineError::DeadlineExceeded => Self::Timeout,
            EngineError::ConcurrentUpdateExceeded { .. } => Self::ConcurrentUpdate,
            EngineError::BalanceOverflow(_) => Self::BalanceOverflow,
            _ => Self::StoreFailure,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome applied to a pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Failed(FailureReason),
}

/// A ledger entry describing one deposit, withdrawal or transfer attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
    kind: TransactionType,
    status: TransactionStatus,
    amount: Money,
    source_account_id: AccountId,
    destination_account_id: Option<AccountId>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    processing_time_ms: Option<u64>,
    failure_reason: Option<FailureReason>,
}

impl Transaction {
    fn pending(
        kind: TransactionType,
        amount: Money,
        source: AccountId,
        destination: Option<AccountId>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            kind,
            status: TransactionStatus::Pending,
            amount,
            source_account_id: source,
            destination_account_id: destination,
            created_at: Utc::now(),
            completed_at: None,
            processing_time_ms: None,
            failure_reason: None,
        }
    }

    pub fn transfer(from: AccountId, to: AccountId, amount: Money) -> Self {
        Self::pending(TransactionType::Transfer, amount, from, Some(to))
    }

    pub fn deposit(account: AccountId, amount: Money) -> Self {
        Self::pending(TransactionType::Deposit, amount, account, None)
    }

    pub fn withdrawal(account: AccountId, amount: Money) -> Self {
        Self::pending(TransactionType::Withdrawal, amount, account, None)
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn kind(&self) -> TransactionType {
        self.kind
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn source_account_id(&self) -> AccountId {
        self.source_account_id
    }

    pub fn destination_account_id(&self) -> Option<AccountId> {
        self.destination_account_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn processing_time_ms(&self) -> Option<u64> {
        self.processing_time_ms
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure_reason
    }

    /// Moves a pending transaction to its terminal state.
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        processing_time_ms: u64,
    ) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::TransactionFinalized(self.id));
        }
        match resolution {
            Resolution::Completed => {
                self.status = TransactionStatus::Completed;
            }
            Resolution::Failed(reason) => {
                self.status = TransactionStatus::Failed;
                self.failure_reason = Some(reason);
            }
        }
        self.completed_at = Some(Utc::now());
        self.processing_time_ms = Some(processing_time_ms);
        Ok(())
    }
}
