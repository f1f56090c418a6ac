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

//! Account records.
//!
//! An [`Account`] is a plain value: the store owns the authoritative copy and
//! hands out snapshots. All balance arithmetic lives here so both mutation
//! paths (exclusive hold and compare-and-swap) apply the same rules.
//!
//! # Example
//!
//! ```
//! use transfer_engine::{Account, AccountId, Money};
//!
//! let account = Account::open(AccountId(1), Money::from_minor(10_000));
//! assert_eq!(account.available_balance(), Money::from_minor(10_000));
//! assert_eq!(account.version(), 0);
//! ```

use crate::base::AccountId;
use crate::error::EngineError;
use crate::money::Money;
use serde::{Deserialize, Serialize};

/// Ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    balance: Money,
    available_balance: Money,
    is_active: bool,
    is_frozen: bool,
    version: u64,
}

impl Account {
    /// Creates an active, unfrozen account at version 0.
    pub fn open(id: AccountId, opening_balance: Money) -> Self {
        Self {
            id,
            balance: opening_balance,
            available_balance: opening_balance,
            is_active: true,
            is_frozen: false,
            version: 0,
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    pub fn available_balance(&self) -> Money {
        self.available_balance
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_frozen(&self) -> bool {
        self.is_frozen
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Checks the invariants a stored account must satisfy.
    pub fn is_consistent(&self) -> bool {
        !self.balance.is_negative()
            && !self.available_balance.is_negative()
            && self.available_balance <= self.balance
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.is_consistent(),
            "Invariant violated on account {}: balance {}, available {}",
            self.id,
            self.balance,
            self.available_balance
        );
    }

    /// Fails unless the account may take part in a money movement.
    pub fn ensure_usable(&self) -> Result<(), EngineError> {
        if !self.is_active {
            return Err(EngineError::AccountInactive(self.id));
        }
        if self.is_frozen {
            return Err(EngineError::AccountFrozen(self.id));
        }
        Ok(())
    }

    /// Increases balance and available balance.
    pub fn credit(&mut self, amount: Money) -> Result<(), EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount);
        }
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or(EngineError::BalanceOverflow(self.id))?;
        let available = self
            .available_balance
            .checked_add(amount)
            .ok_or(EngineError::BalanceOverflow(self.id))?;
        self.balance = balance;
        self.available_balance = available;
        self.assert_invariants();
        Ok(())
    }

    /// Decreases balance and available balance.
    pub fn debit(&mut self, amount: Money) -> Result<(), EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount);
        }
        if self.available_balance < amount {
            return Err(EngineError::InsufficientBalance {
                account: self.id,
                required: amount,
                available: self.available_balance,
            });
        }
        let balance = self
            .balance
            .checked_sub(amount)
            .ok_or(EngineError::BalanceOverflow(self.id))?;
        let available = self
            .available_balance
            .checked_sub(amount)
            .ok_or(EngineError::BalanceOverflow(self.id))?;
        self.balance = balance;
        self.available_balance = available;
        self.assert_invariants();
        Ok(())
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.is_frozen = frozen;
    }

    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    /// Marks one successful mutation.
    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }
}
