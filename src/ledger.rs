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

//! Transaction record store.
//!
//! The [`Ledger`] keeps every deposit, withdrawal and transfer attempt. A
//! record is appended as `pending` before any balance moves and resolved to a
//! terminal state afterwards, so a crash in between leaves evidence that
//! [`Engine::reconcile_pending`](crate::Engine::reconcile_pending) can act on.

use crate::base::{AccountId, TransactionId};
use crate::error::StoreError;
use crate::transaction::{Resolution, Transaction, TransactionStatus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Storage contract for transaction records.
pub trait Ledger: Send + Sync {
    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateTransaction`] if the id is already known.
    fn append(&self, transaction: Transaction) -> Result<(), StoreError>;

    /// Moves a pending record to its terminal state and returns it.
    fn resolve(
        &self,
        id: TransactionId,
        resolution: Resolution,
        processing_time_ms: u64,
    ) -> Result<Transaction, StoreError>;

    fn get(&self, id: TransactionId) -> Result<Transaction, StoreError>;

    /// Records touching `account`, newest first, with the total count.
    fn list_for_account(
        &self,
        account: AccountId,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Transaction>, usize), StoreError>;

    /// Every record still `pending`.
    fn pending(&self) -> Result<Vec<Transaction>, StoreError>;
}

/// In-memory [`Ledger`].
///
/// Records live in a [`DashMap`] keyed by id; a second map indexes record ids
/// per account in append order.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    transactions: DashMap<TransactionId, Transaction>,
    by_account: DashMap<AccountId, Vec<TransactionId>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn index(&self, account: AccountId, id: TransactionId) {
        self.by_account.entry(account).or_default().push(id);
    }
}

impl Ledger for MemoryLedger {
    fn append(&self, transaction: Transaction) -> Result<(), StoreError> {
        let id = transaction.id();
        let source = transaction.source_account_id();
        let destination = transaction.destination_account_id();

        // Entry API keeps check-and-insert atomic.
        match self.transactions.entry(id) {
            Entry::Occupied(_) => return Err(StoreError::DuplicateTransaction(id)),
            Entry::Vacant(entry) => {
                entry.insert(transaction);
            }
        }

        self.index(source, id);
        if let Some(destination) = destination {
            self.index(destination, id);
        }
        Ok(())
    }

    fn resolve(
        &self,
        id: TransactionId,
        resolution: Resolution,
        processing_time_ms: u64,
    ) -> Result<Transaction, StoreError> {
        let mut record = self
            .transactions
            .get_mut(&id)
            .ok_or(StoreError::TransactionNotFound(id))?;
        record.resolve(resolution, processing_time_ms)?;
        Ok(record.clone())
    }

    fn get(&self, id: TransactionId) -> Result<Transaction, StoreError> {
        self.transactions
            .get(&id)
            .map(|record| record.clone())
            .ok_or(StoreError::TransactionNotFound(id))
    }

    fn list_for_account(
        &self,
        account: AccountId,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Transaction>, usize), StoreError> {
        let ids = self
            .by_account
            .get(&account)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let total = ids.len();
        let page = ids
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| self.transactions.get(id).map(|record| record.clone()))
            .collect();
        Ok((page, total))
    }

    fn pending(&self) -> Result<Vec<Transaction>, StoreError> {
        Ok(self
            .transactions
            .iter()
            .filter(|record| record.status() == TransactionStatus::Pending)
            .map(|record| record.clone())
            .collect())
    }
}
