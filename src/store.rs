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

//! Account storage.
//!
//! [`AccountStore`] is the storage contract the engine is written against.
//! It offers three access modes:
//!
//! - **read**: a snapshot, never blocked by exclusive holds.
//! - **exclusive use**: an [`AccountHold`] that keeps every other exclusive
//!   user and every compare-and-swap off the account until it is dropped.
//!   Writes through a hold are staged and only become visible when the holds
//!   are committed together; a dropped hold discards what it staged.
//! - **compare-and-swap**: version-checked single-account update.
//!
//! [`MemoryAccountStore`] implements the contract with a [`DashMap`] of
//! per-account slots. Each slot pairs a [`Mutex`] over the record and a
//! `held` flag with a [`Condvar`] that wakes waiters when a hold is released.
//! Map shard locks are never held while waiting on a slot. Whenever several
//! slot mutexes are taken at once they are locked in ascending account id.

use crate::account::Account;
use crate::base::AccountId;
use crate::context::Context;
use crate::error::StoreError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Exclusive hold on one account, released when dropped.
pub trait AccountHold: Send {
    /// The account as of acquisition or the last write through this hold.
    fn account(&self) -> &Account;
}

/// Storage contract for account records.
pub trait AccountStore: Send + Sync {
    type Hold: AccountHold;

    /// Creates an account. Ids are never reused.
    fn insert(&self, account: Account) -> Result<(), StoreError>;

    fn get_for_read(&self, id: AccountId) -> Result<Account, StoreError>;

    /// Waits until no one else holds `id`, bounded by `ctx`.
    fn get_for_exclusive_use(&self, id: AccountId, ctx: &Context)
    -> Result<Self::Hold, StoreError>;

    /// Stages `account` in `hold`. Readers keep seeing the last committed
    /// state until [`commit`](Self::commit).
    fn save(&self, hold: &mut Self::Hold, account: Account) -> Result<(), StoreError>;

    /// Publishes the staged state of every hold at once. A reader sees either
    /// all of the writes or none of them.
    fn commit(&self, holds: &[&Self::Hold]);

    /// Re-reads `id`, checks its version, applies `mutator` and bumps the
    /// version by one.
    fn compare_and_swap<F>(
        &self,
        id: AccountId,
        expected_version: u64,
        mutator: F,
    ) -> Result<Account, StoreError>
    where
        F: FnOnce(&mut Account);

    /// All accounts ordered by id.
    fn snapshot(&self) -> Result<Vec<Account>, StoreError>;
}

#[derive(Debug)]
struct SlotState {
    account: Account,
    held: bool,
}

#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    released: Condvar,
}

impl Slot {
    fn new(account: Account) -> Self {
        Self {
            state: Mutex::new(SlotState {
                account,
                held: false,
            }),
            released: Condvar::new(),
        }
    }
}

/// Hold handed out by [`MemoryAccountStore`].
#[derive(Debug)]
pub struct MemoryHold {
    slot: Arc<Slot>,
    /// Staged state, private to the holder until committed.
    account: Account,
}

impl AccountHold for MemoryHold {
    fn account(&self) -> &Account {
        &self.account
    }
}

impl Drop for MemoryHold {
    fn drop(&mut self) {
        self.slot.state.lock().held = false;
        self.slot.released.notify_all();
        debug!(account = %self.account.id(), "released exclusive hold");
    }
}

/// In-memory [`AccountStore`].
#[derive(Debug)]
pub struct MemoryAccountStore {
    accounts: DashMap<AccountId, Arc<Slot>>,
    /// How long compare-and-swap waits for a hold before reporting `Busy`.
    busy_wait: Duration,
    /// Upper bound between context checks while waiting for a hold.
    poll_interval: Duration,
}

impl MemoryAccountStore {
    pub const DEFAULT_BUSY_WAIT: Duration = Duration::from_millis(250);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            busy_wait: Self::DEFAULT_BUSY_WAIT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_busy_wait(mut self, busy_wait: Duration) -> Self {
        self.busy_wait = busy_wait;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    fn slot(&self, id: AccountId) -> Result<Arc<Slot>, StoreError> {
        // Clone the Arc out so the shard lock is released before any wait.
        self.accounts
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StoreError::AccountNotFound(id))
    }
}

impl Default for MemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore for MemoryAccountStore {
    type Hold = MemoryHold;

    fn insert(&self, account: Account) -> Result<(), StoreError> {
        match self.accounts.entry(account.id()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateAccount(account.id())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Slot::new(account)));
                Ok(())
            }
        }
    }

    fn get_for_read(&self, id: AccountId) -> Result<Account, StoreError> {
        let slot = self.slot(id)?;
        let account = slot.state.lock().account.clone();
        Ok(account)
    }

    fn get_for_exclusive_use(
        &self,
        id: AccountId,
        ctx: &Context,
    ) -> Result<Self::Hold, StoreError> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock();
        while state.held {
            ctx.check()?;
            let wait = ctx
                .remaining()
                .map_or(self.poll_interval, |left| left.min(self.poll_interval));
            slot.released.wait_for(&mut state, wait);
        }
        state.held = true;
        let account = state.account.clone();
        drop(state);

        debug!(account = %id, "acquired exclusive hold");
        Ok(MemoryHold { slot, account })
    }

    fn save(&self, hold: &mut Self::Hold, account: Account) -> Result<(), StoreError> {
        let held = hold.account.id();
        if account.id() != held {
            return Err(StoreError::HoldMismatch {
                held,
                written: account.id(),
            });
        }
        hold.account = account;
        Ok(())
    }

    fn commit(&self, holds: &[&Self::Hold]) {
        let mut ordered = holds.to_vec();
        ordered.sort_by_key(|hold| hold.account.id());
        let mut states: Vec<_> = ordered.iter().map(|hold| hold.slot.state.lock()).collect();
        for (state, hold) in states.iter_mut().zip(&ordered) {
            state.account = hold.account.clone();
        }
        debug!(accounts = ordered.len(), "committed staged writes");
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
        let slot = self.slot(id)?;
        let mut state = slot.state.lock();
        let give_up = Instant::now() + self.busy_wait;
        while state.held {
            if slot.released.wait_until(&mut state, give_up).timed_out() && state.held {
                return Err(StoreError::Busy(id));
            }
        }

        let found = state.account.version();
        if found != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found,
            });
        }

        let mut next = state.account.clone();
        mutator(&mut next);
        debug_assert_eq!(next.id(), id, "mutator must not change the account id");
        next.bump_version();
        state.account = next.clone();
        Ok(next)
    }

    fn snapshot(&self) -> Result<Vec<Account>, StoreError> {
        let mut slots: Vec<(AccountId, Arc<Slot>)> = self
            .accounts
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        slots.sort_by_key(|(id, _)| *id);
        // All slots locked together so a commit is never seen half applied.
        let states: Vec<_> = slots.iter().map(|(_, slot)| slot.state.lock()).collect();
        Ok(states.iter().map(|state| state.account.clone()).collect())
    }
}
