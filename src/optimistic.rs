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

//! Optimistic single-account updates.
//!
//! Reads an account, computes the new state in memory and publishes it with
//! a version-checked compare-and-swap. A lost race (version conflict, or the
//! account sitting under an exclusive hold) is retried from the read, at most
//! [`RetryPolicy::max_attempts`] times, sleeping `attempt * backoff` between
//! attempts. Business-rule failures are returned at once.

use crate::account::Account;
use crate::base::AccountId;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{EngineError, StoreError};
use crate::store::AccountStore;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounds of the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }
}

/// Account state on either side of a committed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub before: Account,
    pub after: Account,
    pub attempts: u32,
}

/// Applies `plan` to account `id` with bounded compare-and-swap retries.
///
/// `plan` receives the freshly read account and returns the desired state;
/// it runs once per attempt.
///
/// # Errors
///
/// - Whatever `plan` returns, unchanged.
/// - [`EngineError::ConcurrentUpdateExceeded`] once every attempt lost a race.
/// - [`EngineError::Cancelled`] / [`EngineError::DeadlineExceeded`] from `ctx`.
pub fn update_with_retry<S, F>(
    store: &S,
    ctx: &Context,
    id: AccountId,
    policy: RetryPolicy,
    mut plan: F,
) -> Result<Update, EngineError>
where
    S: AccountStore,
    F: FnMut(&Account) -> Result<Account, EngineError>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        ctx.check()?;

        let before = store.get_for_read(id)?;
        let desired = plan(&before)?;

        match store.compare_and_swap(id, before.version(), move |account| *account = desired) {
            Ok(after) => {
                return Ok(Update {
                    before,
                    after,
                    attempts: attempt,
                });
            }
            Err(err @ (StoreError::VersionConflict { .. } | StoreError::Busy(_))) => {
                debug!(account = %id, attempt, error = %err, "optimistic update lost a race");
                if attempt < max_attempts {
                    ctx.sleep(policy.backoff * attempt)?;
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    warn!(account = %id, attempts = max_attempts, "optimistic update retries exhausted");
    Err(EngineError::ConcurrentUpdateExceeded {
        account: id,
        attempts: max_attempts,
    })
}
