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

//! Audit trail for committed mutations.
//!
//! The audit log sits outside the atomicity boundary of a money movement: an
//! entry is written after the balances and the ledger record are committed,
//! and a failed write is logged and reported but never undoes the mutation.

use crate::base::AuditId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    AccountOpened,
    AccountFrozen,
    AccountUnfrozen,
    AccountActivated,
    AccountDeactivated,
    DepositExecuted,
    WithdrawalExecuted,
    TransferExecuted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AccountOpened => "account.opened",
            AuditAction::AccountFrozen => "account.frozen",
            AuditAction::AccountUnfrozen => "account.unfrozen",
            AuditAction::AccountActivated => "account.activated",
            AuditAction::AccountDeactivated => "account.deactivated",
            AuditAction::DepositExecuted => "deposit.executed",
            AuditAction::WithdrawalExecuted => "withdrawal.executed",
            AuditAction::TransferExecuted => "transfer.executed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub id: AuditId,
    /// Position in the log, assigned by the sink.
    pub sequence: u64,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub before_value: serde_json::Value,
    pub after_value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Audit log errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("audit snapshot serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::Serialization(err.to_string())
    }
}

/// Append-only destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError>;
}

/// In-memory [`AuditSink`].
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of all entries in append order.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.read().clone()
    }

    /// Entries about one resource, in append order.
    pub fn entries_for(&self, resource_id: &str) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, mut entry: AuditLogEntry) -> Result<(), AuditError> {
        let mut entries = self.entries.write();
        entry.sequence = entries.len() as u64 + 1;
        entries.push(entry);
        Ok(())
    }
}

/// Builds audit entries and hands them to a sink, logging every failure.
#[derive(Debug)]
pub struct AuditLogger<A> {
    sink: A,
}

impl<A: AuditSink> AuditLogger<A> {
    pub fn new(sink: A) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    /// Appends one entry describing a committed change.
    ///
    /// Errors are returned for the caller to report, after being logged here.
    pub fn record<B, T>(
        &self,
        action: AuditAction,
        resource_type: &str,
        resource_id: impl fmt::Display,
        before: &B,
        after: &T,
    ) -> Result<AuditId, AuditError>
    where
        B: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let resource_id = resource_id.to_string();
        let result = self.build(action, resource_type, &resource_id, before, after).and_then(
            |entry| {
                let id = entry.id;
                self.sink.append(entry).map(|()| id)
            },
        );

        match &result {
            Ok(id) => debug!(
                audit_id = %id,
                action = %action,
                resource_id = %resource_id,
                "audit entry recorded"
            ),
            Err(err) => warn!(
                action = %action,
                resource_type,
                resource_id = %resource_id,
                error = %err,
                "failed to record audit entry"
            ),
        }
        result
    }

    fn build<B, T>(
        &self,
        action: AuditAction,
        resource_type: &str,
        resource_id: &str,
        before: &B,
        after: &T,
    ) -> Result<AuditLogEntry, AuditError>
    where
        B: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        Ok(AuditLogEntry {
            id: AuditId::generate(),
            sequence: 0,
            action: action.as_str().to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            before_value: serde_json::to_value(before)?,
            after_value: serde_json::to_value(after)?,
            timestamp: Utc::now(),
        })
    }
}
