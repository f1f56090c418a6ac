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

//! Engine configuration.
//!
//! Defaults suit an in-process engine; [`EngineConfig::from_env`] lets a
//! deployment override them through environment variables.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Tunables for the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deadline applied to a transfer when the caller's context has none.
    pub lock_timeout: Duration,

    /// Maximum attempts of the optimistic update path.
    pub max_attempts: u32,

    /// Base backoff; attempt `n` sleeps `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl EngineConfig {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Values below one are raised to one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Load configuration from environment variables
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TRANSFER_LOCK_TIMEOUT_MS` | 5000 |
    /// | `TRANSFER_MAX_ATTEMPTS` | 3 |
    /// | `TRANSFER_RETRY_BACKOFF_MS` | 50 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let lock_timeout = match lookup("TRANSFER_LOCK_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse(&raw, "TRANSFER_LOCK_TIMEOUT_MS")?),
            None => defaults.lock_timeout,
        };

        let max_attempts = match lookup("TRANSFER_MAX_ATTEMPTS") {
            Some(raw) => match parse::<u32>(&raw, "TRANSFER_MAX_ATTEMPTS")? {
                0 => return Err(ConfigError::InvalidValue("TRANSFER_MAX_ATTEMPTS")),
                n => n,
            },
            None => defaults.max_attempts,
        };

        let retry_backoff = match lookup("TRANSFER_RETRY_BACKOFF_MS") {
            Some(raw) => Duration::from_millis(parse(&raw, "TRANSFER_RETRY_BACKOFF_MS")?),
            None => defaults.retry_backoff,
        };

        Ok(Self {
            lock_timeout,
            max_attempts,
            retry_backoff,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
        }
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &'static str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue(key))
}

/// Configuration error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
