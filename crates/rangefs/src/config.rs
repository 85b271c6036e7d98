// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Transport configuration

use crate::error::{RangeError, Result};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings for one HTTP transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Extra attempts after the first failure
    pub retries: usize,
    /// Base of the exponential backoff: the n-th retry waits
    /// `backoff_factor * 2^(n-1)`, uncapped
    pub backoff_factor: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Maximum concurrent requests issued by one transport
    pub pool_size: usize,
    /// Idle connections kept per host
    pub pool_per_host: usize,
    /// Sent with every request
    pub headers: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_factor: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            pool_size: 10,
            pool_per_host: 10,
            headers: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(RangeError::config("pool_size must be at least 1"));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(RangeError::config("timeouts must be positive"));
        }
        for name in self.headers.keys() {
            if name.trim().is_empty() {
                return Err(RangeError::config("header names cannot be empty"));
            }
        }
        Ok(())
    }

    /// Number of attempts a single request may make.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.retries + 1
    }

    /// Wait before the last retry, the longest the backoff gets.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        let doublings = u32::try_from(self.retries.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_factor
            .saturating_mul(2u32.saturating_pow(doublings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.backoff_factor, Duration::from_millis(500));
    }

    #[test]
    fn test_max_backoff_follows_the_doubling() {
        let config = TransportConfig {
            retries: 8,
            backoff_factor: Duration::from_secs(1),
            ..TransportConfig::default()
        };
        // 1s, 2s, ... 128s: past the 60s backon would otherwise cap at
        assert_eq!(config.max_backoff(), Duration::from_secs(128));

        let none = TransportConfig {
            retries: 0,
            ..TransportConfig::default()
        };
        assert_eq!(none.max_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = TransportConfig {
            pool_size: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(config.validate(), Err(RangeError::Config(_))));
    }
}
