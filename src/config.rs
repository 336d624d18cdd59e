// SPDX-License-Identifier: LGPL-2.1-or-later
//
// This file is part of redqueue.
//
// redqueue is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// redqueue is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with redqueue. If not, see <https://www.gnu.org/licenses/>.

//! Connection configuration.
//!
//! ## Environment Variables
//! - `REDQUEUE_REDIS_URL`: server URL (default: "redis://localhost:6379")
//! - `REDQUEUE_HEARTBEAT_TTL_SECS`: heartbeat key TTL in seconds (default: 60)
//! - `REDQUEUE_HEARTBEAT_INTERVAL_MS`: heartbeat refresh interval in
//!   milliseconds (default: 1000)

use crate::{QueueError, QueueResult};
use std::time::Duration;

/// Configuration for a [`Connection`](crate::Connection).
///
/// The defaults implement the layered heartbeat timing the cleanup protocol
/// relies on: the key is refreshed every second with a one-minute TTL, and
/// consuming is stopped locally after
/// [`HEARTBEAT_ERROR_LIMIT`](crate::HEARTBEAT_ERROR_LIMIT) consecutive
/// failures, well before the TTL can expire and a cleaner on another host
/// becomes entitled to reclaim this connection's deliveries. Shrink these
/// values only in tests.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server URL, including the database index path if any
    /// (e.g. `redis://localhost:6379/1`).
    pub url: String,
    /// TTL of the heartbeat key.
    pub heartbeat_ttl: Duration,
    /// How often the heartbeat key is refreshed.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            heartbeat_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the variable list; unset variables
    /// fall back to the defaults.
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDQUEUE_REDIS_URL") {
            config.url = url;
        }
        if let Ok(ttl) = std::env::var("REDQUEUE_HEARTBEAT_TTL_SECS") {
            let secs: u64 = ttl.parse().map_err(|_| {
                QueueError::InvalidConfig(format!(
                    "REDQUEUE_HEARTBEAT_TTL_SECS is not an integer: {}",
                    ttl
                ))
            })?;
            config.heartbeat_ttl = Duration::from_secs(secs);
        }
        if let Ok(interval) = std::env::var("REDQUEUE_HEARTBEAT_INTERVAL_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                QueueError::InvalidConfig(format!(
                    "REDQUEUE_HEARTBEAT_INTERVAL_MS is not an integer: {}",
                    interval
                ))
            })?;
            config.heartbeat_interval = Duration::from_millis(millis);
        }

        if config.heartbeat_interval >= config.heartbeat_ttl {
            return Err(QueueError::InvalidConfig(
                "heartbeat interval must be shorter than the heartbeat TTL".to_string(),
            ));
        }

        Ok(config)
    }
}
