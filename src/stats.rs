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

//! Observability: per-queue and per-connection counts.
//!
//! Pure observation, no mutation. The report is a plain data structure (and
//! serializes to JSON) so rendering front-ends stay outside this crate.

use crate::{Connection, QueueError, QueueResult};
use serde::Serialize;
use std::collections::HashMap;

/// Counts contributed by one live connection to one queue.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStat {
    /// Deliveries the connection is currently processing on this queue.
    pub unacked_count: i64,
    /// Consumers the connection has bound on this queue.
    pub consumer_count: i64,
}

/// Counts for one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStat {
    /// Deliveries awaiting delivery.
    pub ready_count: i64,
    /// Rejected deliveries.
    pub rejected_count: i64,
    /// Per-connection breakdown, keyed by connection name. Only connections
    /// with a live heartbeat appear; stale connections are the cleaner's
    /// business.
    pub connection_stats: HashMap<String, ConnectionStat>,
}

impl QueueStat {
    /// Sum of unacked deliveries across all live connections.
    pub fn unacked_count(&self) -> i64 {
        self.connection_stats.values().map(|c| c.unacked_count).sum()
    }

    /// Sum of consumers across all live connections.
    pub fn consumer_count(&self) -> i64 {
        self.connection_stats
            .values()
            .map(|c| c.consumer_count)
            .sum()
    }
}

/// A stats report over a set of queues.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// Per-queue counts, keyed by queue name.
    pub queue_stats: HashMap<String, QueueStat>,
}

impl Stats {
    /// Render the report as pretty-printed JSON.
    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Collect a report for the given queues through `connection`.
///
/// Reads the ready and rejected lengths of every queue, and for each
/// connection whose heartbeat is live, its unacked length and consumer count
/// on that queue.
pub async fn collect_stats(queue_names: &[String], connection: &Connection) -> QueueResult<Stats> {
    let connection_names = connection.get_connections().await?;

    let mut queue_stats = HashMap::new();
    for queue_name in queue_names {
        let queue = connection.queue(queue_name);
        let mut stat = QueueStat {
            ready_count: queue.ready_count().await?,
            rejected_count: queue.rejected_count().await?,
            connection_stats: HashMap::new(),
        };

        for connection_name in &connection_names {
            let hijacked = connection.hijack(connection_name);
            match hijacked.check_heartbeat().await {
                Ok(()) => {}
                Err(QueueError::NotFound) => continue,
                Err(error) => return Err(error),
            }

            let connection_queue = hijacked.queue(queue_name);
            stat.connection_stats.insert(
                connection_name.clone(),
                ConnectionStat {
                    unacked_count: connection_queue.unacked_count().await?,
                    consumer_count: connection_queue.consumer_count().await?,
                },
            );
        }

        queue_stats.insert(queue_name.clone(), stat);
    }

    Ok(Stats { queue_stats })
}
