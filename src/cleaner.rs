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

//! Reclaiming the deliveries of crashed connections.
//!
//! ## Purpose
//! A [`Cleaner`] enumerates all registered connections, identifies the stale
//! ones (expired heartbeat) and moves their unacked deliveries back to the
//! ready lists so surviving consumers redeliver them.
//!
//! ## Concurrency
//! Safe to run periodically on every host. Every mutation is a single atomic
//! server operation: two cleaners racing over the same stale connection move
//! each payload at most once (`RPOPLPUSH` pops it from exactly one position),
//! and the loser of the final deregistration race simply finds the name gone.
//!
//! ## Failure semantics
//! The first error aborts the pass, leaving state consistent with some
//! prefix of the reclaims applied. The next pass resumes the work.

use crate::{Connection, Queue, QueueError, QueueResult};

/// Reclaims unacked deliveries of stale connections.
pub struct Cleaner {
    connection: Connection,
}

impl Cleaner {
    /// Create a cleaner operating through the given connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Run one cleaning pass. Returns the number of deliveries returned to
    /// ready lists.
    pub async fn clean(&self) -> QueueResult<u64> {
        let mut returned_total = 0u64;

        for connection_name in self.connection.get_connections().await? {
            let stale = self.connection.hijack(&connection_name);
            match stale.check_heartbeat().await {
                Ok(()) => continue, // skip active connections!
                Err(QueueError::NotFound) => {}
                Err(error) => return Err(error),
            }

            match Self::clean_connection(&stale).await {
                Ok(returned) => {
                    returned_total += returned;
                    tracing::info!(
                        connection = %connection_name,
                        returned,
                        "cleaned stale connection"
                    );
                }
                // Not-found here means a concurrent cleaner already
                // deregistered this connection; its reclaims are done.
                Err(QueueError::NotFound) => continue,
                Err(error) => return Err(error),
            }
        }

        Ok(returned_total)
    }

    async fn clean_connection(connection: &Connection) -> QueueResult<u64> {
        let mut returned = 0u64;
        for queue_name in connection.get_consuming_queues().await? {
            returned += Self::clean_queue(&connection.queue(&queue_name)).await?;
        }

        connection.close_stale_connection().await?;
        Ok(returned)
    }

    async fn clean_queue(queue: &Queue) -> QueueResult<u64> {
        let returned = queue.return_all_unacked().await?;
        queue.close_in_connection().await?;
        tracing::debug!(queue = %queue.name(), returned, "cleaned queue");
        Ok(returned)
    }
}
