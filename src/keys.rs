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

//! Key layout shared by every process on the same server.
//!
//! All persistent state lives under the fixed `rmq::` templates below. The
//! layout is part of the wire contract: two processes only interoperate when
//! they agree on these keys. Queue and connection names may contain any UTF-8
//! but should avoid the delimiters `:`, `[` and `]`.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Set of all live connection names.
pub(crate) const CONNECTIONS_KEY: &str = "rmq::connections";

/// Set of all open queue names.
pub(crate) const QUEUES_KEY: &str = "rmq::queues";

/// Heartbeat key of one connection; expires after the connection died.
pub(crate) fn connection_heartbeat_key(connection: &str) -> String {
    format!("rmq::connection::{}::heartbeat", connection)
}

/// Set of queues the consumers of one connection are consuming.
pub(crate) fn connection_queues_key(connection: &str) -> String {
    format!("rmq::connection::{}::queues", connection)
}

/// Set of consumers from one connection consuming from one queue.
pub(crate) fn connection_queue_consumers_key(connection: &str, queue: &str) -> String {
    format!("rmq::connection::{}::queue::[{}]::consumers", connection, queue)
}

/// List of deliveries consumers of one connection are currently consuming.
pub(crate) fn connection_queue_unacked_key(connection: &str, queue: &str) -> String {
    format!("rmq::connection::{}::queue::[{}]::unacked", connection, queue)
}

/// List of deliveries in one queue (right is first and oldest, left is last
/// and youngest).
pub(crate) fn queue_ready_key(queue: &str) -> String {
    format!("rmq::queue::[{}]::ready", queue)
}

/// List of rejected deliveries from one queue.
pub(crate) fn queue_rejected_key(queue: &str) -> String {
    format!("rmq::queue::[{}]::rejected", queue)
}

/// 6-character alphanumeric token used to make connection and consumer names
/// unique across processes.
pub(crate) fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}
