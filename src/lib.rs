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

//! # redqueue
//!
//! ## Purpose
//! Turns a Redis-compatible server into a durable, at-least-once message
//! queue for a fleet of producer and consumer processes. Each process opens a
//! [`Connection`], publishes onto named [`Queue`]s, and consumes
//! [`Delivery`]s from them.
//!
//! ## Architecture Context
//! Three subsystems carry the design:
//!
//! - **Liveness and cleanup**: every connection refreshes a heartbeat key
//!   with a TTL. When a process dies the key expires, and a [`Cleaner`]
//!   running on any surviving peer moves the dead connection's unacked
//!   deliveries back to the ready lists. No coordination beyond the server's
//!   atomic primitives is needed.
//! - **The consuming pipeline**: per queue, a fetcher task atomically moves
//!   payloads from `ready` to the connection's `unacked` list (`RPOPLPUSH`)
//!   and buffers them in a bounded in-memory channel of size
//!   `prefetch_limit`; consumer dispatchers (single or batched with timeout)
//!   drain that buffer. Shutdown closes the buffer and lets every callback
//!   finish.
//! - **The delivery state machine**: [`Delivery::ack`] removes the payload
//!   from `unacked` atomically; reject and push move it onward. The
//!   `*_with_retry` wrappers absorb transient server errors so consumer code
//!   never writes retry loops.
//!
//! ## Key Components
//! - [`Connection`]: per-process identity, heartbeat, queue registry
//! - [`Queue`]: publish, consuming pipeline, purge/return operations
//! - [`Delivery`]: ack/reject/push and their retry variants
//! - [`Cleaner`]: reclaims deliveries of crashed connections
//! - [`QueueStore`]: adapter trait over the server primitives, with
//!   [`RedisStore`] and [`InMemoryStore`] implementations
//! - [`collect_stats`]: read-only observability report
//!
//! ## Examples
//!
//! ### Publishing
//! ```rust,no_run
//! use redqueue::Connection;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (errors_tx, _errors_rx) = mpsc::channel(16);
//! let connection = Connection::open("producer", "redis://localhost:6379", errors_tx).await?;
//! let queue = connection.open_queue("tasks").await?;
//! queue.publish(&["task payload"]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Consuming
//! ```rust,no_run
//! use redqueue::{Connection, Delivery};
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (errors_tx, _errors_rx) = mpsc::channel(16);
//! let connection = Connection::open("worker", "redis://localhost:6379", errors_tx).await?;
//! let queue = connection.open_queue("tasks").await?;
//!
//! queue.start_consuming(10, Duration::from_millis(100)).await?;
//! queue
//!     .add_consumer("worker", |delivery: Delivery| async move {
//!         // process delivery.payload() ...
//!         let _ = delivery.ack().await;
//!     })
//!     .await?;
//!
//! // on shutdown:
//! let finished = connection.stop_all_consuming();
//! let _ = finished.await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery guarantees
//! At-least-once. A payload always lives in exactly one of the `ready`,
//! `unacked` or `rejected` lists (or in a consumer callback that has not yet
//! resolved it); crashes between fetch and ack are recovered by the cleaner,
//! which may redeliver. Ordering out of one queue is best-effort FIFO:
//! concurrent consumers reorder completions.
//!
//! ## Testing
//! ```bash
//! # Unit and in-memory pipeline tests (no server needed)
//! cargo test
//!
//! # Integration tests against a local Redis
//! cargo test -- --ignored
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cleaner;
mod config;
mod connection;
mod delivery;
mod error;
mod keys;
mod memory;
mod queue;
mod stats;
mod store;

#[cfg(feature = "redis-backend")]
mod redis;

pub use cleaner::Cleaner;
pub use config::ConnectionConfig;
pub use connection::{Connection, HEARTBEAT_ERROR_LIMIT};
pub use delivery::Delivery;
pub use error::{ErrorEvent, QueueError, QueueResult};
pub use memory::InMemoryStore;
pub use queue::{BatchConsumer, Consumer, Queue};
pub use stats::{collect_stats, ConnectionStat, QueueStat, Stats};
pub use store::QueueStore;

#[cfg(feature = "redis-backend")]
pub use redis::RedisStore;
