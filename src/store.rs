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

//! Storage adapter trait over the ordered-list/set primitives.
//!
//! ## Purpose
//! Exposes each server primitive as a single typed call so that the rest of
//! the crate never touches the driver directly. Two error channels are kept
//! distinguishable for callers: *not-found* (a domain signal, expressed as
//! `Option`/count/sign in the return value) and *backend error* (`Err`).
//!
//! ## Design Decisions
//! - **One round-trip per call, no retries**: retries belong to the delivery
//!   retry wrappers and the heartbeat loop, not to the adapter.
//! - **Trait object seam**: the consuming pipeline, cleaner and stats all
//!   take `Arc<dyn QueueStore>`, so the Redis-backed store and the in-memory
//!   test store are interchangeable.
//!
//! ## Invariants
//! Every mutation here is a single atomic server operation (`RPOPLPUSH`,
//! `LREM`, `SADD`, ...). No multi-primitive transaction is ever required for
//! correctness; shared state is protected exclusively by this atomicity.

use crate::QueueResult;
use async_trait::async_trait;
use std::time::Duration;

/// Typed adapter over the storage primitives the queue protocol needs.
///
/// Implementations: [`RedisStore`](crate::RedisStore) (server-backed) and
/// [`InMemoryStore`](crate::InMemoryStore) (process-local, for tests).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert payloads at the left end of a list. Returns the resulting list
    /// length.
    async fn lpush(&self, key: &str, payloads: &[Vec<u8>]) -> QueueResult<i64>;

    /// Atomically pop the rightmost element of `source` and push it onto the
    /// left end of `destination`. Returns `None` when `source` is empty or
    /// missing.
    async fn rpoplpush(&self, source: &str, destination: &str) -> QueueResult<Option<Vec<u8>>>;

    /// Remove up to `count` occurrences of `payload` from a list (from the
    /// left for positive counts, from the right for negative, all for zero).
    /// Returns the number of removed elements.
    async fn lrem(&self, key: &str, count: i64, payload: &[u8]) -> QueueResult<i64>;

    /// Length of a list; 0 for a missing key.
    async fn llen(&self, key: &str) -> QueueResult<i64>;

    /// Trim a list to the inclusive range `[start, stop]`; negative indices
    /// count from the right end.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> QueueResult<()>;

    /// Add a member to a set. Returns the number of members actually added
    /// (0 when it was already present).
    async fn sadd(&self, key: &str, member: &str) -> QueueResult<i64>;

    /// Remove a member from a set. Returns the number of members actually
    /// removed (0 when it was not present).
    async fn srem(&self, key: &str, member: &str) -> QueueResult<i64>;

    /// All members of a set; empty for a missing key.
    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>>;

    /// Cardinality of a set; 0 for a missing key.
    async fn scard(&self, key: &str) -> QueueResult<i64>;

    /// Delete a key. Returns the number of keys deleted (0 or 1).
    async fn del(&self, key: &str) -> QueueResult<i64>;

    /// Set a string value with a time-to-live.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> QueueResult<()>;

    /// Remaining time-to-live of a key in seconds. Non-positive values mean
    /// the key is absent or expired.
    async fn ttl(&self, key: &str) -> QueueResult<i64>;

    /// Remove every key in the database. Intended for tests only.
    async fn flush_db(&self) -> QueueResult<()>;
}
