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

//! Redis-backed store implementation.
//!
//! ## Purpose
//! Implements [`QueueStore`] against a Redis-compatible server. Every call is
//! a single command round-trip; the atomicity of `RPOPLPUSH`, `LREM`, `SADD`
//! and friends is what the queue protocol builds on.
//!
//! ## Design Decisions
//! - **Why ConnectionManager**: automatic reconnection and cheap per-call
//!   clones instead of a hand-rolled pool.
//! - **No retries here**: a failed command surfaces as a backend error;
//!   retry policy lives with the callers that know whether retrying is safe.

use crate::{QueueError, QueueResult, QueueStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// Redis-backed [`QueueStore`] implementation.
///
/// ## Example
/// ```rust,no_run
/// use redqueue::RedisStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RedisStore::open("redis://localhost:6379").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to the server at `url` (database selection via the URL path,
    /// e.g. `redis://localhost:6379/1`).
    ///
    /// ## Errors
    /// - [`QueueError::BackendError`]: the URL is invalid or the server is
    ///   unreachable
    pub async fn open(url: &str) -> QueueResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn lpush(&self, key: &str, payloads: &[Vec<u8>]) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let len: i64 = conn
            .lpush(key, payloads)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis LPUSH failed: {}", e)))?;
        Ok(len)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> QueueResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let payload: Option<Vec<u8>> = conn
            .rpoplpush(source, destination)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis RPOPLPUSH failed: {}", e)))?;
        Ok(payload)
    }

    async fn lrem(&self, key: &str, count: i64, payload: &[u8]) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn
            .lrem(key, count as isize, payload)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis LREM failed: {}", e)))?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let len: i64 = conn
            .llen(key)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis LLEN failed: {}", e)))?;
        Ok(len)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        conn.ltrim::<_, ()>(key, start as isize, stop as isize)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis LTRIM failed: {}", e)))?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let added: i64 = conn
            .sadd(key, member)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis SADD failed: {}", e)))?;
        Ok(added)
    }

    async fn srem(&self, key: &str, member: &str) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn
            .srem(key, member)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis SREM failed: {}", e)))?;
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = conn
            .smembers(key)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis SMEMBERS failed: {}", e)))?;
        Ok(members)
    }

    async fn scard(&self, key: &str) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let count: i64 = conn
            .scard(key)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis SCARD failed: {}", e)))?;
        Ok(count)
    }

    async fn del(&self, key: &str) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let deleted: i64 = conn
            .del(key)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis DEL failed: {}", e)))?;
        Ok(deleted)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis SETEX failed: {}", e)))?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let ttl: i64 = conn
            .ttl(key)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis TTL failed: {}", e)))?;
        Ok(ttl)
    }

    async fn flush_db(&self) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::BackendError(format!("Redis FLUSHDB failed: {}", e)))?;
        Ok(())
    }
}
