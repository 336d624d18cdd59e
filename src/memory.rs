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

//! In-memory store implementation.
//!
//! ## Purpose
//! Process-local implementation of [`QueueStore`] so the whole pipeline
//! (publish, fetch, dispatch, ack, cleaner) can run in tests without a
//! server.
//!
//! ## Features
//! - Same observable semantics as the server-backed store, including TTL
//!   expiry and the removal of empty lists
//! - Failure injection for outage simulation (heartbeat error limit,
//!   delivery retry paths)
//!
//! ## Limitations
//! - Not persistent, not shared across processes
//! - Every operation takes one lock over the whole state; fine for tests,
//!   not meant for production traffic

use crate::{QueueError, QueueResult, QueueStore};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// String entry with optional expiry.
#[derive(Debug, Clone)]
struct Entry {
    #[allow(dead_code)]
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }

    fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .and_then(|exp| exp.checked_duration_since(Instant::now()))
    }
}

#[derive(Debug, Default)]
struct StoreState {
    /// Lists: front is the left end (`LPUSH` side), back is the right end.
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    sets: HashMap<String, BTreeSet<String>>,
    strings: HashMap<String, Entry>,
}

/// In-memory [`QueueStore`] implementation.
///
/// ## Example
/// ```rust
/// use redqueue::{InMemoryStore, QueueStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStore::new();
/// store.lpush("list", &[b"payload".to_vec()]).await?;
/// assert_eq!(store.llen("list").await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
    /// Remaining number of operations that fail with a simulated backend
    /// error. See [`InMemoryStore::fail_next`].
    fail_remaining: Arc<AtomicU64>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a backend error.
    ///
    /// Used in tests to simulate a server outage: the heartbeat loop and the
    /// delivery retry wrappers observe the failures and must recover (or shut
    /// down) exactly as they would against an unreachable server.
    pub fn fail_next(&self, count: u64) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    fn check_failure(&self) -> QueueResult<()> {
        let injected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QueueError::BackendError(
                "simulated storage failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Normalize a possibly-negative index against a list length.
    fn normalize_index(index: i64, len: i64) -> i64 {
        if index < 0 {
            len + index
        } else {
            index
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn lpush(&self, key: &str, payloads: &[Vec<u8>]) -> QueueResult<i64> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        let list = state.lists.entry(key.to_string()).or_default();
        for payload in payloads {
            list.push_front(payload.clone());
        }
        Ok(list.len() as i64)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> QueueResult<Option<Vec<u8>>> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        let popped = match state.lists.get_mut(source) {
            Some(list) => list.pop_back(),
            None => None,
        };
        let Some(payload) = popped else {
            return Ok(None);
        };
        if state.lists.get(source).is_some_and(VecDeque::is_empty) {
            state.lists.remove(source);
        }
        state
            .lists
            .entry(destination.to_string())
            .or_default()
            .push_front(payload.clone());
        Ok(Some(payload))
    }

    async fn lrem(&self, key: &str, count: i64, payload: &[u8]) -> QueueResult<i64> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0usize;
        if count >= 0 {
            let mut kept = VecDeque::with_capacity(list.len());
            for element in list.drain(..) {
                if removed < limit && element == payload {
                    removed += 1;
                } else {
                    kept.push_back(element);
                }
            }
            *list = kept;
        } else {
            let mut kept = VecDeque::with_capacity(list.len());
            for element in list.drain(..).rev() {
                if removed < limit && element == payload {
                    removed += 1;
                } else {
                    kept.push_front(element);
                }
            }
            *list = kept;
        }

        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(removed as i64)
    }

    async fn llen(&self, key: &str) -> QueueResult<i64> {
        self.check_failure()?;
        let state = self.state.read().await;
        Ok(state.lists.get(key).map_or(0, |l| l.len() as i64))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> QueueResult<()> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(());
        };

        let len = list.len() as i64;
        let start = Self::normalize_index(start, len).max(0);
        let stop = Self::normalize_index(stop, len).min(len - 1);
        if start > stop {
            state.lists.remove(key);
            return Ok(());
        }

        let kept: VecDeque<Vec<u8>> = list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect();
        if kept.is_empty() {
            state.lists.remove(key);
        } else {
            *list = kept;
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> QueueResult<i64> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        let added = state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(added as i64)
    }

    async fn srem(&self, key: &str, member: &str) -> QueueResult<i64> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        let removed = state
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member));
        if state.sets.get(key).is_some_and(BTreeSet::is_empty) {
            state.sets.remove(key);
        }
        Ok(removed as i64)
    }

    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>> {
        self.check_failure()?;
        let state = self.state.read().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> QueueResult<i64> {
        self.check_failure()?;
        let state = self.state.read().await;
        Ok(state.sets.get(key).map_or(0, |s| s.len() as i64))
    }

    async fn del(&self, key: &str) -> QueueResult<i64> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        let mut deleted = state.lists.remove(key).is_some();
        deleted |= state.sets.remove(key).is_some();
        deleted |= state
            .strings
            .remove(key)
            .is_some_and(|entry| !entry.is_expired());
        Ok(deleted as i64)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> QueueResult<()> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> QueueResult<i64> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        match state.strings.get(key) {
            Some(entry) if entry.is_expired() => {
                state.strings.remove(key);
                Ok(-2)
            }
            Some(entry) => match entry.ttl_remaining() {
                // A key that is still alive reports at least one second left,
                // like the server's integer TTL does.
                Some(remaining) => Ok((remaining.as_secs() as i64).max(1)),
                None => Ok(-1),
            },
            None => Ok(-2),
        }
    }

    async fn flush_db(&self) -> QueueResult<()> {
        self.check_failure()?;
        let mut state = self.state.write().await;
        *state = StoreState::default();
        Ok(())
    }
}
