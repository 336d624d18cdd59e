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

//! Connections: per-process identity and the heartbeat.
//!
//! ## Purpose
//! A [`Connection`] is the entry point. It owns a unique name, keeps a
//! heartbeat key alive so peers can tell it is running, and tracks the queues
//! opened on it so consuming can be stopped as a unit.
//!
//! ## Liveness protocol
//! The heartbeat key carries a TTL and is refreshed periodically. A process
//! that dies stops refreshing; once the TTL runs out, any surviving peer
//! running the [`Cleaner`](crate::Cleaner) may reclaim the dead connection's
//! unacked deliveries. The timing is layered: with the default one second
//! interval and one minute TTL, the heartbeat would have to fail 60 times in
//! a row before the key can expire, so consuming is stopped locally after
//! [`HEARTBEAT_ERROR_LIMIT`] (45) consecutive failures. That guarantees all
//! local consumer callbacks have finished before a cleaner elsewhere may act
//! on the same deliveries.

use crate::keys;
use crate::stats::{self, Stats};
use crate::{ConnectionConfig, ErrorEvent, Queue, QueueError, QueueResult, QueueStore};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Stop consuming after this many consecutive heartbeat errors.
///
/// NOTE: be careful when changing this or the timings in
/// [`ConnectionConfig`]. The limit must stay comfortably below
/// `heartbeat_ttl / heartbeat_interval`, otherwise a connection can still be
/// consuming while a cleaner on another host is already reclaiming its
/// unacked deliveries.
pub const HEARTBEAT_ERROR_LIMIT: u64 = 45;

/// A per-process handle to the queue system.
///
/// Cheap to clone; clones share the heartbeat and the open-queue registry.
///
/// ## Example
/// ```rust,no_run
/// use redqueue::Connection;
/// use tokio::sync::mpsc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (errors_tx, _errors_rx) = mpsc::channel(16);
/// let connection = Connection::open("worker", "redis://localhost:6379", errors_tx).await?;
/// let queue = connection.open_queue("tasks").await?;
/// queue.publish(&["job-1"]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    name: String,
    heartbeat_key: String,
    /// Key of the set of queues consumed by this connection.
    queues_key: String,
    store: Arc<dyn QueueStore>,
    errors: mpsc::Sender<ErrorEvent>,
    config: ConnectionConfig,
    heartbeat_stopped: Arc<AtomicBool>,
    /// Every queue opened on this connection, so heartbeat failure can stop
    /// consuming without further server round-trips.
    open_queues: Arc<Mutex<Vec<Queue>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Connection {
    /// Open a new connection against the server at `url`.
    ///
    /// The connection name is `<tag>-<6-char token>`. `errors` is the fan-in
    /// channel that receives [`ErrorEvent`]s from the heartbeat, the fetchers
    /// and the delivery retry wrappers; all sends onto it are non-blocking.
    #[cfg(feature = "redis-backend")]
    pub async fn open(
        tag: &str,
        url: &str,
        errors: mpsc::Sender<ErrorEvent>,
    ) -> QueueResult<Connection> {
        let config = ConnectionConfig {
            url: url.to_string(),
            ..ConnectionConfig::default()
        };
        let store = Arc::new(crate::RedisStore::open(url).await?);
        Self::open_with_config(tag, store, config, errors).await
    }

    /// Open a connection over an existing store. This is the seam test
    /// doubles plug into (see [`InMemoryStore`](crate::InMemoryStore)).
    pub async fn open_with_store(
        tag: &str,
        store: Arc<dyn QueueStore>,
        errors: mpsc::Sender<ErrorEvent>,
    ) -> QueueResult<Connection> {
        Self::open_with_config(tag, store, ConnectionConfig::default(), errors).await
    }

    /// Open a connection with explicit heartbeat timing.
    pub async fn open_with_config(
        tag: &str,
        store: Arc<dyn QueueStore>,
        config: ConnectionConfig,
        errors: mpsc::Sender<ErrorEvent>,
    ) -> QueueResult<Connection> {
        let name = format!("{}-{}", tag, keys::random_token());

        let connection = Connection {
            heartbeat_key: keys::connection_heartbeat_key(&name),
            queues_key: keys::connection_queues_key(&name),
            name,
            store,
            errors,
            config,
            heartbeat_stopped: Arc::new(AtomicBool::new(false)),
            open_queues: Arc::new(Mutex::new(Vec::new())),
        };

        // The initial heartbeat doubles as the reachability check.
        connection.update_heartbeat().await?;

        // Add to the connection set only after the heartbeat exists, so a
        // concurrently running cleaner cannot see a connection without one
        // and declare it stale.
        connection
            .store
            .sadd(keys::CONNECTIONS_KEY, &connection.name)
            .await?;

        connection.spawn_heartbeat();
        tracing::info!(connection = %connection.name, "connection opened");
        Ok(connection)
    }

    /// Connection name (`<tag>-<token>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the queue with the given name and register it on this
    /// connection.
    pub async fn open_queue(&self, name: &str) -> QueueResult<Queue> {
        self.store.sadd(keys::QUEUES_KEY, name).await?;

        let queue = self.queue(name);
        self.open_queues
            .lock()
            .expect("open_queues lock poisoned")
            .push(queue.clone());
        Ok(queue)
    }

    /// Build a queue handle without touching the open-queue registry. Used
    /// by the cleaner and the stats collector on hijacked views.
    pub(crate) fn queue(&self, name: &str) -> Queue {
        Queue::new(
            name,
            &self.name,
            &self.queues_key,
            self.store.clone(),
            self.errors.clone(),
        )
    }

    /// Collect a stats report for the given queues. See
    /// [`collect_stats`](crate::collect_stats).
    pub async fn collect_stats(&self, queue_names: &[String]) -> QueueResult<Stats> {
        stats::collect_stats(queue_names, self).await
    }

    /// Names of all open queues on this server.
    pub async fn get_open_queues(&self) -> QueueResult<Vec<String>> {
        self.store.smembers(keys::QUEUES_KEY).await
    }

    /// Names of all connections currently registered on this server
    /// (live or stale; only the heartbeat tells which).
    pub async fn get_connections(&self) -> QueueResult<Vec<String>> {
        self.store.smembers(keys::CONNECTIONS_KEY).await
    }

    /// Names of the queues this connection is consuming.
    pub async fn get_consuming_queues(&self) -> QueueResult<Vec<String>> {
        self.store.smembers(&self.queues_key).await
    }

    /// Issue `stop_consuming` to every queue opened on this connection and
    /// return a channel that resolves when all of them have drained.
    /// Idempotent.
    pub fn stop_all_consuming(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();

        let queues = self
            .open_queues
            .lock()
            .expect("open_queues lock poisoned")
            .clone();
        if queues.is_empty() {
            let _ = tx.send(()); // nothing to do
            return rx;
        }

        let finished: Vec<oneshot::Receiver<()>> =
            queues.iter().map(Queue::stop_consuming).collect();
        tokio::spawn(async move {
            futures::future::join_all(finished).await;
            let _ = tx.send(());
        });

        rx
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    fn spawn_heartbeat(&self) {
        let connection = self.clone();
        tokio::spawn(async move {
            let mut error_count = 0u64; // consecutive errors
            let start = tokio::time::Instant::now() + connection.config.heartbeat_interval;
            let mut ticker = tokio::time::interval_at(start, connection.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if connection.heartbeat_stopped.load(Ordering::SeqCst) {
                    return;
                }

                let error = match connection.update_heartbeat().await {
                    Ok(()) => {
                        error_count = 0;
                        continue;
                    }
                    Err(error) => error,
                };

                error_count += 1;
                tracing::warn!(
                    connection = %connection.name,
                    %error,
                    count = error_count,
                    "heartbeat update failed"
                );
                let _ = connection.errors.try_send(ErrorEvent::Heartbeat {
                    error,
                    count: error_count,
                });

                if error_count < HEARTBEAT_ERROR_LIMIT {
                    continue; // keep trying unless we hit the limit
                }

                // Reached the error limit: stop all consuming locally and
                // wait for the callbacks to drain before giving up on the
                // heartbeat, so a cleaner elsewhere cannot race them.
                let finished = connection.stop_all_consuming();
                let _ = finished.await;
                return;
            }
        });
    }

    async fn update_heartbeat(&self) -> QueueResult<()> {
        self.store
            .set_ex(&self.heartbeat_key, b"1", self.config.heartbeat_ttl)
            .await
    }

    /// Check whether this connection's heartbeat key is currently alive.
    ///
    /// ## Errors
    /// - [`QueueError::NotFound`]: the key is absent or expired; the
    ///   connection counts as stale
    pub async fn check_heartbeat(&self) -> QueueResult<()> {
        let ttl = self.store.ttl(&self.heartbeat_key).await?;
        if ttl <= 0 {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    /// Stop the heartbeat and delete its key.
    ///
    /// The connection stays in the connections set so a cleaner can find it;
    /// this is how tests (and orderly shutdowns) make a connection eligible
    /// for reclaim.
    pub async fn stop_heartbeat(&self) -> QueueResult<()> {
        self.heartbeat_stopped.store(true, Ordering::SeqCst);
        let deleted = self.store.del(&self.heartbeat_key).await?;
        if deleted == 0 {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    // =========================================================================
    // Stale-connection API (used by the cleaner)
    // =========================================================================

    /// Reopen an existing connection by name for inspection: shares the
    /// store but spawns no heartbeat and registers no new state.
    pub(crate) fn hijack(&self, name: &str) -> Connection {
        Connection {
            name: name.to_string(),
            heartbeat_key: keys::connection_heartbeat_key(name),
            queues_key: keys::connection_queues_key(name),
            store: self.store.clone(),
            errors: self.errors.clone(),
            config: self.config.clone(),
            heartbeat_stopped: Arc::new(AtomicBool::new(true)),
            open_queues: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deregister a stale connection and drop its queues set. Not to be
    /// called on a live connection; the cleaner checks the heartbeat first.
    pub(crate) async fn close_stale_connection(&self) -> QueueResult<()> {
        let removed = self.store.srem(keys::CONNECTIONS_KEY, &self.name).await?;
        if removed == 0 {
            return Err(QueueError::NotFound);
        }

        // A stale connection that never consumed has no queues key; deleting
        // a missing key is fine.
        self.store.del(&self.queues_key).await?;
        Ok(())
    }

    // =========================================================================
    // Test support
    // =========================================================================

    /// Remove every key in the database to reset state. Tests only.
    pub async fn flush_db(&self) -> QueueResult<()> {
        self.store.flush_db().await
    }
}
