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

//! Queues: publishing and the consuming pipeline.
//!
//! ## Purpose
//! A [`Queue`] publishes payloads onto the ready list and, once consuming is
//! started, runs a prefetch-bounded pipeline: a fetcher task atomically moves
//! payloads from `ready` to this connection's `unacked` list and hands them
//! to consumer dispatchers through a bounded in-memory channel.
//!
//! ## Design Decisions
//! - **`RPOPLPUSH` is the atomicity pivot**: a payload can never exist in
//!   neither list, so conservation holds across a crash between fetch and
//!   dispatch.
//! - **The prefetch bound is enforced in memory** (channel capacity), not on
//!   the server: the unacked list may exceed the prefetch limit by the number
//!   of in-flight consumer callbacks, which gives callbacks a stable window
//!   of work during shutdown.
//! - **Single producer, single closer**: only the fetcher holds the channel
//!   sender; dropping it on shutdown is what lets dispatchers drain the
//!   buffer and exit.
//!
//! ## States
//! A queue instance is `idle` (never started), `consuming` (fetcher live) or
//! `stopped` (fetcher exited, channel closed). `stopped` is terminal per
//! instance; reopening the queue on the connection yields a fresh instance.

use crate::keys;
use crate::{Delivery, ErrorEvent, QueueError, QueueResult, QueueStore};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Number of elements removed per `LTRIM` while purging, so a single huge
/// deletion cannot block the server.
/// See <https://www.redisgreen.net/blog/deleting-large-lists>
const PURGE_BATCH_SIZE: i64 = 100;

/// Default time a batch dispatcher waits to fill a batch after its first
/// delivery arrived.
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Consumer callback for single deliveries.
///
/// Implemented for any `Fn(Delivery) -> impl Future` closure, so plain async
/// closures can be passed to [`Queue::add_consumer`] directly.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Handle one delivery. The implementation is responsible for acking,
    /// rejecting or pushing it.
    async fn consume(&self, delivery: Delivery);
}

#[async_trait]
impl<F, Fut> Consumer for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn consume(&self, delivery: Delivery) {
        (self)(delivery).await;
    }
}

/// Consumer callback for batches of deliveries.
///
/// The batch is an ordered sequence; the implementation is responsible for
/// iterating it and acking/rejecting each delivery. On shutdown a partial
/// batch is delivered before the dispatcher exits.
#[async_trait]
pub trait BatchConsumer: Send + Sync + 'static {
    /// Handle one batch.
    async fn consume(&self, batch: Vec<Delivery>);
}

#[async_trait]
impl<F, Fut> BatchConsumer for F
where
    F: Fn(Vec<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn consume(&self, batch: Vec<Delivery>) {
        (self)(batch).await;
    }
}

/// Everything that exists only while the queue instance is consuming.
struct ConsumingState {
    prefetch_limit: usize,
    poll_duration: Duration,
    /// Shared by all dispatchers; the channel disconnects when the fetcher
    /// drops its sender.
    receiver: flume::Receiver<Delivery>,
    stopped: AtomicBool,
    /// Live dispatcher tasks; the stop drain task awaits them all.
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    finished: Mutex<FinishedState>,
}

#[derive(Default)]
struct FinishedState {
    done: bool,
    drain_spawned: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

/// A named queue on one connection.
///
/// Cheap to clone; clones share the consuming pipeline.
#[derive(Clone)]
pub struct Queue {
    name: String,
    connection_name: String,
    /// Key of the set of queues consumed by this connection.
    queues_key: String,
    consumers_key: String,
    ready_key: String,
    rejected_key: String,
    unacked_key: String,
    /// Ready key of the push queue, when one is set.
    push_key: Arc<Mutex<Option<String>>>,
    store: Arc<dyn QueueStore>,
    consuming: Arc<Mutex<Option<Arc<ConsumingState>>>>,
    errors: mpsc::Sender<ErrorEvent>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} conn:{}]", self.name, self.connection_name)
    }
}

impl Queue {
    pub(crate) fn new(
        name: &str,
        connection_name: &str,
        queues_key: &str,
        store: Arc<dyn QueueStore>,
        errors: mpsc::Sender<ErrorEvent>,
    ) -> Self {
        Self {
            name: name.to_string(),
            connection_name: connection_name.to_string(),
            queues_key: queues_key.to_string(),
            consumers_key: keys::connection_queue_consumers_key(connection_name, name),
            ready_key: keys::queue_ready_key(name),
            rejected_key: keys::queue_rejected_key(name),
            unacked_key: keys::connection_queue_unacked_key(connection_name, name),
            push_key: Arc::new(Mutex::new(None)),
            store,
            consuming: Arc::new(Mutex::new(None)),
            errors,
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Add deliveries with the given payloads to the queue. Returns the
    /// resulting length of the ready list.
    pub async fn publish(&self, payloads: &[&str]) -> QueueResult<i64> {
        let bytes: Vec<Vec<u8>> = payloads.iter().map(|p| p.as_bytes().to_vec()).collect();
        self.publish_bytes_owned(bytes).await
    }

    /// Byte-wise identical transport to [`Queue::publish`]; payloads are
    /// opaque octet strings.
    pub async fn publish_bytes(&self, payloads: &[&[u8]]) -> QueueResult<i64> {
        let bytes: Vec<Vec<u8>> = payloads.iter().map(|p| p.to_vec()).collect();
        self.publish_bytes_owned(bytes).await
    }

    async fn publish_bytes_owned(&self, payloads: Vec<Vec<u8>>) -> QueueResult<i64> {
        if payloads.is_empty() {
            return self.ready_count().await;
        }
        self.store.lpush(&self.ready_key, &payloads).await
    }

    // =========================================================================
    // Counts
    // =========================================================================

    /// Number of deliveries awaiting delivery.
    pub async fn ready_count(&self) -> QueueResult<i64> {
        self.store.llen(&self.ready_key).await
    }

    /// Number of deliveries this connection is currently processing.
    pub async fn unacked_count(&self) -> QueueResult<i64> {
        self.store.llen(&self.unacked_key).await
    }

    /// Number of rejected deliveries.
    pub async fn rejected_count(&self) -> QueueResult<i64> {
        self.store.llen(&self.rejected_key).await
    }

    /// Number of consumers bound on this queue within this connection.
    pub async fn consumer_count(&self) -> QueueResult<i64> {
        self.store.scard(&self.consumers_key).await
    }

    // =========================================================================
    // Purge / return operations
    // =========================================================================

    /// Remove all ready deliveries and return how many were purged.
    pub async fn purge_ready(&self) -> QueueResult<i64> {
        self.delete_list(&self.ready_key).await
    }

    /// Remove all rejected deliveries and return how many were purged.
    pub async fn purge_rejected(&self) -> QueueResult<i64> {
        self.delete_list(&self.rejected_key).await
    }

    /// Try to move `count` rejected deliveries back to the ready list.
    /// Returns the number actually moved, which is lower when the rejected
    /// list ran out first.
    pub async fn return_rejected(&self, count: i64) -> QueueResult<i64> {
        for i in 0..count {
            let moved = self
                .store
                .rpoplpush(&self.rejected_key, &self.ready_key)
                .await?;
            if moved.is_none() {
                return Ok(i);
            }
        }
        Ok(count.max(0))
    }

    /// Move all rejected deliveries back to the ready list and return the
    /// number moved.
    pub async fn return_all_rejected(&self) -> QueueResult<i64> {
        let rejected = self.store.llen(&self.rejected_key).await?;
        self.return_rejected(rejected).await
    }

    /// Move all of this connection's unacked deliveries back to the ready
    /// list and return the number moved. This is the primitive the cleaner
    /// reclaims crashed connections with.
    pub async fn return_all_unacked(&self) -> QueueResult<u64> {
        let unacked = self.store.llen(&self.unacked_key).await?;
        for i in 0..unacked {
            let moved = self
                .store
                .rpoplpush(&self.unacked_key, &self.ready_key)
                .await?;
            if moved.is_none() {
                return Ok(i as u64);
            }
        }
        Ok(unacked.max(0) as u64)
    }

    /// Remove this queue's per-connection keys (unacked list, consumers set)
    /// and deregister it from the connection's consuming set.
    pub async fn close_in_connection(&self) -> QueueResult<()> {
        self.store.del(&self.unacked_key).await?;
        self.store.del(&self.consumers_key).await?;
        self.store.srem(&self.queues_key, &self.name).await?;
        Ok(())
    }

    /// Purge the queue and remove it from the set of open queues.
    ///
    /// DESTRUCTIVE: this deletes every ready delivery (undelivered messages
    /// are lost) and every rejected delivery. Returns the purged
    /// `(ready, rejected)` counts. Succeeds even when the lists are empty.
    pub async fn destroy(&self) -> QueueResult<(i64, i64)> {
        let ready = self.purge_ready().await?;
        let rejected = self.purge_rejected().await?;
        self.store.srem(keys::QUEUES_KEY, &self.name).await?;
        Ok((ready, rejected))
    }

    /// Record `push_queue`'s ready list as the push target of deliveries
    /// fetched from this queue. Must be called before consuming starts for
    /// push-capable deliveries to be created.
    pub fn set_push_queue(&self, push_queue: &Queue) {
        let mut push_key = self.push_key.lock().expect("push_key lock poisoned");
        *push_key = Some(push_queue.ready_key.clone());
    }

    // Batched deletion: a plain DEL of a huge list blocks the server, so the
    // list is shortened PURGE_BATCH_SIZE elements at a time.
    async fn delete_list(&self, key: &str) -> QueueResult<i64> {
        let total = self.store.llen(key).await?;
        if total == 0 {
            return Ok(0);
        }

        let mut todo = total;
        while todo > 0 {
            let batch_size = PURGE_BATCH_SIZE.min(todo);
            self.store.ltrim(key, 0, -1 - batch_size).await?;
            todo -= batch_size;
        }

        Ok(total)
    }

    // =========================================================================
    // Consuming pipeline
    // =========================================================================

    /// Start consuming into an in-memory buffer of size `prefetch_limit`.
    /// Must be called before consumers can be added. `poll_duration` is how
    /// long the fetcher sleeps before re-checking an empty ready list.
    ///
    /// ## Errors
    /// - [`QueueError::AlreadyConsuming`]: called twice on this instance
    /// - [`QueueError::InvalidConfig`]: `prefetch_limit` is zero
    pub async fn start_consuming(
        &self,
        prefetch_limit: usize,
        poll_duration: Duration,
    ) -> QueueResult<()> {
        if prefetch_limit == 0 {
            return Err(QueueError::InvalidConfig(
                "prefetch limit must be positive".to_string(),
            ));
        }

        let (delivery_tx, delivery_rx) = flume::bounded(prefetch_limit);
        let state = Arc::new(ConsumingState {
            prefetch_limit,
            poll_duration,
            receiver: delivery_rx,
            stopped: AtomicBool::new(false),
            dispatchers: Mutex::new(Vec::new()),
            finished: Mutex::new(FinishedState::default()),
        });

        {
            let mut consuming = self.consuming.lock().expect("consuming lock poisoned");
            if consuming.is_some() {
                return Err(QueueError::AlreadyConsuming(self.name.clone()));
            }
            *consuming = Some(state.clone());
        }

        // Register in the connection's queues set so the cleaner can find
        // this queue's unacked list if we die.
        if let Err(err) = self.store.sadd(&self.queues_key, &self.name).await {
            *self.consuming.lock().expect("consuming lock poisoned") = None;
            return Err(err);
        }

        tracing::debug!(
            queue = %self.name,
            connection = %self.connection_name,
            prefetch_limit,
            "started consuming"
        );

        let queue = self.clone();
        tokio::spawn(async move { queue.fetch_loop(state, delivery_tx).await });
        Ok(())
    }

    /// Stop the fetcher and return a channel that resolves once every
    /// dispatcher callback for this queue has returned.
    ///
    /// Idempotent. Called on an idle or already-stopped queue it returns an
    /// immediately-resolved channel. Deliveries already buffered in memory
    /// are still handed to consumers before their dispatchers exit.
    pub fn stop_consuming(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();

        let state = self
            .consuming
            .lock()
            .expect("consuming lock poisoned")
            .clone();
        let Some(state) = state else {
            let _ = tx.send(()); // never consuming
            return rx;
        };

        let mut finished = state.finished.lock().expect("finished lock poisoned");
        if finished.done {
            let _ = tx.send(());
            return rx;
        }

        finished.waiters.push(tx);
        if !finished.drain_spawned {
            finished.drain_spawned = true;
            state.stopped.store(true, Ordering::SeqCst);
            tracing::debug!(queue = %self.name, "stopping consuming");

            let state = state.clone();
            tokio::spawn(async move {
                let dispatchers = std::mem::take(
                    &mut *state.dispatchers.lock().expect("dispatchers lock poisoned"),
                );
                for dispatcher in dispatchers {
                    let _ = dispatcher.await;
                }

                let mut finished = state.finished.lock().expect("finished lock poisoned");
                finished.done = true;
                for waiter in finished.waiters.drain(..) {
                    let _ = waiter.send(());
                }
            });
        }

        rx
    }

    /// Add a consumer to the queue and return its assigned name
    /// (`<tag>-<token>`).
    ///
    /// ## Errors
    /// - [`QueueError::NotConsuming`]: `start_consuming` was not called
    pub async fn add_consumer<C: Consumer>(&self, tag: &str, consumer: C) -> QueueResult<String> {
        let (state, name) = self.register_consumer(tag).await?;

        let receiver = state.receiver.clone();
        let handle = tokio::spawn(async move {
            while let Ok(delivery) = receiver.recv_async().await {
                consumer.consume(delivery).await;
            }
        });
        state
            .dispatchers
            .lock()
            .expect("dispatchers lock poisoned")
            .push(handle);

        Ok(name)
    }

    /// Like [`Queue::add_consumer`], but deliveries are accumulated into
    /// batches of `batch_size` with the default accumulation timeout.
    pub async fn add_batch_consumer<C: BatchConsumer>(
        &self,
        tag: &str,
        batch_size: usize,
        consumer: C,
    ) -> QueueResult<String> {
        self.add_batch_consumer_with_timeout(tag, batch_size, DEFAULT_BATCH_TIMEOUT, consumer)
            .await
    }

    /// Like [`Queue::add_batch_consumer`] with an explicit accumulation
    /// timeout. The timer only starts when the first delivery of a batch is
    /// received; the batch is delivered when it is full or the timer fires,
    /// whichever comes first.
    pub async fn add_batch_consumer_with_timeout<C: BatchConsumer>(
        &self,
        tag: &str,
        batch_size: usize,
        timeout: Duration,
        consumer: C,
    ) -> QueueResult<String> {
        if batch_size == 0 {
            return Err(QueueError::InvalidConfig(
                "batch size must be positive".to_string(),
            ));
        }
        let (state, name) = self.register_consumer(tag).await?;

        let receiver = state.receiver.clone();
        let handle = tokio::spawn(async move {
            loop {
                // Wait for the first delivery without a deadline.
                let Ok(first) = receiver.recv_async().await else {
                    return;
                };
                let mut batch = vec![first];
                let deadline = tokio::time::Instant::now() + timeout;
                let mut disconnected = false;

                while batch.len() < batch_size {
                    tokio::select! {
                        received = receiver.recv_async() => match received {
                            Ok(delivery) => batch.push(delivery),
                            Err(_) => {
                                disconnected = true;
                                break;
                            }
                        },
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }

                consumer.consume(batch).await;
                if disconnected {
                    return;
                }
            }
        });
        state
            .dispatchers
            .lock()
            .expect("dispatchers lock poisoned")
            .push(handle);

        Ok(name)
    }

    /// Names of the consumers bound on this queue within this connection.
    pub async fn get_consumers(&self) -> QueueResult<Vec<String>> {
        self.store.smembers(&self.consumers_key).await
    }

    /// Remove one consumer from the registry. Returns whether it was
    /// present.
    pub async fn remove_consumer(&self, name: &str) -> QueueResult<bool> {
        let removed = self.store.srem(&self.consumers_key, name).await?;
        Ok(removed > 0)
    }

    /// Drop the whole consumer registry for this queue on this connection.
    pub async fn remove_all_consumers(&self) -> QueueResult<i64> {
        self.store.del(&self.consumers_key).await
    }

    async fn register_consumer(&self, tag: &str) -> QueueResult<(Arc<ConsumingState>, String)> {
        let state = self
            .consuming
            .lock()
            .expect("consuming lock poisoned")
            .clone()
            .ok_or_else(|| QueueError::NotConsuming(self.name.clone()))?;

        let name = format!("{}-{}", tag, keys::random_token());
        self.store.sadd(&self.consumers_key, &name).await?;
        tracing::debug!(queue = %self.name, consumer = %name, "added consumer");
        Ok((state, name))
    }

    // =========================================================================
    // Fetcher
    // =========================================================================

    async fn fetch_loop(self, state: Arc<ConsumingState>, delivery_tx: flume::Sender<Delivery>) {
        loop {
            let batch_size = match self.fetch_batch_size(&delivery_tx, &state).await {
                Ok(batch_size) => batch_size,
                Err(error) => {
                    let _ = self.errors.try_send(ErrorEvent::Consume { error });
                    0
                }
            };

            let want_more = match self.fetch_batch(batch_size, &delivery_tx).await {
                Some(full_batch) => full_batch,
                None => return, // every receiver is gone, nobody will drain us
            };

            if !want_more {
                tokio::time::sleep(state.poll_duration).await;
            }

            if state.stopped.load(Ordering::SeqCst) {
                tracing::debug!(queue = %self.name, "stopped fetching");
                return; // dropping delivery_tx closes the channel
            }
        }
    }

    /// How many deliveries to move this iteration: the free buffer space,
    /// capped by what the ready list actually holds.
    async fn fetch_batch_size(
        &self,
        delivery_tx: &flume::Sender<Delivery>,
        state: &ConsumingState,
    ) -> QueueResult<i64> {
        let buffered = delivery_tx.len() as i64;
        let space = state.prefetch_limit as i64 - buffered;
        let ready_count = self.ready_count().await?;
        Ok(ready_count.min(space))
    }

    /// Move up to `batch_size` payloads from ready to unacked and buffer
    /// them as deliveries. Returns `Some(true)` when the full batch was
    /// fetched (the loop should continue immediately), `Some(false)` when
    /// the ready list ran dry or a fetch failed, and `None` when the
    /// in-memory channel is disconnected.
    async fn fetch_batch(
        &self,
        batch_size: i64,
        delivery_tx: &flume::Sender<Delivery>,
    ) -> Option<bool> {
        if batch_size <= 0 {
            return Some(false);
        }

        for _ in 0..batch_size {
            let payload = match self
                .store
                .rpoplpush(&self.ready_key, &self.unacked_key)
                .await
            {
                Ok(Some(payload)) => payload,
                Ok(None) => return Some(false), // consumed the last ready delivery
                Err(error) => {
                    tracing::warn!(queue = %self.name, %error, "fetch failed");
                    let _ = self.errors.try_send(ErrorEvent::Consume { error });
                    return Some(false);
                }
            };

            let push_key = self
                .push_key
                .lock()
                .expect("push_key lock poisoned")
                .clone();
            let delivery = Delivery::new(
                payload,
                self.unacked_key.clone(),
                self.rejected_key.clone(),
                push_key,
                self.store.clone(),
            );

            // Blocks when the buffer is full; this is the backpressure.
            if delivery_tx.send_async(delivery).await.is_err() {
                return None;
            }
        }

        Some(true)
    }
}
