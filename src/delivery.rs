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

//! Deliveries and their terminal transitions.
//!
//! ## Purpose
//! A [`Delivery`] is one payload in flight: the fetcher moved it from the
//! ready list to this connection's unacked list, and exactly one of
//! ack/reject/push moves it to its terminal state.
//!
//! ## Invariants
//! - A delivery is immutable once constructed.
//! - Ack removes one occurrence of the payload from the unacked list
//!   (`LREM key 1 payload`); a removed count of 0 means someone else (a
//!   cleaner, or an earlier ack) already took it and surfaces as not-found.
//! - Reject and push first `LPUSH` the payload onto the target list, then
//!   ack. Between the two steps the payload exists twice; the conservation
//!   invariant tolerates duplication, never loss.

use crate::{ErrorEvent, QueueError, QueueResult, QueueStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Delay between retry attempts in the `*_with_retry` wrappers.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// One payload in flight from the fetcher to a terminal state.
#[derive(Clone)]
pub struct Delivery {
    payload: Vec<u8>,
    unacked_key: String,
    rejected_key: String,
    push_key: Option<String>,
    store: Arc<dyn QueueStore>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("unacked_key", &self.unacked_key)
            .finish()
    }
}

impl Delivery {
    pub(crate) fn new(
        payload: Vec<u8>,
        unacked_key: String,
        rejected_key: String,
        push_key: Option<String>,
        store: Arc<dyn QueueStore>,
    ) -> Self {
        Self {
            payload,
            unacked_key,
            rejected_key,
            push_key,
            store,
        }
    }

    /// The delivered payload, an opaque octet string.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Acknowledge the delivery by removing it from the unacked list.
    ///
    /// ## Errors
    /// - [`QueueError::NotFound`]: the payload was no longer in the unacked
    ///   list. The delivery was already acked, or a cleaner reclaimed it
    ///   after this connection's heartbeat expired.
    ///
    /// NOTE: this is a simple low level operation, but potentially dangerous
    /// if used naively: a transient backend error leaves the delivery
    /// unacked. Prefer [`Delivery::ack_with_retry`] unless you know what you
    /// are doing.
    pub async fn ack(&self) -> QueueResult<()> {
        let removed = self.store.lrem(&self.unacked_key, 1, &self.payload).await?;
        if removed == 0 {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    /// Move the delivery to the rejected list, then ack it.
    ///
    /// On not-found from the inner ack the move has still happened; the
    /// caller raced with someone else over a previously-acked delivery.
    pub async fn reject(&self) -> QueueResult<()> {
        let rejected_key = self.rejected_key.clone();
        self.move_to(&rejected_key).await
    }

    /// Move the delivery to the push queue of its source queue, then ack it.
    /// Falls back to [`Delivery::reject`] when no push queue is set.
    pub async fn push(&self) -> QueueResult<()> {
        match self.push_key.clone() {
            Some(push_key) => self.move_to(&push_key).await,
            None => self.reject().await,
        }
    }

    async fn move_to(&self, key: &str) -> QueueResult<()> {
        self.store.lpush(key, &[self.payload.clone()]).await?;
        self.ack().await
    }

    /// Blocking variant of [`Delivery::ack`] with the retry policy below.
    ///
    /// 1. Returns immediately on success or not-found.
    /// 2. Any other error counts as transient: it is reported on `errors`
    ///    (non-blocking, dropped when the channel is full) and the operation
    ///    is retried after a one second sleep.
    /// 3. Cancelling `ctx` cuts the loop short at the next sleep boundary and
    ///    returns [`QueueError::Cancelled`].
    pub async fn ack_with_retry(
        &self,
        ctx: &CancellationToken,
        errors: &mpsc::Sender<ErrorEvent>,
    ) -> QueueResult<()> {
        self.retry_ack(ctx, errors, 0).await
    }

    /// Like [`Delivery::ack_with_retry`], for [`Delivery::reject`].
    pub async fn reject_with_retry(
        &self,
        ctx: &CancellationToken,
        errors: &mpsc::Sender<ErrorEvent>,
    ) -> QueueResult<()> {
        let rejected_key = self.rejected_key.clone();
        self.move_with_retry(ctx, errors, &rejected_key).await
    }

    /// Like [`Delivery::ack_with_retry`], for [`Delivery::push`].
    pub async fn push_with_retry(
        &self,
        ctx: &CancellationToken,
        errors: &mpsc::Sender<ErrorEvent>,
    ) -> QueueResult<()> {
        match self.push_key.clone() {
            Some(push_key) => self.move_with_retry(ctx, errors, &push_key).await,
            None => self.reject_with_retry(ctx, errors).await,
        }
    }

    async fn move_with_retry(
        &self,
        ctx: &CancellationToken,
        errors: &mpsc::Sender<ErrorEvent>,
        key: &str,
    ) -> QueueResult<()> {
        let mut error_count = 0u64;
        loop {
            if ctx.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            match self.store.lpush(key, &[self.payload.clone()]).await {
                Ok(_) => break,
                Err(error) => {
                    error_count += 1;
                    self.report(errors, error, error_count);
                    self.backoff(ctx).await?;
                }
            }
        }

        // The error count carries over so operators can threshold on the
        // whole reject/push chain, not on each half separately.
        self.retry_ack(ctx, errors, error_count).await
    }

    async fn retry_ack(
        &self,
        ctx: &CancellationToken,
        errors: &mpsc::Sender<ErrorEvent>,
        mut error_count: u64,
    ) -> QueueResult<()> {
        loop {
            if ctx.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            match self.ack().await {
                Ok(()) => return Ok(()),
                Err(QueueError::NotFound) => return Err(QueueError::NotFound),
                Err(error) => {
                    error_count += 1;
                    self.report(errors, error, error_count);
                    self.backoff(ctx).await?;
                }
            }
        }
    }

    fn report(&self, errors: &mpsc::Sender<ErrorEvent>, error: QueueError, count: u64) {
        let _ = errors.try_send(ErrorEvent::Delivery {
            payload: self.payload.clone(),
            error,
            count,
        });
    }

    async fn backoff(&self, ctx: &CancellationToken) -> QueueResult<()> {
        tokio::select! {
            _ = ctx.cancelled() => Err(QueueError::Cancelled),
            _ = tokio::time::sleep(RETRY_BACKOFF) => Ok(()),
        }
    }
}
