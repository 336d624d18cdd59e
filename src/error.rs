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

//! Error types and error-channel events.
//!
//! ## Purpose
//! Defines the crate-wide error taxonomy and the event variants delivered on
//! the error channel a caller supplies at connection open.
//!
//! ## Design Decisions
//! - **Not-found is a sentinel, not a failure**: acking an already-reclaimed
//!   delivery or checking a missing heartbeat is a domain outcome callers
//!   routinely match on, so it gets its own variant instead of being folded
//!   into backend errors.
//! - **String-backed variants**: backend errors are captured as strings so
//!   [`QueueError`] stays `Clone` and can travel inside [`ErrorEvent`]s.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Entity (connection, queue or delivery) not found.
    ///
    /// This is a domain signal: the delivery was already acked or reclaimed,
    /// the list was shorter than requested, or the heartbeat key is gone.
    #[error("entity not found")]
    NotFound,

    /// `start_consuming` was called twice on the same queue instance.
    #[error("queue is already consuming: {0}")]
    AlreadyConsuming(String),

    /// A consumer was added before `start_consuming`.
    #[error("queue is not consuming: {0}")]
    NotConsuming(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend error (network, server, protocol).
    #[error("backend error: {0}")]
    BackendError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The caller's cancellation token was triggered.
    #[error("operation cancelled")]
    Cancelled,
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::BackendError(format!("Redis error: {}", err))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SerializationError(err.to_string())
    }
}

/// Events delivered on the error channel supplied at connection open.
///
/// ## Purpose
/// Retriable errors are handled inside the library (heartbeat loop, delivery
/// retry wrappers, fetcher) and never returned to the caller; this channel is
/// how operators observe them. All sends are non-blocking: when the channel
/// is full the event is dropped so a slow sink cannot wedge the pipelines.
#[derive(Debug, Clone)]
pub enum ErrorEvent {
    /// The heartbeat update failed; `count` is the number of consecutive
    /// failures so far.
    Heartbeat {
        /// The underlying error.
        error: QueueError,
        /// Consecutive failure count.
        count: u64,
    },
    /// An ack/reject/push retry wrapper hit a transient error.
    Delivery {
        /// Payload of the affected delivery.
        payload: Vec<u8>,
        /// The underlying error.
        error: QueueError,
        /// Monotonic error count across the whole retry chain.
        count: u64,
    },
    /// The fetcher failed to read or move a delivery.
    Consume {
        /// The underlying error.
        error: QueueError,
    },
}
