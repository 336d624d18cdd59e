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

//! Integration tests against a real Redis server.
//!
//! These are `#[ignore]`d by default; run them with a server on
//! localhost:6379 (database 1 is flushed, so the tests must not run in
//! parallel):
//!
//! ```bash
//! cargo test --test redis_integration_test -- --ignored --test-threads=1
//! ```

#![cfg(feature = "redis-backend")]

mod common;

use common::{TestBatchConsumer, TestConsumer};
use redqueue::{Cleaner, Connection, QueueError};
use std::time::Duration;
use tokio::sync::mpsc;

const REDIS_URL: &str = "redis://localhost:6379/1";
const POLL: Duration = Duration::from_millis(1);

async fn open_redis_connection(tag: &str) -> Connection {
    let (errors_tx, _errors_rx) = mpsc::channel(64);
    Connection::open(tag, REDIS_URL, errors_tx)
        .await
        .expect("failed to connect to Redis (is a server running on localhost:6379?)")
}

/// Reset database 1 before a test.
async fn flush() {
    let connection = open_redis_connection("flush").await;
    connection.flush_db().await.unwrap();
    // The flush also removed our own heartbeat key.
    let _ = connection.stop_heartbeat().await;
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
#[ignore] // requires a running Redis instance
async fn test_redis_publish_consume_ack() {
    flush().await;
    let connection = open_redis_connection("redis-conn").await;
    let queue = connection.open_queue("redis-q").await.unwrap();

    assert_eq!(queue.publish(&["redis-d1"]).await.unwrap(), 1);
    assert_eq!(queue.publish(&["redis-d2", "redis-d3"]).await.unwrap(), 3);
    assert_eq!(queue.ready_count().await.unwrap(), 3);

    queue.start_consuming(10, POLL).await.unwrap();
    let consumer = TestConsumer::new(false, true);
    queue.add_consumer("redis-cons", consumer.clone()).await.unwrap();
    settle().await;

    assert_eq!(consumer.delivery_count(), 3);
    assert_eq!(queue.ready_count().await.unwrap(), 0);
    assert_eq!(queue.unacked_count().await.unwrap(), 3);
    assert_eq!(
        consumer.deliveries()[0].payload(),
        b"redis-d1" as &[u8]
    );

    for delivery in consumer.deliveries() {
        delivery.ack().await.unwrap();
    }
    assert_eq!(queue.unacked_count().await.unwrap(), 0);
    assert_eq!(
        consumer.deliveries()[0].ack().await,
        Err(QueueError::NotFound)
    );

    queue.stop_consuming().await.unwrap();
    connection.stop_heartbeat().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running Redis instance
async fn test_redis_reject_and_return() {
    flush().await;
    let connection = open_redis_connection("redis-rej-conn").await;
    let queue = connection.open_queue("redis-rej-q").await.unwrap();

    queue.publish(&["rej-d1", "rej-d2"]).await.unwrap();
    queue.start_consuming(10, POLL).await.unwrap();
    let consumer = TestConsumer::new(false, true);
    queue.add_consumer("rej-cons", consumer.clone()).await.unwrap();
    settle().await;

    for delivery in consumer.deliveries() {
        delivery.reject().await.unwrap();
    }
    assert_eq!(queue.rejected_count().await.unwrap(), 2);
    assert_eq!(queue.unacked_count().await.unwrap(), 0);

    assert_eq!(queue.return_all_rejected().await.unwrap(), 2);
    assert_eq!(queue.ready_count().await.unwrap(), 2);
    assert_eq!(queue.rejected_count().await.unwrap(), 0);

    // The returned deliveries come around again.
    settle().await;
    assert_eq!(consumer.delivery_count(), 4);

    queue.stop_consuming().await.unwrap();
    connection.stop_heartbeat().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running Redis instance
async fn test_redis_batch_consumer() {
    flush().await;
    let connection = open_redis_connection("redis-batch-conn").await;
    let queue = connection.open_queue("redis-batch-q").await.unwrap();

    for i in 0..5 {
        let payload = format!("batch-d{}", i);
        queue.publish(&[&payload]).await.unwrap();
    }

    queue.start_consuming(10, POLL).await.unwrap();
    let consumer = TestBatchConsumer::new(true);
    queue
        .add_batch_consumer_with_timeout(
            "batch-cons",
            2,
            Duration::from_millis(50),
            consumer.clone(),
        )
        .await
        .unwrap();

    // Two full batches arrive immediately, the trailing single after the
    // accumulation timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(consumer.consumed_count(), 5);

    queue.stop_consuming().await.unwrap();
    connection.stop_heartbeat().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running Redis instance
async fn test_redis_cleaner_reclaim() {
    flush().await;

    let conn = open_redis_connection("redis-clean-conn").await;
    let queue = conn.open_queue("redis-clean-q").await.unwrap();
    for i in 0..11 {
        let payload = format!("clean-d{}", i);
        queue.publish(&[&payload]).await.unwrap();
    }

    queue.start_consuming(4, POLL).await.unwrap();
    let consumer = TestConsumer::new(false, true);
    queue.add_consumer("clean-cons", consumer.clone()).await.unwrap();
    settle().await;
    assert_eq!(queue.unacked_count().await.unwrap(), 11);

    let deliveries = consumer.deliveries();
    deliveries[0].ack().await.unwrap();
    deliveries[1].ack().await.unwrap();

    queue.stop_consuming().await.unwrap();
    conn.stop_heartbeat().await.unwrap();

    let cleaner_conn = open_redis_connection("redis-cleaner").await;
    let returned = Cleaner::new(cleaner_conn.clone()).clean().await.unwrap();
    assert_eq!(returned, 9);

    let queue = cleaner_conn.open_queue("redis-clean-q").await.unwrap();
    assert_eq!(queue.ready_count().await.unwrap(), 9);

    cleaner_conn.stop_heartbeat().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running Redis instance
async fn test_redis_stats() {
    flush().await;

    let connection = open_redis_connection("redis-stats-conn").await;
    let queue = connection.open_queue("redis-stats-q").await.unwrap();
    queue.publish(&["stats-d1", "stats-d2"]).await.unwrap();

    let stats = connection
        .collect_stats(&["redis-stats-q".to_string()])
        .await
        .unwrap();
    let stat = &stats.queue_stats["redis-stats-q"];
    assert_eq!(stat.ready_count, 2);
    assert_eq!(stat.rejected_count, 0);

    connection.stop_heartbeat().await.unwrap();
}
