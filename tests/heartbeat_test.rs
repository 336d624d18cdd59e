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

//! Heartbeat failure handling: error reporting and the limit-triggered
//! graceful shutdown.

mod common;

use common::TestConsumer;
use redqueue::{
    Connection, ConnectionConfig, ErrorEvent, InMemoryStore, HEARTBEAT_ERROR_LIMIT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shrunk heartbeat timing so 45 consecutive failures fit in a test run.
fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_interval: Duration::from_millis(5),
        heartbeat_ttl: Duration::from_secs(60),
        ..ConnectionConfig::default()
    }
}

/// A server outage lasting past the error limit must stop all consuming
/// locally, with every buffered delivery handed to its consumer first.
#[tokio::test]
async fn test_heartbeat_error_limit_stops_consuming() {
    let store = InMemoryStore::new();
    // Generous capacity: the failing fetcher floods the channel with consume
    // errors while we wait for the heartbeat counter to climb.
    let (errors_tx, mut errors_rx) = mpsc::channel(1024);

    let connection = Connection::open_with_config(
        "hb-conn",
        Arc::new(store.clone()),
        test_config(),
        errors_tx,
    )
    .await
    .unwrap();

    let queue = connection.open_queue("hb-q").await.unwrap();
    for i in 0..5 {
        let payload = format!("hb-d{}", i);
        queue.publish(&[&payload]).await.unwrap();
    }

    queue
        .start_consuming(5, Duration::from_millis(1))
        .await
        .unwrap();
    let consumer = TestConsumer::new(true, true);
    queue.add_consumer("hb-cons", consumer.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(consumer.delivery_count(), 5);

    // The server goes away. Drain error events until the heartbeat loop
    // reports its limit-hitting failure.
    store.fail_next(u64::MAX);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, errors_rx.recv())
            .await
            .expect("expected heartbeat failures before the deadline")
            .expect("error channel closed unexpectedly");
        match event {
            ErrorEvent::Heartbeat { count, .. } if count >= HEARTBEAT_ERROR_LIMIT => break,
            ErrorEvent::Heartbeat { .. } | ErrorEvent::Consume { .. } => continue,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    // The server comes back; the connection must not resume fetching, since
    // the heartbeat loop already stopped all consuming.
    store.fail_next(0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    queue.publish(&["hb-late"]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.ready_count().await.unwrap(), 1);
    assert_eq!(queue.unacked_count().await.unwrap(), 0);

    // The stop initiated by the heartbeat loop has fully drained.
    tokio::time::timeout(Duration::from_secs(1), queue.stop_consuming())
        .await
        .expect("consuming must already be stopped")
        .unwrap();
}

/// A transient failure below the limit keeps the connection consuming.
#[tokio::test]
async fn test_heartbeat_recovers_below_limit() {
    let store = InMemoryStore::new();
    let (errors_tx, mut errors_rx) = mpsc::channel(16);

    let connection = Connection::open_with_config(
        "hb-rec-conn",
        Arc::new(store.clone()),
        test_config(),
        errors_tx,
    )
    .await
    .unwrap();

    // A short blip while only the heartbeat talks to the store: a couple of
    // failed refreshes, then recovery.
    store.fail_next(3);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, errors_rx.recv())
            .await
            .expect("expected at least one heartbeat error")
            .expect("error channel closed unexpectedly");
        if matches!(event, ErrorEvent::Heartbeat { .. }) {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    connection.check_heartbeat().await.unwrap();

    // The connection shrugged the blip off and consumes normally.
    let queue = connection.open_queue("hb-rec-q").await.unwrap();
    queue
        .start_consuming(5, Duration::from_millis(1))
        .await
        .unwrap();
    let consumer = TestConsumer::new(true, true);
    queue
        .add_consumer("hb-rec-cons", consumer.clone())
        .await
        .unwrap();

    queue.publish(&["hb-rec-d1"]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(consumer.delivery_count(), 1);

    queue.stop_consuming().await.unwrap();
    connection.stop_heartbeat().await.unwrap();
}
